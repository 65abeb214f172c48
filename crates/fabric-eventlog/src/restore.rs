// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Rebuilds a `FabricStore` from a sequence of persisted events (§4.6).
use std::collections::HashMap;

use fabric_domain::{Dependency, FabricStore, Relation};
use fabric_service::{FabricEvent, FabricEventType};
use tracing::debug;

use crate::error::EventLogError;

/// Pulls a required field out of `event`, turning a missing one into a
/// domain error instead of a panic — a hand-edited or corrupted-but-valid
/// log line must fail `restore` gracefully, not crash it.
fn require<T>(event_type: &str, field: &'static str, value: Option<T>) -> Result<T, EventLogError> {
    value.ok_or_else(|| EventLogError::MissingField { event_type: event_type.to_string(), field })
}

/// Applies `events` in file order to `store`, returning the discovered
/// `slug → channel id` mapping.
pub fn restore(events: &[FabricEvent], store: &FabricStore) -> Result<HashMap<String, String>, EventLogError> {
    let mut slug_to_id = HashMap::new();

    for event in events {
        match &event.event_type {
            FabricEventType::ChannelCreated => {
                let thread = require("channel.created", "thread", event.thread.clone())?;
                if let Some((slug, _)) = thread.variant.as_channel() {
                    slug_to_id.insert(slug.to_string(), thread.id.clone());
                }
                store.threads.insert_restored(thread);
            }
            FabricEventType::MessagePosted => {
                let thread = require("message.posted", "thread", event.thread.clone())?;
                let channel_id = require("message.posted", "channel_id", event.channel_id.clone())?;
                let thread_id = thread.id.clone();
                store.threads.insert_restored(thread);
                store.dependencies.add(Dependency { thread: thread_id, depends_on: channel_id, relation: Relation::ChildOf })?;
            }
            FabricEventType::ReplyPosted => {
                let thread = require("reply.posted", "thread", event.thread.clone())?;
                let root_id = require("reply.posted", "parent_id", event.parent_id.clone())?;
                let thread_id = thread.id.clone();
                store.threads.insert_restored(thread);
                store.dependencies.add(Dependency { thread: thread_id, depends_on: root_id, relation: Relation::ReplyTo })?;
            }
            FabricEventType::ArtifactAdded => {
                let thread = require("artifact.added", "thread", event.thread.clone())?;
                let target_id = require("artifact.added", "parent_id", event.parent_id.clone())?;
                let thread_id = thread.id.clone();
                store.threads.insert_restored(thread);
                store.dependencies.add(Dependency { thread: thread_id, depends_on: target_id, relation: Relation::References })?;
            }
            FabricEventType::Subscribed => {
                let sub = require("subscribed", "subscription", event.subscription.clone())?;
                store.subscriptions.insert_restored(sub);
            }
            FabricEventType::Unsubscribed => {
                let channel_id = require("unsubscribed", "channel_id", event.channel_id.clone())?;
                let agent_id = require("unsubscribed", "agent_id", event.agent_id.clone())?;
                store.subscriptions.unsubscribe(&channel_id, &agent_id);
            }
            FabricEventType::Acked => {
                let agent_id = require("acked", "agent_id", event.agent_id.clone())?;
                for id in event.mentions.clone().unwrap_or_default() {
                    store.acks.ack(&agent_id, &id);
                }
            }
            FabricEventType::ChannelArchived => {
                debug!(channel_id = ?event.channel_id, "channel.archived is informational only during restore");
            }
            FabricEventType::Unknown(name) => {
                debug!(event_type = %name, "skipping unrecognized fabric event type during restore");
            }
        }
    }

    Ok(slug_to_id)
}
