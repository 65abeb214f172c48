// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Fabric data model (§3): threads, dependency edges, subscriptions and acks.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The six fixed channels created by `initSession`, in creation order.
pub const FIXED_CHANNELS: [&str; 6] = ["root", "system", "tasks", "planning", "general", "observer"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Info,
    Request,
    Response,
    Status,
    Error,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Info
    }
}

/// The polymorphic payload carried by a `Thread`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum ThreadVariant {
    Channel {
        slug: String,
        title: String,
    },
    Message {
        content: String,
        kind: MessageKind,
        /// lowercased, deduplicated, order-preserved
        mentions: Vec<String>,
        /// creator + mentions at creation; replies extend this set
        participants: Vec<String>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    Artifact {
        display_name: String,
        media_type: String,
        size_bytes: u64,
        storage_uri: String,
        sha256: String,
    },
}

impl ThreadVariant {
    pub fn as_channel(&self) -> Option<(&str, &str)> {
        match self {
            ThreadVariant::Channel { slug, title } => Some((slug, title)),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<(&str, MessageKind, &[String], &[String])> {
        match self {
            ThreadVariant::Message { content, kind, mentions, participants, .. } => {
                Some((content, *kind, mentions, participants))
            }
            _ => None,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, ThreadVariant::Message { .. })
    }
}

/// A thread: immutable variant/sequence, mutable only via `participants`
/// extension on the root of a reply chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub creator: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub variant: ThreadVariant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    ChildOf,
    ReplyTo,
    References,
}

/// A directed edge `thread --relation--> depends_on`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub thread: String,
    pub depends_on: String,
    pub relation: Relation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    All,
    Mentions,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub channel_id: String,
    pub agent_id: String,
    pub mode: SubscriptionMode,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub agent_id: String,
    pub message_id: String,
    pub acked_at: DateTime<Utc>,
}

/// Per-channel unacked summary for one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnackedSummary {
    pub unacked_count: usize,
    pub last_unacked_seq: Option<u64>,
}
