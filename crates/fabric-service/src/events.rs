// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Fabric events (§3, §4.4): the only output of the Fabric Service besides
//! domain-store mutation. Every mutating operation emits exactly one event
//! through the handler installed at construction.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fabric_domain::{Subscription, Thread};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The event type tag (§3, §4.4). Deserializes any dotted name this build
/// doesn't recognize into `Unknown` rather than failing, so a log written by
/// a newer producer still loads — see `Unknown`'s docs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricEventType {
    ChannelCreated,
    ChannelArchived,
    MessagePosted,
    ReplyPosted,
    ArtifactAdded,
    Subscribed,
    Unsubscribed,
    Acked,
    /// A type tag outside the known set, carrying the original dotted name
    /// verbatim. The event log preserves these on load instead of treating
    /// them as malformed, and re-serializes the same string on append.
    Unknown(String),
}

impl FabricEventType {
    fn as_str(&self) -> &str {
        match self {
            FabricEventType::ChannelCreated => "channel.created",
            FabricEventType::ChannelArchived => "channel.archived",
            FabricEventType::MessagePosted => "message.posted",
            FabricEventType::ReplyPosted => "reply.posted",
            FabricEventType::ArtifactAdded => "artifact.added",
            FabricEventType::Subscribed => "subscribed",
            FabricEventType::Unsubscribed => "unsubscribed",
            FabricEventType::Acked => "acked",
            FabricEventType::Unknown(s) => s,
        }
    }
}

impl Serialize for FabricEventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FabricEventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Err(D::Error::custom("fabric event type must not be empty"));
        }
        Ok(match s.as_str() {
            "channel.created" => FabricEventType::ChannelCreated,
            "channel.archived" => FabricEventType::ChannelArchived,
            "message.posted" => FabricEventType::MessagePosted,
            "reply.posted" => FabricEventType::ReplyPosted,
            "artifact.added" => FabricEventType::ArtifactAdded,
            "subscribed" => FabricEventType::Subscribed,
            "unsubscribed" => FabricEventType::Unsubscribed,
            "acked" => FabricEventType::Acked,
            _ => FabricEventType::Unknown(s),
        })
    }
}

/// A single fabric event: common context fields plus at most one payload slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricEvent {
    #[serde(rename = "type")]
    pub event_type: FabricEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channel_slug: Option<String>,
    /// Root thread id for a reply, persisted so Restore can rebuild the
    /// `reply_to` edge without re-walking the chain.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub thread: Option<Thread>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subscription: Option<Subscription>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mentions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub participants: Option<Vec<String>>,
}

impl FabricEvent {
    fn base(event_type: FabricEventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            channel_id: None,
            channel_slug: None,
            parent_id: None,
            agent_id: None,
            thread: None,
            subscription: None,
            mentions: None,
            participants: None,
        }
    }

    pub fn channel_created(channel_id: &str, channel_slug: &str, thread: Thread) -> Self {
        Self {
            channel_id: Some(channel_id.to_string()),
            channel_slug: Some(channel_slug.to_string()),
            thread: Some(thread),
            ..Self::base(FabricEventType::ChannelCreated)
        }
    }

    pub fn channel_archived(channel_id: &str, channel_slug: &str) -> Self {
        Self {
            channel_id: Some(channel_id.to_string()),
            channel_slug: Some(channel_slug.to_string()),
            ..Self::base(FabricEventType::ChannelArchived)
        }
    }

    pub fn message_posted(
        channel_id: &str,
        channel_slug: &str,
        agent_id: &str,
        thread: Thread,
        mentions: Vec<String>,
        participants: Vec<String>,
    ) -> Self {
        Self {
            channel_id: Some(channel_id.to_string()),
            channel_slug: Some(channel_slug.to_string()),
            agent_id: Some(agent_id.to_string()),
            thread: Some(thread),
            mentions: Some(mentions),
            participants: Some(participants),
            ..Self::base(FabricEventType::MessagePosted)
        }
    }

    pub fn reply_posted(
        channel_id: &str,
        channel_slug: &str,
        agent_id: &str,
        parent_id: &str,
        thread: Thread,
        participants: Vec<String>,
    ) -> Self {
        Self {
            channel_id: Some(channel_id.to_string()),
            channel_slug: Some(channel_slug.to_string()),
            agent_id: Some(agent_id.to_string()),
            parent_id: Some(parent_id.to_string()),
            thread: Some(thread),
            participants: Some(participants),
            ..Self::base(FabricEventType::ReplyPosted)
        }
    }

    /// `target_id` (the thread the artifact references) rides in the generic
    /// `parent_id` context slot so Restore can rebuild the `references` edge.
    pub fn artifact_added(agent_id: &str, target_id: &str, thread: Thread) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            parent_id: Some(target_id.to_string()),
            thread: Some(thread),
            ..Self::base(FabricEventType::ArtifactAdded)
        }
    }

    pub fn subscribed(channel_id: &str, channel_slug: &str, agent_id: &str, subscription: Subscription) -> Self {
        Self {
            channel_id: Some(channel_id.to_string()),
            channel_slug: Some(channel_slug.to_string()),
            agent_id: Some(agent_id.to_string()),
            subscription: Some(subscription),
            ..Self::base(FabricEventType::Subscribed)
        }
    }

    pub fn unsubscribed(channel_id: &str, channel_slug: &str, agent_id: &str) -> Self {
        Self {
            channel_id: Some(channel_id.to_string()),
            channel_slug: Some(channel_slug.to_string()),
            agent_id: Some(agent_id.to_string()),
            ..Self::base(FabricEventType::Unsubscribed)
        }
    }

    pub fn acked(agent_id: &str, message_ids: Vec<String>) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            mentions: Some(message_ids),
            ..Self::base(FabricEventType::Acked)
        }
    }
}

/// Installed once at startup; invoked synchronously for every emitted event.
pub type EventHandler = Arc<dyn Fn(&FabricEvent) + Send + Sync>;

/// Composes multiple sinks into one handler — this is how the service
/// simultaneously feeds the Notification Broker and the Event Log.
pub fn chain_handler(handlers: Vec<EventHandler>) -> EventHandler {
    Arc::new(move |event: &FabricEvent| {
        for h in &handlers {
            h(event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn chain_handler_invokes_every_sink() {
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let (a1, b1) = (a.clone(), b.clone());
        let h1: EventHandler = Arc::new(move |_| {
            a1.fetch_add(1, Ordering::SeqCst);
        });
        let h2: EventHandler = Arc::new(move |_| {
            b1.fetch_add(1, Ordering::SeqCst);
        });
        let chained = chain_handler(vec![h1, h2]);
        chained(&FabricEvent::channel_archived("c1", "general"));
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_type_serializes_with_dotted_names() {
        let event = FabricEvent::channel_archived("c1", "general");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "channel.archived");
    }
}
