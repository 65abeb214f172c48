// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory repositories backing the fabric domain store (§4.3). Each
//! repository is a single shared mutex over a plain index — adequate per
//! the spec, which explicitly permits this.
use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use crate::error::DomainError;
use crate::model::{Ack, Dependency, Relation, Subscription, SubscriptionMode, Thread, ThreadVariant, UnackedSummary};

// ─── Threads ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ThreadsInner {
    by_id: HashMap<String, Thread>,
    by_slug: HashMap<String, String>,
    next_seq: u64,
}

#[derive(Default)]
pub struct ThreadRepo {
    inner: Mutex<ThreadsInner>,
}

impl ThreadRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a fresh id and the next sequence number, stores, and returns
    /// the stored thread.
    pub fn create(&self, creator: impl Into<String>, variant: ThreadVariant) -> Result<Thread, DomainError> {
        let mut inner = self.inner.lock().unwrap();
        if let ThreadVariant::Channel { slug, .. } = &variant {
            if inner.by_slug.contains_key(slug) {
                return Err(DomainError::DuplicateSlug(slug.clone()));
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let thread = Thread {
            id: Uuid::new_v4().to_string(),
            seq,
            created_at: Utc::now(),
            creator: creator.into(),
            metadata: Default::default(),
            variant,
        };
        if let ThreadVariant::Channel { slug, .. } = &thread.variant {
            inner.by_slug.insert(slug.clone(), thread.id.clone());
        }
        inner.by_id.insert(thread.id.clone(), thread.clone());
        Ok(thread)
    }

    /// Like `create`, but preserves a caller-supplied id and sequence number —
    /// used by Restore to rebuild the store from the event log verbatim.
    pub fn insert_restored(&self, thread: Thread) {
        let mut inner = self.inner.lock().unwrap();
        if let ThreadVariant::Channel { slug, .. } = &thread.variant {
            inner.by_slug.insert(slug.clone(), thread.id.clone());
        }
        if thread.seq >= inner.next_seq {
            inner.next_seq = thread.seq + 1;
        }
        inner.by_id.insert(thread.id.clone(), thread);
    }

    pub fn get(&self, id: &str) -> Option<Thread> {
        self.inner.lock().unwrap().by_id.get(id).cloned()
    }

    /// Total number of known threads, used to bound walks over `reply_to`
    /// edges that must not loop forever on a cyclic (malformed) log.
    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().by_id.len()
    }

    pub fn get_by_slug(&self, slug: &str) -> Option<Thread> {
        let inner = self.inner.lock().unwrap();
        inner.by_slug.get(slug).and_then(|id| inner.by_id.get(id)).cloned()
    }

    /// Replaces a thread by id. Used only to extend a reply root's participants.
    pub fn update(&self, thread: Thread) -> Result<(), DomainError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.by_id.contains_key(&thread.id) {
            return Err(DomainError::ThreadNotFound(thread.id));
        }
        inner.by_id.insert(thread.id.clone(), thread);
        Ok(())
    }
}

// ─── Dependencies ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct DependencyRepo {
    edges: Mutex<Vec<Dependency>>,
}

impl DependencyRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, dep: Dependency) -> Result<(), DomainError> {
        let mut edges = self.edges.lock().unwrap();
        if edges
            .iter()
            .any(|e| e.thread == dep.thread && e.depends_on == dep.depends_on && e.relation == dep.relation)
        {
            return Err(DomainError::DuplicateDependency {
                thread: dep.thread,
                depends_on: dep.depends_on,
                relation: dep.relation,
            });
        }
        edges.push(dep);
        Ok(())
    }

    /// Edges whose `depends_on` matches `parent`, insertion order.
    pub fn get_children(&self, parent: &str, relation: Option<Relation>) -> Vec<Dependency> {
        self.edges
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.depends_on == parent && relation.map(|r| r == e.relation).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Edges whose `thread` matches `child`, insertion order.
    pub fn get_parents(&self, child: &str, relation: Option<Relation>) -> Vec<Dependency> {
        self.edges
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.thread == child && relation.map(|r| r == e.relation).unwrap_or(true))
            .cloned()
            .collect()
    }
}

// ─── Subscriptions ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct SubscriptionRepo {
    entries: Mutex<HashMap<(String, String), Subscription>>,
}

impl SubscriptionRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel_id: &str, agent_id: &str, mode: SubscriptionMode) -> Subscription {
        let mut entries = self.entries.lock().unwrap();
        let key = (channel_id.to_string(), agent_id.to_string());
        let created_at = entries.get(&key).map(|s| s.created_at).unwrap_or_else(Utc::now);
        let sub = Subscription {
            channel_id: channel_id.to_string(),
            agent_id: agent_id.to_string(),
            mode,
            created_at,
        };
        entries.insert(key, sub.clone());
        sub
    }

    /// Inserts a subscription verbatim, preserving its original `created_at` —
    /// used by Restore to rebuild state from the event log exactly.
    pub fn insert_restored(&self, sub: Subscription) {
        let key = (sub.channel_id.clone(), sub.agent_id.clone());
        self.entries.lock().unwrap().insert(key, sub);
    }

    pub fn unsubscribe(&self, channel_id: &str, agent_id: &str) -> Option<Subscription> {
        self.entries
            .lock()
            .unwrap()
            .remove(&(channel_id.to_string(), agent_id.to_string()))
    }

    pub fn list_for_channel(&self, channel_id: &str) -> Vec<Subscription> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.channel_id == channel_id)
            .cloned()
            .collect()
    }

    pub fn list_for_agent(&self, agent_id: &str) -> Vec<Subscription> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.agent_id == agent_id)
            .cloned()
            .collect()
    }
}

// ─── Acks ────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct AckRepo {
    entries: Mutex<HashMap<(String, String), Ack>>,
}

impl AckRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ack(&self, agent_id: &str, message_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            (agent_id.to_string(), message_id.to_string()),
            Ack {
                agent_id: agent_id.to_string(),
                message_id: message_id.to_string(),
                acked_at: Utc::now(),
            },
        );
    }

    pub fn is_acked(&self, agent_id: &str, message_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .contains_key(&(agent_id.to_string(), message_id.to_string()))
    }
}

// ─── Composed store ──────────────────────────────────────────────────────────

/// The four repositories composed into one handle, plus the cross-repo
/// unacked-summary query that §4.3 describes as "derived" state.
#[derive(Default)]
pub struct FabricStore {
    pub threads: ThreadRepo,
    pub dependencies: DependencyRepo,
    pub subscriptions: SubscriptionRepo,
    pub acks: AckRepo,
}

impl FabricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-channel `{unacked_count, last_unacked_seq}` for `agent`, keyed by
    /// channel slug, derived from channel children (`child_of` messages) and
    /// the ack repo.
    pub fn unacked_summary(&self, agent_id: &str) -> HashMap<String, UnackedSummary> {
        let mut out = HashMap::new();
        for slug in crate::model::FIXED_CHANNELS {
            let Some(channel) = self.threads.get_by_slug(slug) else {
                continue;
            };
            let children = self.dependencies.get_children(&channel.id, Some(Relation::ChildOf));
            let mut summary = UnackedSummary::default();
            for edge in children {
                let Some(msg) = self.threads.get(&edge.thread) else {
                    continue;
                };
                if !msg.variant.is_message() {
                    continue;
                }
                if self.acks.is_acked(agent_id, &msg.id) {
                    continue;
                }
                summary.unacked_count += 1;
                summary.last_unacked_seq = Some(summary.last_unacked_seq.map_or(msg.seq, |s| s.max(msg.seq)));
            }
            out.insert(slug.to_string(), summary);
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
