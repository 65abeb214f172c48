// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Fabric service (C4, §4.4): the only component permitted to mutate the
//! domain store. Every mutating operation here emits exactly one
//! `FabricEvent` through the handler installed at construction.
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use fabric_domain::{
    Dependency, FabricStore, MessageKind, Relation, Subscription, SubscriptionMode, Thread, ThreadVariant,
    UnackedSummary, FIXED_CHANNELS,
};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::ServiceError;
use crate::events::{EventHandler, FabricEvent};

fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([A-Za-z0-9._-]+)").expect("static mention pattern is valid"))
}

/// Parses `@mentions` out of free text: lowercased, deduplicated, order preserved.
pub fn parse_mentions(content: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for cap in mention_regex().captures_iter(content) {
        let m = cap[1].to_lowercase();
        if seen.insert(m.clone()) {
            out.push(m);
        }
    }
    out
}

fn infer_media_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()) {
        Some(ext) => match ext.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "pdf" => "application/pdf",
            "txt" | "md" => "text/plain",
            "json" => "application/json",
            "log" => "text/plain",
            _ => "application/octet-stream",
        },
        None => "application/octet-stream",
    }
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn dedup_union(existing: &[String], additions: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out = existing.to_vec();
    let mut seen: std::collections::HashSet<String> = out.iter().cloned().collect();
    for a in additions {
        if seen.insert(a.clone()) {
            out.push(a);
        }
    }
    out
}

pub struct SendMessageParams {
    pub channel_slug: String,
    pub content: String,
    pub kind: Option<MessageKind>,
    pub creator: String,
    pub mentions: Option<Vec<String>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

pub struct ReplyParams {
    pub message_id: String,
    pub content: String,
    pub kind: Option<MessageKind>,
    pub creator: String,
    pub mentions: Option<Vec<String>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

pub struct AttachArtifactParams {
    pub target_id: String,
    pub path: std::path::PathBuf,
    pub name: Option<String>,
    pub creator: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// The only component permitted to mutate the fabric domain store.
///
/// Holds the store behind an `Arc` so the same store can be shared with the
/// Notification Broker (C5), which reads subscriptions independently.
pub struct FabricService {
    store: std::sync::Arc<FabricStore>,
    handler: EventHandler,
}

impl FabricService {
    pub fn new(store: std::sync::Arc<FabricStore>, handler: EventHandler) -> Self {
        Self { store, handler }
    }

    pub fn store(&self) -> &FabricStore {
        &self.store
    }

    fn emit(&self, event: FabricEvent) {
        (self.handler)(&event);
    }

    fn channel_id_for_slug(&self, slug: &str) -> Result<String, ServiceError> {
        self.store
            .threads
            .get_by_slug(slug)
            .map(|t| t.id)
            .ok_or_else(|| ServiceError::UnknownChannel(slug.to_string()))
    }

    /// Creates the six fixed channels in order, links each non-root channel
    /// as a `child_of` of root, and auto-subscribes `creator` to `system`
    /// with mode `all`.
    pub fn init_session(&self, creator: &str) -> Result<(), ServiceError> {
        let mut root_id = None;
        for slug in FIXED_CHANNELS {
            let thread = self.store.threads.create(
                creator,
                ThreadVariant::Channel { slug: slug.to_string(), title: slug.to_string() },
            )?;
            if slug == "root" {
                root_id = Some(thread.id.clone());
            } else if let Some(root) = &root_id {
                self.store.dependencies.add(Dependency {
                    thread: thread.id.clone(),
                    depends_on: root.clone(),
                    relation: Relation::ChildOf,
                })?;
            }
            self.emit(FabricEvent::channel_created(&thread.id, slug, thread.clone()));
        }
        let system_id = self.channel_id_for_slug("system")?;
        let sub = self.store.subscriptions.subscribe(&system_id, creator, SubscriptionMode::All);
        self.emit(FabricEvent::subscribed(&system_id, "system", creator, sub));
        Ok(())
    }

    pub fn send_message(&self, params: SendMessageParams) -> Result<Thread, ServiceError> {
        let channel_id = self.channel_id_for_slug(&params.channel_slug)?;
        let kind = params.kind.unwrap_or(MessageKind::Info);
        let mentions = params.mentions.unwrap_or_else(|| parse_mentions(&params.content));
        let participants = dedup_union(&[params.creator.clone()], mentions.iter().cloned());

        let thread = self.store.threads.create(
            params.creator.clone(),
            ThreadVariant::Message {
                content: params.content,
                kind,
                mentions: mentions.clone(),
                participants: participants.clone(),
                metadata: params.metadata,
            },
        )?;
        self.store.dependencies.add(Dependency {
            thread: thread.id.clone(),
            depends_on: channel_id.clone(),
            relation: Relation::ChildOf,
        })?;
        self.emit(FabricEvent::message_posted(
            &channel_id,
            &params.channel_slug,
            &params.creator,
            thread.clone(),
            mentions,
            participants,
        ));
        Ok(thread)
    }

    /// Walks `reply_to` parents upward from `message_id` until a thread with
    /// no `reply_to` parent is found — the root. Bounded by the number of
    /// known threads: a well-formed log can't have a `reply_to` chain longer
    /// than that, so exceeding it means a cycle, which only a malformed
    /// (e.g. hand-edited or corrupted) restored log could introduce.
    fn walk_to_root(&self, message_id: &str) -> Result<String, ServiceError> {
        let mut current = message_id.to_string();
        let bound = self.store.threads.count();
        for _ in 0..=bound {
            let parents = self.store.dependencies.get_parents(&current, Some(Relation::ReplyTo));
            match parents.first() {
                Some(edge) => current = edge.depends_on.clone(),
                None => return Ok(current),
            }
        }
        Err(ServiceError::ReplyCycle(message_id.to_string()))
    }

    pub fn reply(&self, params: ReplyParams) -> Result<Thread, ServiceError> {
        let target = self
            .store
            .threads
            .get(&params.message_id)
            .ok_or_else(|| ServiceError::ThreadNotFound(params.message_id.clone()))?;
        if !target.variant.is_message() {
            return Err(ServiceError::NotAMessage(params.message_id));
        }
        let root_id = self.walk_to_root(&params.message_id)?;
        let root = self
            .store
            .threads
            .get(&root_id)
            .ok_or_else(|| ServiceError::ThreadNotFound(root_id.clone()))?;

        let kind = params.kind.unwrap_or(MessageKind::Response);
        let mentions = params.mentions.unwrap_or_else(|| parse_mentions(&params.content));
        let participants = dedup_union(&[params.creator.clone()], mentions.iter().cloned());

        let reply_thread = self.store.threads.create(
            params.creator.clone(),
            ThreadVariant::Message {
                content: params.content,
                kind,
                mentions: mentions.clone(),
                participants: participants.clone(),
                metadata: params.metadata,
            },
        )?;
        self.store.dependencies.add(Dependency {
            thread: reply_thread.id.clone(),
            depends_on: root_id.clone(),
            relation: Relation::ReplyTo,
        })?;

        let (root_channel_id, root_channel_slug) = self.root_context(&root_id);
        let extended_participants = self.extend_root_participants(root, &params.creator, &mentions);

        self.emit(FabricEvent::reply_posted(
            &root_channel_id,
            &root_channel_slug,
            &params.creator,
            &root_id,
            reply_thread.clone(),
            extended_participants,
        ));
        Ok(reply_thread)
    }

    /// The channel a root message is `child_of`, for event context. Falls
    /// back to the root's own id/empty slug if the edge is somehow missing.
    fn root_context(&self, root_id: &str) -> (String, String) {
        self.store
            .dependencies
            .get_parents(root_id, Some(Relation::ChildOf))
            .first()
            .and_then(|edge| self.store.threads.get(&edge.depends_on))
            .and_then(|t| t.variant.as_channel().map(|(slug, _)| (t.id.clone(), slug.to_string())))
            .unwrap_or_else(|| (root_id.to_string(), String::new()))
    }

    /// Best-effort: extends the root's participants with the replier and any
    /// new mentions. Failure to persist the update does not abort the reply.
    fn extend_root_participants(&self, root: Thread, replier: &str, mentions: &[String]) -> Vec<String> {
        let existing = root
            .variant
            .as_message()
            .map(|(_, _, _, participants)| participants.to_vec())
            .unwrap_or_default();
        let extended = dedup_union(&existing, std::iter::once(replier.to_string()).chain(mentions.iter().cloned()));

        let mut updated = root.clone();
        if let ThreadVariant::Message { participants, .. } = &mut updated.variant {
            *participants = extended.clone();
        }
        if let Err(e) = self.store.threads.update(updated) {
            warn!(error = %e, thread = %root.id, "failed to extend root participants");
        }
        extended
    }

    pub fn attach_artifact(&self, params: AttachArtifactParams) -> Result<Thread, ServiceError> {
        let metadata = std::fs::metadata(&params.path)?;
        if metadata.is_dir() {
            return Err(ServiceError::PathIsDirectory(params.path.display().to_string()));
        }
        let sha256 = sha256_file(&params.path)?;
        let media_type = infer_media_type(&params.path);
        let display_name = params
            .name
            .unwrap_or_else(|| params.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
        let storage_uri = format!("file://{}", params.path.display());

        let thread = self.store.threads.create(
            params.creator.clone(),
            ThreadVariant::Artifact {
                display_name,
                media_type: media_type.to_string(),
                size_bytes: metadata.len(),
                storage_uri,
                sha256,
            },
        )?;
        self.store.dependencies.add(Dependency {
            thread: thread.id.clone(),
            depends_on: params.target_id.clone(),
            relation: Relation::References,
        })?;
        self.emit(FabricEvent::artifact_added(&params.creator, &params.target_id, thread.clone()));
        Ok(thread)
    }

    pub fn list_messages(&self, channel_slug: &str, limit: usize) -> Result<Vec<Thread>, ServiceError> {
        let channel_id = self.channel_id_for_slug(channel_slug)?;
        let mut messages: Vec<Thread> = self
            .store
            .dependencies
            .get_children(&channel_id, Some(Relation::ChildOf))
            .into_iter()
            .filter_map(|edge| self.store.threads.get(&edge.thread))
            .filter(|t| t.variant.is_message())
            .collect();
        messages.sort_by_key(|t| t.seq);
        if limit > 0 && messages.len() > limit {
            messages.truncate(limit);
        }
        Ok(messages)
    }

    pub fn ack(&self, agent: &str, ids: &[String]) -> Result<(), ServiceError> {
        for id in ids {
            self.store.acks.ack(agent, id);
        }
        self.emit(FabricEvent::acked(agent, ids.to_vec()));
        Ok(())
    }

    pub fn subscribe(&self, channel_slug: &str, agent: &str, mode: SubscriptionMode) -> Result<Subscription, ServiceError> {
        let channel_id = self.channel_id_for_slug(channel_slug)?;
        let sub = self.store.subscriptions.subscribe(&channel_id, agent, mode);
        self.emit(FabricEvent::subscribed(&channel_id, channel_slug, agent, sub.clone()));
        Ok(sub)
    }

    pub fn unsubscribe(&self, channel_slug: &str, agent: &str) -> Result<(), ServiceError> {
        let channel_id = self.channel_id_for_slug(channel_slug)?;
        self.store.subscriptions.unsubscribe(&channel_id, agent);
        self.emit(FabricEvent::unsubscribed(&channel_id, channel_slug, agent));
        Ok(())
    }

    /// Unsubscribes `agent` from every channel it is subscribed to,
    /// emitting one `unsubscribed` event per channel. Best-effort: a
    /// per-channel failure to resolve a slug is logged and skipped.
    pub fn unsubscribe_all(&self, agent: &str) {
        for sub in self.store.subscriptions.list_for_agent(agent) {
            let slug = self
                .store
                .threads
                .get(&sub.channel_id)
                .and_then(|t| t.variant.as_channel().map(|(s, _)| s.to_string()))
                .unwrap_or_else(|| {
                    warn!(channel_id = %sub.channel_id, "unsubscribe_all: channel slug unresolved, using id");
                    sub.channel_id.clone()
                });
            self.store.subscriptions.unsubscribe(&sub.channel_id, agent);
            self.emit(FabricEvent::unsubscribed(&sub.channel_id, &slug, agent));
        }
    }

    pub fn unacked_summary(&self, agent: &str) -> HashMap<String, UnackedSummary> {
        self.store.unacked_summary(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_handler() -> (EventHandler, Arc<Mutex<Vec<FabricEvent>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let handler: EventHandler = Arc::new(move |e: &FabricEvent| log2.lock().unwrap().push(e.clone()));
        (handler, log)
    }

    fn service_with_session() -> (FabricService, Arc<Mutex<Vec<FabricEvent>>>) {
        let (handler, log) = recording_handler();
        let svc = FabricService::new(Arc::new(FabricStore::new()), handler);
        svc.init_session("root-agent").unwrap();
        (svc, log)
    }

    #[test]
    fn init_session_creates_six_fixed_channels() {
        let (svc, _) = service_with_session();
        for slug in FIXED_CHANNELS {
            assert!(svc.store().threads.get_by_slug(slug).is_some(), "missing {slug}");
        }
    }

    #[test]
    fn init_session_auto_subscribes_creator_to_system() {
        let (svc, _) = service_with_session();
        let system = svc.store().threads.get_by_slug("system").unwrap();
        let subs = svc.store().subscriptions.list_for_channel(&system.id);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].mode, SubscriptionMode::All);
    }

    #[test]
    fn send_message_resolves_unknown_channel() {
        let (svc, _) = service_with_session();
        let err = svc.send_message(SendMessageParams {
            channel_slug: "nope".into(),
            content: "hi".into(),
            kind: None,
            creator: "alice".into(),
            mentions: None,
            metadata: Default::default(),
        });
        assert!(matches!(err, Err(ServiceError::UnknownChannel(_))));
    }

    #[test]
    fn send_message_parses_mentions_when_none_supplied() {
        let (svc, _) = service_with_session();
        let thread = svc
            .send_message(SendMessageParams {
                channel_slug: "general".into(),
                content: "hey @Bob and @carol".into(),
                kind: None,
                creator: "alice".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        let (_, _, mentions, participants) = thread.variant.as_message().unwrap();
        assert_eq!(mentions, &["bob".to_string(), "carol".to_string()]);
        assert_eq!(participants, &["alice".to_string(), "bob".to_string(), "carol".to_string()]);
    }

    #[test]
    fn reply_flattens_to_root_across_multiple_hops() {
        let (svc, _) = service_with_session();
        let root_msg = svc
            .send_message(SendMessageParams {
                channel_slug: "general".into(),
                content: "root message".into(),
                kind: None,
                creator: "alice".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        let reply1 = svc
            .reply(ReplyParams {
                message_id: root_msg.id.clone(),
                content: "first reply".into(),
                kind: None,
                creator: "bob".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        let reply2 = svc
            .reply(ReplyParams {
                message_id: reply1.id.clone(),
                content: "second reply".into(),
                kind: None,
                creator: "carol".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        let parents = svc.store().dependencies.get_parents(&reply2.id, Some(Relation::ReplyTo));
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].depends_on, root_msg.id, "reply must flatten directly to root");
    }

    #[test]
    fn reply_to_cycle_errors_instead_of_hanging() {
        let (svc, _) = service_with_session();
        let m1 = svc
            .send_message(SendMessageParams {
                channel_slug: "general".into(),
                content: "m1".into(),
                kind: None,
                creator: "alice".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        let m2 = svc
            .reply(ReplyParams {
                message_id: m1.id.clone(),
                content: "m2".into(),
                kind: None,
                creator: "bob".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        // A normal reply() never introduces a cycle; simulate the only way
        // SPEC_FULL.md says one can arise: a malformed/hand-edited restored
        // log. Point m1's reply_to back at m2 to close the loop.
        svc.store()
            .dependencies
            .add(Dependency { thread: m1.id.clone(), depends_on: m2.id.clone(), relation: Relation::ReplyTo })
            .unwrap();
        let err = svc.reply(ReplyParams {
            message_id: m2.id.clone(),
            content: "m3".into(),
            kind: None,
            creator: "carol".into(),
            mentions: None,
            metadata: Default::default(),
        });
        assert!(matches!(err, Err(ServiceError::ReplyCycle(_))));
    }

    #[test]
    fn reply_extends_root_participants() {
        let (svc, _) = service_with_session();
        let root_msg = svc
            .send_message(SendMessageParams {
                channel_slug: "general".into(),
                content: "root".into(),
                kind: None,
                creator: "alice".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        svc.reply(ReplyParams {
            message_id: root_msg.id.clone(),
            content: "reply @dave".into(),
            kind: None,
            creator: "bob".into(),
            mentions: None,
            metadata: Default::default(),
        })
        .unwrap();
        let updated_root = svc.store().threads.get(&root_msg.id).unwrap();
        let (_, _, _, participants) = updated_root.variant.as_message().unwrap();
        assert!(participants.contains(&"bob".to_string()));
        assert!(participants.contains(&"dave".to_string()));
    }

    #[test]
    fn attach_artifact_infers_media_type_and_hashes_contents() {
        let (svc, _) = service_with_session();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, b"hello world").unwrap();
        let msg = svc
            .send_message(SendMessageParams {
                channel_slug: "general".into(),
                content: "see attached".into(),
                kind: None,
                creator: "alice".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        let artifact = svc
            .attach_artifact(AttachArtifactParams {
                target_id: msg.id,
                path: path.clone(),
                name: None,
                creator: "alice".into(),
                metadata: Default::default(),
            })
            .unwrap();
        match artifact.variant {
            ThreadVariant::Artifact { media_type, storage_uri, .. } => {
                assert_eq!(media_type, "text/plain");
                assert!(storage_uri.starts_with("file://"));
            }
            _ => panic!("expected artifact variant"),
        }
    }

    #[test]
    fn attach_artifact_rejects_directory() {
        let (svc, _) = service_with_session();
        let dir = tempfile::tempdir().unwrap();
        let msg = svc
            .send_message(SendMessageParams {
                channel_slug: "general".into(),
                content: "x".into(),
                kind: None,
                creator: "alice".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        let err = svc.attach_artifact(AttachArtifactParams {
            target_id: msg.id,
            path: dir.path().to_path_buf(),
            name: None,
            creator: "alice".into(),
            metadata: Default::default(),
        });
        assert!(matches!(err, Err(ServiceError::PathIsDirectory(_))));
    }

    #[test]
    fn list_messages_orders_by_sequence_and_respects_limit() {
        let (svc, _) = service_with_session();
        for i in 0..5 {
            svc.send_message(SendMessageParams {
                channel_slug: "general".into(),
                content: format!("msg {i}"),
                kind: None,
                creator: "alice".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        }
        let all = svc.list_messages("general", 0).unwrap();
        assert_eq!(all.len(), 5);
        let limited = svc.list_messages("general", 2).unwrap();
        assert_eq!(limited.len(), 2);
        assert!(limited[0].seq < limited[1].seq);
    }

    #[test]
    fn ack_then_unacked_summary_excludes_acked_message() {
        let (svc, _) = service_with_session();
        let msg = svc
            .send_message(SendMessageParams {
                channel_slug: "general".into(),
                content: "needs ack".into(),
                kind: None,
                creator: "alice".into(),
                mentions: None,
                metadata: Default::default(),
            })
            .unwrap();
        let before = svc.unacked_summary("bob");
        assert_eq!(before["general"].unacked_count, 1);
        svc.ack("bob", &[msg.id]).unwrap();
        let after = svc.unacked_summary("bob");
        assert_eq!(after["general"].unacked_count, 0);
    }

    #[test]
    fn unsubscribe_all_removes_every_subscription_and_emits_events() {
        let (svc, log) = service_with_session();
        svc.subscribe("general", "alice", SubscriptionMode::All).unwrap();
        svc.subscribe("tasks", "alice", SubscriptionMode::Mentions).unwrap();
        log.lock().unwrap().clear();
        svc.unsubscribe_all("alice");
        assert!(svc.store().subscriptions.list_for_agent("alice").is_empty());
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn mention_parsing_lowercases_dedupes_and_preserves_order() {
        let mentions = parse_mentions("cc @Alice @BOB @alice again @carol");
        assert_eq!(mentions, vec!["alice".to_string(), "bob".to_string(), "carol".to_string()]);
    }
}
