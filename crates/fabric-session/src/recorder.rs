// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session recorder (C7, §4.7): owns a session directory, attaches to
//! typed pubsub brokers (possibly late, possibly staggered), and fans
//! their events into per-sink buffered journals while aggregating worker
//! and token-usage metadata.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fabric_journal::JournalWriter;
use fabric_pubsub::Broker;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::SessionError;
use crate::index::{SessionIndex, SessionIndexEntry};
use crate::metadata::{MetadataStore, SessionMetadata};
use crate::summary;
use crate::types::{McpEvent, MessageEntry, ProcessEvent, ProcessEventKind, ProcessRole};

const METADATA_FILE: &str = "metadata.json";
const SUMMARY_FILE: &str = "summary.md";
const PROBE_FILE: &str = ".fabric-session-writable";

#[derive(Clone)]
struct WorkerJournals {
    output: Arc<JournalWriter>,
    raw: Arc<JournalWriter>,
}

struct SessionShared {
    dir: PathBuf,
    coordinator_output: Arc<JournalWriter>,
    coordinator_raw: Arc<JournalWriter>,
    messages: Arc<JournalWriter>,
    mcp_requests: Arc<JournalWriter>,
    workers: AsyncMutex<HashMap<String, WorkerJournals>>,
    metadata: MetadataStore,
}

/// Owns one session directory for the lifetime of a run (C7).
pub struct Session {
    id: String,
    dir: PathBuf,
    cancel: CancellationToken,
    closed: AtomicBool,
    shared: Arc<SessionShared>,
}

impl Session {
    /// Creates the directory tree, probes writeability, opens the four
    /// fixed journals, and seeds `metadata.json`. Any failure along the
    /// way closes every writer already opened before returning.
    pub async fn new(id: impl Into<String>, dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let id = id.into();
        let dir = dir.into();

        std::fs::create_dir_all(&dir)?;
        probe_writable(&dir)?;
        std::fs::create_dir_all(dir.join("coordinator"))?;

        let [coordinator_output, coordinator_raw, messages, mcp_requests] = open_fixed_journals(&dir).await?;

        let metadata = SessionMetadata::new(&id, dir.clone());
        let metadata_path = dir.join(METADATA_FILE);
        if let Err(e) = metadata.save(&metadata_path) {
            for w in [&coordinator_output, &coordinator_raw, &messages, &mcp_requests] {
                let _ = w.close().await;
            }
            return Err(e);
        }

        let shared = Arc::new(SessionShared {
            dir: dir.clone(),
            coordinator_output: Arc::new(coordinator_output),
            coordinator_raw: Arc::new(coordinator_raw),
            messages: Arc::new(messages),
            mcp_requests: Arc::new(mcp_requests),
            workers: AsyncMutex::new(HashMap::new()),
            metadata: MetadataStore::new(metadata),
        });

        Ok(Self {
            id,
            dir,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            shared,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> SessionMetadata {
        self.shared.metadata.snapshot()
    }

    fn check_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    pub fn write_coordinator_event(&self, ts: chrono::DateTime<chrono::Utc>, role: &str, content: &str) -> Result<(), SessionError> {
        self.check_open()?;
        let line = format!("{} [{}] {}\n", ts.to_rfc3339(), role, content);
        self.shared.coordinator_output.write(line.as_bytes())?;
        Ok(())
    }

    pub async fn write_worker_event(&self, worker_id: &str, ts: chrono::DateTime<chrono::Utc>, content: &str) -> Result<(), SessionError> {
        self.check_open()?;
        let journals = get_or_create_worker_journals(&self.shared, worker_id).await?;
        let line = format!("{} {}\n", ts.to_rfc3339(), content);
        journals.output.write(line.as_bytes())?;
        Ok(())
    }

    pub fn write_coordinator_raw_json(&self, bytes: &[u8]) -> Result<(), SessionError> {
        self.check_open()?;
        self.shared.coordinator_raw.write(bytes)?;
        Ok(())
    }

    pub async fn write_worker_raw_json(&self, worker_id: &str, bytes: &[u8]) -> Result<(), SessionError> {
        self.check_open()?;
        let journals = get_or_create_worker_journals(&self.shared, worker_id).await?;
        journals.raw.write(bytes)?;
        Ok(())
    }

    pub fn write_message(&self, entry: &MessageEntry) -> Result<(), SessionError> {
        self.check_open()?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.shared.messages.write(&line)?;
        Ok(())
    }

    pub fn write_mcp_event(&self, event: &McpEvent) -> Result<(), SessionError> {
        self.check_open()?;
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.shared.mcp_requests.write(&line)?;
        Ok(())
    }

    /// Overwrites `workers/<id>/accountability_summary.md` with mode 0600
    /// and returns the written path.
    pub fn write_worker_accountability_summary(&self, worker_id: &str, bytes: &[u8]) -> Result<PathBuf, SessionError> {
        self.check_open()?;
        let dir = self.dir.join("workers").join(worker_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("accountability_summary.md");
        std::fs::write(&path, bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(path)
    }

    /// Consumes `ProcessEvent`s for both roles: coordinator events route to
    /// coordinator journals, worker events route to worker journals and
    /// mutate worker metadata.
    pub fn attach_v2_event_bus(&self, broker: Arc<Broker<(), ProcessEvent>>) {
        self.spawn_process_subscriber(broker, false);
    }

    /// Consumes `ProcessEvent`s for workers only — used during staggered
    /// initialization before the v2 bus is attached.
    pub fn attach_process_broker(&self, broker: Arc<Broker<(), ProcessEvent>>) {
        self.spawn_process_subscriber(broker, true);
    }

    fn spawn_process_subscriber(&self, broker: Arc<Broker<(), ProcessEvent>>, workers_only: bool) {
        let mut rx = broker.subscribe(self.cancel.clone());
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let event = envelope.payload;
                if workers_only && matches!(event.role, ProcessRole::Coordinator) {
                    continue;
                }
                if let Err(e) = route_process_event(&shared, &event).await {
                    warn!(error = %e, "session recorder: failed to route process event");
                }
            }
        });
    }

    /// Routes `message.posted` entries to `messages.jsonl`.
    pub fn attach_message_broker(&self, broker: Arc<Broker<(), MessageEntry>>) {
        let mut rx = broker.subscribe(self.cancel.clone());
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = append_json_line(&shared.messages, &envelope.payload) {
                    warn!(error = %e, "session recorder: failed to write message entry");
                }
            }
        });
    }

    /// Routes all RPC events to `mcp_requests.jsonl`.
    pub fn attach_mcp_broker(&self, broker: Arc<Broker<(), McpEvent>>) {
        let mut rx = broker.subscribe(self.cancel.clone());
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = append_json_line(&shared.mcp_requests, &envelope.payload) {
                    warn!(error = %e, "session recorder: failed to write mcp event");
                }
            }
        });
    }

    /// Closes the session: rejects subsequent writes, closes every writer
    /// (recording only the first error), persists final metadata and
    /// `summary.md`, and updates the parent directory's `sessions.json`.
    /// Cancelling detaches every attached subscriber. Idempotent-failing.
    pub async fn close(&self, status: &str) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(SessionError::Closed);
        }
        self.cancel.cancel();

        let mut first_err: Option<SessionError> = None;
        {
            let mut workers = self.shared.workers.lock().await;
            for (_, journals) in workers.drain() {
                if let Err(e) = journals.output.close().await {
                    first_err.get_or_insert(SessionError::Journal(e));
                }
                if let Err(e) = journals.raw.close().await {
                    first_err.get_or_insert(SessionError::Journal(e));
                }
            }
        }
        for writer in [
            &self.shared.coordinator_output,
            &self.shared.coordinator_raw,
            &self.shared.messages,
            &self.shared.mcp_requests,
        ] {
            if let Err(e) = writer.close().await {
                first_err.get_or_insert(SessionError::Journal(e));
            }
        }

        let metadata_path = self.dir.join(METADATA_FILE);
        self.shared.metadata.mark_closed(status);
        let live = self.shared.metadata.snapshot();
        let mut metadata = SessionMetadata::load(&metadata_path).unwrap_or_else(|_| live.clone());
        metadata.end_time = live.end_time;
        metadata.status = live.status;
        metadata.workers = live.workers;
        metadata.token_usage = live.token_usage;
        metadata.save(&metadata_path)?;

        std::fs::write(self.dir.join(SUMMARY_FILE), summary::render(&metadata))?;

        if let Some(sessions_root) = self.dir.parent() {
            SessionIndex::update(
                sessions_root,
                SessionIndexEntry {
                    id: self.id.clone(),
                    start_time: metadata.start_time,
                    end_time: metadata.end_time,
                    status: metadata.status.clone(),
                    epic_id: None,
                    work_dir: self.dir.clone(),
                    accountability_summary_path: None,
                    worker_count: metadata.workers.len(),
                    tasks_completed: 0,
                    total_commits: 0,
                },
            )?;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn probe_writable(dir: &Path) -> Result<(), SessionError> {
    let probe = dir.join(PROBE_FILE);
    match std::fs::File::create(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            Ok(())
        }
        Err(e) => Err(SessionError::NotWritable(dir.to_path_buf(), e.to_string())),
    }
}

async fn open_fixed_journals(dir: &Path) -> Result<[JournalWriter; 4], SessionError> {
    let paths = [
        dir.join("coordinator").join("output.log"),
        dir.join("coordinator").join("raw.jsonl"),
        dir.join("messages.jsonl"),
        dir.join("mcp_requests.jsonl"),
    ];
    let mut opened: Vec<JournalWriter> = Vec::with_capacity(paths.len());
    for path in &paths {
        match JournalWriter::open(path) {
            Ok(writer) => opened.push(writer),
            Err(e) => {
                for writer in opened {
                    let _ = writer.close().await;
                }
                return Err(SessionError::Journal(e));
            }
        }
    }
    let mut it = opened.into_iter();
    Ok([it.next().unwrap(), it.next().unwrap(), it.next().unwrap(), it.next().unwrap()])
}

/// Looks up a worker's journal pair, lazily creating `workers/<id>/` and
/// its two journals on first use. A concurrent first-use race may open and
/// immediately discard one extra pair of file handles; writes are never lost.
async fn get_or_create_worker_journals(shared: &SessionShared, worker_id: &str) -> Result<WorkerJournals, SessionError> {
    {
        let guard = shared.workers.lock().await;
        if let Some(journals) = guard.get(worker_id) {
            return Ok(journals.clone());
        }
    }
    let worker_dir = shared.dir.join("workers").join(worker_id);
    std::fs::create_dir_all(&worker_dir)?;
    let output = Arc::new(JournalWriter::open(worker_dir.join("output.log"))?);
    let raw = Arc::new(JournalWriter::open(worker_dir.join("raw.jsonl"))?);
    let journals = WorkerJournals { output, raw };
    let mut guard = shared.workers.lock().await;
    Ok(guard.entry(worker_id.to_string()).or_insert(journals).clone())
}

async fn route_process_event(shared: &Arc<SessionShared>, event: &ProcessEvent) -> Result<(), SessionError> {
    shared.metadata.apply_process_event(event);

    let content = match event.kind {
        ProcessEventKind::Error => Some(format!("Error: {}", event.error.clone().unwrap_or_default())),
        ProcessEventKind::Spawned if event.role.worker_id().is_some() => Some("Worker spawned".to_string()),
        _ => event.text.clone(),
    };
    let Some(content) = content.filter(|c| !c.is_empty()) else {
        return Ok(());
    };

    match &event.role {
        ProcessRole::Coordinator => {
            let line = format!("{} [coordinator] {}\n", event.timestamp.to_rfc3339(), content);
            shared.coordinator_output.write(line.as_bytes())?;
        }
        ProcessRole::Worker { id } => {
            let journals = get_or_create_worker_journals(shared, id).await?;
            let line = format!("{} {}\n", event.timestamp.to_rfc3339(), content);
            journals.output.write(line.as_bytes())?;
        }
    }
    Ok(())
}

fn append_json_line<T: serde::Serialize>(writer: &JournalWriter, value: &T) -> Result<(), SessionError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write(&line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{McpEventType, ProcessRole};
    use chrono::Utc;
    use fabric_domain::MessageKind;
    use std::time::Duration;

    #[tokio::test]
    async fn new_creates_directory_tree_and_seeds_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let session_dir = dir.path().join("session-1");
        let session = Session::new("session-1", &session_dir).await.unwrap();
        assert!(session_dir.join("coordinator").is_dir());
        assert!(session_dir.join("metadata.json").exists());
        session.close("completed").await.unwrap();
    }

    #[tokio::test]
    async fn write_coordinator_event_formats_rfc3339_role_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new("s-1", dir.path().join("s-1")).await.unwrap();
        session.write_coordinator_event(Utc::now(), "coordinator", "hello").unwrap();
        session.close("completed").await.unwrap();
        let text = std::fs::read_to_string(dir.path().join("s-1/coordinator/output.log")).unwrap();
        assert!(text.contains("[coordinator] hello"));
    }

    #[tokio::test]
    async fn write_after_close_returns_closed() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new("s-1", dir.path().join("s-1")).await.unwrap();
        session.close("completed").await.unwrap();
        assert!(matches!(session.write_coordinator_event(Utc::now(), "coordinator", "x"), Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn double_close_returns_closed() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new("s-1", dir.path().join("s-1")).await.unwrap();
        session.close("completed").await.unwrap();
        assert!(matches!(session.close("completed").await, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn close_writes_summary_and_updates_session_index() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new("s-1", dir.path().join("s-1")).await.unwrap();
        session.close("completed").await.unwrap();

        assert!(dir.path().join("s-1/summary.md").exists());
        let index = SessionIndex::load(dir.path()).unwrap();
        assert_eq!(index.sessions.len(), 1);
        assert_eq!(index.sessions[0].id, "s-1");
        assert_eq!(index.sessions[0].status, "completed");
    }

    #[tokio::test]
    async fn staggered_attachment_routes_process_message_and_mcp_events() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new("s-1", dir.path().join("s-1")).await.unwrap();

        let process_broker: Arc<Broker<(), ProcessEvent>> = Arc::new(Broker::default());
        let message_broker: Arc<Broker<(), MessageEntry>> = Arc::new(Broker::default());
        session.attach_process_broker(process_broker.clone());
        session.attach_message_broker(message_broker.clone());

        process_broker.publish((), ProcessEvent::spawned(ProcessRole::Worker { id: "worker-1".into() }));
        message_broker.publish(
            (),
            MessageEntry {
                id: "m-1".into(),
                timestamp: Utc::now(),
                from: "a".into(),
                to: "b".into(),
                content: "hi".into(),
                kind: MessageKind::Info,
            },
        );

        tokio::time::sleep(Duration::from_millis(30)).await;

        let mcp_broker: Arc<Broker<(), McpEvent>> = Arc::new(Broker::default());
        session.attach_mcp_broker(mcp_broker.clone());
        mcp_broker.publish(
            (),
            McpEvent {
                timestamp: Utc::now(),
                event_type: McpEventType::Request,
                method: "tools/call".into(),
                tool_name: "grep".into(),
                worker_id: Some("worker-1".into()),
                request: serde_json::json!({"pattern": "foo"}),
                response: None,
                duration_ms: 5,
            },
        );

        let process_bus: Arc<Broker<(), ProcessEvent>> = Arc::new(Broker::default());
        session.attach_v2_event_bus(process_bus.clone());
        process_bus.publish((), ProcessEvent::output(ProcessRole::Coordinator, "coordinator says hi"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        session.close("completed").await.unwrap();

        let worker_log = std::fs::read_to_string(dir.path().join("s-1/workers/worker-1/output.log")).unwrap();
        assert!(worker_log.contains("Worker spawned"));
        let messages = std::fs::read_to_string(dir.path().join("s-1/messages.jsonl")).unwrap();
        assert!(messages.contains("\"id\":\"m-1\""));
        let mcp = std::fs::read_to_string(dir.path().join("s-1/mcp_requests.jsonl")).unwrap();
        assert!(mcp.contains("\"tool_name\":\"grep\""));
        let coordinator_log = std::fs::read_to_string(dir.path().join("s-1/coordinator/output.log")).unwrap();
        assert!(coordinator_log.contains("coordinator says hi"));

        let metadata = SessionMetadata::load(&dir.path().join("s-1/metadata.json")).unwrap();
        assert_eq!(metadata.workers.len(), 1);
        assert_eq!(metadata.workers[0].id, "worker-1");
    }

    #[tokio::test]
    async fn cancelling_context_detaches_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new("s-1", dir.path().join("s-1")).await.unwrap();
        let broker: Arc<Broker<(), ProcessEvent>> = Arc::new(Broker::default());
        session.attach_v2_event_bus(broker.clone());
        assert_eq!(broker.subscriber_count(), 1);

        session.close("completed").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn writeability_probe_rejects_read_only_directory() {
        let dir = tempfile::tempdir().unwrap();
        let session_dir = dir.path().join("ro");
        std::fs::create_dir_all(&session_dir).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&session_dir, std::fs::Permissions::from_mode(0o500)).unwrap();
            let result = Session::new("ro", &session_dir).await;
            assert!(matches!(result, Err(SessionError::NotWritable(_, _))));
            std::fs::set_permissions(&session_dir, std::fs::Permissions::from_mode(0o700)).unwrap();
        }
    }
}
