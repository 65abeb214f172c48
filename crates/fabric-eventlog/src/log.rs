// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Append-only fabric event journal (C6, §4.6): `fabric_events.jsonl` inside
//! a session directory, one `{version, timestamp, event}` object per line.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fabric_journal::JournalWriter;
use fabric_service::{EventHandler, FabricEvent};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EventLogError;

pub const CURRENT_VERSION: u32 = 1;
pub const FILE_NAME: &str = "fabric_events.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedRecord {
    version: u32,
    timestamp: DateTime<Utc>,
    event: FabricEvent,
}

/// Durable sink for fabric events, backed by a buffered journal writer.
pub struct EventLog {
    journal: JournalWriter,
    path: PathBuf,
}

impl EventLog {
    pub fn open(session_dir: impl AsRef<Path>) -> Result<Self, EventLogError> {
        let path = session_dir.as_ref().join(FILE_NAME);
        let journal = JournalWriter::open(&path)?;
        Ok(Self { journal, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &FabricEvent) -> Result<(), EventLogError> {
        let record = PersistedRecord { version: CURRENT_VERSION, timestamp: event.timestamp, event: event.clone() };
        let mut bytes = serde_json::to_vec(&record).expect("fabric event is always serializable");
        bytes.push(b'\n');
        self.journal.write(&bytes)?;
        Ok(())
    }

    /// Wraps this log as an `EventHandler` for composition via `chain_handler`.
    /// Write failures are logged, not propagated (the handler signature has
    /// no channel to surface them through).
    pub fn as_handler(self: Arc<Self>) -> EventHandler {
        Arc::new(move |event: &FabricEvent| {
            if let Err(e) = self.append(event) {
                warn!(error = %e, "failed to append fabric event to event log");
            }
        })
    }

    pub async fn close(&self) -> Result<(), EventLogError> {
        self.journal.close().await?;
        Ok(())
    }
}

/// True iff the event log file exists and is non-empty.
pub fn has_persisted_fabric_state(session_dir: impl AsRef<Path>) -> bool {
    let path = session_dir.as_ref().join(FILE_NAME);
    std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Reads the event log if present, tolerating malformed lines (partial
/// tails from an unclean shutdown). A structurally valid line carrying an
/// unsupported schema version aborts the load with a clear error.
pub fn load(session_dir: impl AsRef<Path>) -> Result<Vec<FabricEvent>, EventLogError> {
    let path = session_dir.as_ref().join(FILE_NAME);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut events = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(line = lineno, error = %e, "skipping malformed fabric event line");
                continue;
            }
        };
        if let Some(version) = value.get("version").and_then(|v| v.as_u64()) {
            if version as u32 != CURRENT_VERSION {
                return Err(EventLogError::UnsupportedVersion(version as u32));
            }
        }
        match serde_json::from_value::<PersistedRecord>(value) {
            Ok(record) => events.push(record.event),
            Err(e) => {
                warn!(line = lineno, error = %e, "skipping unparseable fabric event line");
            }
        }
    }
    Ok(events)
}
