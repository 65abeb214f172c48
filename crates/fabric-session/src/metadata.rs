// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session metadata (§3, §4.7): the aggregated, persisted view of a
//! session's worker roster and token usage, rebuilt incrementally from
//! `ProcessEvent`s under a single mutex.
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::types::{ProcessEvent, ProcessEventKind, ProcessRole};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetadata {
    pub id: String,
    pub spawned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub final_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end_time: Option<DateTime<Utc>>,
    pub status: String,
    pub work_dir: PathBuf,
    pub workers: Vec<WorkerMetadata>,
    pub token_usage: TokenUsage,
}

impl SessionMetadata {
    pub fn new(session_id: impl Into<String>, work_dir: PathBuf) -> Self {
        Self {
            session_id: session_id.into(),
            start_time: Utc::now(),
            end_time: None,
            status: "running".to_string(),
            work_dir,
            workers: Vec::new(),
            token_usage: TokenUsage::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Mutex-guarded aggregation surface applying the token accounting law of
/// §8: `total_input_tokens` takes the LAST observed value; the other two
/// fields accumulate.
pub(crate) struct MetadataStore {
    inner: Mutex<SessionMetadata>,
}

impl MetadataStore {
    pub(crate) fn new(metadata: SessionMetadata) -> Self {
        Self { inner: Mutex::new(metadata) }
    }

    pub(crate) fn apply_process_event(&self, event: &ProcessEvent) {
        let mut meta = self.inner.lock().unwrap();
        match event.kind {
            ProcessEventKind::Spawned => {
                if let Some(id) = event.role.worker_id() {
                    if !meta.workers.iter().any(|w| w.id == id) {
                        meta.workers.push(WorkerMetadata {
                            id: id.to_string(),
                            spawned_at: event.timestamp,
                            final_phase: None,
                            retired_at: None,
                        });
                    }
                }
            }
            ProcessEventKind::StatusChange => {
                if let Some(id) = event.role.worker_id() {
                    if let Some(worker) = meta.workers.iter_mut().find(|w| w.id == id) {
                        worker.final_phase = event.phase.clone();
                        if event.status.as_deref() == Some("retired") {
                            worker.retired_at = Some(event.timestamp);
                        }
                    }
                }
            }
            ProcessEventKind::TokenUsage => {
                if let Some(metrics) = &event.metrics {
                    if let Some(input) = metrics.input_tokens {
                        meta.token_usage.total_input_tokens = input;
                    }
                    if let Some(output) = metrics.output_tokens {
                        meta.token_usage.total_output_tokens += output;
                    }
                    if let Some(cost) = metrics.cost_usd {
                        meta.token_usage.total_cost_usd += cost;
                    }
                }
            }
            _ => {}
        }
    }

    pub(crate) fn snapshot(&self) -> SessionMetadata {
        self.inner.lock().unwrap().clone()
    }

    pub(crate) fn mark_closed(&self, status: &str) {
        let mut meta = self.inner.lock().unwrap();
        meta.status = status.to_string();
        meta.end_time = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_metadata() -> SessionMetadata {
        SessionMetadata::new("s-1", PathBuf::from("/tmp/s-1"))
    }

    #[test]
    fn spawned_event_appends_worker_once() {
        let store = MetadataStore::new(base_metadata());
        let event = ProcessEvent::spawned(ProcessRole::Worker { id: "w-1".into() });
        store.apply_process_event(&event);
        store.apply_process_event(&event);
        assert_eq!(store.snapshot().workers.len(), 1);
    }

    #[test]
    fn status_change_sets_final_phase_and_retired_at_when_retired() {
        let store = MetadataStore::new(base_metadata());
        store.apply_process_event(&ProcessEvent::spawned(ProcessRole::Worker { id: "w-1".into() }));
        let mut change = ProcessEvent::spawned(ProcessRole::Worker { id: "w-1".into() });
        change.kind = ProcessEventKind::StatusChange;
        change.phase = Some("done".into());
        change.status = Some("retired".into());
        store.apply_process_event(&change);

        let worker = store.snapshot().workers.into_iter().next().unwrap();
        assert_eq!(worker.final_phase.as_deref(), Some("done"));
        assert!(worker.retired_at.is_some());
    }

    #[test]
    fn token_usage_last_input_and_accumulated_output_and_cost() {
        let store = MetadataStore::new(base_metadata());
        let mut e1 = ProcessEvent::spawned(ProcessRole::Coordinator);
        e1.kind = ProcessEventKind::TokenUsage;
        e1.metrics = Some(crate::types::TokenMetrics { input_tokens: Some(100), output_tokens: Some(10), cost_usd: Some(0.01) });
        store.apply_process_event(&e1);

        let mut e2 = ProcessEvent::spawned(ProcessRole::Coordinator);
        e2.kind = ProcessEventKind::TokenUsage;
        e2.metrics = Some(crate::types::TokenMetrics { input_tokens: Some(250), output_tokens: Some(20), cost_usd: Some(0.02) });
        store.apply_process_event(&e2);

        let usage = store.snapshot().token_usage;
        assert_eq!(usage.total_input_tokens, 250);
        assert_eq!(usage.total_output_tokens, 30);
        assert!((usage.total_cost_usd - 0.03).abs() < 1e-9);
    }

    #[test]
    fn mark_closed_sets_status_and_end_time() {
        let store = MetadataStore::new(base_metadata());
        store.mark_closed("completed");
        let snap = store.snapshot();
        assert_eq!(snap.status, "completed");
        assert!(snap.end_time.is_some());
    }
}
