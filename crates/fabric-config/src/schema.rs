// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_sessions_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fabric")
        .join("sessions")
}

/// Numeric defaults matching §4.1/§4.2/§4.5/§5 of the runtime's component design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Buffered journal writer capacity in records (§4.1).
    pub journal_capacity: usize,
    /// Buffered journal writer flush ticker interval, in milliseconds (§4.1).
    pub journal_flush_interval_ms: u64,
    /// Notification broker debounce window, in milliseconds (§4.5).
    pub debounce_ms: u64,
    /// Per-subscriber bounded queue depth for pubsub brokers (§4.2, §5).
    pub pubsub_queue_depth: usize,
    /// Bounded inbox depth for the notification broker (§4.5, §5).
    pub notification_inbox_depth: usize,
    /// Root directory under which session directories are created.
    #[serde(default = "default_sessions_root")]
    pub sessions_root: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            journal_capacity: fabric_journal::DEFAULT_CAPACITY,
            journal_flush_interval_ms: fabric_journal::DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
            debounce_ms: fabric_notify::DEFAULT_DEBOUNCE.as_millis() as u64,
            pubsub_queue_depth: fabric_pubsub::DEFAULT_QUEUE_DEPTH,
            notification_inbox_depth: fabric_notify::DEFAULT_INBOX_CAPACITY,
            sessions_root: default_sessions_root(),
        }
    }
}

impl RuntimeConfig {
    pub fn journal_flush_interval(&self) -> Duration {
        Duration::from_millis(self.journal_flush_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
