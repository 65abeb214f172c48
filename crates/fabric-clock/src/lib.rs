// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Clock seam (C10): abstracts wall-clock reads and sleeps so the debounce
//! logic in the notification broker and the flush ticker in the buffered
//! journal writer can be driven deterministically in tests.
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Abstracts `now()` and `sleep()` so production code never calls
/// `Utc::now()` or `tokio::time::sleep` directly.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for `d`. Cancellation-safe: callers race this inside `select!`.
    async fn sleep(&self, d: Duration);
}

/// Real clock backed by the system time and the tokio runtime's timer wheel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// Deterministic clock for tests: `now()` returns a fixed, manually advanced
/// instant; `sleep()` still delegates to the tokio timer, so tests pair this
/// with `#[tokio::test(start_paused = true)]` and `tokio::time::advance`.
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.current.lock().unwrap() = t;
    }

    pub fn advance(&self, d: chrono::Duration) {
        let mut guard = self.current.lock().unwrap();
        *guard += d;
    }
}

#[async_trait::async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
