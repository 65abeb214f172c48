// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Buffered journal writer (C1): an append-only sink with a bounded
//! in-memory buffer, a high-water synchronous flush, and a background
//! ticker that flushes under sparse load. Used by every per-session sink
//! (coordinator/worker output logs, raw vendor JSON, messages, MCP events,
//! and the fabric event log itself).
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default buffer capacity (records).
pub const DEFAULT_CAPACITY: usize = 256;
/// Default flush ticker interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal writer is closed")]
    Closed,
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),
}

struct Buffer {
    records: Vec<Vec<u8>>,
}

struct Inner {
    path: PathBuf,
    capacity: usize,
    high_water: usize,
    buffer: Mutex<Buffer>,
    file: Mutex<File>,
    closed: std::sync::atomic::AtomicBool,
    error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Inner {
    fn push(&self, bytes: &[u8]) -> Result<bool, JournalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JournalError::Closed);
        }
        let mut buf = self.buffer.lock().unwrap();
        buf.records.push(bytes.to_vec());
        Ok(buf.records.len() >= self.high_water)
    }

    /// Drains the buffer and writes every record to the file in order.
    /// Per-record failures are counted; remaining records are still attempted.
    fn flush(&self) {
        let drained = {
            let mut buf = self.buffer.lock().unwrap();
            std::mem::take(&mut buf.records)
        };
        if drained.is_empty() {
            return;
        }
        let mut file = self.file.lock().unwrap();
        for record in drained {
            if let Err(e) = file.write_all(&record) {
                self.record_error(e);
                continue;
            }
            if !record.ends_with(b"\n") {
                if let Err(e) = file.write_all(b"\n") {
                    self.record_error(e);
                }
            }
        }
        if let Err(e) = file.flush() {
            self.record_error(e);
        }
    }

    fn record_error(&self, e: std::io::Error) {
        warn!(error = %e, path = %self.path.display(), "journal write failed");
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap() = Some(e.to_string());
    }
}

/// A single append-only journal with a bounded buffer and background flush ticker.
pub struct JournalWriter {
    inner: std::sync::Arc<Inner>,
    cancel: CancellationToken,
    flush_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl JournalWriter {
    /// Opens (creating if absent) the file at `path` in append mode and
    /// starts the background flush ticker.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        Self::with_options(path, DEFAULT_CAPACITY, DEFAULT_FLUSH_INTERVAL)
    }

    pub fn with_options(
        path: impl AsRef<Path>,
        capacity: usize,
        flush_interval: Duration,
    ) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let high_water = (capacity * 3) / 4;
        let inner = std::sync::Arc::new(Inner {
            path,
            capacity,
            high_water,
            buffer: Mutex::new(Buffer { records: Vec::with_capacity(capacity) }),
            file: Mutex::new(file),
            closed: std::sync::atomic::AtomicBool::new(false),
            error_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
        });

        let cancel = CancellationToken::new();
        let task_inner = inner.clone();
        let task_cancel = cancel.clone();
        let flush_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => task_inner.flush(),
                }
            }
        });

        Ok(Self {
            inner,
            cancel,
            flush_task: AsyncMutex::new(Some(flush_task)),
        })
    }

    /// Copies `bytes` into the internal buffer. Triggers a synchronous flush
    /// if the buffer has reached the high-water mark.
    pub fn write(&self, bytes: &[u8]) -> Result<(), JournalError> {
        let should_flush = self.inner.push(bytes)?;
        if should_flush {
            self.inner.flush();
        }
        Ok(())
    }

    /// Forces an immediate flush of any buffered records. No-op when empty.
    pub fn flush(&self) {
        self.inner.flush();
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn error_count(&self) -> u64 {
        self.inner.error_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().unwrap().clone()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Closes the writer: stops the flush ticker, performs a final flush,
    /// and releases the file handle. Idempotent-failing: a second call
    /// returns `Closed`.
    pub async fn close(&self) -> Result<(), JournalError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(JournalError::Closed);
        }
        self.cancel.cancel();
        if let Some(task) = self.flush_task.lock().await.take() {
            let _ = task.await;
        }
        self.inner.flush();
        debug!(path = %self.inner.path.display(), "journal writer closed");
        match self.inner.last_error.lock().unwrap().clone() {
            Some(msg) => Err(JournalError::Io(std::io::Error::other(msg))),
            None => Ok(()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_file(path: &Path) -> String {
        let mut s = String::new();
        File::open(path).unwrap().read_to_string(&mut s).unwrap();
        s
    }

    #[tokio::test]
    async fn write_then_flush_persists_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.log");
        let w = JournalWriter::with_options(&path, 256, Duration::from_secs(3600)).unwrap();
        w.write(b"hello\n").unwrap();
        assert_eq!(w.len(), 1);
        w.flush();
        assert_eq!(w.len(), 0);
        assert_eq!(read_file(&path), "hello\n");
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_appends_newline_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.log");
        let w = JournalWriter::with_options(&path, 256, Duration::from_secs(3600)).unwrap();
        w.write(b"no-newline").unwrap();
        w.flush();
        assert_eq!(read_file(&path), "no-newline\n");
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn high_water_mark_triggers_synchronous_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.log");
        // capacity 4 -> high water = 3
        let w = JournalWriter::with_options(&path, 4, Duration::from_secs(3600)).unwrap();
        w.write(b"a\n").unwrap();
        w.write(b"b\n").unwrap();
        assert_eq!(w.len(), 2);
        w.write(b"c\n").unwrap();
        // reaching high water flushed synchronously
        assert_eq!(w.len(), 0);
        assert_eq!(read_file(&path), "a\nb\nc\n");
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn background_ticker_flushes_on_sparse_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.log");
        let w = JournalWriter::with_options(&path, 256, Duration::from_millis(20)).unwrap();
        w.write(b"only one\n").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(w.len(), 0);
        assert_eq!(read_file(&path), "only one\n");
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.log");
        let w = JournalWriter::with_options(&path, 256, Duration::from_secs(3600)).unwrap();
        w.close().await.unwrap();
        assert!(matches!(w.write(b"x\n"), Err(JournalError::Closed)));
    }

    #[tokio::test]
    async fn double_close_returns_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.log");
        let w = JournalWriter::with_options(&path, 256, Duration::from_secs(3600)).unwrap();
        w.close().await.unwrap();
        assert!(matches!(w.close().await, Err(JournalError::Closed)));
    }

    #[tokio::test]
    async fn close_performs_final_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.log");
        let w = JournalWriter::with_options(&path, 256, Duration::from_secs(3600)).unwrap();
        w.write(b"last\n").unwrap();
        w.close().await.unwrap();
        assert_eq!(read_file(&path), "last\n");
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.log");
        let w = JournalWriter::with_options(&path, 256, Duration::from_secs(3600)).unwrap();
        w.flush();
        assert_eq!(read_file(&path), "");
        w.close().await.unwrap();
    }
}
