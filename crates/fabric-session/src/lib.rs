// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session recorder (C7) and cross-session index (C8): attaches to typed
//! pubsub brokers and fans their events into per-session, per-sink
//! buffered journals, aggregating metadata and a human-readable summary.
mod error;
mod index;
mod metadata;
mod recorder;
mod summary;
mod types;

pub use error::SessionError;
pub use index::{SessionIndex, SessionIndexEntry};
pub use metadata::{SessionMetadata, TokenUsage, WorkerMetadata};
pub use recorder::Session;
pub use summary::render as render_summary;
pub use types::{McpEvent, McpEventType, MessageEntry, ProcessEvent, ProcessEventKind, ProcessRole, TokenMetrics};
