// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session directory {0} is not writable: {1}")]
    NotWritable(std::path::PathBuf, String),
    #[error("session is closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("journal error: {0}")]
    Journal(#[from] fabric_journal::JournalError),
}
