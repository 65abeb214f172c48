// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("unsupported fabric event schema version: {0}")]
    UnsupportedVersion(u32),
    #[error("malformed fabric event: {event_type} is missing required field '{field}'")]
    MissingField { event_type: String, field: &'static str },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Journal(#[from] fabric_journal::JournalError),
    #[error(transparent)]
    Domain(#[from] fabric_domain::DomainError),
}
