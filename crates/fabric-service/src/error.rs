// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("thread {0} is not a message")]
    NotAMessage(String),
    #[error("thread not found: {0}")]
    ThreadNotFound(String),
    #[error("artifact path is a directory: {0}")]
    PathIsDirectory(String),
    #[error("reply_to cycle detected walking to root from {0}")]
    ReplyCycle(String),
    #[error(transparent)]
    Domain(#[from] fabric_domain::DomainError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
