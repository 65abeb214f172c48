// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("thread not found: {0}")]
    ThreadNotFound(String),
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("duplicate channel slug: {0}")]
    DuplicateSlug(String),
    #[error("duplicate dependency: {thread} --{relation:?}--> {depends_on}")]
    DuplicateDependency {
        thread: String,
        depends_on: String,
        relation: crate::model::Relation,
    },
}
