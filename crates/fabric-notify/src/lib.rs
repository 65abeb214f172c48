// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Notification broker (C5) and command submitter seam (C9): debounced,
//! per-agent consolidated nudge dispatch honoring subscription modes.
mod broker;
mod submitter;

pub use broker::{NotificationBroker, DEFAULT_DEBOUNCE, DEFAULT_INBOX_CAPACITY};
pub use submitter::{Command, CommandSource, CommandSubmitter, RecordingSubmitter};
