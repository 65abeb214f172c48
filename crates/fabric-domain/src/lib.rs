// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The fabric domain store (C3): threads, dependencies, subscriptions and
//! acknowledgements, plus derived per-agent unacked summaries.
mod error;
mod model;
mod store;

pub use error::DomainError;
pub use model::{
    Ack, Dependency, MessageKind, Relation, Subscription, SubscriptionMode, Thread, ThreadVariant, UnackedSummary,
    FIXED_CHANNELS,
};
pub use store::{AckRepo, DependencyRepo, FabricStore, SubscriptionRepo, ThreadRepo};
