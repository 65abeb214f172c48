// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire types carried on the brokers a session attaches to (§3): process
//! lifecycle events, inter-agent messages, and MCP tool-call events.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which process emitted a [`ProcessEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Coordinator,
    Worker { id: String },
}

impl ProcessRole {
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            ProcessRole::Coordinator => None,
            ProcessRole::Worker { id } => Some(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessEventKind {
    Spawned,
    Output,
    StatusChange,
    TokenUsage,
    Incoming,
    Error,
    Ready,
    Working,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenMetrics {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cost_usd: Option<f64>,
}

/// A lifecycle or output event from the coordinator or a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub role: ProcessRole,
    pub kind: ProcessEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub raw: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metrics: Option<TokenMetrics>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl ProcessEvent {
    pub fn spawned(role: ProcessRole) -> Self {
        Self {
            role,
            kind: ProcessEventKind::Spawned,
            timestamp: Utc::now(),
            text: None,
            raw: None,
            phase: None,
            status: None,
            metrics: None,
            error: None,
        }
    }

    pub fn output(role: ProcessRole, text: impl Into<String>) -> Self {
        Self {
            role,
            kind: ProcessEventKind::Output,
            timestamp: Utc::now(),
            text: Some(text.into()),
            raw: None,
            phase: None,
            status: None,
            metrics: None,
            error: None,
        }
    }
}

/// A durable inter-agent message routed to `messages.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub to: String,
    pub content: String,
    pub kind: fabric_domain::MessageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpEventType {
    Request,
    Response,
    Error,
}

/// One RPC tool-call leg, routed to `mcp_requests.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: McpEventType,
    pub method: String,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub worker_id: Option<String>,
    pub request: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response: Option<serde_json::Value>,
    pub duration_ms: u64,
}
