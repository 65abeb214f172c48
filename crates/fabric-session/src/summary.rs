// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Renders `summary.md` from closed session metadata (§4.7, §10.4).
use std::fmt::Write as _;

use crate::metadata::SessionMetadata;

pub fn render(metadata: &SessionMetadata) -> String {
    let mut out = String::new();
    writeln!(out, "# Session Summary").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "- id: {}", metadata.session_id).unwrap();
    writeln!(out, "- status: {}", metadata.status).unwrap();
    writeln!(out, "- start_time: {}", metadata.start_time.to_rfc3339()).unwrap();
    if let Some(end) = metadata.end_time {
        writeln!(out, "- end_time: {}", end.to_rfc3339()).unwrap();
    }
    writeln!(out).unwrap();

    writeln!(out, "## Workers").unwrap();
    writeln!(out).unwrap();
    if metadata.workers.is_empty() {
        writeln!(out, "(none)").unwrap();
    } else {
        for worker in &metadata.workers {
            let final_phase = worker.final_phase.as_deref().unwrap_or("-");
            let retired_at = worker
                .retired_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                out,
                "- {} (spawned_at: {}, final_phase: {}, retired_at: {})",
                worker.id,
                worker.spawned_at.to_rfc3339(),
                final_phase,
                retired_at,
            )
            .unwrap();
        }
    }
    writeln!(out).unwrap();

    writeln!(out, "## Token Usage").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "- total_input_tokens: {}", metadata.token_usage.total_input_tokens).unwrap();
    writeln!(out, "- total_output_tokens: {}", metadata.token_usage.total_output_tokens).unwrap();
    writeln!(out, "- total_cost_usd: {:.4}", metadata.token_usage.total_cost_usd).unwrap();

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{TokenUsage, WorkerMetadata};
    use chrono::Utc;
    use std::path::PathBuf;

    #[test]
    fn renders_headings_and_dash_for_unset_worker_fields() {
        let mut metadata = SessionMetadata::new("s-1", PathBuf::from("/tmp/s-1"));
        metadata.workers.push(WorkerMetadata {
            id: "w-1".into(),
            spawned_at: Utc::now(),
            final_phase: None,
            retired_at: None,
        });
        let rendered = render(&metadata);
        assert!(rendered.contains("# Session Summary"));
        assert!(rendered.contains("## Workers"));
        assert!(rendered.contains("## Token Usage"));
        assert!(rendered.contains("final_phase: -, retired_at: -"));
    }

    #[test]
    fn renders_token_usage_to_four_decimal_places() {
        let mut metadata = SessionMetadata::new("s-1", PathBuf::from("/tmp/s-1"));
        metadata.token_usage = TokenUsage { total_input_tokens: 10, total_output_tokens: 5, total_cost_usd: 0.1 };
        let rendered = render(&metadata);
        assert!(rendered.contains("total_cost_usd: 0.1000"));
    }

    #[test]
    fn renders_none_placeholder_when_no_workers() {
        let metadata = SessionMetadata::new("s-1", PathBuf::from("/tmp/s-1"));
        let rendered = render(&metadata);
        assert!(rendered.contains("(none)"));
    }
}
