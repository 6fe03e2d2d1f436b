use chainview_core::connection::GENERIC_FAILURE_MESSAGE;
use chainview_core::{
    AggregatorSession, ChainNode, ConnectionStats, DedupStats, NodeStatus, Progress, RegionState,
    SessionOutcome,
};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;

/// Everything the CLI prints once a session ends.
#[derive(Debug, Clone, Serialize)]
pub struct WatchReport {
    pub session_id: Option<String>,
    pub outcome: SessionOutcome,
    pub regions: Vec<RegionState>,
    pub chain: Vec<ChainNode>,
    pub progress: Progress,
    pub connection: ConnectionStats,
    pub dedup: DedupStats,
}

impl WatchReport {
    pub fn from_parts(session: &AggregatorSession, connection: ConnectionStats) -> Self {
        let outcome = session
            .outcome()
            .cloned()
            .unwrap_or_else(|| SessionOutcome::Failed {
                message: GENERIC_FAILURE_MESSAGE.to_string(),
            });
        Self {
            session_id: session.session_id().map(ToString::to_string),
            outcome,
            regions: session.snapshots(),
            chain: session.chain(),
            progress: session.progress(),
            connection,
            dedup: session.dedup_stats(),
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "session: {}",
            self.session_id.as_deref().unwrap_or("-")
        );
        match &self.outcome {
            SessionOutcome::Completed { result } => {
                let _ = writeln!(out, "outcome: completed");
                if let Some(result) = result {
                    let _ = writeln!(out, "result: {}", render_value(result));
                }
            }
            SessionOutcome::Failed { message } => {
                let _ = writeln!(out, "outcome: failed ({message})");
            }
        }
        let _ = writeln!(
            out,
            "progress: {}/{} regions finalized, {} records, {} receipt-stamped",
            self.progress.regions_finalized,
            self.progress.regions_seen,
            self.progress.records_observed,
            self.progress.synthesized_timestamps
        );
        let _ = writeln!(
            out,
            "connection: {} attempts, {} opens; dedup: {} dropped",
            self.connection.attempts,
            self.connection.opens,
            self.dedup.dropped_exact + self.dedup.dropped_fuzzy
        );

        for region in &self.regions {
            let state = if region.streaming { "streaming" } else { "final" };
            let _ = writeln!(out, "\n[{}] {state}", region.region);
            if !region.merged_text.is_empty() {
                let _ = writeln!(out, "{}", region.merged_text);
            }
        }

        if !self.chain.is_empty() {
            let _ = writeln!(out, "\nthought chain:");
            for (index, node) in self.chain.iter().enumerate() {
                let marker = match node.status {
                    NodeStatus::Success => "ok",
                    NodeStatus::Pending => "..",
                    NodeStatus::Error => "!!",
                };
                let _ = writeln!(out, "{:>3}. [{marker}] {}", index + 1, node.title);
                for line in node.content.lines() {
                    let _ = writeln!(out, "     {line}");
                }
            }
        }
        out
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
