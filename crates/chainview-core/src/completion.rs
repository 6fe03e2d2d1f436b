use crate::record::{RecordKind, StreamRecord, TimestampOrigin};
use crate::region::RegionAggregator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

pub const PIPELINE_ERROR_MESSAGE: &str = "pipeline reported an error";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Failed {
        message: String,
    },
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Progress {
    pub regions_seen: usize,
    pub regions_finalized: usize,
    pub records_observed: u64,
    pub synthesized_timestamps: u64,
    pub fraction: f64,
}

/// Settles a session exactly once and fans the outcome out to listeners.
#[derive(Default)]
pub struct CompletionTracker {
    outcome: Option<SessionOutcome>,
    listeners: Vec<mpsc::UnboundedSender<SessionOutcome>>,
    records_observed: u64,
    synthesized_timestamps: u64,
    in_progress: bool,
    final_seen: bool,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. A listener added after the session settled
    /// receives the outcome right away.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.outcome.as_ref() {
            Some(outcome) => {
                let _ = tx.send(outcome.clone());
            }
            None => self.listeners.push(tx),
        }
        rx
    }

    /// Feeds one accepted record. Returns the outcome if this record settled the session.
    pub fn observe(
        &mut self,
        record: &StreamRecord,
        regions: &RegionAggregator,
    ) -> Option<SessionOutcome> {
        if record.kind == RecordKind::Heartbeat {
            return None;
        }
        self.records_observed += 1;
        if record.timestamp_origin == TimestampOrigin::Receipt {
            self.synthesized_timestamps += 1;
        }
        if self.outcome.is_some() {
            return None;
        }

        match record.kind {
            RecordKind::Message => self.in_progress = true,
            RecordKind::Error => {
                let message = Some(record.content.trim())
                    .filter(|text| !text.is_empty())
                    .unwrap_or(PIPELINE_ERROR_MESSAGE)
                    .to_string();
                return self.settle(SessionOutcome::Failed { message });
            }
            RecordKind::Final => {
                let result = record.result.clone().or_else(|| {
                    Some(record.content.trim())
                        .filter(|text| !text.is_empty())
                        .map(|text| Value::String(text.to_string()))
                });
                if result.is_some() {
                    return self.settle(SessionOutcome::Completed { result });
                }
                self.final_seen = true;
            }
            RecordKind::Session | RecordKind::Heartbeat => {}
        }

        // Region settlement only completes once the producer has signalled
        // the end with a payload-less final record.
        if self.final_seen && regions.all_settled() {
            return self.settle(SessionOutcome::Completed { result: None });
        }
        None
    }

    /// The stream ended cleanly. Completes the session when a final record
    /// was seen or every region with content has settled.
    pub fn end_of_stream(&mut self, regions: &RegionAggregator) -> Option<SessionOutcome> {
        if self.outcome.is_some() {
            return None;
        }
        if self.final_seen || regions.all_settled() {
            return self.settle(SessionOutcome::Completed { result: None });
        }
        None
    }

    /// Settles the session as failed unless it already settled.
    pub fn fail(&mut self, message: impl Into<String>) -> Option<SessionOutcome> {
        if self.outcome.is_some() {
            return None;
        }
        self.settle(SessionOutcome::Failed {
            message: message.into(),
        })
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress && self.outcome.is_none()
    }

    pub fn progress(&self, regions: &RegionAggregator) -> Progress {
        let mut regions_seen = 0;
        let mut regions_finalized = 0;
        for state in regions.content_regions() {
            regions_seen += 1;
            if !state.streaming {
                regions_finalized += 1;
            }
        }

        let fraction = match self.outcome {
            Some(SessionOutcome::Completed { .. }) => 1.0,
            _ if regions_seen == 0 => 0.0,
            _ => regions_finalized as f64 / regions_seen as f64,
        };

        Progress {
            regions_seen,
            regions_finalized,
            records_observed: self.records_observed,
            synthesized_timestamps: self.synthesized_timestamps,
            fraction,
        }
    }

    /// Forgets the outcome and drops every listener, closing their channels.
    pub fn reset(&mut self) {
        self.outcome = None;
        self.listeners.clear();
        self.records_observed = 0;
        self.synthesized_timestamps = 0;
        self.in_progress = false;
        self.final_seen = false;
    }

    fn settle(&mut self, outcome: SessionOutcome) -> Option<SessionOutcome> {
        match &outcome {
            SessionOutcome::Completed { result } => {
                info!(
                    listeners = self.listeners.len(),
                    has_result = result.is_some(),
                    "session_completed"
                );
            }
            SessionOutcome::Failed { message } => {
                info!(listeners = self.listeners.len(), "session_failed: {message}");
            }
        }
        for listener in self.listeners.drain(..) {
            let _ = listener.send(outcome.clone());
        }
        self.in_progress = false;
        self.outcome = Some(outcome.clone());
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggregatorConfig;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record(kind: RecordKind, content: &str) -> StreamRecord {
        let ts = Utc
            .timestamp_millis_opt(1_771_848_000_000)
            .single()
            .expect("valid timestamp");
        StreamRecord::new("r-1", kind, "agent", "sql", content, ts)
    }

    #[test]
    fn final_with_result_notifies_every_listener_once() {
        let regions = RegionAggregator::new(&AggregatorConfig::default());
        let mut tracker = CompletionTracker::new();
        let mut first = tracker.subscribe();
        let mut second = tracker.subscribe();

        let done = record(RecordKind::Final, "").with_result(json!({"rows": 3}));
        assert!(tracker.observe(&done, &regions).is_some());
        assert!(tracker.observe(&done, &regions).is_none());

        let expected = SessionOutcome::Completed {
            result: Some(json!({"rows": 3})),
        };
        for rx in [&mut first, &mut second] {
            assert_eq!(rx.try_recv().expect("outcome"), expected);
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn final_without_payload_waits_for_regions() {
        let mut regions = RegionAggregator::new(&AggregatorConfig::default());
        let mut tracker = CompletionTracker::new();

        regions.merge_from("sql", "agent", "SELECT 1", false).expect("merge");
        assert!(tracker
            .observe(&record(RecordKind::Message, "SELECT 1"), &regions)
            .is_none());
        assert!(tracker.in_progress());
        assert!(tracker
            .observe(&record(RecordKind::Final, ""), &regions)
            .is_none());

        regions.merge_from("sql", "agent", "", true).expect("merge");
        let outcome = tracker.observe(&record(RecordKind::Message, "").with_final(true), &regions);
        assert_eq!(outcome, Some(SessionOutcome::Completed { result: None }));
        assert!(!tracker.in_progress());
    }

    #[test]
    fn settled_regions_wait_for_the_final_result() {
        let mut regions = RegionAggregator::new(&AggregatorConfig::default());
        let mut tracker = CompletionTracker::new();

        regions.merge_from("sql", "agent", "SELECT 1", true).expect("merge");
        let sql = record(RecordKind::Message, "SELECT 1").with_final(true);
        assert!(tracker.observe(&sql, &regions).is_none());

        regions
            .merge_from("analysis", "agent", "Three rows", false)
            .expect("merge");
        assert!(tracker
            .observe(&record(RecordKind::Message, "Three rows"), &regions)
            .is_none());

        let done = record(RecordKind::Final, "").with_result(json!({"rows": 3}));
        assert_eq!(
            tracker.observe(&done, &regions),
            Some(SessionOutcome::Completed {
                result: Some(json!({"rows": 3})),
            })
        );
    }

    #[test]
    fn end_of_stream_completes_after_payloadless_final() {
        let mut regions = RegionAggregator::new(&AggregatorConfig::default());
        let mut tracker = CompletionTracker::new();
        regions.merge_from("analysis", "agent", "Partial", false).expect("merge");
        tracker.observe(&record(RecordKind::Message, "Partial"), &regions);
        assert!(tracker.end_of_stream(&regions).is_none());

        assert!(tracker
            .observe(&record(RecordKind::Final, ""), &regions)
            .is_none());
        assert_eq!(
            tracker.end_of_stream(&regions),
            Some(SessionOutcome::Completed { result: None })
        );
        assert!(tracker.end_of_stream(&regions).is_none());
    }

    #[test]
    fn end_of_stream_completes_when_regions_settled() {
        let mut regions = RegionAggregator::new(&AggregatorConfig::default());
        let mut tracker = CompletionTracker::new();
        regions.merge_from("sql", "agent", "SELECT 1", true).expect("merge");
        tracker.observe(&record(RecordKind::Message, "SELECT 1").with_final(true), &regions);
        assert!(tracker.outcome().is_none());

        assert_eq!(
            tracker.end_of_stream(&regions),
            Some(SessionOutcome::Completed { result: None })
        );
    }

    #[test]
    fn final_content_is_used_as_result_text() {
        let regions = RegionAggregator::new(&AggregatorConfig::default());
        let mut tracker = CompletionTracker::new();
        let outcome = tracker.observe(&record(RecordKind::Final, "All done"), &regions);
        assert_eq!(
            outcome,
            Some(SessionOutcome::Completed {
                result: Some(Value::String("All done".to_string())),
            })
        );
    }

    #[test]
    fn error_record_releases_waiters_with_failure() {
        let regions = RegionAggregator::new(&AggregatorConfig::default());
        let mut tracker = CompletionTracker::new();
        let mut rx = tracker.subscribe();
        tracker.observe(&record(RecordKind::Message, "partial"), &regions);

        tracker.observe(&record(RecordKind::Error, ""), &regions);
        assert_eq!(
            rx.try_recv().expect("outcome"),
            SessionOutcome::Failed {
                message: PIPELINE_ERROR_MESSAGE.to_string(),
            }
        );
        assert!(!tracker.in_progress());
        assert!(tracker.fail("transport dropped").is_none());
    }

    #[test]
    fn late_subscriber_gets_settled_outcome() {
        let regions = RegionAggregator::new(&AggregatorConfig::default());
        let mut tracker = CompletionTracker::new();
        tracker.fail("upstream returned 502");
        tracker.observe(&record(RecordKind::Final, "late"), &regions);

        let mut rx = tracker.subscribe();
        assert_eq!(
            rx.try_recv().expect("outcome"),
            SessionOutcome::Failed {
                message: "upstream returned 502".to_string(),
            }
        );
    }

    #[test]
    fn heartbeats_do_not_count() {
        let regions = RegionAggregator::new(&AggregatorConfig::default());
        let mut tracker = CompletionTracker::new();
        tracker.observe(&record(RecordKind::Heartbeat, ""), &regions);
        let progress = tracker.progress(&regions);
        assert_eq!(progress.records_observed, 0);
        assert_eq!(progress.fraction, 0.0);
        assert!(tracker.outcome().is_none());
    }

    #[test]
    fn progress_tracks_finalized_regions() {
        let mut regions = RegionAggregator::new(&AggregatorConfig::default());
        let tracker = CompletionTracker::new();
        regions.merge_from("sql", "a", "SELECT 1", true).expect("merge");
        regions.merge_from("analysis", "b", "Rising", false).expect("merge");

        let progress = tracker.progress(&regions);
        assert_eq!(progress.regions_seen, 2);
        assert_eq!(progress.regions_finalized, 1);
        assert_eq!(progress.fraction, 0.5);
    }

    #[test]
    fn reset_closes_pending_listeners() {
        let mut tracker = CompletionTracker::new();
        let mut rx = tracker.subscribe();
        tracker.reset();
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = SessionOutcome::Failed {
            message: "boom".to_string(),
        };
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(value, json!({"status": "failed", "message": "boom"}));
    }
}
