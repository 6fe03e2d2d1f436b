use crate::chain::{ChainComposer, ChainNode};
use crate::completion::{CompletionTracker, Progress, SessionOutcome};
use crate::config::{AggregatorConfig, ConfigError};
use crate::connection::{ConnectionState, ConnectionSupervisor};
use crate::dedup::{DedupStats, IdentityFilter};
use crate::record::{
    DecodeError, DecodedFrame, IdOrigin, RawFrame, RecordDecoder, RecordKind, StreamRecord,
};
use crate::region::{MergeOutcome, RegionAggregator, RegionState};
use crate::segments::SegmentParser;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const STREAM_CLOSED_MESSAGE: &str = "stream closed before the session completed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied { region: String, merge: MergeOutcome },
    Duplicate,
    Heartbeat,
    RejectedFinality,
    /// `fresh` is true when the record started a session other than the current one.
    Session { fresh: bool },
    Terminal { kind: RecordKind },
    Closed,
}

/// Owns every aggregation component for one stream session.
///
/// All mutation goes through [`AggregatorSession::ingest`],
/// [`AggregatorSession::observe_connection`] and [`AggregatorSession::reset`],
/// so a reset always clears regions, dedup identities, retained records and
/// completion state together.
pub struct AggregatorSession {
    config: AggregatorConfig,
    decoder: RecordDecoder,
    dedup: IdentityFilter,
    regions: RegionAggregator,
    completion: CompletionTracker,
    composer: ChainComposer,
    records: Vec<StreamRecord>,
    session_id: Option<String>,
    connection: ConnectionState,
}

impl Default for AggregatorSession {
    fn default() -> Self {
        Self::build(AggregatorConfig::default())
    }
}

impl AggregatorSession {
    pub fn new(config: AggregatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: AggregatorConfig) -> Self {
        let parser =
            SegmentParser::with_delimiters(&config.reasoning_open, &config.reasoning_close);
        Self {
            decoder: RecordDecoder::new(&config),
            dedup: IdentityFilter::new(&config),
            regions: RegionAggregator::new(&config),
            completion: CompletionTracker::new(),
            composer: ChainComposer::new(parser),
            records: Vec::new(),
            session_id: None,
            connection: ConnectionState::Disconnected,
            config,
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn ingest_frame(&mut self, frame: &RawFrame) -> Result<IngestOutcome, DecodeError> {
        self.ingest_frame_at(frame, Utc::now())
    }

    pub fn ingest_frame_at(
        &mut self,
        frame: &RawFrame,
        received_at: DateTime<Utc>,
    ) -> Result<IngestOutcome, DecodeError> {
        match self.decoder.decode_at(frame, received_at)? {
            DecodedFrame::Record(record) => Ok(self.ingest(record)),
            DecodedFrame::Close => {
                if self.end_of_stream().is_none() {
                    self.completion.fail(STREAM_CLOSED_MESSAGE);
                }
                Ok(IngestOutcome::Closed)
            }
        }
    }

    pub fn ingest(&mut self, record: StreamRecord) -> IngestOutcome {
        match record.kind {
            RecordKind::Heartbeat => IngestOutcome::Heartbeat,
            RecordKind::Session => self.start_session(record.session_id),
            RecordKind::Message => {
                if !self.dedup.accept(&record) {
                    return IngestOutcome::Duplicate;
                }
                let merged = if record.id_origin == IdOrigin::Producer {
                    self.regions.merge_identified(
                        &record.region,
                        &record.source,
                        &record.content,
                        record.is_final,
                    )
                } else {
                    self.regions.merge_from(
                        &record.region,
                        &record.source,
                        &record.content,
                        record.is_final,
                    )
                };
                let Ok(merge) = merged else {
                    return IngestOutcome::RejectedFinality;
                };
                let region = record.region.clone();
                self.completion.observe(&record, &self.regions);
                // Contained text is already in the region, so the chain only
                // keeps the finality marker of a duplicate.
                match merge {
                    MergeOutcome::Duplicate if record.is_final => {
                        let mut marker = record;
                        marker.content.clear();
                        self.records.push(marker);
                    }
                    MergeOutcome::Duplicate => {}
                    _ => self.records.push(record),
                }
                IngestOutcome::Applied { region, merge }
            }
            RecordKind::Final | RecordKind::Error => {
                if !self.dedup.accept(&record) {
                    return IngestOutcome::Duplicate;
                }
                let kind = record.kind;
                self.retain(record);
                IngestOutcome::Terminal { kind }
            }
        }
    }

    /// Tracks supervisor transitions. Dedup identities survive reconnects so
    /// replayed records are still suppressed.
    pub fn observe_connection(&mut self, supervisor: &ConnectionSupervisor) {
        let state = supervisor.state();
        if state == self.connection {
            return;
        }
        if state == ConnectionState::Connected && supervisor.is_reconnect() {
            info!(
                cached_identities = self.dedup.len(),
                regions = self.regions.len(),
                "session_reconnected: keeping merged state"
            );
        } else {
            debug!("session_connection: {} -> {state}", self.connection);
        }
        self.connection = state;
    }

    /// Called when the stream ended cleanly (close frame or end of body).
    /// Settles the session as completed when the producer sent a final
    /// record or every region with content has settled.
    pub fn end_of_stream(&mut self) -> Option<&SessionOutcome> {
        self.completion.end_of_stream(&self.regions);
        self.completion.outcome()
    }

    /// Settles the session as failed unless it already has an outcome.
    pub fn fail(&mut self, message: impl Into<String>) -> Option<SessionOutcome> {
        self.completion.fail(message)
    }

    pub fn reset(&mut self) {
        self.decoder.reset();
        self.dedup.reset();
        self.regions.reset();
        self.completion.reset();
        self.records.clear();
        self.session_id = None;
        info!("session_reset");
    }

    pub fn snapshot(&self, region: &str) -> Option<&RegionState> {
        self.regions.snapshot(region)
    }

    pub fn snapshots(&self) -> Vec<RegionState> {
        self.regions.snapshots()
    }

    pub fn chain(&self) -> Vec<ChainNode> {
        self.composer.compose(&self.records)
    }

    pub fn progress(&self) -> Progress {
        self.completion.progress(&self.regions)
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionOutcome> {
        self.completion.subscribe()
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.completion.outcome()
    }

    pub fn records(&self) -> &[StreamRecord] {
        &self.records
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn start_session(&mut self, incoming: Option<String>) -> IngestOutcome {
        let Some(incoming) = incoming else {
            return IngestOutcome::Session { fresh: false };
        };
        let fresh = match self.session_id.as_deref() {
            Some(current) if current == incoming => false,
            Some(current) => {
                info!("session_changed: {current} -> {incoming}");
                self.reset();
                true
            }
            None => true,
        };
        self.decoder.set_session_id(Some(incoming.clone()));
        self.session_id = Some(incoming);
        IngestOutcome::Session { fresh }
    }

    fn retain(&mut self, record: StreamRecord) {
        self.completion.observe(&record, &self.regions);
        self.records.push(record);
    }
}
