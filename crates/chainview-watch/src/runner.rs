use crate::config::WatchConfig;
use crate::report::WatchReport;
use crate::transport::{SseTransport, TransportError};
use chainview_core::{
    AggregatorConfig, AggregatorSession, ConfigError, ConnectAttempt, ConnectionSupervisor,
    IngestOutcome, RawFrame,
};
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum AttemptEnd {
    /// A terminal record settled the session.
    Settled,
    /// The producer sent a `close` frame or the stream ended cleanly.
    Closed,
    Failed(TransportError),
}

/// Drives one aggregator session through the connection supervisor.
pub struct StreamRunner {
    session: AggregatorSession,
    supervisor: ConnectionSupervisor,
}

impl StreamRunner {
    pub fn new(config: AggregatorConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            session: AggregatorSession::new(config)?,
            supervisor: ConnectionSupervisor::new(),
        })
    }

    pub fn session(&self) -> &AggregatorSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut AggregatorSession {
        &mut self.session
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn connect(&mut self) -> Option<ConnectAttempt> {
        let attempt = self.supervisor.connect();
        self.session.observe_connection(&self.supervisor);
        attempt
    }

    pub fn retry(&mut self) -> Option<ConnectAttempt> {
        let attempt = self.supervisor.retry();
        self.session.observe_connection(&self.supervisor);
        attempt
    }

    /// Consumes frames for one attempt until the session settles, the
    /// producer closes the stream or the transport fails.
    pub async fn run_attempt<S>(&mut self, attempt: ConnectAttempt, mut frames: S) -> AttemptEnd
    where
        S: Stream<Item = Result<RawFrame, TransportError>> + Unpin,
    {
        if !self.supervisor.on_open(attempt) {
            return AttemptEnd::Failed(TransportError::Stream(format!(
                "attempt {} is no longer current",
                attempt.number()
            )));
        }
        self.session.observe_connection(&self.supervisor);

        while let Some(item) = frames.next().await {
            let frame = match item {
                Ok(frame) => frame,
                Err(err) => return self.fail_attempt(attempt, err),
            };
            match self.session.ingest_frame(&frame) {
                Ok(IngestOutcome::Closed) => {
                    info!("stream_closed_by_producer");
                    return AttemptEnd::Closed;
                }
                Ok(IngestOutcome::Terminal { kind }) if self.session.outcome().is_some() => {
                    info!("stream_terminal_record: {kind}");
                    return AttemptEnd::Settled;
                }
                Ok(IngestOutcome::Terminal { kind }) => {
                    debug!("stream_terminal_record: {kind}; waiting for regions to settle");
                }
                Ok(outcome) => debug!("frame_ingested: {outcome:?}"),
                Err(err) => warn!("frame_decode_error: {err}"),
            }
        }

        if self.session.end_of_stream().is_some() {
            return AttemptEnd::Closed;
        }
        self.fail_attempt(attempt, TransportError::UnexpectedEof)
    }

    pub fn fail_attempt(&mut self, attempt: ConnectAttempt, err: TransportError) -> AttemptEnd {
        warn!("stream_attempt_failed: {err}");
        self.supervisor.on_error(attempt, Some(err.surfaced_message()));
        self.session.observe_connection(&self.supervisor);
        AttemptEnd::Failed(err)
    }

    /// Settles an unsettled session with the supervisor's failure message
    /// and tears the connection down. Merged state is kept for the report.
    pub fn finish(mut self) -> WatchReport {
        if self.session.outcome().is_none() {
            self.session.fail(self.supervisor.failure_message());
        }
        self.supervisor.close();
        self.session.observe_connection(&self.supervisor);
        WatchReport::from_parts(&self.session, self.supervisor.stats())
    }
}

/// Connects, then retries with a fixed delay up to `max_retries` times.
/// Only one transport is open at a time.
pub async fn watch_stream(
    config: &WatchConfig,
    transport: &SseTransport,
) -> Result<WatchReport, ConfigError> {
    let mut runner = StreamRunner::new(config.aggregator.clone())?;
    let mut retries_left = config.max_retries;
    let mut next = runner.connect();

    while let Some(attempt) = next.take() {
        let end = match transport.open(&config.stream_url).await {
            Ok(frames) => runner.run_attempt(attempt, frames).await,
            Err(err) => runner.fail_attempt(attempt, err),
        };

        match end {
            AttemptEnd::Settled | AttemptEnd::Closed => break,
            AttemptEnd::Failed(_) if runner.session().outcome().is_some() => break,
            AttemptEnd::Failed(_) if retries_left == 0 => {
                warn!("stream_retries_exhausted: {}", config.max_retries);
            }
            AttemptEnd::Failed(_) => {
                retries_left -= 1;
                tokio::time::sleep(config.retry_delay).await;
                next = runner.retry();
            }
        }
    }

    Ok(runner.finish())
}
