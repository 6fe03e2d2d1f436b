use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info};

pub const GENERIC_FAILURE_MESSAGE: &str = "connection to the stream failed";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }

    /// A transport handle exists in these states.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token handed out per connect or retry. Events carrying an older token are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectAttempt(u64);

impl ConnectAttempt {
    pub fn number(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStats {
    pub attempts: u64,
    pub opens: u64,
}

/// Owns the transport lifecycle for one session.
///
/// ```text
/// disconnected --connect--> connecting --open--> connected --error--> error
/// error --retry--> reconnecting --open--> connected
/// any --close--> disconnected
/// ```
pub struct ConnectionSupervisor {
    state_tx: watch::Sender<ConnectionState>,
    current: Option<ConnectAttempt>,
    next_attempt: u64,
    last_error: Option<String>,
    opened_before: bool,
    reconnect: bool,
    stats: ConnectionStats,
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSupervisor {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state_tx,
            current: None,
            next_attempt: 0,
            last_error: None,
            opened_before: false,
            reconnect: false,
            stats: ConnectionStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Starts the first attempt. From `error` this behaves like [`Self::retry`];
    /// while a transport is live it is a no-op.
    pub fn connect(&mut self) -> Option<ConnectAttempt> {
        match self.state() {
            ConnectionState::Disconnected => Some(self.begin(ConnectionState::Connecting)),
            ConnectionState::Error => self.retry(),
            live => {
                debug!("connection_connect_ignored: already {live}");
                None
            }
        }
    }

    pub fn retry(&mut self) -> Option<ConnectAttempt> {
        match self.state() {
            ConnectionState::Error => Some(self.begin(ConnectionState::Reconnecting)),
            other => {
                debug!("connection_retry_ignored: state is {other}");
                None
            }
        }
    }

    pub fn on_open(&mut self, attempt: ConnectAttempt) -> bool {
        if !self.is_current(attempt) {
            debug!("connection_open_stale: attempt {}", attempt.0);
            return false;
        }
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            debug!("connection_open_ignored: state is {state}");
            return false;
        }
        self.reconnect = self.opened_before;
        self.opened_before = true;
        self.last_error = None;
        self.stats.opens += 1;
        self.transition(ConnectionState::Connected);
        true
    }

    /// Moves to `error`, keeping a surfaced transport message when one is given.
    pub fn on_error(&mut self, attempt: ConnectAttempt, message: Option<String>) -> bool {
        if !self.is_current(attempt) {
            debug!("connection_error_stale: attempt {}", attempt.0);
            return false;
        }
        self.current = None;
        self.last_error = message
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self.transition(ConnectionState::Error);
        true
    }

    pub fn close(&mut self) {
        self.current = None;
        if self.state() != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected);
        }
    }

    pub fn is_current(&self, attempt: ConnectAttempt) -> bool {
        self.current == Some(attempt)
    }

    /// True when the live connection followed an earlier successful open.
    pub fn is_reconnect(&self) -> bool {
        self.state() == ConnectionState::Connected && self.reconnect
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn failure_message(&self) -> String {
        self.last_error
            .clone()
            .unwrap_or_else(|| GENERIC_FAILURE_MESSAGE.to_string())
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    fn begin(&mut self, state: ConnectionState) -> ConnectAttempt {
        self.next_attempt += 1;
        let attempt = ConnectAttempt(self.next_attempt);
        self.current = Some(attempt);
        self.stats.attempts += 1;
        self.transition(state);
        attempt
    }

    fn transition(&mut self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        info!(
            attempt = self.next_attempt,
            "connection_state: {previous} -> {next}"
        );
    }
}
