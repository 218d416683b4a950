//! Connection state machine
//!
//! Every connectivity event is applied through one transition table, so the
//! `healthy` flag is always derivable from the last applied event: it is true
//! exactly when that event was [`ConnectionEvent::Ready`].
//!
//! ```text
//!              Connect            Ready
//! Connecting ----------> Connecting ------> Ready
//!     ^                                      |
//!     | Connect                              | Error
//!     |                                      v
//! Reconnecting <----- Reconnecting{..} --- Reconnecting
//!
//! any state --Close--> Closed (terminal)
//! ```

use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Ready,
    Reconnecting,
    Closed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A connection attempt started
    Connect,
    /// The connection accepts commands
    Ready,
    /// A connectivity failure was observed
    Error(String),
    /// A retry was scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// The client was shut down
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastError {
    pub message: String,
    pub at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub healthy: bool,
    pub last_error: Option<LastError>,
    pub reconnect_attempts: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            healthy: false,
            last_error: None,
            reconnect_attempts: 0,
        }
    }

    /// Apply an event, returning the status change it caused
    ///
    /// Events that make no sense in the current status (a second `Ready`,
    /// anything after `Close`) leave the state untouched.
    pub fn apply(&mut self, event: &ConnectionEvent) -> Transition {
        let from = self.status;
        let Some(to) = next_status(from, event) else {
            return Transition::Ignored;
        };

        match event {
            ConnectionEvent::Ready => {
                self.healthy = true;
                self.reconnect_attempts = 0;
            }
            ConnectionEvent::Error(message) => {
                self.healthy = false;
                self.last_error = Some(LastError {
                    message: message.clone(),
                    at: SystemTime::now(),
                });
            }
            ConnectionEvent::Reconnecting { attempt, .. } => {
                self.healthy = false;
                self.reconnect_attempts = *attempt;
            }
            ConnectionEvent::Connect | ConnectionEvent::Close => {
                self.healthy = false;
            }
        }

        self.status = to;
        Transition::Applied { from, to }
    }
}

fn next_status(from: ConnectionStatus, event: &ConnectionEvent) -> Option<ConnectionStatus> {
    use ConnectionEvent as E;
    use ConnectionStatus as S;

    match (from, event) {
        (S::Closed, _) => None,
        (_, E::Close) => Some(S::Closed),

        (S::Connecting | S::Reconnecting, E::Connect) => Some(S::Connecting),
        (S::Connecting | S::Reconnecting, E::Ready) => Some(S::Ready),
        (S::Ready, E::Connect | E::Ready) => None,

        (S::Ready, E::Error(_)) => Some(S::Reconnecting),
        (status, E::Error(_)) => Some(status),

        (_, E::Reconnecting { .. }) => Some(S::Reconnecting),
    }
}

/// Delay schedule between reconnection attempts
///
/// `delay(n) = min(n * step, max_delay)`: 50ms, 100ms, 150ms, ... capped at 2s
/// with the defaults. Attempts are retried indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub step: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(50),
            max_delay: Duration::from_millis(2000),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max_delay)
    }
}
