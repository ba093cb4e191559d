//! Connection states and lifecycle events.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// State of the push-stream connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    /// Fetching a token or opening the stream.
    Connecting,
    /// Stream is open.
    Open,
    /// Waiting for the backoff timer before the next attempt.
    Reconnecting,
    /// The backend refuses this channel by policy. Stays here until reset.
    PolicyBlocked,
    /// Closed, or out of retries.
    Stopped,
}

impl ConnectionState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::PolicyBlocked => "policy_blocked",
            Self::Stopped => "stopped",
        }
    }

    /// Whether a connection attempt or live stream exists in this state.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How envelopes are currently delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Push stream.
    #[default]
    Streaming,
    /// Periodic request/response polling.
    Polling,
}

impl DeliveryMode {
    /// Returns the mode as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Polling => "polling",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events emitted by the delivery paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The stream opened.
    Opened,
    /// A failure occurred. Terminal failures are followed by their own event.
    Error(StreamError),
    /// A reconnect is scheduled.
    Reconnecting {
        /// One-based number of the retry about to happen.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The backend denied the channel by policy.
    PolicyBlocked {
        /// Reason given by the backend, if any.
        reason: Option<String>,
    },
    /// The retry budget is spent.
    MaxRetriesExceeded {
        /// Retries made before giving up.
        attempts: u32,
    },
    /// No stream token could be obtained.
    TokenUnavailable,
    /// The active delivery path changed.
    ModeChanged(DeliveryMode),
}

impl ConnectionEvent {
    /// Whether this event ends the delivery path that emitted it.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PolicyBlocked { .. } | Self::MaxRetriesExceeded { .. } | Self::TokenUnavailable
        )
    }
}
