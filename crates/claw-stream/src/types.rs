//! Event envelope and wire types.
//!
//! - [`EventEnvelope`]: one backend event, opaque beyond its routing fields
//! - [`Severity`]: envelope severity, also usable as a stream filter
//! - [`StreamFilters`]: the filter set encoded into stream and poll URLs
//! - [`decode_frame`]: turns one stream frame into envelopes
//! - [`PollResponse`] and [`TokenGrant`]: request/response payloads

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StreamError, StreamResult};

/// Severity of an event.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    #[default]
    Info,
    /// Should be looked at.
    #[serde(alias = "warning")]
    Warn,
    /// Something failed.
    Error,
    /// Requires immediate attention.
    Critical,
}

impl Severity {
    /// Returns the severity as its wire string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(StreamError::Config(format!("unknown severity: {other}"))),
        }
    }
}

/// A single event pushed by the backend.
///
/// Only `type` is required on the wire. Envelopes are immutable once
/// decoded and are shared between listeners as `Arc<EventEnvelope>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event category, used for routing and buffering.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Originating backend module.
    #[serde(default)]
    pub module: String,
    /// Event severity.
    #[serde(default)]
    pub severity: Severity,
    /// Identifier linking causally related events.
    #[serde(default)]
    pub correlation_id: String,
    /// Opaque event payload.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// When the backend created the event, if it said.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl EventEnvelope {
    /// Create an envelope with the given category and defaults elsewhere.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            module: String::new(),
            severity: Severity::default(),
            correlation_id: String::new(),
            payload: Map::new(),
            created_at: None,
        }
    }

    /// Set the module.
    #[must_use]
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    /// Set the severity.
    #[must_use]
    pub const fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Insert a payload field.
    #[must_use]
    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Set the creation timestamp.
    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Serialize to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> StreamResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Severity and module filters applied server-side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFilters {
    /// Only events of this severity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Only events from this module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

impl StreamFilters {
    /// No filtering.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Set the severity filter.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Set the module filter.
    #[must_use]
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Query pairs for the active filters, in a stable order.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(2);
        if let Some(severity) = self.severity {
            pairs.push(("severity", severity.as_str().to_string()));
        }
        if let Some(module) = self.module.as_deref().filter(|m| !m.is_empty()) {
            pairs.push(("module", module.to_string()));
        }
        pairs
    }
}

/// One stream frame: a single envelope or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireFrame {
    Batch { events: Vec<EventEnvelope> },
    Single(EventEnvelope),
}

/// Decode the text of one stream frame.
///
/// Accepts either a JSON-encoded [`EventEnvelope`] or an
/// `{"events": [...]}` batch. An empty batch decodes to an empty vector.
///
/// # Errors
///
/// Returns [`StreamError::MalformedFrame`] if the text is neither shape.
pub fn decode_frame(text: &str) -> StreamResult<Vec<EventEnvelope>> {
    match serde_json::from_str::<WireFrame>(text) {
        Ok(WireFrame::Batch { events }) => Ok(events),
        Ok(WireFrame::Single(envelope)) => Ok(vec![envelope]),
        Err(e) => Err(StreamError::MalformedFrame(e.to_string())),
    }
}

/// Response body of the polling endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    /// Recent events matching the filters.
    #[serde(default)]
    pub events: Vec<EventEnvelope>,
    /// Total matching events on the server, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

/// Response body of the token exchange endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    /// The short-lived stream token.
    pub sse_token: String,
    /// Lifetime in seconds; `None` or `0` means "use the default".
    #[serde(default)]
    pub expires_in_sec: Option<u64>,
}
