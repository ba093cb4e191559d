//! Policy denial detection.
//!
//! After a stream failure the probe asks the same resource, with header
//! credentials, whether the backend is refusing the channel on purpose.
//! Only a `403` whose JSON body says `{"status": "off_by_policy"}` counts as
//! a denial; every other outcome, including errors and timeouts, means
//! "retry". The classification is best effort: policy can change between
//! the failed stream and the probe.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend::EventBackend;
use crate::endpoint::StreamEndpoint;
use crate::error::StreamError;

/// The `status` value of a structured policy denial.
pub const OFF_BY_POLICY: &str = "off_by_policy";

const FORBIDDEN: u16 = 403;

/// Outcome of a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Denied by backend policy; do not retry automatically.
    PolicyBlocked {
        /// The backend's reason, if given.
        reason: Option<String>,
    },
    /// Not a policy denial.
    Retry,
}

impl ProbeVerdict {
    /// Whether this verdict is a policy denial.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::PolicyBlocked { .. })
    }
}

#[derive(Deserialize)]
struct PolicyDenial {
    status: String,
    #[serde(default)]
    reason: Option<Value>,
}

/// Classify a raw response. Pure.
#[must_use]
pub fn classify_response(status: u16, body: Option<&str>) -> ProbeVerdict {
    if status != FORBIDDEN {
        return ProbeVerdict::Retry;
    }
    let Some(body) = body else {
        return ProbeVerdict::Retry;
    };
    match serde_json::from_str::<PolicyDenial>(body) {
        Ok(denial) if denial.status == OFF_BY_POLICY => ProbeVerdict::PolicyBlocked {
            reason: denial.reason.and_then(|reason| match reason {
                Value::Null => None,
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            }),
        },
        _ => ProbeVerdict::Retry,
    }
}

/// Classify a request error that carried a response body.
#[must_use]
pub fn classify_error(err: &StreamError) -> ProbeVerdict {
    match err {
        StreamError::Status { status, body } => classify_response(*status, body.as_deref()),
        _ => ProbeVerdict::Retry,
    }
}

/// Out-of-band policy check against the stream resource.
pub struct PolicyProbe {
    backend: Arc<dyn EventBackend>,
    timeout: Duration,
}

impl std::fmt::Debug for PolicyProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyProbe")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PolicyProbe {
    /// Create a probe with the given request timeout.
    #[must_use]
    pub fn new(backend: Arc<dyn EventBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Probe the endpoint's stream resource.
    pub async fn check(&self, endpoint: &StreamEndpoint) -> ProbeVerdict {
        let url = endpoint.probe_url();
        match timeout(self.timeout, self.backend.probe(&url)).await {
            Ok(Ok(response)) => {
                let verdict = classify_response(response.status, response.body.as_deref());
                debug!(status = response.status, blocked = verdict.is_blocked(), "policy probe answered");
                verdict
            }
            Ok(Err(e)) => {
                warn!(error = %e, "policy probe failed");
                ProbeVerdict::Retry
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "policy probe timed out");
                ProbeVerdict::Retry
            }
        }
    }
}
