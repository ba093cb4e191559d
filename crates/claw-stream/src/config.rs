//! Client configuration.
//!
//! Configuration for the event-stream client, including:
//! - Backend origin and endpoint paths
//! - The durable credential and the header that carries it
//! - Retry, token, probe and polling timing
//! - Per-category buffer sizing

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::StreamEndpoint;
use crate::error::{StreamError, StreamResult};
use crate::registry::BufferConfig;
use crate::retry::RetryPolicy;
use crate::state::DeliveryMode;
use crate::types::StreamFilters;

/// Durable credential exchanged for stream tokens.
///
/// Never printed: `Debug` is redacted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Wrap a credential value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for building request headers only.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Token exchange settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TokenConfig {
    /// Lifetime assumed when the server omits `expires_in_sec`.
    pub default_lifetime_secs: u64,
    /// A cached token is reused only with more than this much lifetime left.
    pub safety_margin_secs: u64,
    /// Timeout of one exchange request.
    pub timeout_ms: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            default_lifetime_secs: 60,
            safety_margin_secs: 10,
            timeout_ms: 5_000,
        }
    }
}

impl TokenConfig {
    /// Default lifetime as a [`Duration`].
    #[must_use]
    pub const fn default_lifetime(&self) -> Duration {
        Duration::from_secs(self.default_lifetime_secs)
    }

    /// Safety margin as a [`Duration`].
    #[must_use]
    pub const fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// HTTP method used by the policy probe.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    /// `GET`, which lets the denial body be read.
    #[default]
    Get,
    /// `HEAD`; denials without a body are never classified as policy.
    Head,
}

/// Policy probe settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Timeout of one probe request.
    pub timeout_ms: u64,
    /// Request method.
    pub method: ProbeMethod,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            method: ProbeMethod::Get,
        }
    }
}

impl ProbeConfig {
    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Polling fallback settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollConfig {
    /// Period between polls.
    pub interval_ms: u64,
    /// Timeout of one poll request.
    pub timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            timeout_ms: 5_000,
        }
    }
}

impl PollConfig {
    /// Poll period as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Push stream settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamSettings {
    /// Seconds to wait for the stream to answer an open request.
    pub connect_timeout_secs: u64,
    /// Seconds without any bytes before the stream counts as dead; `0` disables.
    pub idle_timeout_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            idle_timeout_secs: 45,
        }
    }
}

impl StreamSettings {
    /// The open deadline.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// The idle timeout, if enabled.
    #[must_use]
    pub const fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_secs))
        }
    }
}

fn default_stream_path() -> String {
    "/api/events/stream".to_string()
}

fn default_poll_path() -> String {
    "/api/events".to_string()
}

fn default_token_path() -> String {
    "/api/auth/sse-token".to_string()
}

fn default_credential_header() -> String {
    "X-API-Key".to_string()
}

/// Main client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    /// Backend origin, `http://` or `https://`.
    pub base_url: String,
    /// Push stream path.
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    /// Polling endpoint path.
    #[serde(default = "default_poll_path")]
    pub poll_path: String,
    /// Token exchange path.
    #[serde(default = "default_token_path")]
    pub token_path: String,
    /// Durable credential. Without one the stream is opened tokenless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    /// Header carrying the credential on token, probe and poll requests.
    #[serde(default = "default_credential_header")]
    pub credential_header: String,
    /// Initial delivery mode.
    #[serde(default)]
    pub start_mode: DeliveryMode,
    /// Initial filters.
    #[serde(default)]
    pub filters: StreamFilters,
    /// Reconnect backoff.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Token exchange.
    #[serde(default)]
    pub token: TokenConfig,
    /// Policy probe.
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Polling fallback.
    #[serde(default)]
    pub poll: PollConfig,
    /// Push stream.
    #[serde(default)]
    pub stream: StreamSettings,
    /// Per-category buffers.
    #[serde(default)]
    pub buffers: BufferConfig,
}

impl StreamConfig {
    /// Configuration with defaults for everything but the origin.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            stream_path: default_stream_path(),
            poll_path: default_poll_path(),
            token_path: default_token_path(),
            credential: None,
            credential_header: default_credential_header(),
            start_mode: DeliveryMode::default(),
            filters: StreamFilters::default(),
            retry: RetryPolicy::default(),
            token: TokenConfig::default(),
            probe: ProbeConfig::default(),
            poll: PollConfig::default(),
            stream: StreamSettings::default(),
            buffers: BufferConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> StreamResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StreamError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> StreamResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the durable credential.
    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(Credential::new(credential));
        self
    }

    /// Set the initial filters.
    #[must_use]
    pub fn with_filters(mut self, filters: StreamFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Set the initial delivery mode.
    #[must_use]
    pub const fn with_start_mode(mut self, mode: DeliveryMode) -> Self {
        self.start_mode = mode;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the polling interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the stream idle timeout; `Duration::ZERO` disables it.
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream.idle_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the buffer sizing.
    #[must_use]
    pub fn with_buffers(mut self, buffers: BufferConfig) -> Self {
        self.buffers = buffers;
        self
    }

    /// Endpoint for the configured paths and the given filters.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL cannot be built.
    pub fn endpoint(&self, filters: StreamFilters) -> StreamResult<StreamEndpoint> {
        StreamEndpoint::new(&self.base_url, &self.stream_path, &self.poll_path, filters)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> StreamResult<()> {
        if self.base_url.is_empty() {
            return Err(StreamError::Config("base_url cannot be empty".to_string()));
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(StreamError::Config(
                "base_url must start with http:// or https://".to_string(),
            ));
        }

        for (name, path) in [
            ("stream_path", &self.stream_path),
            ("poll_path", &self.poll_path),
            ("token_path", &self.token_path),
        ] {
            if !path.starts_with('/') {
                return Err(StreamError::Config(format!("{name} must start with '/'")));
            }
        }

        if self.credential_header.trim().is_empty() {
            return Err(StreamError::Config(
                "credential_header cannot be empty".to_string(),
            ));
        }

        if self.retry.base_delay_ms == 0 {
            return Err(StreamError::Config(
                "retry.base_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(StreamError::Config(
                "retry.max_delay_ms cannot be less than retry.base_delay_ms".to_string(),
            ));
        }

        if self.poll.interval_ms == 0 {
            return Err(StreamError::Config(
                "poll.interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.token.timeout_ms == 0
            || self.probe.timeout_ms == 0
            || self.poll.timeout_ms == 0
            || self.stream.connect_timeout_secs == 0
        {
            return Err(StreamError::Config(
                "request timeouts must be greater than 0".to_string(),
            ));
        }

        if self.token.safety_margin_secs >= self.token.default_lifetime_secs {
            return Err(StreamError::Config(
                "token.safety_margin_secs must be shorter than token.default_lifetime_secs"
                    .to_string(),
            ));
        }

        // Catches paths that are syntactically fine but cannot be joined.
        self.endpoint(self.filters.clone())?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferOrder;
    use crate::types::Severity;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("failed to write temp file");
        file
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = StreamConfig::from_toml(r#"base_url = "https://dash.example.com""#)
            .expect("should parse minimal config");

        assert_eq!(config.stream_path, "/api/events/stream");
        assert_eq!(config.poll_path, "/api/events");
        assert_eq!(config.token_path, "/api/auth/sse-token");
        assert_eq!(config.credential_header, "X-API-Key");
        assert!(config.credential.is_none());
        assert_eq!(config.start_mode, DeliveryMode::Streaming);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.token.default_lifetime_secs, 60);
        assert_eq!(config.probe.method, ProbeMethod::Get);
        assert_eq!(config.poll.interval_ms, 5_000);
        assert_eq!(config.stream.idle_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(config.stream.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.buffers.default_capacity, 20);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            base_url = "http://localhost:8080"
            stream_path = "/v2/stream"
            credential = "key-123"
            credential_header = "Authorization"
            start_mode = "polling"

            [filters]
            severity = "warning"
            module = "gpu"

            [retry]
            base_delay_ms = 500
            max_delay_ms = 10000
            max_retries = 3

            [token]
            safety_margin_secs = 5

            [probe]
            method = "head"

            [poll]
            interval_ms = 2000

            [stream]
            connect_timeout_secs = 4
            idle_timeout_secs = 0

            [buffers]
            default_capacity = 10
            order = "oldest_first"
            capacities = { alert = 5, forensic_snapshot = 20 }
        "#;

        let config = StreamConfig::from_toml(toml).expect("should parse full config");

        assert_eq!(config.stream_path, "/v2/stream");
        assert_eq!(config.credential.as_ref().map(Credential::expose), Some("key-123"));
        assert_eq!(config.start_mode, DeliveryMode::Polling);
        assert_eq!(config.filters.severity, Some(Severity::Warn));
        assert_eq!(config.filters.module.as_deref(), Some("gpu"));
        assert_eq!(config.retry, RetryPolicy::new(500, 10_000, 3));
        assert_eq!(config.token.safety_margin_secs, 5);
        assert_eq!(config.token.default_lifetime_secs, 60);
        assert_eq!(config.probe.method, ProbeMethod::Head);
        assert_eq!(config.poll.interval(), Duration::from_secs(2));
        assert_eq!(config.stream.idle_timeout(), None);
        assert_eq!(config.stream.connect_timeout(), Duration::from_secs(4));
        assert_eq!(config.buffers.order, BufferOrder::OldestFirst);
        assert_eq!(config.buffers.capacity_for("alert"), 5);
        assert_eq!(config.buffers.capacity_for("metric"), 10);
    }

    #[test]
    fn test_from_file() {
        let file = create_temp_config("base_url = \"https://dash.example.com\"\n");
        let config = StreamConfig::from_file(file.path()).expect("should load from file");
        assert_eq!(config.base_url, "https://dash.example.com");
    }

    #[test]
    fn test_from_file_missing() {
        let err = StreamConfig::from_file("/nonexistent/claw-stream.toml").unwrap_err();
        assert!(matches!(err, StreamError::Config(msg) if msg.contains("failed to read")));
    }

    #[test]
    fn test_invalid_toml() {
        let err = StreamConfig::from_toml("base_url = ").unwrap_err();
        assert!(matches!(err, StreamError::Config(msg) if msg.contains("invalid TOML")));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let config = StreamConfig::new("https://dash.example.com").with_credential("super-secret");
        let debug = format!("{config:?}");

        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("Credential(***)"));
    }

    #[test]
    fn test_builder() {
        let config = StreamConfig::new("https://dash.example.com")
            .with_start_mode(DeliveryMode::Polling)
            .with_poll_interval(Duration::from_millis(250))
            .with_idle_timeout(Duration::ZERO)
            .with_retry(RetryPolicy::new(100, 1_000, 2))
            .with_buffers(BufferConfig::default().with_capacity("alert", 5));

        assert!(config.validate().is_ok());
        assert_eq!(config.poll.interval_ms, 250);
        assert_eq!(config.stream.idle_timeout(), None);
        assert_eq!(config.buffers.capacity_for("alert"), 5);
    }

    #[test]
    fn test_endpoint_uses_paths() {
        let config = StreamConfig::new("https://dash.example.com");
        let endpoint = config.endpoint(StreamFilters::none()).unwrap();

        assert_eq!(
            endpoint.stream_url(None).as_str(),
            "https://dash.example.com/api/events/stream"
        );
    }

    #[test]
    fn test_validation_empty_base_url() {
        let err = StreamConfig::new("").validate().unwrap_err();
        assert!(matches!(err, StreamError::Config(msg) if msg.contains("base_url cannot be empty")));
    }

    #[test]
    fn test_validation_scheme() {
        let err = StreamConfig::new("ws://dash.example.com").validate().unwrap_err();
        assert!(matches!(err, StreamError::Config(msg) if msg.contains("http://")));
    }

    #[test]
    fn test_validation_relative_path() {
        let mut config = StreamConfig::new("https://dash.example.com");
        config.poll_path = "api/events".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, StreamError::Config(msg) if msg.contains("poll_path")));
    }

    #[test]
    fn test_validation_retry_bounds() {
        let config = StreamConfig::new("https://dash.example.com")
            .with_retry(RetryPolicy::new(0, 1_000, 3));
        assert!(config.validate().is_err());

        let config = StreamConfig::new("https://dash.example.com")
            .with_retry(RetryPolicy::new(2_000, 1_000, 3));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_poll_interval() {
        let config =
            StreamConfig::new("https://dash.example.com").with_poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_timeout() {
        let mut config = StreamConfig::new("https://dash.example.com");
        config.probe.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::new("https://dash.example.com");
        config.stream.connect_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_safety_margin() {
        let mut config = StreamConfig::new("https://dash.example.com");
        config.token.safety_margin_secs = 60;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, StreamError::Config(msg) if msg.contains("safety_margin")));
    }
}
