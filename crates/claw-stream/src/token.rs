//! Ephemeral stream token cache.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout};
use tracing::debug;

use crate::backend::EventBackend;
use crate::config::TokenConfig;
use crate::error::{StreamError, StreamResult};

/// A short-lived stream token.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    expires_at: Instant,
}

impl Token {
    /// Create a token valid for `lifetime` from now.
    #[must_use]
    pub fn new(value: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Instant::now() + lifetime,
        }
    }

    /// The token value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// When the token expires.
    #[must_use]
    pub const fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Lifetime left, zero once expired.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &"***")
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Exchanges the durable credential for stream tokens and caches them.
///
/// The cache is shared across reconnect attempts; a cached token is only
/// handed out while its remaining lifetime exceeds the safety margin.
pub struct TokenBroker {
    backend: Arc<dyn EventBackend>,
    config: TokenConfig,
    cached: Option<Token>,
}

impl std::fmt::Debug for TokenBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBroker")
            .field("config", &self.config)
            .field("cached", &self.cached)
            .finish_non_exhaustive()
    }
}

impl TokenBroker {
    /// Create a broker with an empty cache.
    #[must_use]
    pub fn new(backend: Arc<dyn EventBackend>, config: TokenConfig) -> Self {
        Self {
            backend,
            config,
            cached: None,
        }
    }

    /// Return a usable token, fetching a new one if needed.
    ///
    /// # Errors
    ///
    /// Returns the exchange error, or [`StreamError::Timeout`] if the
    /// exchange takes longer than the configured timeout.
    pub async fn get_token(&mut self) -> StreamResult<String> {
        if let Some(token) = &self.cached {
            if token.remaining() > self.config.safety_margin() {
                return Ok(token.value.clone());
            }
            debug!(remaining_ms = token.remaining().as_millis() as u64, "stream token near expiry");
        }

        let grant = timeout(self.config.timeout(), self.backend.exchange_token())
            .await
            .map_err(|_| StreamError::Timeout("token exchange".to_string()))??;

        if grant.sse_token.is_empty() {
            return Err(StreamError::TokenExchange("empty token in response".to_string()));
        }

        let lifetime = grant
            .expires_in_sec
            .filter(|secs| *secs > 0)
            .map_or_else(|| self.config.default_lifetime(), Duration::from_secs);
        debug!(lifetime_secs = lifetime.as_secs(), "fetched stream token");

        let token = Token::new(grant.sse_token, lifetime);
        let value = token.value.clone();
        self.cached = Some(token);
        Ok(value)
    }

    /// Drop the cached token so the next call fetches a fresh one.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// The cached token, if any.
    #[must_use]
    pub const fn cached(&self) -> Option<&Token> {
        self.cached.as_ref()
    }
}
