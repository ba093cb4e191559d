//! Stream, probe and poll URL construction.

use url::Url;

use crate::error::StreamResult;
use crate::types::StreamFilters;

/// Query parameter carrying the ephemeral stream token.
pub const TOKEN_PARAM: &str = "token";

/// Where a stream is opened and with which filters.
///
/// Recomputed whenever filters change; a new endpoint means a new
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    stream_url: Url,
    poll_url: Url,
    filters: StreamFilters,
}

impl StreamEndpoint {
    /// Build an endpoint from a base URL and paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL or a path cannot be parsed.
    pub fn new(
        base_url: &str,
        stream_path: &str,
        poll_path: &str,
        filters: StreamFilters,
    ) -> StreamResult<Self> {
        let base = Url::parse(base_url)?;
        Ok(Self {
            stream_url: base.join(stream_path)?,
            poll_url: base.join(poll_path)?,
            filters,
        })
    }

    /// The same endpoint with different filters.
    #[must_use]
    pub fn with_filters(&self, filters: StreamFilters) -> Self {
        Self {
            stream_url: self.stream_url.clone(),
            poll_url: self.poll_url.clone(),
            filters,
        }
    }

    /// Active filters.
    #[must_use]
    pub const fn filters(&self) -> &StreamFilters {
        &self.filters
    }

    /// URL used to open the stream, with filters and optional token.
    #[must_use]
    pub fn stream_url(&self, token: Option<&str>) -> Url {
        let mut url = self.filtered(&self.stream_url);
        if let Some(token) = token {
            url.query_pairs_mut().append_pair(TOKEN_PARAM, token);
        }
        url
    }

    /// URL for the out-of-band policy probe: the stream resource, no token.
    #[must_use]
    pub fn probe_url(&self) -> Url {
        self.filtered(&self.stream_url)
    }

    /// URL of the polling endpoint with the same filters.
    #[must_use]
    pub fn poll_url(&self) -> Url {
        self.filtered(&self.poll_url)
    }

    fn filtered(&self, base: &Url) -> Url {
        let mut url = base.clone();
        let pairs = self.filters.query_pairs();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        url
    }
}

/// Render a URL for logs with the token value removed.
#[must_use]
pub fn redact(url: &Url) -> String {
    if !url.query_pairs().any(|(k, _)| k == TOKEN_PARAM) {
        return url.to_string();
    }
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == TOKEN_PARAM { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}
