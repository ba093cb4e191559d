//! Transport abstraction between the stream core and the backend.

use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use url::Url;

use crate::error::StreamResult;
use crate::types::{PollResponse, TokenGrant};

/// Boxed future returned by [`EventBackend`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Frames read from an open stream.
pub type FrameStream = Pin<Box<dyn Stream<Item = StreamResult<StreamFrame>> + Send>>;

/// One unit read from an open push stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Text payload of one frame.
    Data(String),
    /// Keep-alive with no payload.
    KeepAlive,
}

/// Raw outcome of a policy probe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    /// HTTP status code.
    pub status: u16,
    /// Body, read only for denial statuses.
    pub body: Option<String>,
}

impl ProbeResponse {
    /// A response with status only.
    #[must_use]
    pub const fn status(status: u16) -> Self {
        Self { status, body: None }
    }

    /// A response with a body.
    #[must_use]
    pub fn with_body(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: Some(body.into()),
        }
    }
}

/// The four backend interactions the client needs.
///
/// [`HttpBackend`](crate::HttpBackend) is the production implementation;
/// tests substitute scripted ones.
pub trait EventBackend: Send + Sync {
    /// Exchange the durable credential for a short-lived stream token.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    fn exchange_token(&self) -> BoxFuture<'_, StreamResult<TokenGrant>>;

    /// Open the push stream at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened.
    fn open_stream<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, StreamResult<FrameStream>>;

    /// Out-of-band request to the stream resource using header credentials.
    ///
    /// # Errors
    ///
    /// Returns an error only if no response was received at all.
    fn probe<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, StreamResult<ProbeResponse>>;

    /// Fetch one page from the polling endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is invalid.
    fn poll<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, StreamResult<PollResponse>>;
}
