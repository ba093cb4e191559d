//! HTTP implementation of [`EventBackend`] on `reqwest`.

use futures::StreamExt;
use reqwest::header::{ACCEPT, HeaderName};
use reqwest::{Client, RequestBuilder};
use tracing::debug;
use url::Url;

use crate::backend::{BoxFuture, EventBackend, FrameStream, ProbeResponse};
use crate::config::{Credential, ProbeMethod, StreamConfig};
use crate::endpoint::redact;
use crate::error::{StreamError, StreamResult};
use crate::sse::SseDecoder;
use crate::types::{PollResponse, TokenGrant};

const EVENT_STREAM: &str = "text/event-stream";
const JSON: &str = "application/json";
const FORBIDDEN: u16 = 403;

/// Talks to the dashboard backend over HTTP.
///
/// The durable credential travels only in a request header (token, probe
/// and poll requests). Stream requests carry nothing but the URL.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    token_url: Url,
    credential: Option<Credential>,
    credential_header: HeaderName,
    probe_method: ProbeMethod,
}

impl HttpBackend {
    /// Build a backend from client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the token URL or the credential header is invalid.
    pub fn from_config(config: &StreamConfig) -> StreamResult<Self> {
        let token_url = Url::parse(&config.base_url)?.join(&config.token_path)?;
        let credential_header = HeaderName::from_bytes(config.credential_header.as_bytes())
            .map_err(|e| StreamError::Config(format!("invalid credential_header: {e}")))?;

        Ok(Self {
            client: Client::new(),
            token_url,
            credential: config.credential.clone(),
            credential_header,
            probe_method: config.probe.method,
        })
    }

    /// Use a preconfigured `reqwest` client (proxies, TLS roots).
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Whether a durable credential is configured.
    #[must_use]
    pub const fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Some(credential) => builder.header(self.credential_header.clone(), credential.expose()),
            None => builder,
        }
    }
}

async fn error_for_status(response: reqwest::Response) -> StreamResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.ok().filter(|b| !b.is_empty());
    Err(StreamError::Status {
        status: status.as_u16(),
        body,
    })
}

impl EventBackend for HttpBackend {
    fn exchange_token(&self) -> BoxFuture<'_, StreamResult<TokenGrant>> {
        Box::pin(async move {
            let response = self
                .authorized(self.client.post(self.token_url.clone()))
                .header(ACCEPT, JSON)
                .send()
                .await
                .map_err(|e| StreamError::TokenExchange(e.to_string()))?;
            let response = error_for_status(response).await?;

            response
                .json::<TokenGrant>()
                .await
                .map_err(|e| StreamError::TokenExchange(format!("invalid token response: {e}")))
        })
    }

    fn open_stream<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, StreamResult<FrameStream>> {
        Box::pin(async move {
            debug!(url = %redact(url), "opening event stream");
            let response = self
                .client
                .get(url.clone())
                .header(ACCEPT, EVENT_STREAM)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(StreamError::Status {
                    status: status.as_u16(),
                    body: None,
                });
            }

            let mut decoder = SseDecoder::new();
            let frames = response
                .bytes_stream()
                .map(move |chunk| match chunk {
                    Ok(bytes) => decoder.feed(&bytes),
                    Err(e) => vec![Err(StreamError::from(e))],
                })
                .flat_map(futures::stream::iter);

            Ok(Box::pin(frames) as FrameStream)
        })
    }

    fn probe<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, StreamResult<ProbeResponse>> {
        Box::pin(async move {
            let builder = match self.probe_method {
                ProbeMethod::Get => self.client.get(url.clone()),
                ProbeMethod::Head => self.client.head(url.clone()),
            };
            let response = self.authorized(builder).header(ACCEPT, JSON).send().await?;

            let status = response.status().as_u16();
            // Only a denial body matters; a successful GET would otherwise
            // start streaming.
            if status == FORBIDDEN && self.probe_method == ProbeMethod::Get {
                let body = response.text().await.ok();
                return Ok(ProbeResponse { status, body });
            }
            Ok(ProbeResponse::status(status))
        })
    }

    fn poll<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, StreamResult<PollResponse>> {
        Box::pin(async move {
            let response = self
                .authorized(self.client.get(url.clone()))
                .header(ACCEPT, JSON)
                .send()
                .await?;
            let response = error_for_status(response).await?;

            Ok(response.json::<PollResponse>().await?)
        })
    }
}
