//! Push-stream connection state machine.
//!
//! A [`ConnectionManager`] owns at most one driver task at a time. The
//! driver fetches a token, opens the stream, dispatches decoded envelopes to
//! the [`SubscriptionRegistry`], and on failure consults the
//! [`PolicyProbe`] before either scheduling a retry or stopping.
//!
//! ```text
//! Idle ──connect()──▶ Connecting ──opened──▶ Open ──frame──▶ Open (retry reset)
//!                         ▲                   │
//!                         │            failure + probe
//!                    timer fires        ├─ denied ──▶ PolicyBlocked
//!                         │             ├─ budget left ──▶ Reconnecting
//!                         └─────────────┘
//!                                       └─ budget spent ──▶ Stopped
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::{EventBackend, FrameStream, StreamFrame};
use crate::config::{StreamConfig, TokenConfig};
use crate::endpoint::{StreamEndpoint, redact};
use crate::error::StreamError;
use crate::probe::{PolicyProbe, ProbeVerdict, classify_error};
use crate::registry::SubscriptionRegistry;
use crate::retry::{RetryPolicy, RetryState};
use crate::state::{ConnectionEvent, ConnectionState};
use crate::token::TokenBroker;
use crate::types::decode_frame;

/// Timing and credential settings for a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Reconnect backoff.
    pub retry: RetryPolicy,
    /// Token settings; `None` opens the stream without a token.
    pub token: Option<TokenConfig>,
    /// Policy probe timeout.
    pub probe_timeout: Duration,
    /// Deadline for the stream to answer an open request.
    pub connect_timeout: Duration,
    /// Maximum silence on an open stream.
    pub idle_timeout: Option<Duration>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            token: Some(TokenConfig::default()),
            probe_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(45)),
        }
    }
}

impl ManagerSettings {
    /// Derive settings from client configuration.
    #[must_use]
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            retry: config.retry,
            token: config.credential.as_ref().map(|_| config.token),
            probe_timeout: config.probe.timeout(),
            connect_timeout: config.stream.connect_timeout(),
            idle_timeout: config.stream.idle_timeout(),
        }
    }
}

/// Resolve `fut`, or `None` if `cancel` fires first.
pub(crate) async fn or_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

struct DriverContext {
    backend: Arc<dyn EventBackend>,
    registry: Arc<SubscriptionRegistry>,
    tokens: Option<Arc<Mutex<TokenBroker>>>,
    probe: PolicyProbe,
    retry: RetryPolicy,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    status: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

struct DriverTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns one push-stream connection per endpoint.
///
/// Must be used from within a Tokio runtime. Lifecycle events are sent on
/// the channel given to [`ConnectionManager::new`]; the status is published
/// on a `watch` channel.
pub struct ConnectionManager {
    ctx: Arc<DriverContext>,
    endpoint: StreamEndpoint,
    root: CancellationToken,
    task: Option<DriverTask>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create an idle manager with a private status channel.
    #[must_use]
    pub fn new(
        backend: Arc<dyn EventBackend>,
        registry: Arc<SubscriptionRegistry>,
        endpoint: StreamEndpoint,
        settings: ManagerSettings,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionState::Idle);
        Self::with_status(backend, registry, endpoint, settings, events, Arc::new(status))
    }

    /// Create an idle manager publishing on an existing status channel.
    #[must_use]
    pub fn with_status(
        backend: Arc<dyn EventBackend>,
        registry: Arc<SubscriptionRegistry>,
        endpoint: StreamEndpoint,
        settings: ManagerSettings,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        status: Arc<watch::Sender<ConnectionState>>,
    ) -> Self {
        let tokens = settings
            .token
            .map(|config| Arc::new(Mutex::new(TokenBroker::new(Arc::clone(&backend), config))));
        let probe = PolicyProbe::new(Arc::clone(&backend), settings.probe_timeout);
        status.send_replace(ConnectionState::Idle);

        Self {
            ctx: Arc::new(DriverContext {
                backend,
                registry,
                tokens,
                probe,
                retry: settings.retry,
                connect_timeout: settings.connect_timeout,
                idle_timeout: settings.idle_timeout,
                status,
                events,
            }),
            endpoint,
            root: CancellationToken::new(),
            task: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.ctx.status.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.ctx.status.subscribe()
    }

    /// The endpoint connections are opened against.
    #[must_use]
    pub const fn endpoint(&self) -> &StreamEndpoint {
        &self.endpoint
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Start connecting.
    ///
    /// No-op while a connection is being established, open or waiting to
    /// reconnect, while policy-blocked, and after [`close`](Self::close).
    pub fn connect(&mut self) {
        if self.is_closed() {
            debug!("connect ignored: manager closed");
            return;
        }
        let state = self.state();
        if state.is_active() || state == ConnectionState::PolicyBlocked {
            debug!(state = %state, "connect ignored");
            return;
        }
        self.spawn_driver();
    }

    /// Stop permanently. Once this returns, no envelope from this manager
    /// can still be dispatched.
    pub async fn close(&mut self) {
        let first = !self.root.is_cancelled();
        self.root.cancel();
        self.join_task().await;
        self.ctx.status.send_replace(ConnectionState::Stopped);
        if first {
            info!(url = %redact(&self.endpoint.probe_url()), "connection closed");
        }
    }

    /// Leave `PolicyBlocked` and connect again.
    ///
    /// Returns `false` and does nothing in any other state.
    pub async fn reset_policy(&mut self) -> bool {
        if self.is_closed() || self.state() != ConnectionState::PolicyBlocked {
            return false;
        }
        info!("policy block reset");
        self.join_task().await;
        self.spawn_driver();
        true
    }

    /// Switch to a new endpoint.
    ///
    /// An active connection is torn down and reopened against the new
    /// endpoint with a fresh retry state. In any other state only the
    /// endpoint is replaced.
    pub async fn set_endpoint(&mut self, endpoint: StreamEndpoint) {
        if endpoint == self.endpoint {
            return;
        }
        let was_active = self.state().is_active();
        if let Some(task) = &self.task {
            task.cancel.cancel();
        }
        self.join_task().await;
        self.endpoint = endpoint;

        if was_active && !self.is_closed() {
            debug!("endpoint changed, reconnecting");
            self.spawn_driver();
        }
    }

    fn spawn_driver(&mut self) {
        let cancel = self.root.child_token();
        self.ctx.status.send_replace(ConnectionState::Connecting);

        let driver = Driver {
            ctx: Arc::clone(&self.ctx),
            endpoint: self.endpoint.clone(),
            cancel: cancel.clone(),
            retry: RetryState::new(&self.ctx.retry),
        };
        let handle = tokio::spawn(driver.run());
        self.task = Some(DriverTask { cancel, handle });
    }

    async fn join_task(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.handle.await {
                warn!(error = %e, "connection task ended abnormally");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// How a single connect-and-stream session ended.
enum Session {
    Cancelled,
    Failed(StreamError),
    PolicyBlocked(Option<String>),
    TokenUnavailable,
}

enum NextFrame {
    Cancelled,
    Idle,
    Ended,
    Frame(Result<StreamFrame, StreamError>),
}

struct Driver {
    ctx: Arc<DriverContext>,
    endpoint: StreamEndpoint,
    cancel: CancellationToken,
    retry: RetryState,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);

            let err = match self.session().await {
                Session::Cancelled => return,
                Session::PolicyBlocked(reason) => {
                    self.block(reason);
                    return;
                }
                Session::TokenUnavailable => {
                    warn!("stream token unavailable");
                    self.set_state(ConnectionState::Stopped);
                    self.emit(ConnectionEvent::TokenUnavailable);
                    return;
                }
                Session::Failed(err) => err,
            };

            warn!(error = %err, attempt = self.retry.attempt(), "stream failed");
            self.emit(ConnectionEvent::Error(err));

            let Some(verdict) = or_cancelled(&self.cancel, self.ctx.probe.check(&self.endpoint)).await
            else {
                return;
            };
            if let ProbeVerdict::PolicyBlocked { reason } = verdict {
                self.block(reason);
                return;
            }

            let Some(delay) = self.retry.record_failure(&self.ctx.retry) else {
                let attempts = self.retry.attempt();
                warn!(attempts, "retry budget exhausted");
                self.set_state(ConnectionState::Stopped);
                self.emit(ConnectionEvent::MaxRetriesExceeded { attempts });
                return;
            };

            let attempt = self.retry.attempt();
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            self.set_state(ConnectionState::Reconnecting);
            self.emit(ConnectionEvent::Reconnecting { attempt, delay });

            if or_cancelled(&self.cancel, sleep(delay)).await.is_none() {
                return;
            }
        }
    }

    async fn session(&mut self) -> Session {
        let token = match self.ctx.tokens.clone() {
            None => None,
            Some(broker) => match self.obtain_token(&broker).await {
                Ok(token) => Some(token),
                Err(session) => return session,
            },
        };

        let url = self.endpoint.stream_url(token.as_deref());
        let opening = timeout(self.ctx.connect_timeout, self.ctx.backend.open_stream(&url));
        let mut frames = match or_cancelled(&self.cancel, opening).await {
            None => return Session::Cancelled,
            Some(Err(_)) => {
                return Session::Failed(StreamError::Timeout("stream open".to_string()));
            }
            Some(Ok(Ok(frames))) => frames,
            Some(Ok(Err(err))) => {
                if matches!(err.status(), Some(401 | 403)) {
                    self.invalidate_token().await;
                }
                return Session::Failed(err);
            }
        };

        if self.cancel.is_cancelled() {
            return Session::Cancelled;
        }
        info!(url = %redact(&url), "stream opened");
        self.set_state(ConnectionState::Open);
        self.emit(ConnectionEvent::Opened);

        loop {
            match self.next_frame(&mut frames).await {
                NextFrame::Cancelled => return Session::Cancelled,
                NextFrame::Idle => {
                    return Session::Failed(StreamError::Timeout("stream idle".to_string()));
                }
                NextFrame::Ended => {
                    return Session::Failed(StreamError::Transport("stream ended".to_string()));
                }
                NextFrame::Frame(Err(err)) => return Session::Failed(err),
                NextFrame::Frame(Ok(StreamFrame::KeepAlive)) => trace!("keep-alive"),
                NextFrame::Frame(Ok(StreamFrame::Data(text))) => {
                    if !self.deliver(&text) {
                        return Session::Cancelled;
                    }
                }
            }
        }
    }

    /// One immediate retry; if both fail, classify the failure.
    async fn obtain_token(&self, broker: &Mutex<TokenBroker>) -> Result<String, Session> {
        let mut last = None;
        for attempt in 0..2 {
            let fetched = or_cancelled(&self.cancel, async {
                broker.lock().await.get_token().await
            })
            .await;
            match fetched {
                None => return Err(Session::Cancelled),
                Some(Ok(token)) => return Ok(token),
                Some(Err(err)) => {
                    warn!(error = %err, attempt, "token exchange failed");
                    last = Some(err);
                }
            }
        }

        if let Some(ProbeVerdict::PolicyBlocked { reason }) = last.as_ref().map(classify_error) {
            return Err(Session::PolicyBlocked(reason));
        }
        match or_cancelled(&self.cancel, self.ctx.probe.check(&self.endpoint)).await {
            None => Err(Session::Cancelled),
            Some(ProbeVerdict::PolicyBlocked { reason }) => Err(Session::PolicyBlocked(reason)),
            Some(ProbeVerdict::Retry) => Err(Session::TokenUnavailable),
        }
    }

    async fn invalidate_token(&self) {
        if let Some(broker) = &self.ctx.tokens {
            broker.lock().await.invalidate();
            debug!("stream token invalidated");
        }
    }

    async fn next_frame(&self, frames: &mut FrameStream) -> NextFrame {
        let next = match self.ctx.idle_timeout {
            Some(idle) => or_cancelled(&self.cancel, timeout(idle, frames.next())).await,
            None => or_cancelled(&self.cancel, frames.next()).await.map(Ok),
        };
        match next {
            None => NextFrame::Cancelled,
            Some(Err(_)) => NextFrame::Idle,
            Some(Ok(None)) => NextFrame::Ended,
            Some(Ok(Some(frame))) => NextFrame::Frame(frame),
        }
    }

    /// Decode and dispatch one data frame. Returns `false` if cancelled.
    fn deliver(&mut self, text: &str) -> bool {
        let envelopes = match decode_frame(text) {
            Ok(envelopes) => envelopes,
            Err(err) => {
                warn!(error = %err, "skipping malformed frame");
                self.emit(ConnectionEvent::Error(err));
                return true;
            }
        };

        self.retry.reset();
        for envelope in envelopes {
            if self.cancel.is_cancelled() {
                return false;
            }
            trace!(event_type = %envelope.event_type, "dispatching envelope");
            self.ctx.registry.dispatch(envelope);
        }
        true
    }

    fn block(&self, reason: Option<String>) {
        warn!(reason = reason.as_deref().unwrap_or(""), "stream blocked by policy");
        self.set_state(ConnectionState::PolicyBlocked);
        self.emit(ConnectionEvent::PolicyBlocked { reason });
    }

    fn set_state(&self, state: ConnectionState) {
        if !self.cancel.is_cancelled() {
            self.ctx.status.send_replace(state);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if !self.cancel.is_cancelled() {
            let _ = self.ctx.events.send(event);
        }
    }
}
