//! Delivery path selection: push stream or polling.
//!
//! The [`ModeSelector`] is a handle to an actor task that owns the single
//! active delivery path. Every command is acknowledged only after the old
//! path is fully torn down and the new one started. Each path reports
//! lifecycle events on its own channel; the actor drops the receiver of a
//! torn-down path, so stale events never reach consumers.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::backend::EventBackend;
use crate::config::{PollConfig, StreamConfig};
use crate::endpoint::StreamEndpoint;
use crate::error::StreamResult;
use crate::manager::{ConnectionManager, ManagerSettings};
use crate::poller::{PollHandle, Poller};
use crate::registry::SubscriptionRegistry;
use crate::state::{ConnectionEvent, ConnectionState, DeliveryMode};
use crate::types::StreamFilters;

/// Capacity of the lifecycle broadcast channel.
pub const LIFECYCLE_CAPACITY: usize = 64;

const COMMAND_CAPACITY: usize = 16;

enum Command {
    SetMode(DeliveryMode, oneshot::Sender<()>),
    SetFilters(StreamFilters, oneshot::Sender<()>),
    ResetPolicy(oneshot::Sender<bool>),
    Close(oneshot::Sender<()>),
}

enum DeliveryPath {
    Idle,
    Stream(ConnectionManager),
    Poll {
        handle: PollHandle,
        blocked: bool,
    },
}

/// Handle to the delivery actor.
#[derive(Debug, Clone)]
pub struct ModeSelector {
    commands: mpsc::Sender<Command>,
    status: Arc<watch::Sender<ConnectionState>>,
    mode: watch::Receiver<DeliveryMode>,
    lifecycle: broadcast::Sender<ConnectionEvent>,
}

impl ModeSelector {
    /// Start delivering in `config.start_mode` with `config.filters`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint URLs cannot be built.
    pub fn spawn(
        backend: Arc<dyn EventBackend>,
        registry: Arc<SubscriptionRegistry>,
        config: &StreamConfig,
    ) -> StreamResult<Self> {
        let endpoint = config.endpoint(config.filters.clone())?;
        let (status, _) = watch::channel(ConnectionState::Idle);
        let status = Arc::new(status);
        let (mode_tx, mode_rx) = watch::channel(config.start_mode);
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (_, events) = mpsc::unbounded_channel();

        let mut actor = ModeActor {
            backend,
            registry,
            settings: ManagerSettings::from_config(config),
            poll: config.poll,
            endpoint,
            status: Arc::clone(&status),
            mode: mode_tx,
            lifecycle: lifecycle.clone(),
            path: DeliveryPath::Idle,
            events,
        };
        actor.start(config.start_mode);
        tokio::spawn(actor.run(command_rx));

        Ok(Self {
            commands,
            status,
            mode: mode_rx,
            lifecycle,
        })
    }

    /// Current connection state. `Stopped` while polling, unless polling is
    /// blocked by policy.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    /// Current delivery mode.
    #[must_use]
    pub fn mode(&self) -> DeliveryMode {
        *self.mode.borrow()
    }

    /// Subscribe to delivery mode changes.
    #[must_use]
    pub fn watch_mode(&self) -> watch::Receiver<DeliveryMode> {
        self.mode.clone()
    }

    /// Subscribe to lifecycle events from now on.
    #[must_use]
    pub fn lifecycle(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.lifecycle.subscribe()
    }

    /// Switch delivery mode. Returns after the old path is torn down.
    pub async fn set_mode(&self, mode: DeliveryMode) {
        self.request(|ack| Command::SetMode(mode, ack)).await;
    }

    /// Replace the filters and restart the active path.
    pub async fn set_filters(&self, filters: StreamFilters) {
        self.request(|ack| Command::SetFilters(filters, ack)).await;
    }

    /// Restart the active path if it is blocked by policy.
    pub async fn reset_policy(&self) -> bool {
        self.request(Command::ResetPolicy).await.unwrap_or(false)
    }

    /// Tear down the active path and stop the actor. Idempotent.
    pub async fn close(&self) {
        self.request(Command::Close).await;
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (ack, done) = oneshot::channel();
        if self.commands.send(command(ack)).await.is_err() {
            debug!("delivery actor already stopped");
            return None;
        }
        done.await.ok()
    }
}

struct ModeActor {
    backend: Arc<dyn EventBackend>,
    registry: Arc<SubscriptionRegistry>,
    settings: ManagerSettings,
    poll: PollConfig,
    endpoint: StreamEndpoint,
    status: Arc<watch::Sender<ConnectionState>>,
    mode: watch::Sender<DeliveryMode>,
    lifecycle: broadcast::Sender<ConnectionEvent>,
    path: DeliveryPath,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ModeActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::SetMode(mode, ack)) => {
                        if mode != *self.mode.borrow() {
                            self.switch_to(mode).await;
                        }
                        let _ = ack.send(());
                    }
                    Some(Command::SetFilters(filters, ack)) => {
                        self.set_filters(filters).await;
                        let _ = ack.send(());
                    }
                    Some(Command::ResetPolicy(ack)) => {
                        let reset = self.reset_policy().await;
                        let _ = ack.send(reset);
                    }
                    Some(Command::Close(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = self.events.recv() => self.on_event(event).await,
            }
        }
    }

    async fn on_event(&mut self, event: ConnectionEvent) {
        let mut fallback = false;
        if event.is_terminal() {
            match (&event, &mut self.path) {
                (ConnectionEvent::PolicyBlocked { .. }, DeliveryPath::Poll { blocked, .. }) => {
                    *blocked = true;
                    self.status.send_replace(ConnectionState::PolicyBlocked);
                }
                // A stream denied by policy stays blocked until reset.
                (ConnectionEvent::PolicyBlocked { .. }, _) => {}
                (_, DeliveryPath::Stream(_)) => fallback = true,
                _ => {}
            }
        }

        let _ = self.lifecycle.send(event);

        if fallback {
            warn!("stream unavailable, falling back to polling");
            self.switch_to(DeliveryMode::Polling).await;
        }
    }

    async fn switch_to(&mut self, mode: DeliveryMode) {
        self.teardown().await;
        self.start(mode);
        info!(mode = %mode, "delivery mode changed");
        let _ = self.lifecycle.send(ConnectionEvent::ModeChanged(mode));
    }

    fn start(&mut self, mode: DeliveryMode) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = rx;
        self.mode.send_replace(mode);

        self.path = match mode {
            DeliveryMode::Streaming => {
                let mut manager = ConnectionManager::with_status(
                    Arc::clone(&self.backend),
                    Arc::clone(&self.registry),
                    self.endpoint.clone(),
                    self.settings,
                    tx,
                    Arc::clone(&self.status),
                );
                manager.connect();
                DeliveryPath::Stream(manager)
            }
            DeliveryMode::Polling => {
                self.status.send_replace(ConnectionState::Stopped);
                let handle = Poller::new(
                    Arc::clone(&self.backend),
                    Arc::clone(&self.registry),
                    self.endpoint.clone(),
                    self.poll,
                    tx,
                )
                .start();
                DeliveryPath::Poll {
                    handle,
                    blocked: false,
                }
            }
        };
    }

    async fn teardown(&mut self) {
        match std::mem::replace(&mut self.path, DeliveryPath::Idle) {
            DeliveryPath::Idle => {}
            DeliveryPath::Stream(mut manager) => manager.close().await,
            DeliveryPath::Poll { handle, .. } => handle.stop().await,
        }
        let (_, rx) = mpsc::unbounded_channel();
        self.events = rx;
        self.status.send_replace(ConnectionState::Stopped);
    }

    async fn set_filters(&mut self, filters: StreamFilters) {
        if &filters == self.endpoint.filters() {
            return;
        }
        self.endpoint = self.endpoint.with_filters(filters);
        debug!("filters changed");

        match &mut self.path {
            DeliveryPath::Stream(manager) => {
                manager.set_endpoint(self.endpoint.clone()).await;
                return;
            }
            DeliveryPath::Poll { blocked: false, .. } => {}
            DeliveryPath::Poll { blocked: true, .. } | DeliveryPath::Idle => return,
        }
        self.teardown().await;
        self.start(DeliveryMode::Polling);
    }

    async fn reset_policy(&mut self) -> bool {
        match &mut self.path {
            DeliveryPath::Stream(manager) => return manager.reset_policy().await,
            DeliveryPath::Poll { blocked: true, .. } => {}
            DeliveryPath::Poll { blocked: false, .. } | DeliveryPath::Idle => return false,
        }
        info!("polling policy block reset");
        self.teardown().await;
        self.start(DeliveryMode::Polling);
        true
    }

    async fn shutdown(&mut self) {
        self.teardown().await;
        info!("event delivery closed");
    }
}
