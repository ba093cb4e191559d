//! Consumer-facing facade.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::backend::EventBackend;
use crate::config::StreamConfig;
use crate::error::StreamResult;
use crate::http::HttpBackend;
use crate::mode::ModeSelector;
use crate::registry::{SubscriptionId, SubscriptionRegistry};
use crate::state::{ConnectionEvent, ConnectionState, DeliveryMode};
use crate::types::{EventEnvelope, StreamFilters};

/// A caller-owned, live view of backend events.
///
/// Create one with [`EventStream::start`], subscribe by category, and call
/// [`close`](Self::close) when done. Nothing after construction returns an
/// error: failures surface as [`ConnectionEvent`]s and as the
/// [`ConnectionState`] signal.
#[derive(Debug, Clone)]
pub struct EventStream {
    registry: Arc<SubscriptionRegistry>,
    selector: ModeSelector,
}

impl EventStream {
    /// Validate `config` and start delivering through `backend`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn start(config: &StreamConfig, backend: Arc<dyn EventBackend>) -> StreamResult<Self> {
        config.validate()?;
        Self::spawn(config, backend)
    }

    /// Validate `config` and start delivering over HTTP.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn http(config: &StreamConfig) -> StreamResult<Self> {
        config.validate()?;
        let backend = HttpBackend::from_config(config)?;
        Self::spawn(config, Arc::new(backend))
    }

    fn spawn(config: &StreamConfig, backend: Arc<dyn EventBackend>) -> StreamResult<Self> {
        let registry = Arc::new(SubscriptionRegistry::new(config.buffers.clone()));
        let selector = ModeSelector::spawn(backend, Arc::clone(&registry), config)?;
        info!(base_url = %config.base_url, mode = %config.start_mode, "event stream started");

        Ok(Self { registry, selector })
    }

    /// Register a listener for one category, or `"*"` for all.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(Arc<EventEnvelope>) + Send + Sync + 'static,
    {
        self.registry.subscribe(event_type, callback)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// Recent envelopes of one category, in buffer order.
    #[must_use]
    pub fn buffer(&self, event_type: &str) -> Vec<Arc<EventEnvelope>> {
        self.registry.buffered(event_type)
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.selector.state()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.selector.watch_state()
    }

    /// Current delivery mode.
    #[must_use]
    pub fn mode(&self) -> DeliveryMode {
        self.selector.mode()
    }

    /// Subscribe to delivery mode changes.
    #[must_use]
    pub fn watch_mode(&self) -> watch::Receiver<DeliveryMode> {
        self.selector.watch_mode()
    }

    /// Subscribe to lifecycle events emitted from now on.
    #[must_use]
    pub fn lifecycle(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.selector.lifecycle()
    }

    /// Change the server-side filters; the active path restarts.
    pub async fn set_filters(&self, filters: StreamFilters) {
        self.selector.set_filters(filters).await;
    }

    /// Switch between streaming and polling.
    pub async fn set_mode(&self, mode: DeliveryMode) {
        self.selector.set_mode(mode).await;
    }

    /// Leave a policy block and try again. Returns whether anything restarted.
    pub async fn reset_policy(&self) -> bool {
        self.selector.reset_policy().await
    }

    /// Stop all delivery. Safe to call more than once.
    pub async fn close(&self) {
        self.selector.close().await;
    }
}
