//! Category-scoped publish/subscribe fan-out.
//!
//! Every delivered envelope is appended to the [`ChannelBuffer`] of its
//! category and then handed to the listeners of that category, followed by
//! wildcard listeners registered under [`ANY_EVENT_TYPE`].

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::buffer::{BufferOrder, ChannelBuffer};
use crate::types::EventEnvelope;

/// Category that matches every envelope.
pub const ANY_EVENT_TYPE: &str = "*";

/// Listener callback.
pub type Listener = Arc<dyn Fn(Arc<EventEnvelope>) + Send + Sync>;

/// Identifier returned by [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Generate a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-category buffer sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Capacity for categories without an explicit entry.
    pub default_capacity: usize,
    /// Ordering of every buffer.
    pub order: BufferOrder,
    /// Explicit capacities by category.
    pub capacities: HashMap<String, usize>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            default_capacity: 20,
            order: BufferOrder::NewestFirst,
            capacities: HashMap::new(),
        }
    }
}

impl BufferConfig {
    /// Set the capacity for one category.
    #[must_use]
    pub fn with_capacity(mut self, event_type: impl Into<String>, capacity: usize) -> Self {
        self.capacities.insert(event_type.into(), capacity);
        self
    }

    /// Capacity used for the given category.
    #[must_use]
    pub fn capacity_for(&self, event_type: &str) -> usize {
        self.capacities
            .get(event_type)
            .copied()
            .unwrap_or(self.default_capacity)
    }
}

struct Subscription {
    id: SubscriptionId,
    listener: Listener,
}

/// Fan-out registry for decoded envelopes.
///
/// Dispatch works on a snapshot of the listener list taken when it starts,
/// so listeners may subscribe or unsubscribe from inside a callback.
pub struct SubscriptionRegistry {
    listeners: Mutex<HashMap<String, Vec<Subscription>>>,
    buffers: Mutex<HashMap<String, ChannelBuffer<Arc<EventEnvelope>>>>,
    buffer_config: BufferConfig,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("listeners", &self.listener_count())
            .field("buffer_config", &self.buffer_config)
            .finish_non_exhaustive()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(BufferConfig::default())
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(buffer_config: BufferConfig) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            buffer_config,
        }
    }

    /// Register a callback for one category (or [`ANY_EVENT_TYPE`]).
    pub fn subscribe<F>(&self, event_type: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(Arc<EventEnvelope>) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        let event_type = event_type.into();
        trace!(%id, event_type = %event_type, "subscribed");
        self.listeners
            .lock()
            .entry(event_type)
            .or_default()
            .push(Subscription {
                id,
                listener: Arc::new(callback),
            });
        id
    }

    /// Remove a subscription.
    ///
    /// Returns `true` if it existed. A dispatch already in progress still
    /// calls the removed listener.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let mut removed = false;
        listeners.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    /// Buffer and dispatch one envelope.
    ///
    /// A panicking listener is logged and skipped; the remaining listeners
    /// still run. Returns the number of listeners invoked.
    pub fn dispatch(&self, envelope: EventEnvelope) -> usize {
        let envelope = Arc::new(envelope);
        self.buffer(&envelope);

        let snapshot = self.snapshot(&envelope.event_type);
        for listener in &snapshot {
            let delivered = catch_unwind(AssertUnwindSafe(|| listener(Arc::clone(&envelope))));
            if delivered.is_err() {
                warn!(event_type = %envelope.event_type, "listener panicked");
            }
        }
        snapshot.len()
    }

    /// Envelopes retained for a category, in buffer order.
    #[must_use]
    pub fn buffered(&self, event_type: &str) -> Vec<Arc<EventEnvelope>> {
        self.buffers
            .lock()
            .get(event_type)
            .map(ChannelBuffer::snapshot)
            .unwrap_or_default()
    }

    /// Total number of live subscriptions.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().values().map(Vec::len).sum()
    }

    /// Number of subscriptions for one category.
    #[must_use]
    pub fn listener_count_for(&self, event_type: &str) -> usize {
        self.listeners.lock().get(event_type).map_or(0, Vec::len)
    }

    /// Buffer sizing in use.
    #[must_use]
    pub const fn buffer_config(&self) -> &BufferConfig {
        &self.buffer_config
    }

    fn buffer(&self, envelope: &Arc<EventEnvelope>) {
        let mut buffers = self.buffers.lock();
        buffers
            .entry(envelope.event_type.clone())
            .or_insert_with(|| {
                ChannelBuffer::with_order(
                    self.buffer_config.capacity_for(&envelope.event_type),
                    self.buffer_config.order,
                )
            })
            .push(Arc::clone(envelope));
    }

    fn snapshot(&self, event_type: &str) -> Vec<Listener> {
        let listeners = self.listeners.lock();
        let specific = listeners.get(event_type).into_iter().flatten();
        let wildcard = if event_type == ANY_EVENT_TYPE {
            None
        } else {
            listeners.get(ANY_EVENT_TYPE)
        };
        specific
            .chain(wildcard.into_iter().flatten())
            .map(|s| Arc::clone(&s.listener))
            .collect()
    }
}
