//! Fixed-capacity ring buffer for late-joining consumers.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Which end of a [`ChannelBuffer`] receives new items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferOrder {
    /// New items at the front; the oldest is evicted from the back.
    #[default]
    NewestFirst,
    /// New items at the back; the oldest is evicted from the front.
    OldestFirst,
}

/// Keeps the most recent `capacity` items of one event category.
#[derive(Debug, Clone)]
pub struct ChannelBuffer<T> {
    capacity: usize,
    order: BufferOrder,
    items: VecDeque<T>,
}

impl<T> ChannelBuffer<T> {
    /// Create a newest-first buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_order(capacity, BufferOrder::NewestFirst)
    }

    /// Create a buffer with explicit ordering.
    #[must_use]
    pub fn with_order(capacity: usize, order: BufferOrder) -> Self {
        Self {
            capacity,
            order,
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Insert an item, evicting the oldest one if the buffer is full.
    ///
    /// A zero-capacity buffer retains nothing.
    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        match self.order {
            BufferOrder::NewestFirst => {
                self.items.push_front(item);
                if self.items.len() > self.capacity {
                    self.items.pop_back();
                }
            }
            BufferOrder::OldestFirst => {
                self.items.push_back(item);
                if self.items.len() > self.capacity {
                    self.items.pop_front();
                }
            }
        }
    }

    /// Maximum number of retained items.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured ordering.
    #[must_use]
    pub const fn order(&self) -> BufferOrder {
        self.order
    }

    /// Number of retained items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate in the configured order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// The most recently pushed item.
    #[must_use]
    pub fn latest(&self) -> Option<&T> {
        match self.order {
            BufferOrder::NewestFirst => self.items.front(),
            BufferOrder::OldestFirst => self.items.back(),
        }
    }

    /// Remove every item.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> ChannelBuffer<T> {
    /// Copy the items out in the configured order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}
