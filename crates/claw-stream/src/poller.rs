//! Polling fallback.
//!
//! The poller is an explicit task with its own cancellation token; stopping
//! its [`PollHandle`] waits for the task to finish, so no tick can fire
//! after a mode switch completes.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::EventBackend;
use crate::config::PollConfig;
use crate::endpoint::StreamEndpoint;
use crate::error::StreamError;
use crate::manager::or_cancelled;
use crate::probe::{ProbeVerdict, classify_error};
use crate::registry::SubscriptionRegistry;
use crate::state::ConnectionEvent;
use crate::types::EventEnvelope;

/// Number of untimestamped envelopes remembered for de-duplication.
pub const UNTIMED_MEMORY: usize = 1024;

/// Tracks which polled envelopes were already delivered.
///
/// The poll endpoint returns a window of recent events. Only timestamped
/// envelopes newer than the newest one delivered pass; envelopes sharing
/// that timestamp are told apart by their serialized content. Envelopes
/// without `created_at` are matched by content against the last
/// [`UNTIMED_MEMORY`] such envelopes.
#[derive(Debug, Default)]
pub struct PollCursor {
    mark: Option<DateTime<Utc>>,
    at_mark: HashSet<String>,
    untimed: HashSet<String>,
    untimed_order: VecDeque<String>,
}

impl PollCursor {
    /// Empty cursor; the first page passes in full.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest `created_at` delivered so far.
    #[must_use]
    pub const fn mark(&self) -> Option<DateTime<Utc>> {
        self.mark
    }

    /// Filter a page down to unseen envelopes.
    ///
    /// Timestamped envelopes come first, oldest first, followed by
    /// untimestamped ones in page order.
    pub fn fresh(&mut self, events: Vec<EventEnvelope>) -> Vec<EventEnvelope> {
        let mut timed = Vec::with_capacity(events.len());
        let mut untimed = Vec::new();
        for envelope in events {
            match envelope.created_at {
                Some(created_at) => timed.push((created_at, envelope)),
                None => untimed.push(envelope),
            }
        }
        timed.sort_by_key(|(created_at, _)| *created_at);

        let mut fresh = Vec::with_capacity(timed.len() + untimed.len());
        for (created_at, envelope) in timed {
            let fingerprint = fingerprint(&envelope);
            match self.mark {
                Some(mark) if created_at < mark => continue,
                Some(mark) if created_at == mark => {
                    if !self.at_mark.insert(fingerprint) {
                        continue;
                    }
                }
                _ => {
                    self.mark = Some(created_at);
                    self.at_mark.clear();
                    self.at_mark.insert(fingerprint);
                }
            }
            fresh.push(envelope);
        }

        for envelope in untimed {
            if self.remember_untimed(fingerprint(&envelope)) {
                fresh.push(envelope);
            }
        }
        fresh
    }

    fn remember_untimed(&mut self, fingerprint: String) -> bool {
        if !self.untimed.insert(fingerprint.clone()) {
            return false;
        }
        self.untimed_order.push_back(fingerprint);
        if self.untimed_order.len() > UNTIMED_MEMORY {
            if let Some(oldest) = self.untimed_order.pop_front() {
                self.untimed.remove(&oldest);
            }
        }
        true
    }
}

fn fingerprint(envelope: &EventEnvelope) -> String {
    serde_json::to_string(envelope).unwrap_or_else(|_| envelope.correlation_id.clone())
}

/// Periodically fetches the poll endpoint and dispatches new envelopes.
pub struct Poller {
    backend: Arc<dyn EventBackend>,
    registry: Arc<SubscriptionRegistry>,
    endpoint: StreamEndpoint,
    config: PollConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Poller {
    /// Create a poller for the endpoint's poll URL.
    #[must_use]
    pub fn new(
        backend: Arc<dyn EventBackend>,
        registry: Arc<SubscriptionRegistry>,
        endpoint: StreamEndpoint,
        config: PollConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            backend,
            registry,
            endpoint,
            config,
            events,
        }
    }

    /// Spawn the polling task. The first poll happens immediately.
    #[must_use]
    pub fn start(self) -> PollHandle {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.run(cancel.clone()));
        PollHandle {
            cancel,
            handle: Some(handle),
        }
    }

    async fn run(self, cancel: CancellationToken) {
        let url = self.endpoint.poll_url();
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cursor = PollCursor::new();
        info!(interval_ms = self.config.interval_ms, "polling started");

        loop {
            if or_cancelled(&cancel, ticker.tick()).await.is_none() {
                return;
            }

            let polled =
                or_cancelled(&cancel, timeout(self.config.timeout(), self.backend.poll(&url))).await;
            let response = match polled {
                None => return,
                Some(Err(_)) => {
                    warn!(timeout_ms = self.config.timeout_ms, "poll timed out");
                    self.emit(&cancel, ConnectionEvent::Error(StreamError::Timeout("poll".to_string())));
                    continue;
                }
                Some(Ok(Err(err))) => {
                    if let ProbeVerdict::PolicyBlocked { reason } = classify_error(&err) {
                        warn!(reason = reason.as_deref().unwrap_or(""), "polling blocked by policy");
                        self.emit(&cancel, ConnectionEvent::PolicyBlocked { reason });
                        return;
                    }
                    warn!(error = %err, "poll failed");
                    self.emit(&cancel, ConnectionEvent::Error(err));
                    continue;
                }
                Some(Ok(Ok(response))) => response,
            };

            let fresh = cursor.fresh(response.events);
            trace!(count = fresh.len(), total = ?response.total, "poll page");
            for envelope in fresh {
                if cancel.is_cancelled() {
                    return;
                }
                self.registry.dispatch(envelope);
            }
        }
    }

    fn emit(&self, cancel: &CancellationToken, event: ConnectionEvent) {
        if !cancel.is_cancelled() {
            let _ = self.events.send(event);
        }
    }
}

/// Handle to a running poller.
#[derive(Debug)]
pub struct PollHandle {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PollHandle {
    /// Whether the task has ended (stopped, or blocked by policy).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancel the task and wait for it to end.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "poll task ended abnormally");
            }
        }
        debug!("polling stopped");
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64, id: &str) -> EventEnvelope {
        EventEnvelope::new("alert")
            .with_correlation_id(id)
            .with_created_at(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    #[test]
    fn test_first_page_passes_oldest_first() {
        let mut cursor = PollCursor::new();
        let fresh = cursor.fresh(vec![at(3, "c"), at(1, "a"), at(2, "b")]);

        let ids: Vec<_> = fresh.iter().map(|e| e.correlation_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(cursor.mark(), at(3, "c").created_at);
    }

    #[test]
    fn test_overlapping_window_deduplicated() {
        let mut cursor = PollCursor::new();
        cursor.fresh(vec![at(1, "a"), at(2, "b")]);

        let fresh = cursor.fresh(vec![at(1, "a"), at(2, "b"), at(3, "c")]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].correlation_id, "c");
    }

    #[test]
    fn test_ties_at_mark_distinguished_by_content() {
        let mut cursor = PollCursor::new();
        cursor.fresh(vec![at(5, "a")]);

        let fresh = cursor.fresh(vec![
            at(5, "a"),
            at(5, "b").with_payload("value", json!(1)),
        ]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].correlation_id, "b");

        assert!(cursor.fresh(vec![at(5, "b").with_payload("value", json!(1))]).is_empty());
    }

    #[test]
    fn test_older_than_mark_dropped() {
        let mut cursor = PollCursor::new();
        cursor.fresh(vec![at(10, "x")]);

        assert!(cursor.fresh(vec![at(9, "late")]).is_empty());
    }

    #[test]
    fn test_untimed_envelopes_delivered_once() {
        let mut cursor = PollCursor::new();
        let untimed = |id: &str| EventEnvelope::new("status").with_correlation_id(id);

        let fresh = cursor.fresh(vec![untimed("u1"), at(1, "a"), untimed("u2")]);
        let ids: Vec<_> = fresh.iter().map(|e| e.correlation_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "u1", "u2"]);

        let fresh = cursor.fresh(vec![untimed("u1"), untimed("u2"), untimed("u3")]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].correlation_id, "u3");
        assert_eq!(cursor.mark(), at(1, "a").created_at);
    }

    #[test]
    fn test_untimed_memory_is_bounded() {
        let mut cursor = PollCursor::new();
        let untimed = |i: usize| EventEnvelope::new("status").with_correlation_id(i.to_string());

        let page: Vec<_> = (0..=UNTIMED_MEMORY).map(untimed).collect();
        assert_eq!(cursor.fresh(page).len(), UNTIMED_MEMORY + 1);

        // The oldest entry was forgotten; the newest is still known.
        assert_eq!(cursor.fresh(vec![untimed(0)]).len(), 1);
        assert!(cursor.fresh(vec![untimed(UNTIMED_MEMORY)]).is_empty());
    }
}
