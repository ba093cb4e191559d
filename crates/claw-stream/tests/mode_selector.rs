//! Delivery mode handoff tests through the `EventStream` facade.

mod common;

use std::sync::Arc;
use std::time::Duration;

use claw_stream::{
    ConnectionEvent, ConnectionState, DeliveryMode, EventStream, PollResponse, RetryPolicy,
    Severity, StreamConfig, StreamFilters,
};
use common::{ScriptedBackend, data_frame, denial_error, envelope, wait_until};
use parking_lot::Mutex;
use tokio::sync::broadcast;

fn config() -> StreamConfig {
    StreamConfig::new("https://dash.example.com")
        .with_retry(RetryPolicy::new(100, 1_000, 2))
        .with_poll_interval(Duration::from_secs(5))
        .with_idle_timeout(Duration::ZERO)
}

fn collect(stream: &EventStream, event_type: &str) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    stream.subscribe(event_type, move |envelope| {
        sink.lock().push(envelope.correlation_id.clone());
    });
    seen
}

async fn wait_for(
    lifecycle: &mut broadcast::Receiver<ConnectionEvent>,
    pred: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    loop {
        let event = lifecycle.recv().await.expect("lifecycle closed");
        if pred(&event) {
            return event;
        }
    }
}

fn page(ids: &[(&str, i64)]) -> PollResponse {
    let base = chrono::Utc::now();
    PollResponse {
        events: ids
            .iter()
            .map(|(id, offset)| {
                envelope("alert", id).with_created_at(base + chrono::Duration::seconds(*offset))
            })
            .collect(),
        total: None,
    }
}

// ============================================================================
// Automatic fallback
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_falls_back_to_polling() {
    let backend = ScriptedBackend::new();
    backend.set_poll(Ok(page(&[("p1", 0)])));
    let stream = EventStream::start(&config(), backend.clone()).unwrap();
    let mut lifecycle = stream.lifecycle();
    let seen = collect(&stream, "alert");

    assert_eq!(stream.mode(), DeliveryMode::Streaming);
    wait_for(&mut lifecycle, |e| matches!(e, ConnectionEvent::MaxRetriesExceeded { .. })).await;
    let changed = wait_for(&mut lifecycle, |e| matches!(e, ConnectionEvent::ModeChanged(_))).await;

    assert_eq!(changed, ConnectionEvent::ModeChanged(DeliveryMode::Polling));
    assert_eq!(stream.mode(), DeliveryMode::Polling);
    assert_eq!(stream.connection_state(), ConnectionState::Stopped);
    assert_eq!(backend.opens(), 3);

    wait_until(|| seen.lock().len() == 1).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(seen.lock().as_slice(), ["p1"], "repeated pages are not redelivered");
    assert!(backend.polls() > 1);
    assert_eq!(backend.opens(), 3);

    stream.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_token_unavailable_falls_back_to_polling() {
    let backend = ScriptedBackend::new();
    backend.push_token(Err(claw_stream::StreamError::TokenExchange("down".to_string())));
    backend.push_token(Err(claw_stream::StreamError::TokenExchange("down".to_string())));
    let stream = EventStream::start(&config().with_credential("key"), backend.clone()).unwrap();
    let mut lifecycle = stream.lifecycle();

    wait_for(&mut lifecycle, |e| *e == ConnectionEvent::TokenUnavailable).await;
    wait_for(&mut lifecycle, |e| *e == ConnectionEvent::ModeChanged(DeliveryMode::Polling)).await;

    wait_until(|| backend.polls() >= 1).await;
    assert_eq!(backend.opens(), 0);
    stream.close().await;
}

// ============================================================================
// Manual handoff
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_no_stream_envelopes_after_switch_to_polling() {
    let backend = ScriptedBackend::new();
    let tx = backend.push_channel();
    let stream = EventStream::start(&config(), backend.clone()).unwrap();
    let seen = collect(&stream, "alert");

    wait_until(|| stream.connection_state() == ConnectionState::Open).await;
    tx.send(Ok(data_frame("alert", "s1"))).unwrap();
    wait_until(|| seen.lock().len() == 1).await;

    stream.set_mode(DeliveryMode::Polling).await;
    assert_eq!(stream.mode(), DeliveryMode::Polling);

    let _ = tx.send(Ok(data_frame("alert", "s2")));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(seen.lock().as_slice(), ["s1"]);
    assert!(backend.polls() >= 1);

    stream.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_toggle_back_to_streaming() {
    let backend = ScriptedBackend::new();
    let _first = backend.push_channel();
    let stream = EventStream::start(&config().with_start_mode(DeliveryMode::Polling), backend.clone())
        .unwrap();
    assert_eq!(stream.mode(), DeliveryMode::Polling);
    assert_eq!(stream.connection_state(), ConnectionState::Stopped);
    wait_until(|| backend.polls() == 1).await;

    let mut lifecycle = stream.lifecycle();
    stream.set_mode(DeliveryMode::Streaming).await;
    assert_eq!(stream.mode(), DeliveryMode::Streaming);
    wait_for(&mut lifecycle, |e| *e == ConnectionEvent::Opened).await;
    assert_eq!(stream.connection_state(), ConnectionState::Open);

    let polls = backend.polls();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.polls(), polls, "poller stopped");

    stream.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_set_mode_to_current_mode_is_noop() {
    let backend = ScriptedBackend::new();
    let _tx = backend.push_channel();
    let stream = EventStream::start(&config(), backend.clone()).unwrap();
    wait_until(|| stream.connection_state() == ConnectionState::Open).await;

    stream.set_mode(DeliveryMode::Streaming).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(backend.opens(), 1);
    assert_eq!(stream.connection_state(), ConnectionState::Open);

    stream.close().await;
}

// ============================================================================
// Filters
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_set_filters_reopens_stream() {
    let backend = ScriptedBackend::new();
    let _first = backend.push_channel();
    let _second = backend.push_channel();
    let stream = EventStream::start(&config(), backend.clone()).unwrap();
    wait_until(|| stream.connection_state() == ConnectionState::Open).await;

    stream
        .set_filters(StreamFilters::none().with_severity(Severity::Critical))
        .await;
    wait_until(|| backend.opens() == 2).await;

    let url = backend.opened_urls.lock()[1].clone();
    assert_eq!(url.query(), Some("severity=critical"));
    stream.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_set_filters_restarts_poller() {
    let backend = ScriptedBackend::new();
    let stream = EventStream::start(&config().with_start_mode(DeliveryMode::Polling), backend.clone())
        .unwrap();
    wait_until(|| backend.polls() == 1).await;

    stream.set_filters(StreamFilters::none().with_module("gpu")).await;
    wait_until(|| backend.polls() == 2).await;

    let urls = backend.polled_urls.lock().clone();
    assert_eq!(urls[0].query(), None);
    assert_eq!(urls[1].query(), Some("module=gpu"));
    stream.close().await;
}

// ============================================================================
// Policy
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stream_policy_block_and_reset() {
    let backend = ScriptedBackend::new();
    backend.deny_by_policy("sse disabled");
    let stream = EventStream::start(&config(), backend.clone()).unwrap();
    let mut lifecycle = stream.lifecycle();

    wait_for(&mut lifecycle, |e| matches!(e, ConnectionEvent::PolicyBlocked { .. })).await;
    assert_eq!(stream.connection_state(), ConnectionState::PolicyBlocked);
    assert_eq!(stream.mode(), DeliveryMode::Streaming, "policy denial is not a fallback");

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(backend.opens(), 1);
    assert_eq!(backend.polls(), 0);

    backend.allow();
    let _tx = backend.push_channel();
    assert!(stream.reset_policy().await);
    wait_for(&mut lifecycle, |e| *e == ConnectionEvent::Opened).await;
    assert_eq!(stream.connection_state(), ConnectionState::Open);

    stream.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_polling_policy_denial_stops_poller() {
    let backend = ScriptedBackend::new();
    backend.push_poll(Err(denial_error("polling disabled")));
    let stream = EventStream::start(&config().with_start_mode(DeliveryMode::Polling), backend.clone())
        .unwrap();
    let mut lifecycle = stream.lifecycle();

    let blocked = wait_for(&mut lifecycle, |e| matches!(e, ConnectionEvent::PolicyBlocked { .. })).await;
    assert_eq!(
        blocked,
        ConnectionEvent::PolicyBlocked {
            reason: Some("polling disabled".to_string())
        }
    );
    assert_eq!(stream.connection_state(), ConnectionState::PolicyBlocked);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.polls(), 1);

    assert!(stream.reset_policy().await);
    wait_until(|| backend.polls() == 2).await;
    assert_eq!(stream.connection_state(), ConnectionState::Stopped);

    stream.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_poll_errors_keep_polling() {
    let backend = ScriptedBackend::new();
    backend.push_poll(Err(claw_stream::StreamError::Status {
        status: 503,
        body: None,
    }));
    backend.push_poll(Ok(page(&[("p1", 0)])));
    let stream = EventStream::start(&config().with_start_mode(DeliveryMode::Polling), backend.clone())
        .unwrap();
    let seen = collect(&stream, "alert");

    wait_until(|| seen.lock().len() == 1).await;
    assert_eq!(backend.polls(), 2);
    stream.close().await;
}

// ============================================================================
// Consumer surface
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_buffer_and_unsubscribe() {
    let backend = ScriptedBackend::new();
    let tx = backend.push_channel();
    let config = config().with_buffers(claw_stream::BufferConfig::default().with_capacity("alert", 2));
    let stream = EventStream::start(&config, backend.clone()).unwrap();

    let seen = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&seen);
    let id = stream.subscribe("alert", move |_| *sink.lock() += 1);

    wait_until(|| stream.connection_state() == ConnectionState::Open).await;
    for id in ["a", "b", "c"] {
        tx.send(Ok(data_frame("alert", id))).unwrap();
    }
    wait_until(|| *seen.lock() == 3).await;

    let buffered: Vec<_> = stream
        .buffer("alert")
        .iter()
        .map(|e| e.correlation_id.clone())
        .collect();
    assert_eq!(buffered, vec!["c", "b"]);

    assert!(stream.unsubscribe(id));
    tx.send(Ok(data_frame("alert", "d"))).unwrap();
    wait_until(|| stream.buffer("alert")[0].correlation_id == "d").await;
    assert_eq!(*seen.lock(), 3);

    stream.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_is_terminal_and_idempotent() {
    let backend = ScriptedBackend::new();
    let _tx = backend.push_channel();
    let stream = EventStream::start(&config(), backend.clone()).unwrap();
    wait_until(|| stream.connection_state() == ConnectionState::Open).await;

    stream.close().await;
    assert_eq!(stream.connection_state(), ConnectionState::Stopped);
    stream.close().await;
    stream.set_mode(DeliveryMode::Polling).await;
    assert!(!stream.reset_policy().await);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.polls(), 0);
    assert_eq!(backend.opens(), 1);
}

#[tokio::test]
async fn test_invalid_config_rejected_at_start() {
    let backend = ScriptedBackend::new();
    let result = EventStream::start(&StreamConfig::new("ftp://nope"), backend);
    assert!(result.is_err());
}
