//! Scripted in-memory backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use claw_stream::{
    BoxFuture, EventBackend, EventEnvelope, FrameStream, PollResponse, ProbeResponse,
    StreamError, StreamFrame, StreamResult, TokenGrant,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

/// What the next `open_stream` call does.
pub enum OpenScript {
    /// Fail to open.
    Fail(StreamError),
    /// Open, yield these frames, then end.
    Frames(Vec<StreamFrame>),
    /// Open and yield whatever is sent on the channel.
    Channel(mpsc::UnboundedReceiver<StreamResult<StreamFrame>>),
    /// Never resolve.
    Hang,
}

/// Backend whose responses are queued up front.
///
/// Empty queues fall back to: failing opens, a `200` probe, a fresh token and
/// an empty poll page.
#[derive(Default)]
pub struct ScriptedBackend {
    opens: Mutex<VecDeque<OpenScript>>,
    probes: Mutex<VecDeque<StreamResult<ProbeResponse>>>,
    sticky_probe: Mutex<Option<ProbeResponse>>,
    tokens: Mutex<VecDeque<StreamResult<TokenGrant>>>,
    polls: Mutex<VecDeque<StreamResult<PollResponse>>>,
    sticky_poll: Mutex<Option<StreamResult<PollResponse>>>,
    pub opened_urls: Mutex<Vec<Url>>,
    pub polled_urls: Mutex<Vec<Url>>,
    pub open_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub token_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_open(&self, script: OpenScript) {
        self.opens.lock().push_back(script);
    }

    pub fn push_failures(&self, count: usize) {
        for _ in 0..count {
            self.push_open(OpenScript::Fail(refused()));
        }
    }

    /// Queue an open backed by a channel and return its sender.
    pub fn push_channel(&self) -> mpsc::UnboundedSender<StreamResult<StreamFrame>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push_open(OpenScript::Channel(rx));
        tx
    }

    pub fn push_probe(&self, response: StreamResult<ProbeResponse>) {
        self.probes.lock().push_back(response);
    }

    /// Every probe from now on answers with a structured policy denial.
    pub fn deny_by_policy(&self, reason: &str) {
        *self.sticky_probe.lock() = Some(policy_denial(reason));
    }

    pub fn allow(&self) {
        *self.sticky_probe.lock() = None;
    }

    pub fn push_token(&self, grant: StreamResult<TokenGrant>) {
        self.tokens.lock().push_back(grant);
    }

    pub fn push_poll(&self, response: StreamResult<PollResponse>) {
        self.polls.lock().push_back(response);
    }

    /// Every poll from now on returns this response once the queue is empty.
    pub fn set_poll(&self, response: StreamResult<PollResponse>) {
        *self.sticky_poll.lock() = Some(response);
    }

    pub fn opens(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }
}

impl EventBackend for ScriptedBackend {
    fn exchange_token(&self) -> BoxFuture<'_, StreamResult<TokenGrant>> {
        let n = self.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.tokens.lock().pop_front();
        Box::pin(async move {
            scripted.unwrap_or_else(|| {
                Ok(TokenGrant {
                    sse_token: format!("tok-{n}"),
                    expires_in_sec: Some(60),
                })
            })
        })
    }

    fn open_stream<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, StreamResult<FrameStream>> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        self.opened_urls.lock().push(url.clone());
        let script = self
            .opens
            .lock()
            .pop_front()
            .unwrap_or_else(|| OpenScript::Fail(refused()));
        Box::pin(async move {
            match script {
                OpenScript::Fail(err) => Err(err),
                OpenScript::Frames(frames) => {
                    Ok(futures::stream::iter(frames.into_iter().map(Ok)).boxed())
                }
                OpenScript::Channel(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
                OpenScript::Hang => {
                    futures::future::pending::<()>().await;
                    Err(StreamError::Closed)
                }
            }
        })
    }

    fn probe<'a>(&'a self, _url: &'a Url) -> BoxFuture<'a, StreamResult<ProbeResponse>> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let response = self.probes.lock().pop_front().unwrap_or_else(|| {
            Ok(self
                .sticky_probe
                .lock()
                .clone()
                .unwrap_or(ProbeResponse::status(200)))
        });
        Box::pin(async move { response })
    }

    fn poll<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, StreamResult<PollResponse>> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.polled_urls.lock().push(url.clone());
        let response = self.polls.lock().pop_front().unwrap_or_else(|| {
            self.sticky_poll
                .lock()
                .clone()
                .unwrap_or_else(|| Ok(PollResponse::default()))
        });
        Box::pin(async move { response })
    }
}

pub fn refused() -> StreamError {
    StreamError::Transport("connection refused".to_string())
}

pub fn policy_denial(reason: &str) -> ProbeResponse {
    ProbeResponse::with_body(
        403,
        format!(r#"{{"status":"off_by_policy","reason":"{reason}"}}"#),
    )
}

pub fn denial_error(reason: &str) -> StreamError {
    StreamError::Status {
        status: 403,
        body: Some(format!(r#"{{"status":"off_by_policy","reason":"{reason}"}}"#)),
    }
}

pub fn envelope(event_type: &str, id: &str) -> EventEnvelope {
    EventEnvelope::new(event_type)
        .with_module("test")
        .with_correlation_id(id)
}

pub fn data_frame(event_type: &str, id: &str) -> StreamFrame {
    StreamFrame::Data(envelope(event_type, id).to_json().unwrap())
}

/// Poll `cond` in virtual time until it holds or a minute passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..60_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
