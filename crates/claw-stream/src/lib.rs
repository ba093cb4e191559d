//! # claw-stream
//!
//! Resilient client for the dashboard event stream.
//!
//! Keeps a live, category-keyed view of backend events despite unreliable
//! connectivity and backend access policy, and falls back to polling when
//! push delivery is unavailable.
//!
//! ## Features
//!
//! - **Push stream**: server-sent events, opened with a short-lived token
//! - **Backoff**: exponential retry delays with jitter and a retry budget
//! - **Policy awareness**: deliberate backend denials stop retries
//! - **Polling fallback**: automatic after retry exhaustion, manual toggle back
//! - **Buffers**: the most recent envelopes per category for late joiners
//!
//! ## Example
//!
//! ```rust,no_run
//! use claw_stream::{EventStream, StreamConfig};
//!
//! #[tokio::main]
//! async fn main() -> claw_stream::StreamResult<()> {
//!     let config = StreamConfig::new("https://dashboard.example.com").with_credential("api-key");
//!     let stream = EventStream::http(&config)?;
//!
//!     stream.subscribe("alert", |envelope| {
//!         println!("{} from {}", envelope.event_type, envelope.module);
//!     });
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     stream.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Backend endpoints
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/api/auth/sse-token` | POST | Exchange the credential for a stream token |
//! | `/api/events/stream` | GET | Event stream (`?severity=&module=&token=`) |
//! | `/api/events` | GET | Polling fallback with the same filters |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod buffer;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod manager;
pub mod mode;
pub mod poller;
pub mod probe;
pub mod registry;
pub mod retry;
pub mod sse;
pub mod state;
pub mod token;
pub mod types;

// Re-export main types
pub use backend::{BoxFuture, EventBackend, FrameStream, ProbeResponse, StreamFrame};
pub use buffer::{BufferOrder, ChannelBuffer};
pub use client::EventStream;
pub use config::{
    Credential, PollConfig, ProbeConfig, ProbeMethod, StreamConfig, StreamSettings, TokenConfig,
};
pub use endpoint::StreamEndpoint;
pub use error::{StreamError, StreamResult};
pub use http::HttpBackend;
pub use manager::{ConnectionManager, ManagerSettings};
pub use mode::ModeSelector;
pub use poller::{PollCursor, PollHandle, Poller};
pub use probe::{PolicyProbe, ProbeVerdict};
pub use registry::{ANY_EVENT_TYPE, BufferConfig, SubscriptionId, SubscriptionRegistry};
pub use retry::{RetryPolicy, RetryState};
pub use state::{ConnectionEvent, ConnectionState, DeliveryMode};
pub use token::{Token, TokenBroker};
pub use types::{EventEnvelope, PollResponse, Severity, StreamFilters, TokenGrant, decode_frame};
