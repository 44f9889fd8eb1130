//! Streaming translation from chat-completions deltas to Messages events.
//!
//! Bytes from the upstream body go through [`sse::sse_event_stream`], each
//! event payload is decoded into a [`delta::Delta`] and fed to a
//! [`session::StreamSession`], which owns the content adapter, the tool-call
//! accumulator, the block machine and the event emitter for one request.

pub mod accumulator;
pub mod blocks;
pub mod delta;
pub mod emitter;
pub mod pump;
pub mod session;
pub mod sse;

pub use session::StreamSession;
pub use sse::{sse_event_stream, SseParser};

/// A parsed SSE frame from the upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Failure inside one streaming session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    /// Dropped connection, malformed chunk or in-band upstream error.
    #[error("upstream stream failed: {0}")]
    UpstreamTransport(String),
    /// The client went away.
    #[error("downstream write failed")]
    DownstreamWrite,
    /// A block lifecycle rule was broken.
    #[error("protocol invariant violated: {0}")]
    ProtocolInvariant(String),
}
