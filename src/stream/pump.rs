use std::convert::Infallible;
use std::fmt::Display;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::session::StreamSession;
use super::{SseEvent, TranslateError};
use crate::protocol::anthropic::AnthropicUsage;
use crate::protocol::openai_chat::stream::is_done_payload;

/// Channel depth between the pump task and the response body.
pub const DOWNSTREAM_CHANNEL_CAPACITY: usize = 32;

/// How a pumped session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// `[DONE]` or a clean upstream close.
    Completed,
    /// Upstream error or invariant violation; the stream was force-closed.
    Failed,
    /// The client disconnected.
    Aborted,
}

#[derive(Debug, Clone, Copy)]
pub struct PumpOutcome {
    pub status: SessionStatus,
    pub usage: AnthropicUsage,
}

/// Drive `session` over `upstream`, writing frames into `tx`.
///
/// `prelude` holds the frames produced by [`StreamSession::start`] and is
/// written first. Waiting on the upstream races against the receiver
/// closing, so a client disconnect is noticed even while the backend is
/// silent.
pub async fn pump_session<S, E>(
    mut session: StreamSession,
    prelude: String,
    upstream: S,
    tx: mpsc::Sender<Bytes>,
) -> PumpOutcome
where
    S: Stream<Item = Result<SseEvent, E>>,
    E: Display,
{
    let outcome = |session: &StreamSession, status| PumpOutcome {
        status,
        usage: session.usage(),
    };

    if send(&tx, prelude).await.is_err() {
        session.abort();
        return outcome(&session, SessionStatus::Aborted);
    }

    futures_util::pin_mut!(upstream);
    loop {
        let item = tokio::select! {
            biased;
            () = tx.closed() => {
                session.abort();
                return outcome(&session, SessionStatus::Aborted);
            }
            item = upstream.next() => item,
        };

        let result = match item {
            Some(Ok(event)) if is_done_payload(&event.data) => break,
            Some(Ok(event)) => session.process_event(&event),
            Some(Err(err)) => Err(TranslateError::UpstreamTransport(err.to_string())),
            None => break,
        };

        match result {
            Ok(frames) => {
                if send(&tx, frames).await.is_err() {
                    session.abort();
                    return outcome(&session, SessionStatus::Aborted);
                }
            }
            Err(err) => return fail(session, &err, &tx).await,
        }
    }

    match session.finish() {
        Ok(frames) => {
            if send(&tx, frames).await.is_err() {
                session.abort();
                return outcome(&session, SessionStatus::Aborted);
            }
            outcome(&session, SessionStatus::Completed)
        }
        Err(err) => fail(session, &err, &tx).await,
    }
}

async fn fail(
    mut session: StreamSession,
    err: &TranslateError,
    tx: &mpsc::Sender<Bytes>,
) -> PumpOutcome {
    let frames = session.fail(err);
    let status = if send(tx, frames).await.is_err() {
        session.abort();
        SessionStatus::Aborted
    } else {
        SessionStatus::Failed
    };
    PumpOutcome {
        status,
        usage: session.usage(),
    }
}

async fn send(tx: &mpsc::Sender<Bytes>, frames: String) -> Result<(), TranslateError> {
    if frames.is_empty() {
        return Ok(());
    }
    tx.send(Bytes::from(frames))
        .await
        .map_err(|_| TranslateError::DownstreamWrite)
}

/// Adapt the receiving half into a body stream for `axum::body::Body::from_stream`.
pub fn receiver_stream(
    rx: mpsc::Receiver<Bytes>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|bytes| (Ok(bytes), rx))
    })
}
