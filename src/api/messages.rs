use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::adapter::ContentAdapter;
use crate::error::BridgeError;
use crate::observability::log_request_complete;
use crate::observability::token_counter::estimate_request_tokens;
use crate::protocol::anthropic::MessagesRequest;
use crate::protocol::mapping::{
    anthropic_to_openai_request, openai_response_to_anthropic, RequestMapping,
};
use crate::protocol::openai_chat::OpenAiChatRequest;
use crate::state::AppState;
use crate::stream::pump::{
    pump_session, receiver_stream, SessionStatus, DOWNSTREAM_CHANNEL_CAPACITY,
};
use crate::stream::StreamSession;
use crate::util::next_message_id;

/// `POST /v1/messages`.
pub async fn handle_messages(State(state): State<Arc<AppState>>, body: bytes::Bytes) -> Response {
    match handle_messages_inner(state, body).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "messages request failed");
            err.into_response()
        }
    }
}

/// `POST /v1/messages/count_tokens`, answered locally from the estimate.
pub async fn handle_count_tokens(body: bytes::Bytes) -> Response {
    match parse_request(&body) {
        Ok(request) => {
            Json(json!({ "input_tokens": estimate_request_tokens(&request) })).into_response()
        }
        Err(err) => err.into_response(),
    }
}

fn parse_request(body: &[u8]) -> Result<MessagesRequest, BridgeError> {
    serde_json::from_slice(body)
        .map_err(|e| BridgeError::InvalidRequest(format!("Invalid Messages request: {e}")))
}

async fn handle_messages_inner(
    state: Arc<AppState>,
    body: bytes::Bytes,
) -> Result<Response, BridgeError> {
    let started = Instant::now();
    let request = parse_request(&body)?;
    let client_model = request.model.clone();
    let input_estimate = estimate_request_tokens(&request);
    let stream = request.stream.unwrap_or(false);

    let upstream_request = anthropic_to_openai_request(
        request,
        RequestMapping {
            model_override: state.config.upstream.model.as_deref(),
            default_max_tokens: state.config.features.default_max_tokens,
        },
    )?;
    debug!(
        client_model = %client_model,
        upstream_model = %upstream_request.model,
        stream,
        messages = upstream_request.messages.len(),
        "forwarding messages request"
    );

    if stream {
        handle_streaming(&state, upstream_request, client_model, input_estimate, started).await
    } else {
        handle_non_streaming(&state, upstream_request, &client_model, input_estimate, started)
            .await
    }
}

async fn handle_streaming(
    state: &AppState,
    upstream_request: OpenAiChatRequest,
    client_model: String,
    input_estimate: u64,
    started: Instant,
) -> Result<Response, BridgeError> {
    let events = state
        .upstream
        .chat_completion_stream(&upstream_request)
        .await?;

    let mut session = StreamSession::new(&state.config.upstream);
    let message_id = next_message_id();
    let prelude = session.start(&message_id, &client_model, input_estimate)?;

    let (tx, rx) = mpsc::channel(DOWNSTREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let outcome = pump_session(session, prelude, events, tx).await;
        match outcome.status {
            SessionStatus::Completed | SessionStatus::Failed => {
                log_request_complete(&client_model, &outcome.usage, started);
            }
            SessionStatus::Aborted => {
                debug!(message_id = %message_id, "client disconnected mid-stream");
            }
        }
    });

    Ok(sse_ok_response(axum::body::Body::from_stream(
        receiver_stream(rx),
    )))
}

async fn handle_non_streaming(
    state: &AppState,
    upstream_request: OpenAiChatRequest,
    client_model: &str,
    input_estimate: u64,
    started: Instant,
) -> Result<Response, BridgeError> {
    let completion = state.upstream.chat_completion(&upstream_request).await?;
    let mut adapter = ContentAdapter::from_config(&state.config.upstream);
    let response =
        openai_response_to_anthropic(completion, client_model, &mut adapter, input_estimate);
    log_request_complete(client_model, &response.usage, started);
    Ok(Json(response).into_response())
}

fn sse_ok_response(body: axum::body::Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}
