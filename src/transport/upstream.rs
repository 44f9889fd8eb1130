use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use http::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};

use super::retry_policy::RetryPolicy;
use crate::config::{ServerConfig, UpstreamConfig};
use crate::error::BridgeError;
use crate::protocol::openai_chat::{OpenAiChatRequest, OpenAiChatResponse};
use crate::stream::{sse_event_stream, SseEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_MAX_IDLE_PER_HOST: usize = 32;
const UPSTREAM_ERROR_MAX_LEN: usize = 500;

fn build_reqwest_client(timeout: Duration) -> Result<reqwest::Client, BridgeError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .tcp_nodelay(true)
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(|err| BridgeError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// Client for the configured chat-completions backend.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    url: url::Url,
    headers: HeaderMap,
    retry: RetryPolicy,
}

impl UpstreamClient {
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] for an unusable base URL or API key and
    /// [`BridgeError::Transport`] when the HTTP client cannot be built.
    pub fn new(server: &ServerConfig, upstream: &UpstreamConfig) -> Result<Self, BridgeError> {
        let url = url::Url::parse(&upstream.chat_completions_url())
            .map_err(|err| BridgeError::Config(format!("invalid upstream base_url: {err}")))?;

        let mut headers = HeaderMap::with_capacity(2);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = upstream.api_key.as_deref() {
            let mut value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| BridgeError::Config("upstream api_key is not a valid header".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Ok(Self {
            client: build_reqwest_client(Duration::from_secs(server.timeout))?,
            url,
            headers,
            retry: RetryPolicy::new(upstream.retry_max_attempts),
        })
    }

    #[must_use]
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// Send a non-streaming request and decode the completion.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Upstream`] for a non-success status,
    /// [`BridgeError::Transport`] for connection failures and
    /// [`BridgeError::Translation`] for an undecodable body.
    pub async fn chat_completion(
        &self,
        request: &OpenAiChatRequest,
    ) -> Result<OpenAiChatResponse, BridgeError> {
        let response = self.send(request, false).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| BridgeError::Transport(format!("Failed to read upstream body: {e}")))?;
        serde_json::from_slice(&body).map_err(|e| {
            BridgeError::Translation(format!("Failed to decode upstream response: {e}"))
        })
    }

    /// Send a streaming request and return its SSE events.
    ///
    /// Only the request phase is retried; once this returns, stream failures
    /// surface as stream items.
    ///
    /// # Errors
    ///
    /// Same as [`Self::chat_completion`], for the response head only.
    pub async fn chat_completion_stream(
        &self,
        request: &OpenAiChatRequest,
    ) -> Result<impl Stream<Item = Result<SseEvent, reqwest::Error>> + Send + 'static, BridgeError>
    {
        let response = self.send(request, true).await?;
        Ok(sse_event_stream(response.bytes_stream()))
    }

    async fn send(
        &self,
        request: &OpenAiChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, BridgeError> {
        let body = Bytes::from(serde_json::to_vec(request).map_err(|e| {
            BridgeError::Internal(format!("Failed to encode upstream request: {e}"))
        })?);
        let mut headers = self.headers.clone();
        if stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }

        let mut attempt = 0;
        loop {
            let mut outgoing = reqwest::Request::new(http::Method::POST, self.url.clone());
            *outgoing.headers_mut() = headers.clone();
            *outgoing.body_mut() = Some(reqwest::Body::from(body.clone()));

            match self.client.execute(outgoing).await {
                Ok(response) => {
                    let status = response.status();
                    if let Some(delay) = self.retry.after_status(status, response.headers(), attempt)
                    {
                        tracing::debug!(
                            status = status.as_u16(),
                            retry_attempt = attempt + 1,
                            delay_ms = delay.as_millis(),
                            "retrying upstream request after retriable status"
                        );
                        drop(response);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    if !status.is_success() {
                        let body_bytes = response.bytes().await.map_err(|e| {
                            BridgeError::Transport(format!("Failed to read error body: {e}"))
                        })?;
                        return Err(BridgeError::Upstream {
                            status: status.as_u16(),
                            message: sanitize_upstream_error(&body_bytes),
                        });
                    }
                    return Ok(response);
                }
                Err(err) => {
                    let message = err.to_string();
                    let Some(delay) = self.retry.after_transport_error(&message, attempt) else {
                        return Err(BridgeError::Transport(message));
                    };
                    tracing::debug!(
                        retry_attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %message,
                        "retrying upstream request after transport error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Human-readable message from an upstream error body, truncated.
pub(crate) fn sanitize_upstream_error(body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        let message = json
            .get("error")
            .and_then(|e| match e {
                serde_json::Value::String(s) => Some(s.as_str()),
                other => other.get("message").and_then(|m| m.as_str()),
            })
            .or_else(|| json.get("message").and_then(|m| m.as_str()));
        if let Some(message) = message {
            return truncate_on_char_boundary(message, UPSTREAM_ERROR_MAX_LEN);
        }
    }
    truncate_on_char_boundary(&String::from_utf8_lossy(body), UPSTREAM_ERROR_MAX_LEN)
}

fn truncate_on_char_boundary(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_prefers_error_message() {
        assert_eq!(
            sanitize_upstream_error(br#"{"error":{"message":"model not found","code":404}}"#),
            "model not found"
        );
        assert_eq!(sanitize_upstream_error(br#"{"error":"bad key"}"#), "bad key");
        assert_eq!(sanitize_upstream_error(br#"{"message":"busy"}"#), "busy");
        assert_eq!(sanitize_upstream_error(b"plain failure"), "plain failure");
    }

    #[test]
    fn sanitize_truncates_on_char_boundary() {
        let long = "é".repeat(400);
        let out = sanitize_upstream_error(long.as_bytes());
        assert!(out.ends_with("..."));
        assert!(out.len() <= UPSTREAM_ERROR_MAX_LEN + 3);
    }

    #[test]
    fn client_targets_chat_completions() {
        let mut upstream = UpstreamConfig::with_base_url("http://127.0.0.1:9/v1/");
        upstream.api_key = Some("sk-test".to_string());
        let client = UpstreamClient::new(&ServerConfig::default(), &upstream).unwrap();
        assert_eq!(client.url().as_str(), "http://127.0.0.1:9/v1/chat/completions");
        assert!(client.headers.get(AUTHORIZATION).unwrap().is_sensitive());
    }
}
