use super::OpenAiStreamChunk;

/// Sentinel payload that terminates a chat-completions stream.
pub const DONE_PAYLOAD: &str = "[DONE]";

/// Decode the `data` field of one SSE event.
///
/// `Ok(None)` means the event carries nothing to translate (blank payload or
/// the `[DONE]` sentinel).
pub fn decode_openai_stream_data(data: &str) -> Result<Option<OpenAiStreamChunk>, serde_json::Error> {
    let data = data.trim();
    if data.is_empty() || is_done_payload(data) {
        return Ok(None);
    }
    serde_json::from_str(data).map(Some)
}

#[inline]
#[must_use]
pub fn is_done_payload(data: &str) -> bool {
    data.trim() == DONE_PAYLOAD
}

/// Best-effort human-readable message from an in-band `error` object.
#[must_use]
pub fn upstream_error_message(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string),
        other => other.to_string(),
    }
}
