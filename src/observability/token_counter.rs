use crate::protocol::anthropic::{AnthropicUsage, MessagesRequest};
use std::time::Duration;
use tracing::info;

/// Estimate the number of tokens in `text`.
///
/// Uses a lightweight heuristic (`bytes / 4`) to avoid loading model BPE tables.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    estimate_tokens_for_len(text.len())
}

/// Same heuristic for a byte count already tallied by the caller.
#[inline]
#[must_use]
pub fn estimate_tokens_for_len(len: usize) -> u64 {
    (len as u64).div_ceil(4)
}

/// Estimate the input tokens of a Messages request.
///
/// Sums the system prompt, every message's content and the serialized tool
/// definitions. Used for `message_start`, which is sent before the upstream
/// reports real usage.
#[must_use]
pub fn estimate_request_tokens(request: &MessagesRequest) -> u64 {
    let mut total: u64 = 0;

    if let Some(system) = request.system.as_ref() {
        total += estimate_json_tokens(system);
    }

    for msg in &request.messages {
        total += estimate_json_tokens(&msg.content);
    }

    for tool in request.tools.iter().flatten() {
        total += estimate_tokens(&tool.name);
        if let Some(desc) = tool.description.as_deref() {
            total += estimate_tokens(desc);
        }
        if let Ok(serialized) = serde_json::to_string(&tool.input_schema) {
            total += estimate_tokens(&serialized);
        }
    }

    total
}

fn estimate_json_tokens(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::String(s) => estimate_tokens(s),
        serde_json::Value::Array(items) => items.iter().map(estimate_json_tokens).sum(),
        serde_json::Value::Object(map) => map
            .iter()
            .filter(|(key, _)| key.as_str() != "type")
            .map(|(_, v)| estimate_json_tokens(v))
            .sum(),
        _ => 0,
    }
}

/// Merge upstream-reported usage with local estimates.
///
/// Non-zero upstream values always win; zero or missing fields fall back to
/// the estimate.
#[must_use]
pub fn merge_usage(
    upstream: Option<&AnthropicUsage>,
    estimated_input: u64,
    estimated_output: u64,
) -> AnthropicUsage {
    let (input, output) = upstream.map_or((0, 0), |u| (u.input_tokens, u.output_tokens));
    AnthropicUsage {
        input_tokens: if input > 0 { input } else { estimated_input },
        output_tokens: if output > 0 { output } else { estimated_output },
    }
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_usage(model: &str, usage: &AnthropicUsage, duration: Duration) {
    info!(
        model = model,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}
