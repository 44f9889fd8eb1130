use crate::protocol::anthropic::AnthropicStreamEvent;
use crate::util::{push_json_string_escaped, push_u64_decimal, push_usize_decimal};

pub const PING_JSON: &str = "{\"type\":\"ping\"}";
pub const MESSAGE_STOP_JSON: &str = "{\"type\":\"message_stop\"}";

/// `content_block` payload of a `content_block_start` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStart<'a> {
    Text,
    Thinking,
    ToolUse { id: &'a str, name: &'a str },
}

/// `delta` payload of a `content_block_delta` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDelta<'a> {
    Text(&'a str),
    Thinking(&'a str),
    InputJson(&'a str),
}

/// Parse a named Messages SSE event into a typed stream event.
///
/// The `event_type` is the value after "event:", and `data` is the JSON payload.
#[must_use]
pub fn parse_anthropic_sse(event_type: &str, data: &str) -> Option<AnthropicStreamEvent> {
    match event_type {
        "message_start"
        | "content_block_start"
        | "content_block_delta"
        | "content_block_stop"
        | "message_delta"
        | "message_stop"
        | "ping" => serde_json::from_str(data).ok(),
        _ => None,
    }
}

/// Write the `message_start` payload.
pub fn push_message_start_json(out: &mut String, id: &str, model: &str, input_tokens: u64) {
    out.reserve(176 + id.len() + model.len());
    out.push_str("{\"type\":\"message_start\",\"message\":{\"id\":");
    push_json_string_escaped(out, id);
    out.push_str(",\"type\":\"message\",\"role\":\"assistant\",\"model\":");
    push_json_string_escaped(out, model);
    out.push_str(
        ",\"content\":[],\"stop_reason\":null,\"stop_sequence\":null,\"usage\":{\"input_tokens\":",
    );
    push_u64_decimal(out, input_tokens);
    out.push_str(",\"output_tokens\":0}}}");
}

/// Write a `content_block_start` payload.
pub fn push_content_block_start_json(out: &mut String, index: usize, block: BlockStart<'_>) {
    out.push_str("{\"type\":\"content_block_start\",\"index\":");
    push_usize_decimal(out, index);
    match block {
        BlockStart::Text => {
            out.push_str(",\"content_block\":{\"type\":\"text\",\"text\":\"\"}}");
        }
        BlockStart::Thinking => {
            out.push_str(
                ",\"content_block\":{\"type\":\"thinking\",\"thinking\":\"\",\"signature\":\"\"}}",
            );
        }
        BlockStart::ToolUse { id, name } => {
            out.reserve(48 + id.len() + name.len());
            out.push_str(",\"content_block\":{\"type\":\"tool_use\",\"id\":");
            push_json_string_escaped(out, id);
            out.push_str(",\"name\":");
            push_json_string_escaped(out, name);
            out.push_str(",\"input\":{}}}");
        }
    }
}

/// Write a `content_block_delta` payload.
pub fn push_content_block_delta_json(out: &mut String, index: usize, delta: BlockDelta<'_>) {
    out.push_str("{\"type\":\"content_block_delta\",\"index\":");
    push_usize_decimal(out, index);
    match delta {
        BlockDelta::Text(text) => {
            out.reserve(32 + text.len());
            out.push_str(",\"delta\":{\"type\":\"text_delta\",\"text\":");
            push_json_string_escaped(out, text);
        }
        BlockDelta::Thinking(thinking) => {
            out.reserve(40 + thinking.len());
            out.push_str(",\"delta\":{\"type\":\"thinking_delta\",\"thinking\":");
            push_json_string_escaped(out, thinking);
        }
        BlockDelta::InputJson(partial_json) => {
            out.reserve(48 + partial_json.len());
            out.push_str(",\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":");
            push_json_string_escaped(out, partial_json);
        }
    }
    out.push_str("}}");
}

/// Write a `content_block_stop` payload.
pub fn push_content_block_stop_json(out: &mut String, index: usize) {
    out.push_str("{\"type\":\"content_block_stop\",\"index\":");
    push_usize_decimal(out, index);
    out.push('}');
}

/// Write the terminal `message_delta` payload.
pub fn push_message_delta_json(out: &mut String, stop_reason: &str, output_tokens: u64) {
    out.push_str("{\"type\":\"message_delta\",\"delta\":{\"stop_reason\":");
    push_json_string_escaped(out, stop_reason);
    out.push_str(",\"stop_sequence\":null},\"usage\":{\"output_tokens\":");
    push_u64_decimal(out, output_tokens);
    out.push_str("}}");
}
