use tracing::warn;

use super::anthropic::{
    AnthropicContentBlock, AnthropicMessage, AnthropicTool, AnthropicUsage, MessagesRequest,
    MessagesResponse,
};
use super::openai_chat::{
    OpenAiChatRequest, OpenAiChatResponse, OpenAiMessage, OpenAiStreamOptions, OpenAiTool,
    OpenAiToolCall, OpenAiToolCallFunction, OpenAiToolChoice, OpenAiToolChoiceFunction,
    OpenAiToolChoiceFunctionCall, OpenAiToolFunction,
};
use crate::adapter::{ContentAdapter, Segment};
use crate::error::BridgeError;
use crate::observability::token_counter::{estimate_tokens_for_len, merge_usage};
use crate::util::next_message_id;

// ---------------------------------------------------------------------------
// Stop reason mappings
// ---------------------------------------------------------------------------

/// Map a chat-completions `finish_reason` to a Messages `stop_reason`.
#[must_use]
pub fn openai_finish_to_anthropic_stop(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        // The Messages API has no content_filter reason.
        _ => "end_turn",
    }
}

/// Final `stop_reason` for a response.
///
/// Backends that emit tool calls as markup still report `stop`; any emitted
/// `tool_use` block turns that into `tool_use`.
#[must_use]
pub fn resolve_stop_reason(finish_reason: Option<&str>, emitted_tool_use: bool) -> &'static str {
    let mapped = finish_reason.map_or("end_turn", openai_finish_to_anthropic_stop);
    if emitted_tool_use && mapped == "end_turn" {
        "tool_use"
    } else {
        mapped
    }
}

// ---------------------------------------------------------------------------
// Request mapping
// ---------------------------------------------------------------------------

/// Knobs applied while mapping a Messages request upstream.
#[derive(Debug, Clone, Copy)]
pub struct RequestMapping<'a> {
    /// Replaces the client's model name when set.
    pub model_override: Option<&'a str>,
    pub default_max_tokens: u64,
}

/// Convert a Messages request into a chat-completions request.
///
/// # Errors
///
/// Returns [`BridgeError::InvalidRequest`] for an empty message list or an
/// unknown message role.
pub fn anthropic_to_openai_request(
    request: MessagesRequest,
    mapping: RequestMapping<'_>,
) -> Result<OpenAiChatRequest, BridgeError> {
    let MessagesRequest {
        model,
        max_tokens,
        system,
        messages: wire_messages,
        tools,
        tool_choice,
        stream,
        temperature,
        top_p,
        stop_sequences,
        extra: _,
    } = request;

    if wire_messages.is_empty() {
        return Err(BridgeError::InvalidRequest(
            "messages must contain at least one message".to_string(),
        ));
    }

    let mut messages = Vec::with_capacity(wire_messages.len() + 1);
    if let Some(system) = system.and_then(system_prompt_text) {
        messages.push(OpenAiMessage {
            role: "system".to_string(),
            content: Some(serde_json::Value::String(system)),
            tool_calls: None,
            tool_call_id: None,
        });
    }
    for message in wire_messages {
        map_message(message, &mut messages)?;
    }

    let tools = tools
        .filter(|t| !t.is_empty())
        .map(|t| t.into_iter().map(map_tool).collect::<Vec<_>>());
    let tool_choice = if tools.is_some() {
        tool_choice.as_ref().and_then(map_tool_choice)
    } else {
        None
    };

    let stream = stream.unwrap_or(false);
    Ok(OpenAiChatRequest {
        model: mapping.model_override.map_or(model, str::to_string),
        messages,
        tools,
        tool_choice,
        stream: Some(stream),
        stream_options: stream.then_some(OpenAiStreamOptions {
            include_usage: Some(true),
        }),
        temperature,
        max_tokens: Some(max_tokens.unwrap_or(mapping.default_max_tokens)),
        top_p,
        stop: stop_sequences.filter(|s| !s.is_empty()),
    })
}

fn system_prompt_text(system: serde_json::Value) -> Option<String> {
    match system {
        serde_json::Value::String(s) => (!s.is_empty()).then_some(s),
        serde_json::Value::Array(blocks) => {
            let texts: Vec<String> = blocks
                .into_iter()
                .filter_map(|block| match block {
                    serde_json::Value::Object(mut obj)
                        if obj.get("type").and_then(|t| t.as_str()) == Some("text") =>
                    {
                        match obj.remove("text") {
                            Some(serde_json::Value::String(text)) => Some(text),
                            _ => None,
                        }
                    }
                    _ => None,
                })
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
        _ => None,
    }
}

fn map_message(message: AnthropicMessage, out: &mut Vec<OpenAiMessage>) -> Result<(), BridgeError> {
    let AnthropicMessage { role, content } = message;
    match role.as_str() {
        "user" | "assistant" => {}
        other => {
            return Err(BridgeError::InvalidRequest(format!(
                "unsupported message role '{other}'"
            )));
        }
    }

    let blocks = match content {
        serde_json::Value::String(text) => {
            out.push(OpenAiMessage {
                role,
                content: Some(serde_json::Value::String(text)),
                tool_calls: None,
                tool_call_id: None,
            });
            return Ok(());
        }
        serde_json::Value::Array(blocks) => blocks,
        serde_json::Value::Null => Vec::new(),
        other => {
            return Err(BridgeError::InvalidRequest(format!(
                "message content must be a string or an array, got {other}"
            )));
        }
    };

    let mut texts: Vec<String> = Vec::new();
    let mut images: Vec<serde_json::Value> = Vec::new();
    let mut tool_calls: Vec<OpenAiToolCall> = Vec::new();

    for block in blocks {
        let serde_json::Value::Object(mut obj) = block else {
            continue;
        };
        let block_type = obj
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("text")
            .to_string();
        match block_type.as_str() {
            "text" => {
                if let Some(serde_json::Value::String(text)) = obj.remove("text") {
                    texts.push(text);
                }
            }
            "image" => {
                if let Some(part) = obj.remove("source").and_then(image_part) {
                    images.push(part);
                }
            }
            "tool_use" => {
                let id = take_string(&mut obj, "id");
                let name = take_string(&mut obj, "name");
                let input = obj
                    .remove("input")
                    .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
                tool_calls.push(OpenAiToolCall {
                    id,
                    type_: "function".to_string(),
                    function: OpenAiToolCallFunction {
                        name,
                        arguments: input.to_string(),
                    },
                });
            }
            "tool_result" => {
                let tool_use_id = take_string(&mut obj, "tool_use_id");
                let content = obj
                    .remove("content")
                    .map(tool_result_text)
                    .unwrap_or_default();
                out.push(OpenAiMessage {
                    role: "tool".to_string(),
                    content: Some(serde_json::Value::String(content)),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id),
                });
            }
            // Thinking blocks are replayed by the client but not sent upstream.
            _ => {}
        }
    }

    let content = if images.is_empty() {
        (!texts.is_empty()).then(|| serde_json::Value::String(texts.join("\n")))
    } else {
        let mut parts: Vec<serde_json::Value> = texts
            .into_iter()
            .map(|text| serde_json::json!({"type": "text", "text": text}))
            .collect();
        parts.extend(images);
        Some(serde_json::Value::Array(parts))
    };

    if content.is_some() || !tool_calls.is_empty() {
        out.push(OpenAiMessage {
            role,
            content,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        });
    }
    Ok(())
}

fn take_string(obj: &mut serde_json::Map<String, serde_json::Value>, key: &str) -> String {
    match obj.remove(key) {
        Some(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

fn image_part(source: serde_json::Value) -> Option<serde_json::Value> {
    let url = match source.get("type").and_then(|t| t.as_str())? {
        "base64" => {
            let media_type = source.get("media_type").and_then(|t| t.as_str())?;
            let data = source.get("data").and_then(|t| t.as_str())?;
            format!("data:{media_type};base64,{data}")
        }
        "url" => source.get("url").and_then(|u| u.as_str())?.to_string(),
        _ => return None,
    };
    Some(serde_json::json!({"type": "image_url", "image_url": {"url": url}}))
}

fn tool_result_text(content: serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s,
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::Object(mut obj)
                    if obj.get("type").and_then(|t| t.as_str()) == Some("text") =>
                {
                    match obj.remove("text") {
                        Some(serde_json::Value::String(text)) => Some(text),
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn map_tool(tool: AnthropicTool) -> OpenAiTool {
    OpenAiTool {
        type_: "function".to_string(),
        function: OpenAiToolFunction {
            name: tool.name,
            description: tool.description,
            parameters: Some(tool.input_schema),
        },
    }
}

fn map_tool_choice(choice: &serde_json::Value) -> Option<OpenAiToolChoice> {
    match choice.get("type").and_then(|t| t.as_str())? {
        "auto" => Some(OpenAiToolChoice::Mode("auto".to_string())),
        "any" => Some(OpenAiToolChoice::Mode("required".to_string())),
        "none" => Some(OpenAiToolChoice::Mode("none".to_string())),
        "tool" => {
            let name = choice.get("name").and_then(|n| n.as_str())?;
            Some(OpenAiToolChoice::Function(OpenAiToolChoiceFunctionCall {
                type_: "function".to_string(),
                function: OpenAiToolChoiceFunction {
                    name: name.to_string(),
                },
            }))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Response mapping
// ---------------------------------------------------------------------------

/// Convert a non-streaming chat-completions response into a Messages response.
///
/// Answer text runs through `adapter` so inline tool markup is extracted the
/// same way as on the streaming path.
#[must_use]
pub fn openai_response_to_anthropic(
    response: OpenAiChatResponse,
    model: &str,
    adapter: &mut ContentAdapter,
    estimated_input_tokens: u64,
) -> MessagesResponse {
    let upstream_usage = response.usage.map(|u| AnthropicUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    let mut content = Vec::new();
    let mut emitted_bytes = 0usize;
    let mut finish_reason = None;

    if let Some(choice) = response.choices.into_iter().next() {
        finish_reason = choice.finish_reason;
        let message = choice.message;

        if let Some(reasoning) = message.reasoning.filter(|r| !r.is_empty()) {
            emitted_bytes += reasoning.len();
            content.push(AnthropicContentBlock::Thinking {
                thinking: reasoning,
                signature: String::new(),
            });
        }

        if let Some(text) = message.content.filter(|t| !t.is_empty()) {
            let processed = adapter.process(&text);
            let flushed = adapter.finish();
            for output in [&processed, &flushed] {
                for segment in output.segments() {
                    match segment {
                        Segment::Text(text) => {
                            emitted_bytes += text.len();
                            push_text(&mut content, text);
                        }
                        Segment::Call(call) => {
                            emitted_bytes += call.arguments.len();
                            content.push(AnthropicContentBlock::ToolUse {
                                id: call.id.clone(),
                                name: call.name.clone(),
                                input: parse_tool_input(&call.name, &call.arguments),
                            });
                        }
                    }
                }
            }
        }

        for call in message.tool_calls.into_iter().flatten() {
            emitted_bytes += call.function.arguments.len();
            let input = parse_tool_input(&call.function.name, &call.function.arguments);
            content.push(AnthropicContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }
    }

    let emitted_tool_use = content
        .iter()
        .any(|b| matches!(b, AnthropicContentBlock::ToolUse { .. }));
    if content.is_empty() {
        content.push(AnthropicContentBlock::Text {
            text: String::new(),
        });
    }

    let estimated_output = estimate_tokens_for_len(emitted_bytes);
    MessagesResponse {
        id: next_message_id(),
        type_: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content,
        stop_reason: Some(
            resolve_stop_reason(finish_reason.as_deref(), emitted_tool_use).to_string(),
        ),
        stop_sequence: None,
        usage: merge_usage(
            upstream_usage.as_ref(),
            estimated_input_tokens,
            estimated_output,
        ),
    }
}

/// Append text, merging with a directly preceding text block.
fn push_text(content: &mut Vec<AnthropicContentBlock>, text: &str) {
    if let Some(AnthropicContentBlock::Text { text: last }) = content.last_mut() {
        last.push_str(text);
        return;
    }
    content.push(AnthropicContentBlock::Text {
        text: text.to_string(),
    });
}

fn parse_tool_input(name: &str, arguments: &str) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str::<serde_json::Value>(arguments) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        Ok(other) => serde_json::json!({ "value": other }),
        Err(err) => {
            warn!(tool = name, error = %err, "tool arguments are not valid JSON");
            serde_json::json!({ "raw_arguments": arguments })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MarkupMode, UpstreamConfig};

    fn request(value: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    fn mapping() -> RequestMapping<'static> {
        RequestMapping {
            model_override: None,
            default_max_tokens: 4096,
        }
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(openai_finish_to_anthropic_stop("stop"), "end_turn");
        assert_eq!(openai_finish_to_anthropic_stop("length"), "max_tokens");
        assert_eq!(openai_finish_to_anthropic_stop("tool_calls"), "tool_use");
        assert_eq!(openai_finish_to_anthropic_stop("function_call"), "tool_use");
        assert_eq!(openai_finish_to_anthropic_stop("content_filter"), "end_turn");
    }

    #[test]
    fn test_resolve_stop_reason_upgrades_stop_with_tools() {
        assert_eq!(resolve_stop_reason(Some("stop"), true), "tool_use");
        assert_eq!(resolve_stop_reason(None, true), "tool_use");
        assert_eq!(resolve_stop_reason(Some("length"), true), "max_tokens");
        assert_eq!(resolve_stop_reason(None, false), "end_turn");
    }

    #[test]
    fn test_basic_request_mapping() {
        let req = request(serde_json::json!({
            "model": "claude-x",
            "max_tokens": 256,
            "system": [{"type": "text", "text": "Be brief."}],
            "messages": [{"role": "user", "content": "Hello"}],
            "stream": true,
            "temperature": 0.2,
            "stop_sequences": ["END"]
        }));
        let out = anthropic_to_openai_request(req, mapping()).unwrap();
        assert_eq!(out.model, "claude-x");
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0].role, "system");
        assert_eq!(out.messages[0].content, Some(serde_json::json!("Be brief.")));
        assert_eq!(out.messages[1].content, Some(serde_json::json!("Hello")));
        assert_eq!(out.max_tokens, Some(256));
        assert_eq!(out.stream, Some(true));
        assert_eq!(
            out.stream_options.and_then(|o| o.include_usage),
            Some(true)
        );
        assert_eq!(out.stop, Some(vec!["END".to_string()]));
    }

    #[test]
    fn test_model_override_and_default_max_tokens() {
        let req = request(serde_json::json!({
            "model": "claude-x",
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        let out = anthropic_to_openai_request(
            req,
            RequestMapping {
                model_override: Some("qwen3"),
                default_max_tokens: 1024,
            },
        )
        .unwrap();
        assert_eq!(out.model, "qwen3");
        assert_eq!(out.max_tokens, Some(1024));
        assert_eq!(out.stream, Some(false));
        assert!(out.stream_options.is_none());
    }

    #[test]
    fn test_tool_round_trip_history() {
        let req = request(serde_json::json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "call it", "signature": ""},
                    {"type": "text", "text": "Checking."},
                    {"type": "tool_use", "id": "toolu_1", "name": "weather", "input": {"city": "Oslo"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "5C"}]},
                    {"type": "text", "text": "thanks"}
                ]}
            ],
            "tools": [{"name": "weather", "description": "w", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "tool", "name": "weather"}
        }));
        let out = anthropic_to_openai_request(req, mapping()).unwrap();
        let roles: Vec<_> = out.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant", "tool", "user"]);

        let assistant = &out.messages[1];
        assert_eq!(assistant.content, Some(serde_json::json!("Checking.")));
        let call = &assistant.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "toolu_1");
        assert_eq!(call.function.arguments, "{\"city\":\"Oslo\"}");

        assert_eq!(out.messages[2].tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(out.messages[2].content, Some(serde_json::json!("5C")));

        let tools = out.tools.unwrap();
        assert_eq!(tools[0].function.name, "weather");
        assert_eq!(
            out.tool_choice,
            Some(OpenAiToolChoice::Function(OpenAiToolChoiceFunctionCall {
                type_: "function".to_string(),
                function: OpenAiToolChoiceFunction {
                    name: "weather".to_string()
                },
            }))
        );
    }

    #[test]
    fn test_tool_choice_any_maps_to_required() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{"name": "t"}],
            "tool_choice": {"type": "any"}
        }));
        let out = anthropic_to_openai_request(req, mapping()).unwrap();
        assert_eq!(
            out.tool_choice,
            Some(OpenAiToolChoice::Mode("required".to_string()))
        );
    }

    #[test]
    fn test_image_block_becomes_content_part() {
        let req = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}}
            ]}]
        }));
        let out = anthropic_to_openai_request(req, mapping()).unwrap();
        let parts = out.messages[0].content.as_ref().unwrap().as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_invalid_requests() {
        let empty = request(serde_json::json!({"model": "m", "messages": []}));
        assert!(matches!(
            anthropic_to_openai_request(empty, mapping()),
            Err(BridgeError::InvalidRequest(_))
        ));
        let bad_role = request(serde_json::json!({
            "model": "m",
            "messages": [{"role": "system", "content": "x"}]
        }));
        assert!(matches!(
            anthropic_to_openai_request(bad_role, mapping()),
            Err(BridgeError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_response_mapping_with_reasoning_and_tool_calls() {
        let response: OpenAiChatResponse = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-1",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "reasoning_content": "thinking...",
                    "content": "Sure.",
                    "tool_calls": [{"id": "call_1", "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"q\":1}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 11, "completion_tokens": 7}
        }))
        .unwrap();
        let mut adapter = ContentAdapter::Passthrough;
        let out = openai_response_to_anthropic(response, "claude-x", &mut adapter, 99);
        assert_eq!(out.model, "claude-x");
        assert!(out.id.starts_with("msg_"));
        assert_eq!(out.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(out.usage.input_tokens, 11);
        assert_eq!(out.usage.output_tokens, 7);
        assert_eq!(out.content.len(), 3);
        assert!(matches!(&out.content[0], AnthropicContentBlock::Thinking { thinking, .. } if thinking == "thinking..."));
        assert!(matches!(&out.content[1], AnthropicContentBlock::Text { text } if text == "Sure."));
        match &out.content[2] {
            AnthropicContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "lookup");
                assert_eq!(input, &serde_json::json!({"q": 1}));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn test_response_mapping_extracts_markup() {
        let response: OpenAiChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{
                "message": {"content": "Let me check.<tool_call>{\"name\":\"w\",\"arguments\":{\"c\":\"x\"}}</tool_call>"},
                "finish_reason": "stop"
            }]
        }))
        .unwrap();
        let mut upstream = UpstreamConfig::with_base_url("http://localhost/v1");
        upstream.markup = MarkupMode::Tags;
        let mut adapter = ContentAdapter::from_config(&upstream);
        let out = openai_response_to_anthropic(response, "m", &mut adapter, 5);
        assert_eq!(out.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(out.usage.input_tokens, 5);
        assert!(out.usage.output_tokens > 0);
        assert!(matches!(&out.content[0], AnthropicContentBlock::Text { text } if text == "Let me check."));
        assert!(matches!(&out.content[1], AnthropicContentBlock::ToolUse { name, .. } if name == "w"));
    }

    #[test]
    fn test_empty_response_has_one_text_block() {
        let response: OpenAiChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": null}, "finish_reason": "stop"}]
        }))
        .unwrap();
        let mut adapter = ContentAdapter::Passthrough;
        let out = openai_response_to_anthropic(response, "m", &mut adapter, 0);
        assert_eq!(
            out.content,
            vec![AnthropicContentBlock::Text {
                text: String::new()
            }]
        );
        assert_eq!(out.stop_reason.as_deref(), Some("end_turn"));
    }
}
