use msgbridge::adapter::{ContentAdapter, Segment};
use msgbridge::config::{MarkupMode, UpstreamConfig};
use msgbridge::protocol::anthropic::stream::parse_anthropic_sse;
use msgbridge::protocol::anthropic::{AnthropicContentBlock, AnthropicDelta, AnthropicStreamEvent};
use msgbridge::stream::blocks::BlockState;
use msgbridge::stream::{SseParser, StreamSession, TranslateError};
use serde_json::{json, Value};

fn upstream(markup: MarkupMode) -> UpstreamConfig {
    let mut config = UpstreamConfig::with_base_url("http://127.0.0.1:11434/v1");
    config.markup = markup;
    config
}

fn delta_chunk(delta: Value) -> String {
    json!({"choices": [{"index": 0, "delta": delta, "finish_reason": null}]}).to_string()
}

fn finish_chunk(reason: &str) -> String {
    json!({"choices": [{"index": 0, "delta": {}, "finish_reason": reason}]}).to_string()
}

fn tool_chunk(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> String {
    let mut call = json!({"index": index, "function": {"arguments": args}});
    if let Some(id) = id {
        call["id"] = json!(id);
        call["type"] = json!("function");
    }
    if let Some(name) = name {
        call["function"]["name"] = json!(name);
    }
    delta_chunk(json!({"tool_calls": [call]}))
}

/// Run a full session and return its raw output.
fn run(markup: MarkupMode, chunks: &[String]) -> String {
    let mut session = StreamSession::new(&upstream(markup));
    let mut out = session.start("msg_test", "claude-test", 10).unwrap();
    for chunk in chunks {
        out.push_str(&session.process_data(chunk).unwrap());
    }
    out.push_str(&session.finish().unwrap());
    out
}

fn decode(raw: &str) -> Vec<AnthropicStreamEvent> {
    let mut parser = SseParser::new();
    let frames = parser.feed(raw);
    assert!(parser.finish().is_none(), "trailing bytes after last frame");
    frames
        .into_iter()
        .map(|frame| {
            let name = frame.event.expect("every frame is named");
            parse_anthropic_sse(&name, &frame.data)
                .unwrap_or_else(|| panic!("undecodable {name} frame: {}", frame.data))
        })
        .collect()
}

/// Concatenated `text_delta` payloads.
fn answer_text(events: &[AnthropicStreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            AnthropicStreamEvent::ContentBlockDelta {
                delta: AnthropicDelta::TextDelta { text },
                ..
            } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Compact, comparable rendering of an event sequence.
fn summarize(events: &[AnthropicStreamEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| match event {
            AnthropicStreamEvent::MessageStart { .. } => "message_start".to_string(),
            AnthropicStreamEvent::Ping {} => "ping".to_string(),
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                AnthropicContentBlock::Text { .. } => format!("open(text,{index})"),
                AnthropicContentBlock::Thinking { .. } => format!("open(thinking,{index})"),
                AnthropicContentBlock::ToolUse { id, name, .. } => {
                    format!("open(tool_use:{id}:{name},{index})")
                }
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicDelta::TextDelta { text } => format!("text({text:?},{index})"),
                AnthropicDelta::ThinkingDelta { thinking } => {
                    format!("thinking({thinking:?},{index})")
                }
                AnthropicDelta::InputJsonDelta { partial_json } => {
                    format!("json({partial_json:?},{index})")
                }
            },
            AnthropicStreamEvent::ContentBlockStop { index } => format!("close({index})"),
            AnthropicStreamEvent::MessageDelta { delta, .. } => format!(
                "message_delta({})",
                delta.stop_reason.as_deref().unwrap_or("null")
            ),
            AnthropicStreamEvent::MessageStop {} => "message_stop".to_string(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Thinking,
    ToolUse,
}

/// Check the lifecycle properties every session output must satisfy.
fn assert_well_formed(events: &[AnthropicStreamEvent]) {
    assert!(
        matches!(events.first(), Some(AnthropicStreamEvent::MessageStart { .. })),
        "message_start must come first"
    );
    assert!(
        matches!(
            events.get(1),
            Some(AnthropicStreamEvent::ContentBlockStart {
                index: 0,
                content_block: AnthropicContentBlock::Text { .. }
            })
        ),
        "block 0 must be an empty text block opened before anything else"
    );
    assert!(
        matches!(events.get(2), Some(AnthropicStreamEvent::Ping {})),
        "ping must follow block 0"
    );
    let n = events.len();
    assert!(matches!(
        events[n - 2],
        AnthropicStreamEvent::MessageDelta { .. }
    ));
    assert!(matches!(events[n - 1], AnthropicStreamEvent::MessageStop {}));

    let mut open: Option<(usize, Kind)> = None;
    let mut next_index = 0usize;
    let mut closed = Vec::new();
    for event in &events[1..n - 2] {
        match event {
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                assert!(open.is_none(), "block {index} opened while {open:?} is open");
                assert_eq!(*index, next_index, "indices must be dense and increasing");
                next_index += 1;
                let kind = match content_block {
                    AnthropicContentBlock::Text { .. } => Kind::Text,
                    AnthropicContentBlock::Thinking { .. } => Kind::Thinking,
                    AnthropicContentBlock::ToolUse { .. } => Kind::ToolUse,
                };
                open = Some((*index, kind));
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                let kind = match delta {
                    AnthropicDelta::TextDelta { .. } => Kind::Text,
                    AnthropicDelta::ThinkingDelta { .. } => Kind::Thinking,
                    AnthropicDelta::InputJsonDelta { .. } => Kind::ToolUse,
                };
                assert_eq!(open, Some((*index, kind)), "delta does not match open block");
            }
            AnthropicStreamEvent::ContentBlockStop { index } => {
                assert_eq!(open.map(|(i, _)| i), Some(*index), "close of a block not open");
                closed.push(*index);
                open = None;
            }
            AnthropicStreamEvent::Ping {} => {}
            other => panic!("unexpected event inside the body: {other:?}"),
        }
    }
    assert!(open.is_none(), "block {open:?} left open");
    assert_eq!(closed, (0..next_index).collect::<Vec<_>>());
}

#[test]
fn scenario_content_only_stream() {
    let raw = run(
        MarkupMode::None,
        &[
            delta_chunk(json!({"content": "Hi"})),
            delta_chunk(json!({"content": " there"})),
        ],
    );
    let events = decode(&raw);
    assert_well_formed(&events);
    assert_eq!(
        summarize(&events),
        [
            "message_start",
            "open(text,0)",
            "ping",
            "text(\"Hi\",0)",
            "text(\" there\",0)",
            "close(0)",
            "message_delta(end_turn)",
            "message_stop",
        ]
    );
}

#[test]
fn scenario_reasoning_then_answer() {
    let raw = run(
        MarkupMode::None,
        &[
            delta_chunk(json!({"reasoning": "Let me think"})),
            delta_chunk(json!({"content": "Answer"})),
        ],
    );
    let events = decode(&raw);
    assert_well_formed(&events);
    assert_eq!(
        summarize(&events)[1..],
        [
            "open(text,0)",
            "ping",
            "close(0)",
            "open(thinking,1)",
            "thinking(\"Let me think\",1)",
            "close(1)",
            "open(text,2)",
            "text(\"Answer\",2)",
            "close(2)",
            "message_delta(end_turn)",
            "message_stop",
        ]
    );
}

#[test]
fn scenario_tag_extractor_split_across_fragments() {
    let mut adapter = ContentAdapter::from_config(&upstream(MarkupMode::Tags));
    let first = adapter.process("before <tool>{\"a\":1}");
    assert_eq!(first.cleaned_text, "before ");
    assert!(first.extracted_calls.is_empty());

    let second = adapter.process("</tool> after");
    assert_eq!(second.cleaned_text, " after");
    assert_eq!(second.extracted_calls.len(), 1);
    assert_eq!(second.extracted_calls[0].arguments, "{\"a\":1}");
    assert_eq!(second.extracted_calls[0].name, "tool");
    assert!(second.extracted_calls[0].id.starts_with("toolu_"));
    assert!(matches!(second.segments()[0], Segment::Call(_)));
    assert!(adapter.finish().is_empty());

    let raw = run(
        MarkupMode::Tags,
        &[
            delta_chunk(json!({"content": "before <tool>{\"a\":1}"})),
            delta_chunk(json!({"content": "</tool> after"})),
            finish_chunk("stop"),
        ],
    );
    let events = decode(&raw);
    assert_well_formed(&events);
    let summary = summarize(&events);
    assert_eq!(summary[3], "text(\"before \",0)");
    assert_eq!(summary[4], "close(0)");
    assert!(summary[5].starts_with("open(tool_use:toolu_"));
    assert!(summary[5].ends_with(":tool,1)"));
    assert_eq!(
        summary[6..],
        [
            "json(\"{\\\"a\\\":1}\",1)",
            "close(1)",
            "open(text,2)",
            "text(\" after\",2)",
            "close(2)",
            "message_delta(tool_use)",
            "message_stop",
        ]
    );
}

#[test]
fn scenario_stream_dropped_mid_thinking() {
    let mut session = StreamSession::new(&upstream(MarkupMode::None));
    let mut raw = session.start("msg_test", "claude-test", 10).unwrap();
    raw.push_str(
        &session
            .process_data(&delta_chunk(json!({"reasoning_content": "step one"})))
            .unwrap(),
    );
    raw.push_str(&session.fail(&TranslateError::UpstreamTransport(
        "connection reset".to_string(),
    )));
    let events = decode(&raw);
    assert_well_formed(&events);
    assert_eq!(
        summarize(&events)[3..],
        [
            "close(0)",
            "open(thinking,1)",
            "thinking(\"step one\",1)",
            "close(1)",
            "message_delta(end_turn)",
            "message_stop",
        ]
    );
    assert!(session.is_terminated());
}

#[test]
fn scenario_interleaved_tool_calls_are_grouped() {
    let raw = run(
        MarkupMode::None,
        &[
            tool_chunk(0, Some("call_A"), Some("alpha"), "{\"x\":"),
            tool_chunk(1, Some("call_B"), Some("beta"), "{\"y\":2}"),
            tool_chunk(0, None, None, "1}"),
            finish_chunk("tool_calls"),
        ],
    );
    let events = decode(&raw);
    assert_well_formed(&events);
    assert_eq!(
        summarize(&events)[3..],
        [
            "close(0)",
            "open(tool_use:call_A:alpha,1)",
            "json(\"{\\\"x\\\":\",1)",
            "json(\"1}\",1)",
            "close(1)",
            "open(tool_use:call_B:beta,2)",
            "json(\"{\\\"y\\\":2}\",2)",
            "close(2)",
            "message_delta(tool_use)",
            "message_stop",
        ]
    );
}

#[test]
fn markup_free_text_is_not_transformed() {
    let mut adapter = ContentAdapter::from_config(&upstream(MarkupMode::Tags));
    for fragment in ["plain text", " with a < sign", " and more"] {
        let out = adapter.process(fragment);
        assert!(!out.was_transformed);
        assert_eq!(out.cleaned_text, fragment);
        assert!(out.extracted_calls.is_empty());
    }
    let mut passthrough = ContentAdapter::from_config(&upstream(MarkupMode::None));
    let out = passthrough.process("plain <tool>{}</tool>");
    assert!(!out.was_transformed);
    assert_eq!(out.cleaned_text, "plain <tool>{}</tool>");
}

#[test]
fn empty_payloads_never_transition() {
    let raw = run(
        MarkupMode::None,
        &[
            delta_chunk(json!({"content": ""})),
            delta_chunk(json!({"reasoning_content": ""})),
            delta_chunk(json!({})),
            delta_chunk(json!({"content": "ok"})),
        ],
    );
    let events = decode(&raw);
    assert_well_formed(&events);
    let starts = events
        .iter()
        .filter(|e| matches!(e, AnthropicStreamEvent::ContentBlockStart { .. }))
        .count();
    assert_eq!(starts, 1);
}

#[test]
fn truncation_at_any_point_leaves_no_open_block() {
    let chunks = [
        delta_chunk(json!({"reasoning": "plan"})),
        delta_chunk(json!({"content": "Calling <tool_call>{\"name\":\"f\","})),
        delta_chunk(json!({"content": "\"arguments\":{\"k\":1}}</tool_call>"})),
        tool_chunk(0, Some("call_1"), Some("g"), "{\"a\""),
        tool_chunk(1, Some("call_2"), Some("h"), "{}"),
        tool_chunk(0, None, None, ":true}"),
        delta_chunk(json!({"content": "done"})),
        finish_chunk("stop"),
    ];
    // Answer text expected downstream when the stream drops after `cut`
    // chunks; held markup comes out as text.
    let expected_text = |cut: usize| match cut {
        0 | 1 => "",
        2 => "Calling <tool_call>{\"name\":\"f\",",
        3..=6 => "Calling ",
        _ => "Calling done",
    };
    for cut in 0..=chunks.len() {
        let mut session = StreamSession::new(&upstream(MarkupMode::Tags));
        let mut raw = session.start("msg_test", "claude-test", 10).unwrap();
        for chunk in &chunks[..cut] {
            raw.push_str(&session.process_data(chunk).unwrap());
        }
        raw.push_str(&session.fail(&TranslateError::UpstreamTransport(
            "dropped".to_string(),
        )));
        assert_eq!(session.block_state(), &BlockState::NoBlockOpen);
        assert!(session.is_terminated());
        let events = decode(&raw);
        assert_well_formed(&events);
        assert_eq!(answer_text(&events), expected_text(cut), "cut after {cut} chunks");
    }

    let events = decode(&run(MarkupMode::Tags, &chunks));
    assert_well_formed(&events);
    let tool_names: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            AnthropicStreamEvent::ContentBlockStart {
                content_block: AnthropicContentBlock::ToolUse { name, .. },
                ..
            } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(tool_names, ["f", "g", "h"]);
}

#[test]
fn distinct_ids_on_one_upstream_index_get_separate_blocks() {
    let chunks = [
        tool_chunk(0, Some("A"), Some("fa"), "{\"a\":1}"),
        tool_chunk(0, Some("B"), Some("fb"), "{\"b\":2}"),
        finish_chunk("tool_calls"),
    ];
    let events = decode(&run(MarkupMode::None, &chunks));
    assert_well_formed(&events);
    assert_eq!(
        summarize(&events),
        [
            "message_start",
            "open(text,0)",
            "ping",
            "close(0)",
            "open(tool_use:A:fa,1)",
            "json(\"{\\\"a\\\":1}\",1)",
            "close(1)",
            "open(tool_use:B:fb,2)",
            "json(\"{\\\"b\\\":2}\",2)",
            "close(2)",
            "message_delta(tool_use)",
            "message_stop",
        ]
    );
}

#[test]
fn unterminated_tag_is_flushed_as_text_at_end() {
    let raw = run(
        MarkupMode::Tags,
        &[delta_chunk(json!({"content": "see <tool_call>{\"name\":"}))],
    );
    let events = decode(&raw);
    assert_well_formed(&events);
    let text: String = events
        .iter()
        .filter_map(|e| match e {
            AnthropicStreamEvent::ContentBlockDelta {
                delta: AnthropicDelta::TextDelta { text },
                ..
            } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "see <tool_call>{\"name\":");
}

#[test]
fn upstream_usage_reaches_message_delta() {
    let raw = run(
        MarkupMode::None,
        &[
            delta_chunk(json!({"content": "hello"})),
            json!({"choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 34}})
                .to_string(),
        ],
    );
    let events = decode(&raw);
    match &events[events.len() - 2] {
        AnthropicStreamEvent::MessageDelta { usage, .. } => assert_eq!(usage.output_tokens, 34),
        other => panic!("unexpected: {other:?}"),
    }
    match &events[0] {
        AnthropicStreamEvent::MessageStart { message } => {
            assert_eq!(message.id, "msg_test");
            assert_eq!(message.model, "claude-test");
            assert_eq!(message.usage.input_tokens, 10);
        }
        other => panic!("unexpected: {other:?}"),
    }
}
