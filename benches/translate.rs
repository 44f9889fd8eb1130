use criterion::{black_box, criterion_group, criterion_main, Criterion};
use msgbridge::adapter::ContentAdapter;
use msgbridge::config::{MarkupMode, UpstreamConfig};
use msgbridge::protocol::anthropic::MessagesRequest;
use msgbridge::protocol::mapping::{anthropic_to_openai_request, RequestMapping};
use msgbridge::stream::{SseParser, StreamSession};

fn upstream(markup: MarkupMode) -> UpstreamConfig {
    let mut config = UpstreamConfig::with_base_url("http://127.0.0.1:11434/v1");
    config.markup = markup;
    config
}

fn content_chunk(text: &str) -> String {
    serde_json::json!({
        "id": "chatcmpl-bench",
        "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]
    })
    .to_string()
}

/// A typical answer: some reasoning, a few hundred short content deltas.
fn sample_stream(markup_call: bool) -> Vec<String> {
    let mut chunks = Vec::with_capacity(260);
    for _ in 0..40 {
        chunks.push(
            serde_json::json!({"choices": [{"index": 0, "delta": {"reasoning_content": "thinking "}}]})
                .to_string(),
        );
    }
    for i in 0..200 {
        chunks.push(content_chunk(&format!("token{i} ")));
    }
    if markup_call {
        chunks.push(content_chunk("<tool_call>{\"name\":\"get_weather\","));
        chunks.push(content_chunk("\"arguments\":{\"city\":\"Oslo\"}}</tool_call>"));
    }
    chunks
}

fn run_session(markup: MarkupMode, chunks: &[String]) -> usize {
    let mut session = StreamSession::new(&upstream(markup));
    let mut bytes = session
        .start("msg_bench", "claude-bench", 100)
        .map_or(0, |s| s.len());
    for chunk in chunks {
        bytes += session.process_data(chunk).map_or(0, |s| s.len());
    }
    bytes + session.finish().map_or(0, |s| s.len())
}

fn bench_session(c: &mut Criterion) {
    let plain = sample_stream(false);
    let with_markup = sample_stream(true);

    c.bench_function("session_passthrough_240_chunks", |b| {
        b.iter(|| black_box(run_session(MarkupMode::None, black_box(&plain))));
    });

    c.bench_function("session_tag_extractor_242_chunks", |b| {
        b.iter(|| black_box(run_session(MarkupMode::Tags, black_box(&with_markup))));
    });
}

fn bench_adapter(c: &mut Criterion) {
    let fragments: Vec<String> = (0..256)
        .map(|i| {
            if i % 32 == 0 {
                format!("a < b and <tool_call>{{\"name\":\"f{i}\",\"arguments\":{{}}}}</tool_call>")
            } else {
                format!("plain fragment {i} ")
            }
        })
        .collect();

    c.bench_function("tag_extractor_256_fragments", |b| {
        b.iter(|| {
            let mut adapter = ContentAdapter::from_config(&upstream(MarkupMode::Tags));
            let mut calls = 0;
            for fragment in &fragments {
                calls += adapter.process(black_box(fragment)).extracted_calls.len();
            }
            black_box(calls)
        });
    });
}

fn bench_sse_parser(c: &mut Criterion) {
    let raw: String = sample_stream(true)
        .iter()
        .map(|chunk| format!("data: {chunk}\n\n"))
        .collect();

    c.bench_function("sse_parser_split_64b", |b| {
        b.iter(|| {
            let mut parser = SseParser::new();
            let mut events = Vec::with_capacity(8);
            let mut count = 0;
            for piece in raw.as_bytes().chunks(64) {
                // Chunks are ASCII, so any split is a char boundary.
                parser.feed_into(std::str::from_utf8(piece).unwrap_or_default(), &mut events);
                count += events.len();
                events.clear();
            }
            black_box(count)
        });
    });
}

fn bench_request_mapping(c: &mut Criterion) {
    let request: MessagesRequest = serde_json::from_value(serde_json::json!({
        "model": "claude-bench",
        "max_tokens": 1024,
        "system": "You are a helpful assistant",
        "messages": (0..50).map(|i| serde_json::json!({
            "role": if i % 2 == 0 { "user" } else { "assistant" },
            "content": [{"type": "text", "text": "x".repeat(2_000)}]
        })).collect::<Vec<_>>(),
        "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}]
    }))
    .unwrap_or_else(|e| panic!("bench request: {e}"));

    c.bench_function("map_request_50msg_100k", |b| {
        b.iter(|| {
            let mapped = anthropic_to_openai_request(
                black_box(request.clone()),
                RequestMapping {
                    model_override: None,
                    default_max_tokens: 4096,
                },
            );
            black_box(mapped.map(|r| r.messages.len()).unwrap_or(0))
        });
    });
}

criterion_group!(
    benches,
    bench_session,
    bench_adapter,
    bench_sse_parser,
    bench_request_mapping
);
criterion_main!(benches);
