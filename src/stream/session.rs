use tracing::{debug, error, warn};

use super::accumulator::{ToolCallAccumulator, ToolEvent};
use super::blocks::{BlockKind, BlockMachine, BlockState, Transition};
use super::delta::Delta;
use super::emitter::EventEmitter;
use super::{SseEvent, TranslateError};
use crate::adapter::{AdapterOutput, ContentAdapter, Segment};
use crate::config::{ReasoningField, UpstreamConfig};
use crate::observability::token_counter::estimate_tokens_for_len;
use crate::protocol::anthropic::stream::{BlockDelta, BlockStart};
use crate::protocol::anthropic::AnthropicUsage;
use crate::protocol::mapping::{openai_finish_to_anthropic_stop, resolve_stop_reason};
use crate::protocol::openai_chat::stream::{decode_openai_stream_data, upstream_error_message};
use crate::protocol::openai_chat::{OpenAiStreamChunk, OpenAiUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Streaming,
    Finished,
    Aborted,
}

/// All mutable translator state for one client request.
///
/// Every method returns the downstream bytes it produced; the caller writes
/// them in order. Chunks must be fed one at a time, each running to
/// completion before the next.
#[derive(Debug)]
pub struct StreamSession {
    adapter: ContentAdapter,
    accumulator: ToolCallAccumulator,
    blocks: BlockMachine,
    emitter: EventEmitter,
    reasoning_field: ReasoningField,
    tool_events: Vec<ToolEvent>,
    phase: Phase,
    finish_reason: Option<String>,
    upstream_usage: Option<OpenAiUsage>,
    emitted_tool_use: bool,
    input_tokens: u64,
    output_bytes: usize,
}

impl StreamSession {
    /// Build a session whose adapter follows the upstream's declared markup.
    #[must_use]
    pub fn new(upstream: &UpstreamConfig) -> Self {
        Self::with_adapter(ContentAdapter::from_config(upstream), upstream.reasoning_field)
    }

    #[must_use]
    pub fn with_adapter(adapter: ContentAdapter, reasoning_field: ReasoningField) -> Self {
        Self {
            adapter,
            accumulator: ToolCallAccumulator::new(),
            blocks: BlockMachine::new(),
            emitter: EventEmitter::new(),
            reasoning_field,
            tool_events: Vec::new(),
            phase: Phase::Created,
            finish_reason: None,
            upstream_usage: None,
            emitted_tool_use: false,
            input_tokens: 0,
            output_bytes: 0,
        }
    }

    /// `message_start`, the empty text block at index 0, then `ping`.
    ///
    /// # Errors
    ///
    /// [`TranslateError::ProtocolInvariant`] when the session already started.
    pub fn start(
        &mut self,
        message_id: &str,
        model: &str,
        input_tokens: u64,
    ) -> Result<String, TranslateError> {
        if self.phase != Phase::Created {
            return Err(TranslateError::ProtocolInvariant(
                "session started twice".to_string(),
            ));
        }
        self.input_tokens = input_tokens;
        self.emitter.session_start(message_id, model, input_tokens);
        let index = self.blocks.open_initial_text()?;
        self.emitter.open(index, BlockStart::Text);
        self.emitter.ping();
        self.phase = Phase::Streaming;
        debug!(
            message_id,
            model,
            adapter = self.adapter.name(),
            input_tokens,
            "stream session started"
        );
        Ok(self.emitter.take())
    }

    /// Translate one upstream SSE event.
    ///
    /// The `[DONE]` sentinel and blank payloads produce nothing; the caller
    /// decides when the stream ends.
    ///
    /// # Errors
    ///
    /// [`TranslateError::UpstreamTransport`] for `error` events, malformed
    /// payloads and in-band error objects; [`TranslateError::ProtocolInvariant`]
    /// for lifecycle violations.
    pub fn process_event(&mut self, event: &SseEvent) -> Result<String, TranslateError> {
        if event.event.as_deref() == Some("error") {
            let message = serde_json::from_str::<serde_json::Value>(&event.data).map_or_else(
                |_| event.data.clone(),
                |value| match value.get("error") {
                    Some(inner) => upstream_error_message(inner),
                    None => upstream_error_message(&value),
                },
            );
            return Err(TranslateError::UpstreamTransport(message));
        }
        self.process_data(&event.data)
    }

    /// Translate the `data` payload of one upstream event.
    ///
    /// # Errors
    ///
    /// See [`Self::process_event`].
    pub fn process_data(&mut self, data: &str) -> Result<String, TranslateError> {
        match decode_openai_stream_data(data) {
            Ok(Some(chunk)) => self.process_chunk(chunk),
            Ok(None) => Ok(String::new()),
            Err(err) => Err(TranslateError::UpstreamTransport(format!(
                "malformed upstream chunk: {err}"
            ))),
        }
    }

    /// Translate one decoded upstream chunk.
    ///
    /// # Errors
    ///
    /// See [`Self::process_event`].
    pub fn process_chunk(&mut self, chunk: OpenAiStreamChunk) -> Result<String, TranslateError> {
        let delta = Delta::from_chunk(chunk, self.reasoning_field)?;
        self.process_delta(delta)
    }

    /// Translate one normalized delta.
    ///
    /// Reasoning is handled before answer text, answer text before tool
    /// fragments.
    ///
    /// # Errors
    ///
    /// [`TranslateError::ProtocolInvariant`] when called outside the streaming
    /// phase or when a lifecycle rule is broken.
    pub fn process_delta(&mut self, delta: Delta) -> Result<String, TranslateError> {
        match self.phase {
            Phase::Streaming => {}
            Phase::Aborted => return Ok(String::new()),
            Phase::Created | Phase::Finished => {
                return Err(TranslateError::ProtocolInvariant(
                    "delta outside an active session".to_string(),
                ));
            }
        }

        let Delta {
            reasoning,
            answer,
            tool_fragments,
            finish_reason,
            usage,
        } = delta;

        if let Some(reasoning) = reasoning.as_deref() {
            self.flush_tool_calls()?;
            self.emit_text(BlockKind::Thinking, reasoning)?;
        }

        if let Some(answer) = answer.as_deref() {
            let output = self.adapter.process(answer);
            self.flush_tool_calls()?;
            self.emit_adapter_output(&output)?;
        }

        for fragment in tool_fragments {
            self.accumulator.push(fragment, &mut self.tool_events);
            self.apply_tool_events()?;
        }

        if finish_reason.is_some() {
            self.finish_reason = finish_reason;
        }
        if usage.is_some() {
            self.upstream_usage = usage;
        }
        Ok(self.emitter.take())
    }

    /// Normal end of stream: flush held state, close the open block, then
    /// `message_delta` and `message_stop`.
    ///
    /// # Errors
    ///
    /// [`TranslateError::ProtocolInvariant`] when called outside the streaming
    /// phase or when flushing breaks a lifecycle rule.
    pub fn finish(&mut self) -> Result<String, TranslateError> {
        match self.phase {
            Phase::Streaming => {}
            Phase::Aborted => return Ok(String::new()),
            Phase::Created | Phase::Finished => {
                return Err(TranslateError::ProtocolInvariant(
                    "finish outside an active session".to_string(),
                ));
            }
        }

        self.flush_tool_calls()?;
        let held = self.adapter.finish();
        self.emit_adapter_output(&held)?;
        if let Some(index) = self.blocks.close_open() {
            self.emitter.close(index);
        }

        let stop_reason = resolve_stop_reason(self.finish_reason.as_deref(), self.emitted_tool_use);
        self.end(stop_reason);
        debug!(
            stop_reason,
            blocks = self.blocks.opened(),
            tool_cycles = self.accumulator.cycles(),
            output_tokens = self.output_tokens(),
            "stream session finished"
        );
        Ok(self.emitter.take())
    }

    /// Forced-close path after an error: flush text the adapter still holds,
    /// close the open block and emit a best-effort
    /// `message_delta`/`message_stop`.
    ///
    /// A [`TranslateError::DownstreamWrite`] aborts instead and returns
    /// nothing.
    pub fn fail(&mut self, err: &TranslateError) -> String {
        match err {
            TranslateError::DownstreamWrite => {
                self.abort();
                return String::new();
            }
            TranslateError::UpstreamTransport(message) => {
                warn!(error = %message, "upstream stream failed, closing session");
            }
            TranslateError::ProtocolInvariant(message) => {
                error!(error = %message, "stream protocol invariant violated, closing session");
            }
        }
        if self.phase != Phase::Streaming {
            return String::new();
        }

        // Held markup goes out as text; a lifecycle error here leaves nothing
        // safe to emit.
        let held = self.adapter.finish();
        if let Err(err) = self.emit_adapter_output(&held) {
            error!(error = %err, "could not flush held text on forced close");
            self.emitter.discard();
            self.phase = Phase::Aborted;
            return String::new();
        }
        if let Some(index) = self.blocks.close_open() {
            self.emitter.close(index);
        }
        let stop_reason = self
            .finish_reason
            .as_deref()
            .map_or("end_turn", openai_finish_to_anthropic_stop);
        self.end(stop_reason);
        self.emitter.take()
    }

    /// The client went away: stop without further output.
    pub fn abort(&mut self) {
        if self.phase == Phase::Aborted {
            return;
        }
        self.emitter.discard();
        debug!(
            blocks_opened = self.blocks.opened(),
            blocks_closed = self.blocks.closed(),
            "stream session aborted by client"
        );
        self.phase = Phase::Aborted;
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self.phase, Phase::Finished | Phase::Aborted)
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.phase == Phase::Aborted
    }

    #[must_use]
    pub fn block_state(&self) -> &BlockState {
        self.blocks.state()
    }

    /// Usage reported upstream, with estimates filling missing counts.
    #[must_use]
    pub fn usage(&self) -> AnthropicUsage {
        let input = self
            .upstream_usage
            .map_or(0, |u| u.prompt_tokens);
        AnthropicUsage {
            input_tokens: if input > 0 { input } else { self.input_tokens },
            output_tokens: self.output_tokens(),
        }
    }

    fn output_tokens(&self) -> u64 {
        match self.upstream_usage {
            Some(usage) if usage.completion_tokens > 0 => usage.completion_tokens,
            _ => estimate_tokens_for_len(self.output_bytes),
        }
    }

    fn end(&mut self, stop_reason: &str) {
        let output_tokens = self.output_tokens();
        self.emitter.session_end(stop_reason, output_tokens);
        self.phase = Phase::Finished;
    }

    fn apply_transition(&mut self, transition: Transition, block: BlockStart<'_>) {
        if let Some(index) = transition.close {
            self.emitter.close(index);
        }
        if let Some(index) = transition.open {
            self.emitter.open(index, block);
        }
    }

    fn emit_text(&mut self, kind: BlockKind, text: &str) -> Result<(), TranslateError> {
        if text.is_empty() {
            return Ok(());
        }
        let transition = self.blocks.route_text(kind)?;
        let (start, delta) = match kind {
            BlockKind::Thinking => (BlockStart::Thinking, BlockDelta::Thinking(text)),
            BlockKind::Text | BlockKind::ToolUse => (BlockStart::Text, BlockDelta::Text(text)),
        };
        self.apply_transition(transition, start);
        self.blocks.check_append(transition.index, kind)?;
        self.emitter.append(transition.index, delta);
        self.output_bytes += text.len();
        Ok(())
    }

    fn emit_adapter_output(&mut self, output: &AdapterOutput) -> Result<(), TranslateError> {
        for segment in output.segments() {
            match segment {
                Segment::Text(text) => self.emit_text(BlockKind::Text, text)?,
                Segment::Call(call) => {
                    self.open_tool(&call.id, &call.name);
                    self.append_tool_args(&call.arguments)?;
                    self.close_tool()?;
                }
            }
        }
        Ok(())
    }

    fn open_tool(&mut self, id: &str, name: &str) {
        let transition = self.blocks.open_tool(id);
        self.apply_transition(transition, BlockStart::ToolUse { id, name });
        self.emitted_tool_use = true;
    }

    fn append_tool_args(&mut self, arguments: &str) -> Result<(), TranslateError> {
        if arguments.is_empty() {
            return Ok(());
        }
        let BlockState::ToolOpen { index, .. } = *self.blocks.state() else {
            return Err(TranslateError::ProtocolInvariant(
                "tool arguments without an open tool block".to_string(),
            ));
        };
        self.blocks.check_append(index, BlockKind::ToolUse)?;
        self.emitter.append(index, BlockDelta::InputJson(arguments));
        self.output_bytes += arguments.len();
        Ok(())
    }

    fn close_tool(&mut self) -> Result<(), TranslateError> {
        let index = self.blocks.close_tool()?;
        self.emitter.close(index);
        Ok(())
    }

    fn flush_tool_calls(&mut self) -> Result<(), TranslateError> {
        self.accumulator.flush(&mut self.tool_events);
        self.apply_tool_events()
    }

    fn apply_tool_events(&mut self) -> Result<(), TranslateError> {
        let mut events = std::mem::take(&mut self.tool_events);
        for event in events.drain(..) {
            match event {
                ToolEvent::Start { id, name } => self.open_tool(&id, &name),
                ToolEvent::Args(arguments) => self.append_tool_args(&arguments)?,
                ToolEvent::End => self.close_tool()?,
            }
        }
        self.tool_events = events;
        Ok(())
    }
}
