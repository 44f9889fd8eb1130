use super::sse::write_event_frame;
use crate::protocol::anthropic::stream::{
    push_content_block_delta_json, push_content_block_start_json, push_content_block_stop_json,
    push_message_delta_json, push_message_start_json, BlockDelta, BlockStart, MESSAGE_STOP_JSON,
    PING_JSON,
};

/// Frames downstream events into an output buffer.
///
/// Each method appends exactly one `event:`/`data:` frame; [`Self::take`]
/// hands the accumulated bytes to the writer.
#[derive(Debug, Default)]
pub struct EventEmitter {
    out: String,
    scratch: String,
}

impl EventEmitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_start(&mut self, message_id: &str, model: &str, input_tokens: u64) {
        self.scratch.clear();
        push_message_start_json(&mut self.scratch, message_id, model, input_tokens);
        write_event_frame(&mut self.out, "message_start", &self.scratch);
    }

    pub fn ping(&mut self) {
        write_event_frame(&mut self.out, "ping", PING_JSON);
    }

    pub fn open(&mut self, index: usize, block: BlockStart<'_>) {
        self.scratch.clear();
        push_content_block_start_json(&mut self.scratch, index, block);
        write_event_frame(&mut self.out, "content_block_start", &self.scratch);
    }

    pub fn append(&mut self, index: usize, delta: BlockDelta<'_>) {
        self.scratch.clear();
        push_content_block_delta_json(&mut self.scratch, index, delta);
        write_event_frame(&mut self.out, "content_block_delta", &self.scratch);
    }

    pub fn close(&mut self, index: usize) {
        self.scratch.clear();
        push_content_block_stop_json(&mut self.scratch, index);
        write_event_frame(&mut self.out, "content_block_stop", &self.scratch);
    }

    /// `message_delta` followed by `message_stop`.
    pub fn session_end(&mut self, stop_reason: &str, output_tokens: u64) {
        self.scratch.clear();
        push_message_delta_json(&mut self.scratch, stop_reason, output_tokens);
        write_event_frame(&mut self.out, "message_delta", &self.scratch);
        write_event_frame(&mut self.out, "message_stop", MESSAGE_STOP_JSON);
    }

    /// Take everything framed since the last call.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.out)
    }

    /// Drop anything framed but not yet taken.
    pub fn discard(&mut self) {
        self.out.clear();
    }
}
