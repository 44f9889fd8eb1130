use memchr::{memchr, memmem};
use tracing::{debug, warn};

use super::{AdapterOutput, ExtractedCall};
use crate::util::next_tool_use_id;

// Inline tool-call markup extractor.
//
// Some backends emit tool calls as markup inside the answer text, e.g.
// `<tool_call>{"name":"lookup","arguments":{...}}</tool_call>`. The extractor
// scans answer fragments as they arrive, forwards everything outside a known
// tag pair, and turns each complete tag body into one extracted call.
//
// - Detection works across arbitrary fragment boundaries.
// - At most one partial opening tag is held at a time.
// - The held tag body is capped; overflow falls back to passthrough for the
//   rest of the session.

/// State of the extractor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorState {
    /// Scanning plain text.
    Idle,
    /// The buffer ends with something that may still become an opening tag.
    InTag,
    /// An opening tag was seen; the buffer holds it and the body so far.
    AwaitingClose { tag: usize },
}

#[derive(Debug)]
struct ToolTag {
    name: String,
    open: String,
    close: String,
    close_finder: memmem::Finder<'static>,
}

impl ToolTag {
    fn new(name: &str) -> Self {
        let close = format!("</{name}>");
        let close_finder = memmem::Finder::new(close.as_bytes()).into_owned();
        Self {
            name: name.to_string(),
            open: format!("<{name}>"),
            close,
            close_finder,
        }
    }
}

enum OpenMatch {
    Full(usize),
    Partial,
    None,
}

/// Streaming extractor for `<tag>body</tag>` tool-call markup.
#[derive(Debug)]
pub struct TagExtractor {
    tags: Vec<ToolTag>,
    buffer: String,
    state: ExtractorState,
    max_buffer_size: usize,
    /// Where the closing-tag search resumes, relative to `buffer`.
    close_search_from: usize,
    /// Set after an overflow; everything passes through from then on.
    bypass: bool,
}

impl TagExtractor {
    #[must_use]
    pub fn new<S: AsRef<str>>(tag_names: &[S], max_buffer_size: usize) -> Self {
        Self {
            tags: tag_names.iter().map(|n| ToolTag::new(n.as_ref())).collect(),
            buffer: String::new(),
            state: ExtractorState::Idle,
            max_buffer_size,
            close_search_from: 0,
            bypass: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> ExtractorState {
        self.state
    }

    /// Number of bytes currently held back.
    #[must_use]
    pub fn held_len(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    fn is_bypassed(&self) -> bool {
        self.bypass
    }

    /// Feed one answer-text fragment.
    pub fn process(&mut self, fragment: &str) -> AdapterOutput {
        if fragment.is_empty() {
            return AdapterOutput::default();
        }
        if self.bypass {
            return AdapterOutput::passthrough(fragment);
        }

        // Fast path: nothing held and no '<' means no tag can start here.
        if self.state == ExtractorState::Idle
            && self.buffer.is_empty()
            && memchr(b'<', fragment.as_bytes()).is_none()
        {
            return AdapterOutput::passthrough(fragment);
        }

        self.buffer.push_str(fragment);
        let mut out = AdapterOutput::default();
        self.drain_buffer(&mut out);
        out.was_transformed = !(out.extracted_calls.is_empty() && out.cleaned_text == fragment);
        out
    }

    /// Flush whatever is held (a partial or unterminated tag) as plain text.
    pub fn finish(&mut self) -> AdapterOutput {
        if let ExtractorState::AwaitingClose { tag } = self.state {
            debug!(
                tag = %self.tags[tag].name,
                held_bytes = self.buffer.len(),
                "unterminated tool markup flushed as text"
            );
        }
        self.state = ExtractorState::Idle;
        self.close_search_from = 0;
        let cleaned_text = std::mem::take(&mut self.buffer);
        let was_transformed = !cleaned_text.is_empty();
        AdapterOutput {
            cleaned_text,
            extracted_calls: Vec::new(),
            was_transformed,
        }
    }

    fn drain_buffer(&mut self, out: &mut AdapterOutput) {
        let mut pos = 0;
        loop {
            match self.state {
                ExtractorState::Idle | ExtractorState::InTag => {
                    let Some(rel_lt) = memchr(b'<', &self.buffer.as_bytes()[pos..]) else {
                        out.cleaned_text.push_str(&self.buffer[pos..]);
                        pos = self.buffer.len();
                        self.state = ExtractorState::Idle;
                        break;
                    };
                    let lt = pos + rel_lt;
                    out.cleaned_text.push_str(&self.buffer[pos..lt]);
                    pos = lt;
                    match self.match_open_tag(&self.buffer[lt..]) {
                        OpenMatch::Full(tag) => {
                            self.state = ExtractorState::AwaitingClose { tag };
                            self.close_search_from = lt + self.tags[tag].open.len();
                        }
                        OpenMatch::Partial => {
                            self.state = ExtractorState::InTag;
                            break;
                        }
                        OpenMatch::None => {
                            out.cleaned_text.push('<');
                            pos = lt + 1;
                            self.state = ExtractorState::Idle;
                        }
                    }
                }
                ExtractorState::AwaitingClose { tag } => {
                    let tag_def = &self.tags[tag];
                    let body_start = pos + tag_def.open.len();
                    let search_from = self.close_search_from.max(body_start);
                    let found = tag_def
                        .close_finder
                        .find(&self.buffer.as_bytes()[search_from..]);
                    if let Some(rel_close) = found {
                        let close_at = search_from + rel_close;
                        let call = build_call(
                            &tag_def.name,
                            &self.buffer[body_start..close_at],
                            out.cleaned_text.len(),
                        );
                        debug!(tool = %call.name, id = %call.id, "extracted tool markup");
                        out.extracted_calls.push(call);
                        pos = close_at + tag_def.close.len();
                        self.state = ExtractorState::Idle;
                        continue;
                    }

                    let held = self.buffer.len() - pos;
                    if held > self.max_buffer_size {
                        warn!(
                            tag = %tag_def.name,
                            held_bytes = held,
                            limit = self.max_buffer_size,
                            "tool markup exceeded buffer limit; passing through"
                        );
                        out.cleaned_text.push_str(&self.buffer[pos..]);
                        pos = self.buffer.len();
                        self.state = ExtractorState::Idle;
                        self.bypass = true;
                    } else {
                        // A closing tag split across fragments can begin in the tail.
                        self.close_search_from = self
                            .buffer
                            .len()
                            .saturating_sub(tag_def.close.len().saturating_sub(1))
                            .max(body_start);
                    }
                    break;
                }
            }
        }

        self.buffer.drain(..pos);
        self.close_search_from = self.close_search_from.saturating_sub(pos);
    }

    fn match_open_tag(&self, rest: &str) -> OpenMatch {
        if let Some(tag) = self.tags.iter().position(|t| rest.starts_with(&t.open)) {
            return OpenMatch::Full(tag);
        }
        if self
            .tags
            .iter()
            .any(|t| rest.len() < t.open.len() && t.open.starts_with(rest))
        {
            return OpenMatch::Partial;
        }
        OpenMatch::None
    }
}

fn build_call(tag_name: &str, body: &str, text_offset: usize) -> ExtractedCall {
    let (name, arguments) = parse_call_envelope(body).unwrap_or_else(|| {
        let arguments = if body.trim().is_empty() {
            "{}".to_string()
        } else {
            body.to_string()
        };
        (tag_name.to_string(), arguments)
    });
    ExtractedCall {
        id: next_tool_use_id(),
        name,
        arguments,
        text_offset,
    }
}

/// Unwrap `{"name": ..., "arguments"|"parameters"|"input": ...}`.
fn parse_call_envelope(body: &str) -> Option<(String, String)> {
    let serde_json::Value::Object(mut map) = serde_json::from_str(body.trim()).ok()? else {
        return None;
    };
    let key = ["arguments", "parameters", "input"]
        .into_iter()
        .find(|k| map.contains_key(*k))?;
    let name = map.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    let name = name.to_string();
    let arguments = match map.remove(key)? {
        serde_json::Value::Null => "{}".to_string(),
        // Some backends double-encode the arguments object.
        serde_json::Value::String(s) if serde_json::from_str::<serde_json::Value>(&s).is_ok() => s,
        other => other.to_string(),
    };
    Some((name, arguments))
}
