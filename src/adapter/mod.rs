pub mod tag_extractor;

use crate::config::{MarkupMode, UpstreamConfig};

pub use tag_extractor::{ExtractorState, TagExtractor};

/// A tool call recovered from inline markup in the answer text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCall {
    pub id: String,
    pub name: String,
    /// Argument JSON forwarded as a single `input_json_delta`.
    pub arguments: String,
    /// Byte offset into [`AdapterOutput::cleaned_text`] where the markup stood.
    pub text_offset: usize,
}

/// Result of running one text fragment through a [`ContentAdapter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterOutput {
    pub cleaned_text: String,
    pub extracted_calls: Vec<ExtractedCall>,
    /// `false` when `cleaned_text` is exactly the input and nothing was extracted.
    pub was_transformed: bool,
}

/// One piece of adapter output in stream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Call(&'a ExtractedCall),
}

impl AdapterOutput {
    #[must_use]
    pub fn passthrough(text: &str) -> Self {
        Self {
            cleaned_text: text.to_owned(),
            extracted_calls: Vec::new(),
            was_transformed: false,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cleaned_text.is_empty() && self.extracted_calls.is_empty()
    }

    /// Interleave cleaned text and extracted calls in the order they appeared.
    /// Empty text runs are skipped.
    #[must_use]
    pub fn segments(&self) -> Vec<Segment<'_>> {
        let mut out = Vec::with_capacity(self.extracted_calls.len() * 2 + 1);
        let mut cursor = 0;
        for call in &self.extracted_calls {
            let at = call.text_offset.clamp(cursor, self.cleaned_text.len());
            if at > cursor {
                out.push(Segment::Text(&self.cleaned_text[cursor..at]));
            }
            out.push(Segment::Call(call));
            cursor = at;
        }
        if cursor < self.cleaned_text.len() {
            out.push(Segment::Text(&self.cleaned_text[cursor..]));
        }
        out
    }
}

/// Per-session text adapter, chosen once from the upstream's declared markup.
#[derive(Debug)]
pub enum ContentAdapter {
    Passthrough,
    TagExtractor(TagExtractor),
}

impl ContentAdapter {
    #[must_use]
    pub fn from_config(upstream: &UpstreamConfig) -> Self {
        match upstream.markup {
            MarkupMode::None => Self::Passthrough,
            MarkupMode::Tags => Self::TagExtractor(TagExtractor::new(
                &upstream.tool_tags,
                upstream.max_markup_buffer_bytes,
            )),
        }
    }

    /// Run an answer-text fragment through the adapter.
    pub fn process(&mut self, fragment: &str) -> AdapterOutput {
        match self {
            Self::Passthrough => AdapterOutput::passthrough(fragment),
            Self::TagExtractor(extractor) => extractor.process(fragment),
        }
    }

    /// Flush anything still held at end of stream.
    pub fn finish(&mut self) -> AdapterOutput {
        match self {
            Self::Passthrough => AdapterOutput::default(),
            Self::TagExtractor(extractor) => extractor.finish(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::TagExtractor(_) => "tag_extractor",
        }
    }
}
