use smallvec::SmallVec;

use super::TranslateError;
use crate::config::ReasoningField;
use crate::protocol::openai_chat::stream::upstream_error_message;
use crate::protocol::openai_chat::{OpenAiStreamChunk, OpenAiUsage};

/// One fragment of a structured upstream tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolFragment {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// Normalized view of one upstream chunk.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    pub reasoning: Option<String>,
    pub answer: Option<String>,
    pub tool_fragments: SmallVec<[ToolFragment; 1]>,
    pub finish_reason: Option<String>,
    pub usage: Option<OpenAiUsage>,
}

impl Delta {
    /// Normalize a decoded chunk. Only the first choice is translated.
    ///
    /// # Errors
    ///
    /// Returns [`TranslateError::UpstreamTransport`] when the chunk carries an
    /// in-band `error` object.
    pub fn from_chunk(
        chunk: OpenAiStreamChunk,
        reasoning_field: ReasoningField,
    ) -> Result<Self, TranslateError> {
        if let Some(error) = chunk.error.as_ref() {
            return Err(TranslateError::UpstreamTransport(upstream_error_message(
                error,
            )));
        }

        let mut delta = Delta {
            usage: chunk.usage,
            ..Delta::default()
        };

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(delta);
        };

        let wire = choice.delta;
        delta.reasoning = match reasoning_field {
            ReasoningField::Auto => wire.reasoning_content.or(wire.reasoning),
            ReasoningField::Reasoning => wire.reasoning,
            ReasoningField::ReasoningContent => wire.reasoning_content,
        }
        .filter(|s| !s.is_empty());
        delta.answer = wire.content.filter(|s| !s.is_empty());

        for call in wire.tool_calls.into_iter().flatten() {
            let (name, arguments) = match call.function {
                Some(function) => (function.name, function.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            delta.tool_fragments.push(ToolFragment {
                index: call.index,
                id: call.id.filter(|id| !id.is_empty()),
                name: name.filter(|n| !n.is_empty()),
                arguments,
            });
        }

        delta.finish_reason = choice.finish_reason.filter(|r| !r.is_empty());
        Ok(delta)
    }

    /// Whether the delta carries reasoning or answer text.
    #[cfg(test)]
    fn has_text(&self) -> bool {
        self.reasoning.is_some() || self.answer.is_some()
    }
}
