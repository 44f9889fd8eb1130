use super::TranslateError;

/// Kind of a downstream content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

impl BlockKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BlockKind::Text => "text",
            BlockKind::Thinking => "thinking",
            BlockKind::ToolUse => "tool_use",
        }
    }
}

/// Which block is open right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    NoBlockOpen,
    TextOpen { index: usize },
    ThinkingOpen { index: usize },
    ToolOpen { index: usize, id: String },
}

impl BlockState {
    fn open_block(&self) -> Option<(usize, BlockKind)> {
        match self {
            BlockState::NoBlockOpen => None,
            BlockState::TextOpen { index } => Some((*index, BlockKind::Text)),
            BlockState::ThinkingOpen { index } => Some((*index, BlockKind::Thinking)),
            BlockState::ToolOpen { index, .. } => Some((*index, BlockKind::ToolUse)),
        }
    }
}

/// Decision taken for one piece of content.
///
/// Apply in order: close `close` (if any), open `open` (if any), then append
/// to `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub close: Option<usize>,
    pub open: Option<usize>,
    pub index: usize,
}

/// Owns block indices and open state for one session.
///
/// Indices are handed out from a monotonic counter and never reused; every
/// opened block is closed exactly once.
#[derive(Debug)]
pub struct BlockMachine {
    state: BlockState,
    next_index: usize,
    opened: usize,
    closed: usize,
}

impl Default for BlockMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: BlockState::NoBlockOpen,
            next_index: 0,
            opened: 0,
            closed: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> &BlockState {
        &self.state
    }

    /// Number of blocks opened so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened
    }

    #[must_use]
    pub fn closed(&self) -> usize {
        self.closed
    }

    /// Open the initial empty text block at index 0.
    ///
    /// # Errors
    ///
    /// [`TranslateError::ProtocolInvariant`] if any block was opened before.
    pub fn open_initial_text(&mut self) -> Result<usize, TranslateError> {
        if self.opened != 0 {
            return Err(TranslateError::ProtocolInvariant(
                "initial text block opened twice".to_string(),
            ));
        }
        Ok(self.open(BlockKind::Text, None))
    }

    /// Route reasoning or answer text to a block of `kind`, switching blocks
    /// when the open one is of another kind.
    ///
    /// # Errors
    ///
    /// [`TranslateError::ProtocolInvariant`] when called with
    /// [`BlockKind::ToolUse`]; tool blocks go through [`Self::open_tool`].
    pub fn route_text(&mut self, kind: BlockKind) -> Result<Transition, TranslateError> {
        if kind == BlockKind::ToolUse {
            return Err(TranslateError::ProtocolInvariant(
                "tool content must be routed by id".to_string(),
            ));
        }
        let transition = match self.state.open_block() {
            Some((index, open_kind)) if open_kind == kind => Transition {
                close: None,
                open: None,
                index,
            },
            current => {
                let close = current.map(|(index, _)| index);
                if close.is_some() {
                    self.close_current();
                }
                let index = self.open(kind, None);
                Transition {
                    close,
                    open: Some(index),
                    index,
                }
            }
        };
        Ok(transition)
    }

    /// Open a `tool_use` block for `id`, closing whatever is open.
    ///
    /// A fragment for the already-open id stays in the same block.
    pub fn open_tool(&mut self, id: &str) -> Transition {
        if let BlockState::ToolOpen { index, id: open_id } = &self.state {
            if open_id == id {
                return Transition {
                    close: None,
                    open: None,
                    index: *index,
                };
            }
        }
        let close = self.state.open_block().map(|(index, _)| index);
        if close.is_some() {
            self.close_current();
        }
        let index = self.open(BlockKind::ToolUse, Some(id));
        Transition {
            close,
            open: Some(index),
            index,
        }
    }

    /// Check that content of `kind` may be appended to block `index`.
    ///
    /// # Errors
    ///
    /// [`TranslateError::ProtocolInvariant`] when `index` is not the open block
    /// or the open block is of another kind.
    pub fn check_append(&self, index: usize, kind: BlockKind) -> Result<(), TranslateError> {
        match self.state.open_block() {
            Some((open_index, open_kind)) if open_index == index && open_kind == kind => Ok(()),
            Some((open_index, open_kind)) => Err(TranslateError::ProtocolInvariant(format!(
                "{} delta for block {index} while {} block {open_index} is open",
                kind.as_str(),
                open_kind.as_str()
            ))),
            None => Err(TranslateError::ProtocolInvariant(format!(
                "{} delta for block {index} while no block is open",
                kind.as_str()
            ))),
        }
    }

    /// Close the open tool block.
    ///
    /// # Errors
    ///
    /// [`TranslateError::ProtocolInvariant`] when no tool block is open.
    pub fn close_tool(&mut self) -> Result<usize, TranslateError> {
        match self.state {
            BlockState::ToolOpen { index, .. } => {
                self.close_current();
                Ok(index)
            }
            _ => Err(TranslateError::ProtocolInvariant(
                "tool block close without an open tool block".to_string(),
            )),
        }
    }

    /// Close whatever is open. Used at stream end, on error and on cancel.
    pub fn close_open(&mut self) -> Option<usize> {
        let index = self.state.open_block().map(|(index, _)| index);
        if index.is_some() {
            self.close_current();
        }
        index
    }

    fn open(&mut self, kind: BlockKind, tool_id: Option<&str>) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.opened += 1;
        self.state = match kind {
            BlockKind::Text => BlockState::TextOpen { index },
            BlockKind::Thinking => BlockState::ThinkingOpen { index },
            BlockKind::ToolUse => BlockState::ToolOpen {
                index,
                id: tool_id.unwrap_or_default().to_string(),
            },
        };
        index
    }

    fn close_current(&mut self) {
        self.state = BlockState::NoBlockOpen;
        self.closed += 1;
    }
}
