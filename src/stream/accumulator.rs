use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::delta::ToolFragment;
use crate::util::next_tool_use_id;

/// Instruction for the block machine produced by the accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolEvent {
    /// Open a `tool_use` block.
    Start { id: String, name: String },
    /// Append argument JSON to the open `tool_use` block.
    Args(String),
    /// Close the open `tool_use` block.
    End,
}

/// Brace balance of a JSON value arriving in pieces.
#[derive(Debug, Clone, Copy, Default)]
struct JsonBalance {
    depth: i32,
    in_string: bool,
    escape_next: bool,
    seen_open: bool,
}

impl JsonBalance {
    fn feed(&mut self, partial: &str) {
        for b in partial.bytes() {
            if self.escape_next {
                self.escape_next = false;
                continue;
            }
            match b {
                b'\\' if self.in_string => self.escape_next = true,
                b'"' => self.in_string = !self.in_string,
                b'{' | b'[' if !self.in_string => {
                    self.depth += 1;
                    self.seen_open = true;
                }
                b'}' | b']' if !self.in_string => self.depth -= 1,
                _ => {}
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.seen_open && self.depth <= 0 && !self.in_string
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Seen, waiting behind the active call.
    Queued,
    Active,
    /// Its block was closed.
    Retired,
}

#[derive(Debug)]
struct ToolCallEntry {
    upstream_index: u32,
    id: String,
    /// The id came from the backend rather than `next_tool_use_id`.
    id_from_upstream: bool,
    name: String,
    /// Full argument text, for completeness detection and diagnostics.
    args: String,
    /// Arguments not yet forwarded.
    pending: String,
    balance: JsonBalance,
    state: EntryState,
    /// `ToolEvent::Start` has been emitted.
    started: bool,
}

impl ToolCallEntry {
    fn new(fragment: &ToolFragment) -> Self {
        Self {
            upstream_index: fragment.index,
            id: fragment.id.clone().unwrap_or_else(next_tool_use_id),
            id_from_upstream: fragment.id.is_some(),
            name: fragment.name.clone().unwrap_or_default(),
            args: String::new(),
            pending: String::new(),
            balance: JsonBalance::default(),
            state: EntryState::Queued,
            started: false,
        }
    }

    /// A fragment on this entry's index that names another call.
    fn is_other_call(&self, fragment: &ToolFragment) -> bool {
        matches!(&fragment.id, Some(id) if self.id_from_upstream && *id != self.id)
    }

    /// Take id and name from a later fragment while the block is not open yet.
    fn adopt_identity(&mut self, fragment: &mut ToolFragment) {
        if self.started {
            return;
        }
        if let Some(id) = fragment.id.take() {
            if !self.id_from_upstream {
                self.id = id;
                self.id_from_upstream = true;
            }
        }
        if let Some(name) = fragment.name.take() {
            if self.name.is_empty() {
                self.name = name;
            }
        }
    }

    fn ready_to_start(&self) -> bool {
        !self.name.is_empty() || !self.pending.is_empty()
    }
}

/// Groups structured tool-call fragments into sequential block cycles.
///
/// Fragments of the active call are forwarded as they arrive. Fragments of
/// another call are queued while the active call's argument JSON is still
/// incomplete, then replayed as a complete cycle once the active call is
/// released. A new id on an already used upstream index starts a new call.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    /// Entries in first-seen order.
    entries: Vec<ToolCallEntry>,
    /// Upstream call index -> position of its newest entry in `entries`.
    positions: FxHashMap<u32, usize>,
    active: Option<usize>,
    cycles: usize,
}

impl ToolCallAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tool cycles started so far.
    #[must_use]
    pub fn cycles(&self) -> usize {
        self.cycles
    }

    #[cfg(test)]
    fn has_active(&self) -> bool {
        self.active.is_some()
    }

    /// Accept one upstream fragment.
    pub fn push(&mut self, mut fragment: ToolFragment, out: &mut Vec<ToolEvent>) {
        let pos = self.entry_for(&fragment, out);
        let entry = &mut self.entries[pos];
        if entry.state == EntryState::Retired {
            warn!(
                upstream_index = entry.upstream_index,
                id = %entry.id,
                dropped_bytes = fragment.arguments.len(),
                "fragment for a closed tool call dropped"
            );
            return;
        }
        entry.adopt_identity(&mut fragment);
        entry.args.push_str(&fragment.arguments);
        entry.balance.feed(&fragment.arguments);

        match self.active {
            Some(active) if active == pos => {
                if entry.started {
                    if !fragment.arguments.is_empty() {
                        out.push(ToolEvent::Args(fragment.arguments));
                    }
                } else {
                    entry.pending.push_str(&fragment.arguments);
                    if entry.ready_to_start() {
                        self.emit_start(pos, out);
                    }
                }
            }
            Some(active) => {
                entry.pending.push_str(&fragment.arguments);
                if self.entries[active].balance.is_complete() {
                    self.release_active(out);
                    self.activate_queued(out);
                } else {
                    debug!(
                        active_index = self.entries[active].upstream_index,
                        queued_index = self.entries[pos].upstream_index,
                        "interleaved tool fragment queued"
                    );
                }
            }
            None => {
                entry.pending.push_str(&fragment.arguments);
                self.activate_queued(out);
            }
        }
    }

    /// Close the active call and replay every queued call as a full cycle.
    ///
    /// Called when a non-tool delta arrives and at stream end.
    pub fn flush(&mut self, out: &mut Vec<ToolEvent>) {
        self.release_active(out);
        for pos in 0..self.entries.len() {
            if self.entries[pos].state == EntryState::Queued {
                self.start(pos, out);
                self.release_active(out);
            }
        }
    }

    fn entry_for(&mut self, fragment: &ToolFragment, out: &mut Vec<ToolEvent>) -> usize {
        if let Some(&pos) = self.positions.get(&fragment.index) {
            if !self.entries[pos].is_other_call(fragment) {
                return pos;
            }
            debug!(
                upstream_index = fragment.index,
                previous_id = %self.entries[pos].id,
                "new tool call on a reused upstream index"
            );
            if self.active == Some(pos) {
                self.release_active(out);
            }
        }
        self.positions.insert(fragment.index, self.entries.len());
        self.entries.push(ToolCallEntry::new(fragment));
        self.entries.len() - 1
    }

    /// Activate queued entries in first-seen order, retiring each one whose
    /// JSON is already complete, until one stays active or none are left.
    fn activate_queued(&mut self, out: &mut Vec<ToolEvent>) {
        while self.active.is_none() {
            let Some(pos) = self
                .entries
                .iter()
                .position(|e| e.state == EntryState::Queued)
            else {
                return;
            };
            self.start(pos, out);
            if self.entries[pos].balance.is_complete() && self.has_later_queued(pos) {
                self.release_active(out);
            }
        }
    }

    fn has_later_queued(&self, pos: usize) -> bool {
        self.entries[pos + 1..]
            .iter()
            .any(|e| e.state == EntryState::Queued)
    }

    /// Make `pos` the active call. The block opens once a name or argument
    /// bytes are known.
    fn start(&mut self, pos: usize, out: &mut Vec<ToolEvent>) {
        self.entries[pos].state = EntryState::Active;
        self.active = Some(pos);
        self.cycles += 1;
        if self.entries[pos].ready_to_start() {
            self.emit_start(pos, out);
        } else {
            debug!(id = %self.entries[pos].id, "tool call start held until its name arrives");
        }
    }

    fn emit_start(&mut self, pos: usize, out: &mut Vec<ToolEvent>) {
        let entry = &mut self.entries[pos];
        if entry.name.is_empty() {
            warn!(id = %entry.id, "tool call started without a name");
        }
        out.push(ToolEvent::Start {
            id: entry.id.clone(),
            name: entry.name.clone(),
        });
        entry.started = true;
        let pending = std::mem::take(&mut entry.pending);
        if !pending.is_empty() {
            out.push(ToolEvent::Args(pending));
        }
    }

    fn release_active(&mut self, out: &mut Vec<ToolEvent>) {
        if let Some(pos) = self.active.take() {
            if !self.entries[pos].started {
                self.emit_start(pos, out);
            }
            let entry = &mut self.entries[pos];
            entry.state = EntryState::Retired;
            debug!(
                id = %entry.id,
                name = %entry.name,
                args_bytes = entry.args.len(),
                complete = entry.balance.is_complete(),
                "tool call closed"
            );
            out.push(ToolEvent::End);
        }
    }
}
