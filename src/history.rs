//! Append-only history store and the single pending entry (SPEC_FULL.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::tool_call::TrackedToolCall;

pub type HistoryId = u64;

/// One call's outcome as recorded in a finalized `tool_group` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolOutcomeEntry {
    pub call_id: String,
    pub name: String,
    /// Terminal status, lower-cased (e.g. "success", "error", "cancelled").
    pub status: String,
}

/// Tagged history-entry variant (SPEC_FULL.md §3's "History entry").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HistoryEntryKind {
    User { text: String },
    UserShell { command: String },
    Assistant { text: String },
    /// Continuation fragment of a split assistant message.
    AssistantContent { text: String },
    ToolGroup { calls: Vec<ToolOutcomeEntry> },
    Info { text: String },
    Error { text: String },
    About { text: String },
    Help { text: String },
    Stats { text: String },
    Compression { before: u64, after: u64 },
    Summary { text: String },
    Quit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: HistoryId,
    pub timestamp: DateTime<Utc>,
    pub kind: HistoryEntryKind,
}

/// The at-most-one pending entry (SPEC_FULL.md §3's "Pending entry").
///
/// Never stored in the history array (Invariant 1); rendered separately
/// by the host UI and finalized into a real [`HistoryEntry`] at turn
/// boundaries.
#[derive(Debug, Clone)]
pub enum Pending {
    None,
    Assistant {
        buffer: String,
        /// Whether an earlier split already emitted the leading
        /// `assistant` entry for this response; subsequent flushes
        /// become `assistant_content` continuations.
        leading_emitted: bool,
    },
    ToolGroup {
        calls: Vec<TrackedToolCall>,
    },
}

impl Pending {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Append-only ordered history plus the single pending entry.
pub struct HistoryStore {
    entries: Vec<HistoryEntry>,
    next_id: HistoryId,
    pending: Pending,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            pending: Pending::None,
        }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn pending(&self) -> &Pending {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut Pending {
        &mut self.pending
    }

    /// Append a finalized entry directly to history (bypassing pending).
    /// Used for `user`, `info`, `error`, and other entries that are never
    /// incrementally assembled.
    pub fn append(&mut self, clock: &dyn Clock, kind: HistoryEntryKind) -> HistoryId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(HistoryEntry {
            id,
            timestamp: clock.now(),
            kind,
        });
        id
    }

    /// Begin or continue an assistant content buffer in the pending slot.
    pub fn push_content(&mut self, text: &str) {
        match &mut self.pending {
            Pending::Assistant { buffer, .. } => buffer.push_str(text),
            Pending::None => {
                self.pending = Pending::Assistant {
                    buffer: text.to_string(),
                    leading_emitted: false,
                };
            }
            Pending::ToolGroup { .. } => {
                // A content event arriving while a tool group is pending is
                // not expected by the dispatcher (tool groups only appear
                // at stream end); ignore rather than clobber tool state.
            }
        }
    }

    /// Split the assistant buffer at the last safe boundary if it exceeds
    /// `threshold` bytes, emitting the split-off prefix as a finalized
    /// history entry. Returns the id of the newly appended entry, if any.
    pub fn maybe_split_assistant_buffer(
        &mut self,
        clock: &dyn Clock,
        threshold: usize,
    ) -> Option<HistoryId> {
        let Pending::Assistant {
            buffer,
            leading_emitted,
        } = &mut self.pending
        else {
            return None;
        };

        if buffer.len() <= threshold {
            return None;
        }

        let split_at = crate::splitting::find_safe_split_point(buffer)?;
        if split_at == 0 {
            return None;
        }

        let head: String = buffer.drain(..split_at).collect();
        let kind = if *leading_emitted {
            HistoryEntryKind::AssistantContent { text: head }
        } else {
            HistoryEntryKind::Assistant { text: head }
        };
        *leading_emitted = true;
        Some(self.append(clock, kind))
    }

    /// Finalize the pending entry into history, per the Draining phase.
    /// An empty assistant buffer is discarded rather than stored (a turn
    /// that streamed no content produces no assistant entry). Returns the
    /// id of the finalized entry, if one was written.
    pub fn finalize_pending(&mut self, clock: &dyn Clock) -> Option<HistoryId> {
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::None => None,
            Pending::Assistant {
                buffer,
                leading_emitted,
            } => {
                if buffer.is_empty() {
                    None
                } else {
                    let kind = if leading_emitted {
                        HistoryEntryKind::AssistantContent { text: buffer }
                    } else {
                        HistoryEntryKind::Assistant { text: buffer }
                    };
                    Some(self.append(clock, kind))
                }
            }
            Pending::ToolGroup { calls } => {
                let outcomes = calls
                    .into_iter()
                    .map(|call| ToolOutcomeEntry {
                        call_id: call.request.call_id,
                        name: call.request.name,
                        status: call.status.as_str().to_string(),
                    })
                    .collect();
                Some(self.append(clock, HistoryEntryKind::ToolGroup { calls: outcomes }))
            }
        }
    }

    /// Discard the pending entry without writing it to history (used when
    /// a stream-stall retry clears a partial response, or when a later
    /// `UserCancelled` event arrives after the entry was already flushed).
    pub fn discard_pending(&mut self) -> Pending {
        std::mem::replace(&mut self.pending, Pending::None)
    }

    /// True if the oldest call/response pair in the current pending tool
    /// group (if any) has settled; used by `streaming_state`.
    pub fn has_unresolved_tool_calls(&self) -> bool {
        match &self.pending {
            Pending::ToolGroup { calls } => calls.iter().any(|c| !c.is_ripe_or_pending_forward()),
            _ => false,
        }
    }
}
