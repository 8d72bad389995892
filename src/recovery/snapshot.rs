//! Context-Snapshot Builder (spec.md §4.4).

use crate::history::{HistoryEntry, HistoryEntryKind, ToolOutcomeEntry};

const TEXT_TRUNCATE_LEN: usize = 280;
const MAX_TOOL_GROUP_ENTRIES: usize = 4;

fn truncate_collapsed(text: &str) -> String {
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= TEXT_TRUNCATE_LEN {
        return collapsed;
    }
    let truncated: String = collapsed.chars().take(TEXT_TRUNCATE_LEN).collect();
    format!("{truncated}…")
}

fn last_user_text(entries: &[HistoryEntry]) -> Option<String> {
    entries.iter().rev().find_map(|e| match &e.kind {
        HistoryEntryKind::User { text } => Some(truncate_collapsed(text)),
        _ => None,
    })
}

fn last_assistant_text(entries: &[HistoryEntry]) -> Option<String> {
    entries.iter().rev().find_map(|e| match &e.kind {
        HistoryEntryKind::Assistant { text } | HistoryEntryKind::AssistantContent { text } => {
            Some(truncate_collapsed(text))
        }
        _ => None,
    })
}

fn format_outcome(entry: &ToolOutcomeEntry) -> String {
    format!("{}: {}", entry.name, entry.status.to_lowercase())
}

/// Join the last two tool groups' calls, capped at four entries with a
/// trailing `, …` marker if more outcomes exist than fit.
fn last_tool_groups_summary(entries: &[HistoryEntry]) -> Option<String> {
    let mut groups_seen = 0;
    let mut outcomes: Vec<&ToolOutcomeEntry> = Vec::new();

    for entry in entries.iter().rev() {
        if let HistoryEntryKind::ToolGroup { calls } = &entry.kind {
            groups_seen += 1;
            for call in calls.iter().rev() {
                outcomes.push(call);
            }
            if groups_seen == 2 {
                break;
            }
        }
    }

    if outcomes.is_empty() {
        return None;
    }

    outcomes.reverse();
    let truncated = outcomes.len() > MAX_TOOL_GROUP_ENTRIES;
    let shown: Vec<String> = outcomes
        .iter()
        .take(MAX_TOOL_GROUP_ENTRIES)
        .map(|o| format_outcome(o))
        .collect();

    let mut joined = shown.join(", ");
    if truncated {
        joined.push_str(", …");
    }
    Some(joined)
}

/// Build the compact recovery snapshot embedded in recovery prompts and
/// shown to the user as info text.
pub fn build_recovery_snapshot(entries: &[HistoryEntry]) -> String {
    let segments: Vec<String> = [
        last_user_text(entries),
        last_assistant_text(entries),
        last_tool_groups_summary(entries),
    ]
    .into_iter()
    .flatten()
    .collect();

    segments.join("\n")
}
