//! Recovery Planner: pure prompt-building functions per failure category
//! (spec.md §2's "Recovery Planner", §4.3's recovery tables).

use crate::model_client::FinishReason;

/// Stream-stall recovery prompt (category: auto).
pub fn stream_stall_prompt(snapshot: &str) -> String {
    let mut prompt = String::from(
        "Streaming stalled before a response completed. Resume from the last successful step, \
         continuing the task without repeating work already done.",
    );
    if !snapshot.is_empty() {
        prompt.push_str("\n\nContext:\n");
        prompt.push_str(snapshot);
    }
    prompt
}

/// Loop-detection recovery prompt (category: loop).
pub fn loop_recovery_prompt(snapshot: &str) -> String {
    let mut prompt = String::from(
        "A potential tool loop was detected: the same tool call appears to be repeating without \
         making progress. Reassess the approach, avoid repeating the same call with the same \
         arguments, and choose a different strategy or ask the user for guidance.",
    );
    if !snapshot.is_empty() {
        prompt.push_str("\n\nContext:\n");
        prompt.push_str(snapshot);
    }
    prompt
}

/// Which limit-exceeded signal triggered limit recovery.
#[derive(Debug, Clone)]
pub enum LimitTrigger {
    MaxSessionTurns,
    SessionTokenLimit { current_tokens: u64, limit: u64 },
    TurnBudgetExceeded { limit: Option<u64> },
}

/// Limit recovery prompt (category: limit). Token counts are formatted
/// with thousands separators (spec.md §8 scenario 4: `"130,000 / 128,000"`).
pub fn limit_recovery_prompt(trigger: &LimitTrigger, snapshot: &str) -> String {
    let mut prompt = match trigger {
        LimitTrigger::MaxSessionTurns => String::from(
            "The maximum number of turns for this session was reached. Wrap up the current \
             task concisely: summarize progress, note any remaining steps, and avoid starting \
             new large sub-tasks.",
        ),
        LimitTrigger::SessionTokenLimit { current_tokens, limit } => format!(
            "The session token budget was exceeded ({} / {}). Summarize progress so far, drop \
             unnecessary context, and continue with a more compact approach.",
            format_thousands(*current_tokens),
            format_thousands(*limit)
        ),
        LimitTrigger::TurnBudgetExceeded { limit } => match limit {
            Some(limit) => format!(
                "This turn exceeded its budget of {} and was stopped. Continue with a narrower, \
                 more focused next step.",
                format_thousands(*limit)
            ),
            None => String::from(
                "This turn exceeded its budget and was stopped. Continue with a narrower, more \
                 focused next step.",
            ),
        },
    };
    if !snapshot.is_empty() {
        prompt.push_str("\n\nContext:\n");
        prompt.push_str(snapshot);
    }
    prompt
}

/// User-facing description of a limit trigger, for the `error` history
/// entry emitted alongside the recovery prompt.
pub fn limit_description(trigger: &LimitTrigger) -> String {
    match trigger {
        LimitTrigger::MaxSessionTurns => "Maximum session turns reached.".to_string(),
        LimitTrigger::SessionTokenLimit { current_tokens, limit } => format!(
            "Session token limit exceeded: {} / {}. Consider starting a new session, \
             compressing the conversation, or narrowing the current task.",
            format_thousands(*current_tokens),
            format_thousands(*limit)
        ),
        LimitTrigger::TurnBudgetExceeded { limit } => match limit {
            Some(limit) => format!("Turn budget of {} exceeded.", format_thousands(*limit)),
            None => "Turn budget exceeded.".to_string(),
        },
    }
}

fn format_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    let bytes = digits.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 && (bytes.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(*b as char);
    }
    out
}

/// Finish-reason-specific guidance (spec.md §4.3's finish recovery table).
fn finish_guidance(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::MaxTokens => {
            "Resume from the last complete point; prefer shorter outputs and split long replies \
             across multiple turns."
        }
        FinishReason::MalformedFunctionCall => {
            "Audit the arguments of the last tool call, correct the schema, and retry."
        }
        FinishReason::Safety
        | FinishReason::ProhibitedContent
        | FinishReason::Blocklist
        | FinishReason::ImageSafety => {
            "Reframe the response, offer a compliant alternative, and avoid blocked terms."
        }
        FinishReason::Recitation => {
            "Summarize the material in original wording and keep any excerpts short."
        }
        _ => "Clarify what blocked completion and adjust the strategy accordingly.",
    }
}

/// Finish recovery prompt (category: finish).
pub fn finish_recovery_prompt(reason: FinishReason, snapshot: &str) -> String {
    let mut prompt = format!(
        "The model stopped early with finish reason {:?}. {}",
        reason,
        finish_guidance(reason)
    );
    if !snapshot.is_empty() {
        prompt.push_str("\n\nContext:\n");
        prompt.push_str(snapshot);
    }
    prompt
}

/// Provider-failure recovery prompt (category: provider).
pub fn provider_recovery_prompt(
    attempts: u32,
    error_codes: &[String],
    last_error: &str,
    snapshot: &str,
) -> String {
    let mut prompt = format!(
        "The model provider failed after {attempts} attempt(s) ({}): {last_error}. Retry the \
         request, and if the same failure recurs, consider an alternative approach.",
        error_codes.join(", ")
    );
    if !snapshot.is_empty() {
        prompt.push_str("\n\nContext:\n");
        prompt.push_str(snapshot);
    }
    prompt
}
