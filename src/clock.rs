//! Clock & identifier source.
//!
//! Supplies monotonic timestamps and fresh prompt/call identifiers to the
//! rest of the crate. Kept as a trait so tests can drive deterministic
//! timestamps instead of `Utc::now()`.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Source of wall-clock timestamps for history entries and checkpoints.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Default clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Recovery prompt categories, used to format recovery prompt ids.
///
/// `Auto` covers stream-stall recovery. SPEC_FULL.md §9 resolves the
/// otherwise-unnamed suffix for this category as `stall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryCategory {
    Auto,
    Loop,
    Provider,
    Limit(LimitKind),
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    MaxSessionTurns,
    SessionTokenLimit,
    TurnBudget,
}

impl RecoveryCategory {
    fn suffix(self) -> &'static str {
        match self {
            Self::Auto => "stall",
            Self::Loop => "loop",
            Self::Provider => "provider",
            Self::Limit(LimitKind::MaxSessionTurns) => "turn-limit",
            Self::Limit(LimitKind::SessionTokenLimit) => "token-limit",
            Self::Limit(LimitKind::TurnBudget) => "turn-budget",
            Self::Finish => "finish",
        }
    }
}

/// Generates prompt ids of the shape `${session_id}########${prompt_count}`
/// for user turns, and `${parent_prompt_id}-{category}-recovery-${attempt}`
/// for recovery continuations.
pub struct IdGenerator {
    session_id: String,
    prompt_counter: AtomicU64,
    call_counter: AtomicU64,
}

impl IdGenerator {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            prompt_counter: AtomicU64::new(0),
            call_counter: AtomicU64::new(0),
        }
    }

    /// Allocate the next user-originated prompt id.
    pub fn next_user_prompt_id(&self) -> String {
        let count = self.prompt_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}########{}", self.session_id, count)
    }

    /// Build a recovery-continuation prompt id from its parent.
    pub fn recovery_prompt_id(
        &self,
        parent_prompt_id: &str,
        category: RecoveryCategory,
        attempt: u32,
    ) -> String {
        format!(
            "{}-{}-recovery-{}",
            parent_prompt_id,
            category.suffix(),
            attempt
        )
    }

    /// Allocate a fresh tool-call id, unique within this process lifetime.
    pub fn next_call_id(&self) -> String {
        let count = self.call_counter.fetch_add(1, Ordering::SeqCst);
        format!("call_{}_{}", self.session_id, count)
    }
}
