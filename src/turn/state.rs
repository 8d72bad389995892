//! Turn state and the single pending-recovery slot (spec.md §3's "Turn
//! state" / "Pending recovery").

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Coarse phase of the turn state machine (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Preflight,
    Streaming,
    Draining,
    RecoveryDecision,
    Cancelled,
}

/// Observable `streaming_state` (spec.md §4.1's public contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    Idle,
    Responding,
    WaitingForConfirmation,
}

/// Flags carried by a continuation so it does not zero out the ceilings
/// its parent turn already raised (spec.md §3's "Pending recovery").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipResetFlags {
    pub skip_loop_reset: bool,
    pub skip_provider_reset: bool,
    pub skip_limit_reset: bool,
    pub skip_finish_reset: bool,
}

/// A queued recovery continuation, consumed exactly once at turn teardown.
#[derive(Debug, Clone)]
pub struct PendingRecovery {
    pub prompt_id: String,
    pub query_text: String,
    pub timestamp: DateTime<Utc>,
    pub is_continuation: bool,
    pub skip_reset_flags: SkipResetFlags,
}

/// Options accepted by `submit_query` (spec.md §4.1's public contract).
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub is_continuation: bool,
    pub skip_loop_reset: bool,
    pub skip_provider_reset: bool,
    pub skip_limit_reset: bool,
    pub skip_finish_reset: bool,
}

/// Per-turn counters and the single pending-recovery slot. Scoped to one
/// user-originated turn; persists across the recovery continuations it
/// spawns (spec.md §3's "Turn state").
pub struct TurnState {
    pub turn_id: String,
    pub cancellation_token: CancellationToken,
    pub retry_attempts: u32,
    pub auto_recovery_attempts: u32,
    pub loop_recovery_attempts: u32,
    pub provider_recovery_attempts: u32,
    pub limit_recovery_attempts: u32,
    pub finish_recovery_attempts: u32,
    pub pending_recovery: Option<PendingRecovery>,
    pub loop_detected_flag: bool,
}

impl TurnState {
    pub fn new(turn_id: impl Into<String>) -> Self {
        Self {
            turn_id: turn_id.into(),
            cancellation_token: CancellationToken::new(),
            retry_attempts: 0,
            auto_recovery_attempts: 0,
            loop_recovery_attempts: 0,
            provider_recovery_attempts: 0,
            limit_recovery_attempts: 0,
            finish_recovery_attempts: 0,
            pending_recovery: None,
            loop_detected_flag: false,
        }
    }

    /// Counter reset policy on entering a non-continuation turn
    /// (spec.md §4.1): `retry_attempts`/`auto_recovery_attempts` always
    /// reset; the other four reset unless their `skip_*_reset` flag is set.
    /// Continuations never reset anything.
    pub fn apply_reset_policy(&mut self, options: &SubmitOptions) {
        if options.is_continuation {
            return;
        }
        self.retry_attempts = 0;
        self.auto_recovery_attempts = 0;
        if !options.skip_loop_reset {
            self.loop_recovery_attempts = 0;
        }
        if !options.skip_provider_reset {
            self.provider_recovery_attempts = 0;
        }
        if !options.skip_limit_reset {
            self.limit_recovery_attempts = 0;
        }
        if !options.skip_finish_reset {
            self.finish_recovery_attempts = 0;
        }
    }

    /// First-writer-wins: if a pending recovery is already queued, a later
    /// attempt in the same turn is dropped (spec.md §9's tie-breaking
    /// resolution).
    pub fn queue_recovery_if_absent(&mut self, recovery: PendingRecovery) -> bool {
        if self.pending_recovery.is_some() {
            return false;
        }
        self.pending_recovery = Some(recovery);
        true
    }

    pub fn take_pending_recovery(&mut self) -> Option<PendingRecovery> {
        self.pending_recovery.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_never_resets_counters() {
        let mut state = TurnState::new("t1");
        state.retry_attempts = 2;
        state.loop_recovery_attempts = 1;
        state.apply_reset_policy(&SubmitOptions {
            is_continuation: true,
            ..Default::default()
        });
        assert_eq!(state.retry_attempts, 2);
        assert_eq!(state.loop_recovery_attempts, 1);
    }

    #[test]
    fn non_continuation_resets_unless_skipped() {
        let mut state = TurnState::new("t1");
        state.retry_attempts = 2;
        state.loop_recovery_attempts = 1;
        state.provider_recovery_attempts = 1;
        state.apply_reset_policy(&SubmitOptions {
            is_continuation: false,
            skip_loop_reset: true,
            ..Default::default()
        });
        assert_eq!(state.retry_attempts, 0);
        assert_eq!(state.loop_recovery_attempts, 1, "skip flag preserves it");
        assert_eq!(state.provider_recovery_attempts, 0);
    }

    #[test]
    fn first_writer_wins_for_pending_recovery() {
        let mut state = TurnState::new("t1");
        let first = PendingRecovery {
            prompt_id: "p1".into(),
            query_text: "first".into(),
            timestamp: Utc::now(),
            is_continuation: true,
            skip_reset_flags: SkipResetFlags::default(),
        };
        let second = PendingRecovery {
            query_text: "second".into(),
            ..first.clone()
        };
        assert!(state.queue_recovery_if_absent(first));
        assert!(!state.queue_recovery_if_absent(second));
        assert_eq!(state.pending_recovery.unwrap().query_text, "first");
    }
}
