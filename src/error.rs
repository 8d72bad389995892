//! Error taxonomy for the turn controller and its collaborators.
//!
//! Every failure mode the assistant turn controller reacts to is a named
//! variant here rather than a duck-typed shape or an exception type, per
//! the re-architecting notes in SPEC_FULL.md §9.

use thiserror::Error;

/// Errors surfaced by the model client, tool scheduler, or checkpoint writer
/// at the boundary the [`crate::turn::AssistantTurnController`] observes.
#[derive(Debug, Error, Clone)]
pub enum TurnError {
    /// The model endpoint exhausted its own retry budget before giving up.
    #[error("provider retry exhausted after {attempts} attempt(s): {error_codes:?}: {last_error}")]
    ProviderRetryExhausted {
        attempts: u32,
        error_codes: Vec<String>,
        last_error: String,
    },

    /// Authentication with the model endpoint failed; not auto-recoverable.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// The turn was cancelled; callers should treat this as a silent abort.
    #[error("turn cancelled")]
    Cancelled,

    /// The tool scheduler reported a failure outside the normal tool-call
    /// lifecycle (e.g. it could not accept a batch at all).
    #[error("tool scheduler error: {0}")]
    Scheduler(String),

    /// The checkpoint writer failed. Per spec this never aborts the
    /// triggering tool call; it is surfaced here only so the caller can log.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Any other error surfaced by the model client.
    #[error("model error: {0}")]
    Model(String),
}

impl TurnError {
    /// True for the single duck-typed shape SPEC_FULL.md replaces with a
    /// real variant: "attempts" + "error_codes" retry-exhausted errors.
    pub fn is_provider_retry_exhausted(&self) -> bool {
        matches!(self, Self::ProviderRetryExhausted { .. })
    }
}
