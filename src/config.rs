//! Recognized configuration keys (SPEC_FULL.md §6, §10.3).
//!
//! Mirrors `vtcode_core::config::core::agent::AgentConfig`: a
//! `serde`-deserializable struct with a `#[serde(default = "...")]` per
//! field, loaded once by the host application and passed to the
//! controller at construction. The controller never reads environment
//! variables itself.

use serde::{Deserialize, Serialize};

fn default_stream_retry_limit() -> u32 {
    3
}
fn default_auto_recovery_max_attempts() -> u32 {
    1
}
fn default_loop_recovery_max_attempts() -> u32 {
    1
}
fn default_provider_recovery_max_attempts() -> u32 {
    1
}
fn default_limit_recovery_max_attempts() -> u32 {
    1
}
fn default_finish_recovery_max_attempts() -> u32 {
    1
}
fn default_split_buffer_threshold() -> usize {
    4_000
}
fn default_recovery_cooldown_secs() -> u64 {
    0
}

/// Per-category attempt ceilings for the recovery subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryLimits {
    #[serde(default = "default_stream_retry_limit")]
    pub stream_retry_limit: u32,
    #[serde(default = "default_auto_recovery_max_attempts")]
    pub auto_recovery_max_attempts: u32,
    #[serde(default = "default_loop_recovery_max_attempts")]
    pub loop_recovery_max_attempts: u32,
    #[serde(default = "default_provider_recovery_max_attempts")]
    pub provider_recovery_max_attempts: u32,
    #[serde(default = "default_limit_recovery_max_attempts")]
    pub limit_recovery_max_attempts: u32,
    #[serde(default = "default_finish_recovery_max_attempts")]
    pub finish_recovery_max_attempts: u32,
}

impl Default for RecoveryLimits {
    fn default() -> Self {
        Self {
            stream_retry_limit: default_stream_retry_limit(),
            auto_recovery_max_attempts: default_auto_recovery_max_attempts(),
            loop_recovery_max_attempts: default_loop_recovery_max_attempts(),
            provider_recovery_max_attempts: default_provider_recovery_max_attempts(),
            limit_recovery_max_attempts: default_limit_recovery_max_attempts(),
            finish_recovery_max_attempts: default_finish_recovery_max_attempts(),
        }
    }
}

/// Approval policy governing when a tool call must pass through
/// `awaiting_approval` before executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Ask before every mutating tool call.
    #[default]
    Default,
    /// Never ask; run mutating tools immediately.
    Yolo,
}

impl ApprovalMode {
    pub fn requires_confirmation(self, tool_name: &str, mutating_tools: &[&str]) -> bool {
        match self {
            Self::Yolo => false,
            Self::Default => mutating_tools.contains(&tool_name),
        }
    }
}

/// Top-level configuration recognized by the assistant turn controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtcConfig {
    #[serde(default)]
    pub recovery_limits: RecoveryLimits,

    /// Maximum number of conversation turns before `MaxSessionTurns` fires.
    pub max_session_turns: Option<u64>,

    /// Maximum cumulative session token budget before
    /// `SessionTokenLimitExceeded` fires.
    pub session_token_limit: Option<u64>,

    #[serde(default)]
    pub checkpointing_enabled: bool,

    #[serde(default)]
    pub approval_mode: ApprovalMode,

    /// Character count at which the assistant content buffer is
    /// considered for a safe-boundary split (SPEC_FULL.md §9).
    #[serde(default = "default_split_buffer_threshold")]
    pub split_buffer_threshold: usize,

    /// Cooldown between successive recovery-prompt user notices
    /// (SPEC_FULL.md §10.5). Zero disables the cooldown.
    #[serde(default = "default_recovery_cooldown_secs")]
    pub recovery_cooldown_secs: u64,
}

impl Default for AtcConfig {
    fn default() -> Self {
        Self {
            recovery_limits: RecoveryLimits::default(),
            max_session_turns: None,
            session_token_limit: None,
            checkpointing_enabled: true,
            approval_mode: ApprovalMode::default(),
            split_buffer_threshold: default_split_buffer_threshold(),
            recovery_cooldown_secs: default_recovery_cooldown_secs(),
        }
    }
}

/// Tool names whose `awaiting_approval` transition triggers a checkpoint.
pub const MUTATING_TOOLS: &[&str] = &["edit", "write_file"];
