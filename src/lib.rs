//! Assistant Turn Controller: the orchestration core of an interactive
//! command-line coding assistant's single conversational turn.
//!
//! The controller takes a user prompt, streams model output through a
//! [`model_client::ModelClient`], dispatches tool calls through a
//! [`scheduler::ToolScheduler`], and detects and recovers from stream
//! stalls, tool loops, provider outages, turn/token budget exhaustion, and
//! early-termination finish reasons by synthesizing a corrective prompt and
//! re-entering the turn. See [`turn::AssistantTurnController`] for the
//! entry point.

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod error;
pub mod history;
pub mod model_client;
pub mod recovery;
pub mod scheduler;
pub mod splitting;
pub mod stats;
pub mod tool_call;
pub mod turn;

pub use checkpoint::{CheckpointRequest, CheckpointWriter, DefaultCheckpointWriter};
pub use clock::{Clock, IdGenerator, SystemClock};
pub use config::{ApprovalMode, AtcConfig, RecoveryLimits};
pub use error::TurnError;
pub use history::{HistoryEntry, HistoryEntryKind, HistoryId, HistoryStore};
pub use model_client::{FinishReason, ModelClient, ModelPayload, TurnEvent, TurnEventStream};
pub use scheduler::{ConversationSnapshot, InMemoryToolScheduler, ToolExecutor, ToolScheduler};
pub use stats::TurnStats;
pub use tool_call::{ResponsePart, ToolCallRequest, ToolCallStatus, TrackedToolCall};
pub use turn::{AssistantTurnController, StreamingState, SubmitOptions, TurnPhase};
