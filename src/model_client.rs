//! Model-client stream event union and the `ModelClient` collaborator
//! trait (SPEC_FULL.md §6, §4.3).
//!
//! Modeled on `vtcode_core::llm::provider::{LLMStreamEvent, FinishReason}`,
//! widened to the full set spec.md's dispatch table requires.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::TurnError;
use crate::tool_call::{ResponsePart, ToolCallRequest};

/// Reason the model stopped generating, widened from
/// `vtcode_core::llm::provider::FinishReason` to the full enumeration
/// spec.md §6 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    FinishReasonUnspecified,
    Stop,
    MaxTokens,
    Safety,
    Recitation,
    Language,
    Blocklist,
    ProhibitedContent,
    Spii,
    Other,
    MalformedFunctionCall,
    ImageSafety,
    UnexpectedToolCall,
}

impl FinishReason {
    /// Only these reasons trigger finish recovery (spec.md §4.3's Finish
    /// recovery table); everything else (including `STOP`) is benign.
    pub fn triggers_finish_recovery(self) -> bool {
        matches!(
            self,
            Self::MaxTokens
                | Self::MalformedFunctionCall
                | Self::Safety
                | Self::ProhibitedContent
                | Self::Recitation
                | Self::Blocklist
                | Self::ImageSafety
                | Self::Other
        )
    }
}

/// The typed stream-event union the model client produces.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Thought { summary: String },
    Content(String),
    ToolCallRequest(ToolCallRequest),
    UserCancelled,
    Error { error: String, message: String },
    ChatCompressed { original_token_count: Option<u64>, new_token_count: Option<u64> },
    MaxSessionTurns,
    SessionTokenLimitExceeded { current_tokens: u64, limit: u64, message: Option<String> },
    TurnBudgetExceeded { limit: Option<u64> },
    Finished(FinishReason),
    LoopDetected,
    Retry,
    /// Owned by the scheduler; the dispatcher no-ops on these.
    ToolCallConfirmation,
    /// Owned by the scheduler; the dispatcher no-ops on these.
    ToolCallResponse,
}

/// Payload handed to the model client for a turn or continuation.
#[derive(Debug, Clone)]
pub enum ModelPayload {
    Text(String),
    ToolResults(Vec<ResponsePart>),
}

pub type TurnEventStream = Pin<Box<dyn Stream<Item = Result<TurnEvent, TurnError>> + Send>>;

/// External collaborator that turns a payload into a stream of
/// [`TurnEvent`]s (SPEC_FULL.md §2's "Model Client").
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(
        &self,
        payload: ModelPayload,
        cancellation: CancellationToken,
    ) -> Result<TurnEventStream, TurnError>;

    /// Best-effort reset of the client's own chat state, invoked by
    /// provider-failure recovery before it queues a continuation.
    async fn reset_chat(&self) -> Result<(), TurnError>;

    /// Inject a synthetic user-role message carrying the response parts of
    /// an all-cancelled tool batch into the client's own conversation
    /// history, per spec.md §4.2 item 2.
    fn inject_cancelled_batch(&self, parts: Vec<ResponsePart>);

    /// A point-in-time snapshot of the client's own wire-format
    /// conversation buffer, used to populate a checkpoint's
    /// `client_history` field (SPEC_FULL.md §4.2). Clients that keep no
    /// separate buffer from the shared [`crate::history::HistoryStore`]
    /// may return an empty array.
    fn conversation_snapshot(&self) -> serde_json::Value;
}
