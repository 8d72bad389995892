//! Tool-call request/tracking types (SPEC_FULL.md §3).

use serde::{Deserialize, Serialize};

/// A tool-call request as issued by the model (or, for
/// `client_initiated = true`, synthesized by the host application itself).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub prompt_id: String,
    pub client_initiated: bool,
}

/// A single part of a tool's model-addressable response payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponsePart {
    pub call_id: String,
    pub name: String,
    pub content: serde_json::Value,
}

/// Lifecycle status of a tracked tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Validating,
    Scheduled,
    AwaitingApproval,
    Executing,
    Success,
    Error,
    Cancelled,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Scheduled => "scheduled",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A tool-call request plus its scheduler-tracked lifecycle state
/// (SPEC_FULL.md §3's "Tracked tool call").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedToolCall {
    pub request: ToolCallRequest,
    pub status: ToolCallStatus,
    pub response: Option<Vec<ResponsePart>>,
    pub response_submitted: bool,
}

impl TrackedToolCall {
    pub fn new(request: ToolCallRequest) -> Self {
        Self {
            request,
            status: ToolCallStatus::Validating,
            response: None,
            response_submitted: false,
        }
    }

    /// Invariant 2: terminal and not yet forwarded.
    pub fn is_ripe(&self) -> bool {
        self.status.is_terminal() && !self.response_submitted
    }

    /// True while this call still blocks `streaming_state` from settling:
    /// either it hasn't reached a terminal state yet, or it has but the
    /// result has not been forwarded to the model yet.
    pub fn is_ripe_or_pending_forward(&self) -> bool {
        !self.status.is_terminal() || !self.response_submitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ToolCallRequest {
        ToolCallRequest {
            call_id: "c1".into(),
            name: "read_file".into(),
            arguments: serde_json::json!({}),
            prompt_id: "p1".into(),
            client_initiated: false,
        }
    }

    #[test]
    fn ripe_only_when_terminal_and_unsubmitted() {
        let mut call = TrackedToolCall::new(request());
        assert!(!call.is_ripe());
        call.status = ToolCallStatus::Success;
        assert!(call.is_ripe());
        call.response_submitted = true;
        assert!(!call.is_ripe());
    }
}
