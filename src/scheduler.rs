//! Tool scheduler handshake (SPEC_FULL.md §4.2).
//!
//! Grounded on `vtcode_core::orchestrator::scheduler::Scheduler` (a queue
//! wrapped in a tokio mutex) and
//! `vtcode_core::core::agent::runner::tool_exec` (per-call execution,
//! loop-detector throttling, rate-limit halts). Each scheduled call runs on
//! its own task; approval-gated calls block on a oneshot channel that the
//! host resolves via [`InMemoryToolScheduler::approve`] /
//! [`InMemoryToolScheduler::deny`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::{checkpoint_best_effort, CheckpointRequest, CheckpointWriter};
use crate::config::ApprovalMode;
use crate::error::TurnError;
use crate::tool_call::{ResponsePart, ToolCallRequest, ToolCallStatus};

/// A point-in-time view of the conversation, handed to the scheduler
/// alongside a batch so its checkpoint step can snapshot real history
/// instead of an empty stand-in (spec.md §4.2's checkpoint policy reads
/// "the current conversation history").
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub history: Value,
    pub client_history: Value,
}

impl ConversationSnapshot {
    pub fn empty() -> Self {
        Self {
            history: serde_json::json!([]),
            client_history: serde_json::json!([]),
        }
    }
}

/// Per-call executor supplied by the host application.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &ToolCallRequest,
        cancellation: CancellationToken,
    ) -> Result<Value, String>;
}

/// Outcome of one completed call, delivered to the scheduler's completion
/// callback (SPEC_FULL.md §4.2's "batch-level completion").
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub call_id: String,
    pub name: String,
    pub status: ToolCallStatus,
    pub response: ResponsePart,
}

/// Fired once every call in a scheduled batch has reached a terminal state.
pub type CompletionCallback = Arc<dyn Fn(Vec<ToolCallOutcome>) + Send + Sync>;

/// Scheduler handshake surface consumed by the turn controller.
#[async_trait]
pub trait ToolScheduler: Send + Sync {
    /// Schedule a batch of calls; `on_complete` fires exactly once, after
    /// the last call in the batch reaches a terminal status. `snapshot` is
    /// the conversation state as of dispatch, used to populate the
    /// checkpoint written before an approval-gated mutating call executes.
    async fn schedule(
        &self,
        requests: Vec<ToolCallRequest>,
        snapshot: ConversationSnapshot,
        on_complete: CompletionCallback,
    );

    /// Resolve an `awaiting_approval` call as approved and let it proceed
    /// to execution.
    fn approve(&self, call_id: &str);

    /// Resolve an `awaiting_approval` call as denied; it completes with a
    /// cancelled status without ever executing.
    fn deny(&self, call_id: &str);

    /// Cancel every call still in flight for the current generation.
    /// Already-terminal calls are unaffected.
    fn reset(&self);

    /// True while at least one tracked call is blocked in
    /// `awaiting_approval` (spec.md §4.1: `streaming_state` is
    /// `WaitingForConfirmation` iff any tracked call is in this state).
    fn has_awaiting_approval(&self) -> bool;

    /// Record that the controller has forwarded these calls' responses
    /// upstream (spec.md §4.2). Calls already marked submitted are
    /// idempotent no-ops.
    fn mark_submitted(&self, call_ids: &[String]);
}

struct PendingApproval {
    resolve: Option<oneshot::Sender<bool>>,
}

struct BatchState {
    remaining: usize,
    outcomes: Vec<ToolCallOutcome>,
    on_complete: CompletionCallback,
}

/// Shared scheduler state, held behind an `Arc` so that per-call tasks can
/// outlive the stack frame that spawned them.
struct Inner {
    executor: Arc<dyn ToolExecutor>,
    checkpoint_writer: Arc<dyn CheckpointWriter>,
    approval_mode: ApprovalMode,
    mutating_tools: Vec<String>,
    workspace_root: std::path::PathBuf,
    approvals: Mutex<HashMap<String, PendingApproval>>,
    batches: Mutex<HashMap<u64, Arc<Mutex<BatchState>>>>,
    next_batch_id: Mutex<u64>,
    cancellation: Mutex<CancellationToken>,
    submitted: Mutex<HashSet<String>>,
}

impl Inner {
    fn requires_approval(&self, name: &str) -> bool {
        let names: Vec<&str> = self.mutating_tools.iter().map(|s| s.as_str()).collect();
        self.approval_mode.requires_confirmation(name, &names)
    }

    fn record_outcome(&self, batch_id: u64, outcome: ToolCallOutcome) {
        let batch = {
            let batches = self.batches.lock();
            match batches.get(&batch_id) {
                Some(b) => b.clone(),
                None => return,
            }
        };

        let maybe_complete = {
            let mut state = batch.lock();
            state.outcomes.push(outcome);
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining == 0 {
                Some((state.outcomes.clone(), state.on_complete.clone()))
            } else {
                None
            }
        };

        if let Some((outcomes, on_complete)) = maybe_complete {
            self.batches.lock().remove(&batch_id);
            on_complete(outcomes);
        }
    }

    async fn run_call(
        self: Arc<Self>,
        request: ToolCallRequest,
        batch_id: u64,
        token: CancellationToken,
        snapshot: Arc<ConversationSnapshot>,
    ) {
        let call_id = request.call_id.clone();
        let name = request.name.clone();

        if token.is_cancelled() {
            self.record_outcome(batch_id, cancelled_outcome(call_id, name));
            return;
        }

        if self.requires_approval(&name) {
            let file_path = request
                .arguments
                .get("file_path")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            checkpoint_best_effort(
                self.checkpoint_writer.as_ref(),
                CheckpointRequest {
                    history: snapshot.history.clone(),
                    client_history: snapshot.client_history.clone(),
                    tool_name: name.clone(),
                    tool_args: request.arguments.clone(),
                    file_path,
                    workspace_root: self.workspace_root.clone(),
                },
            )
            .await;

            let (tx, rx) = oneshot::channel();
            self.approvals
                .lock()
                .insert(call_id.clone(), PendingApproval { resolve: Some(tx) });

            let approved = tokio::select! {
                result = rx => result.unwrap_or(false),
                _ = token.cancelled() => false,
            };
            self.approvals.lock().remove(&call_id);

            if !approved {
                info!(call_id = %call_id, name = %name, "tool call denied or cancelled during approval");
                self.record_outcome(batch_id, cancelled_outcome(call_id, name));
                return;
            }
        }

        let result = self.executor.execute(&request, token.clone()).await;
        let (status, content) = match result {
            Ok(value) => (ToolCallStatus::Success, value),
            Err(message) => {
                warn!(call_id = %call_id, name = %name, error = %message, "tool call failed");
                (ToolCallStatus::Error, serde_json::json!({"error": message}))
            }
        };

        self.record_outcome(
            batch_id,
            ToolCallOutcome {
                call_id: call_id.clone(),
                name: name.clone(),
                status,
                response: ResponsePart {
                    call_id,
                    name,
                    content,
                },
            },
        );
    }
}

fn cancelled_outcome(call_id: String, name: String) -> ToolCallOutcome {
    ToolCallOutcome {
        call_id: call_id.clone(),
        name: name.clone(),
        status: ToolCallStatus::Cancelled,
        response: ResponsePart {
            call_id,
            name,
            content: serde_json::json!({"cancelled": true}),
        },
    }
}

/// In-process scheduler: each call runs as its own tokio task, with a
/// shared approval-gate table and a per-batch remaining-counter.
#[derive(Clone)]
pub struct InMemoryToolScheduler {
    inner: Arc<Inner>,
}

impl InMemoryToolScheduler {
    pub fn new(
        executor: Arc<dyn ToolExecutor>,
        checkpoint_writer: Arc<dyn CheckpointWriter>,
        approval_mode: ApprovalMode,
        mutating_tools: &[&str],
        workspace_root: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                checkpoint_writer,
                approval_mode,
                mutating_tools: mutating_tools.iter().map(|s| s.to_string()).collect(),
                workspace_root: workspace_root.into(),
                approvals: Mutex::new(HashMap::new()),
                batches: Mutex::new(HashMap::new()),
                next_batch_id: Mutex::new(0),
                cancellation: Mutex::new(CancellationToken::new()),
                submitted: Mutex::new(HashSet::new()),
            }),
        }
    }
}

#[async_trait]
impl ToolScheduler for InMemoryToolScheduler {
    async fn schedule(
        &self,
        requests: Vec<ToolCallRequest>,
        snapshot: ConversationSnapshot,
        on_complete: CompletionCallback,
    ) {
        if requests.is_empty() {
            on_complete(Vec::new());
            return;
        }

        let batch_id = {
            let mut next = self.inner.next_batch_id.lock();
            let id = *next;
            *next += 1;
            id
        };

        let state = Arc::new(Mutex::new(BatchState {
            remaining: requests.len(),
            outcomes: Vec::with_capacity(requests.len()),
            on_complete,
        }));
        self.inner.batches.lock().insert(batch_id, state);

        let token = self.inner.cancellation.lock().clone();
        let snapshot = Arc::new(snapshot);

        for request in requests {
            info!(call_id = %request.call_id, name = %request.name, "scheduling tool call");
            let inner = Arc::clone(&self.inner);
            let call_token = token.clone();
            let call_snapshot = Arc::clone(&snapshot);
            tokio::spawn(async move {
                inner.run_call(request, batch_id, call_token, call_snapshot).await;
            });
        }
    }

    fn approve(&self, call_id: &str) {
        if let Some(pending) = self.inner.approvals.lock().get_mut(call_id) {
            if let Some(tx) = pending.resolve.take() {
                let _ = tx.send(true);
            }
        }
    }

    fn deny(&self, call_id: &str) {
        if let Some(pending) = self.inner.approvals.lock().get_mut(call_id) {
            if let Some(tx) = pending.resolve.take() {
                let _ = tx.send(false);
            }
        }
    }

    fn reset(&self) {
        let mut token = self.inner.cancellation.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    fn has_awaiting_approval(&self) -> bool {
        !self.inner.approvals.lock().is_empty()
    }

    fn mark_submitted(&self, call_ids: &[String]) {
        let mut submitted = self.inner.submitted.lock();
        for call_id in call_ids {
            submitted.insert(call_id.clone());
        }
    }
}
