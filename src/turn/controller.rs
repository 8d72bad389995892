//! Assistant Turn Controller (spec.md §4.1) — the orchestration core.
//!
//! Modeled on `vtcode_core::core::agent::session::controller::AgentSessionController`'s
//! `run_turn` loop: a single-writer event loop guarded by an in-flight
//! flag, with shared mutable state behind async-aware mutexes rather than
//! closure-captured cells.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{info, instrument, warn};

use crate::clock::{Clock, IdGenerator, LimitKind, RecoveryCategory};
use crate::config::AtcConfig;
use crate::error::TurnError;
use crate::history::{HistoryEntryKind, HistoryStore, Pending};
use crate::model_client::{FinishReason, ModelClient, ModelPayload, TurnEvent};
use crate::recovery::planner::{self, LimitTrigger};
use crate::recovery::snapshot::build_recovery_snapshot;
use crate::scheduler::{CompletionCallback, ConversationSnapshot, ToolCallOutcome, ToolScheduler};
use crate::stats::TurnStats;
use crate::tool_call::{ResponsePart, ToolCallRequest, ToolCallStatus, TrackedToolCall};

use super::state::{PendingRecovery, SkipResetFlags, StreamingState, SubmitOptions, TurnPhase, TurnState};

const SAVE_MEMORY_TOOL: &str = "save_memory";
const SAVE_MEMORY_DEDUP_CAPACITY: usize = 4_096;

/// Outcome of consuming one model-client stream to its end.
enum StreamOutcome {
    Completed,
    Cancelled,
    RetryLimitExceeded,
    LoopDetected,
    LimitExceeded,
    Finished(FinishReason),
    Errored,
}

/// What the draining phase decided to do next.
enum NextStep {
    Continuation { payload: ModelPayload, options: SubmitOptions, prompt_id: String },
    Idle,
}

/// Bounded insertion-order dedup set, used for the `save_memory`
/// processed-call-id table (spec.md §9 Open Question: capped rather than
/// left to grow unbounded for the life of a session).
struct BoundedSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl BoundedSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity,
        }
    }

    /// Returns true if `key` was newly inserted (i.e. not already present).
    fn insert_if_absent(&mut self, key: String) -> bool {
        if self.members.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.members.insert(key);
        true
    }
}

/// Orchestrates a single turn and the automatic-recovery continuations it
/// may spawn (spec.md §2's "Assistant Turn Controller").
pub struct AssistantTurnController {
    history: AsyncMutex<HistoryStore>,
    turn_state: AsyncMutex<Option<TurnState>>,
    config: AtcConfig,
    model_client: Arc<dyn ModelClient>,
    scheduler: Arc<dyn ToolScheduler>,
    clock: Arc<dyn Clock>,
    ids: IdGenerator,
    is_submitting_query: AtomicBool,
    model_switched_from_quota_error: AtomicBool,
    processed_save_memory: AsyncMutex<BoundedSet>,
    thought: AsyncMutex<Option<String>>,
    phase: AsyncMutex<TurnPhase>,
    stats: AsyncMutex<TurnStats>,
    last_recovery_notice_at: AsyncMutex<Option<chrono::DateTime<chrono::Utc>>>,
    on_auth_error: Arc<dyn Fn() + Send + Sync>,
    on_memory_refresh: Arc<dyn Fn(String) + Send + Sync>,
}

impl AssistantTurnController {
    pub fn new(
        model_client: Arc<dyn ModelClient>,
        scheduler: Arc<dyn ToolScheduler>,
        clock: Arc<dyn Clock>,
        config: AtcConfig,
        session_id: impl Into<String>,
        on_auth_error: Arc<dyn Fn() + Send + Sync>,
        on_memory_refresh: Arc<dyn Fn(String) + Send + Sync>,
    ) -> Self {
        Self {
            history: AsyncMutex::new(HistoryStore::new()),
            turn_state: AsyncMutex::new(None),
            config,
            model_client,
            scheduler,
            clock,
            ids: IdGenerator::new(session_id),
            is_submitting_query: AtomicBool::new(false),
            model_switched_from_quota_error: AtomicBool::new(false),
            processed_save_memory: AsyncMutex::new(BoundedSet::new(SAVE_MEMORY_DEDUP_CAPACITY)),
            thought: AsyncMutex::new(None),
            phase: AsyncMutex::new(TurnPhase::Idle),
            stats: AsyncMutex::new(TurnStats::default()),
            last_recovery_notice_at: AsyncMutex::new(None),
            on_auth_error,
            on_memory_refresh,
        }
    }

    /// Current observable `streaming_state` (spec.md §4.1's public contract).
    pub async fn streaming_state(&self) -> StreamingState {
        if self.scheduler_has_awaiting_approval() {
            return StreamingState::WaitingForConfirmation;
        }
        if self.is_submitting_query.load(Ordering::SeqCst) {
            return StreamingState::Responding;
        }
        let history = self.history.lock().await;
        if history.has_unresolved_tool_calls() || !history.pending().is_none() {
            return StreamingState::Responding;
        }
        StreamingState::Idle
    }

    fn scheduler_has_awaiting_approval(&self) -> bool {
        self.scheduler.has_awaiting_approval()
    }

    /// Coarse turn-state-machine phase (spec.md §4.1), for hosts that want
    /// finer-grained introspection than `streaming_state`'s three-way
    /// summary.
    pub async fn turn_phase(&self) -> TurnPhase {
        *self.phase.lock().await
    }

    async fn set_phase(&self, phase: TurnPhase) {
        *self.phase.lock().await = phase;
    }

    /// Accumulated turn-execution statistics (SPEC_FULL.md §10.5).
    pub async fn turn_stats(&self) -> TurnStats {
        self.stats.lock().await.clone()
    }

    /// Host-facing snapshot of the full history, for rendering scrollback.
    pub async fn history_entries(&self) -> Vec<crate::history::HistoryEntry> {
        self.history.lock().await.entries().to_vec()
    }

    /// Latest `Thought` summary observed during streaming, if any.
    pub async fn current_thought(&self) -> Option<String> {
        self.thought.lock().await.clone()
    }

    /// Set by the host when it has already switched providers due to a
    /// quota error; the next tool-result batch will not be forwarded back
    /// to the model (spec.md §4.2 item 4).
    pub fn mark_model_switched_from_quota_error(&self) {
        self.model_switched_from_quota_error.store(true, Ordering::SeqCst);
    }

    /// Cancel the in-progress turn, if any (spec.md §4.1's public contract).
    /// A no-op outside `Responding`; idempotent within a turn.
    pub async fn cancel_ongoing(&self) {
        let mut state_guard = self.turn_state.lock().await;
        let Some(state) = state_guard.as_mut() else {
            return;
        };
        if state.cancellation_token.is_cancelled() {
            return;
        }
        state.cancellation_token.cancel();
        drop(state_guard);

        self.set_phase(TurnPhase::Cancelled).await;
        self.scheduler.reset();

        let mut history = self.history.lock().await;
        history.discard_pending();
        let clock = self.clock.clone();
        history.append(
            clock.as_ref(),
            HistoryEntryKind::Info {
                text: "Request cancelled".to_string(),
            },
        );
    }

    /// Submit a user (or continuation) query. Silently no-ops if a
    /// non-continuation turn is already in progress (spec.md §4.1).
    #[instrument(skip(self, query, options))]
    pub async fn submit_query(
        &self,
        query: String,
        options: SubmitOptions,
        prompt_id: Option<String>,
    ) {
        if !options.is_continuation
            && self.is_submitting_query.swap(true, Ordering::SeqCst)
        {
            info!("submit_query rejected: a turn is already in progress");
            return;
        }

        let mut payload = ModelPayload::Text(query);
        let mut options = options;
        let mut prompt_id = prompt_id;

        loop {
            let prompt_id_owned = prompt_id
                .clone()
                .unwrap_or_else(|| self.ids.next_user_prompt_id());

            match self.run_one_turn(payload, options, prompt_id_owned).await {
                NextStep::Continuation {
                    payload: next_payload,
                    options: next_options,
                    prompt_id: next_prompt_id,
                } => {
                    payload = next_payload;
                    options = next_options;
                    prompt_id = Some(next_prompt_id);
                }
                NextStep::Idle => break,
            }
        }

        self.is_submitting_query.store(false, Ordering::SeqCst);
    }

    async fn run_one_turn(
        &self,
        payload: ModelPayload,
        options: SubmitOptions,
        prompt_id: String,
    ) -> NextStep {
        let started = std::time::Instant::now();
        let result = self.run_one_turn_inner(payload, options, prompt_id).await;
        self.stats.lock().await.record_turn(started.elapsed());
        result
    }

    async fn run_one_turn_inner(
        &self,
        payload: ModelPayload,
        options: SubmitOptions,
        prompt_id: String,
    ) -> NextStep {
        self.set_phase(TurnPhase::Preflight).await;

        // Preflight: reject empty text payloads outright.
        if let ModelPayload::Text(text) = &payload {
            if text.trim().is_empty() {
                self.set_phase(TurnPhase::Idle).await;
                return NextStep::Idle;
            }
        }

        {
            let mut state_guard = self.turn_state.lock().await;
            let state = state_guard.get_or_insert_with(|| TurnState::new(prompt_id.clone()));
            state.apply_reset_policy(&options);
        }

        if let ModelPayload::Text(text) = &payload {
            let clock = self.clock.clone();
            let mut history = self.history.lock().await;
            history.append(clock.as_ref(), HistoryEntryKind::User { text: text.clone() });
        }

        let cancellation = {
            let state_guard = self.turn_state.lock().await;
            state_guard.as_ref().unwrap().cancellation_token.clone()
        };

        self.set_phase(TurnPhase::Streaming).await;
        let stream = match self.model_client.stream(payload, cancellation.clone()).await {
            Ok(stream) => stream,
            Err(err) => {
                return self.handle_stream_setup_error(err).await;
            }
        };

        let (outcome, tool_batch) = self.consume_stream(stream, cancellation.clone()).await;

        self.drain_turn(outcome, tool_batch).await
    }

    async fn handle_stream_setup_error(&self, err: TurnError) -> NextStep {
        match err {
            TurnError::Unauthorized { .. } => {
                (self.on_auth_error)();
                NextStep::Idle
            }
            TurnError::Cancelled => NextStep::Idle,
            TurnError::ProviderRetryExhausted {
                attempts,
                error_codes,
                last_error,
            } => {
                self.handle_provider_failure(attempts, error_codes, last_error)
                    .await;
                self.resolve_recovery_decision().await
            }
            other => {
                self.emit_error(format!("{other}")).await;
                NextStep::Idle
            }
        }
    }

    async fn consume_stream(
        &self,
        mut stream: crate::model_client::TurnEventStream,
        cancellation: tokio_util::sync::CancellationToken,
    ) -> (StreamOutcome, Vec<ToolCallRequest>) {
        let mut tool_batch = Vec::new();

        loop {
            let event = match stream.next().await {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    let outcome = self.handle_mid_stream_error(err).await;
                    return (outcome, tool_batch);
                }
                None => return (StreamOutcome::Completed, tool_batch),
            };

            match event {
                TurnEvent::Thought { summary } => {
                    *self.thought.lock().await = Some(summary);
                }
                TurnEvent::Content(text) => {
                    if cancellation.is_cancelled() {
                        continue;
                    }
                    {
                        let mut state_guard = self.turn_state.lock().await;
                        state_guard.as_mut().unwrap().retry_attempts = 0;
                    }
                    let mut history = self.history.lock().await;
                    history.push_content(&text);
                    history.maybe_split_assistant_buffer(
                        self.clock.as_ref(),
                        self.config.split_buffer_threshold,
                    );
                }
                TurnEvent::ToolCallRequest(request) => {
                    if !cancellation.is_cancelled() {
                        tool_batch.push(request);
                    }
                }
                TurnEvent::UserCancelled => {
                    self.mark_cancelled_and_emit_info().await;
                    return (StreamOutcome::Cancelled, tool_batch);
                }
                TurnEvent::Error { error: code, message } => {
                    self.emit_error(format!("{code}: {message}")).await;
                }
                TurnEvent::ChatCompressed {
                    original_token_count,
                    new_token_count,
                } => {
                    let mut history = self.history.lock().await;
                    history.append(
                        self.clock.as_ref(),
                        HistoryEntryKind::Compression {
                            before: original_token_count.unwrap_or(0),
                            after: new_token_count.unwrap_or(0),
                        },
                    );
                }
                TurnEvent::ToolCallConfirmation | TurnEvent::ToolCallResponse => {}
                TurnEvent::MaxSessionTurns => {
                    self.handle_limit_event(LimitTrigger::MaxSessionTurns).await;
                    return (StreamOutcome::LimitExceeded, tool_batch);
                }
                TurnEvent::SessionTokenLimitExceeded {
                    current_tokens,
                    limit,
                    ..
                } => {
                    self.handle_limit_event(LimitTrigger::SessionTokenLimit {
                        current_tokens,
                        limit,
                    })
                    .await;
                    return (StreamOutcome::LimitExceeded, tool_batch);
                }
                TurnEvent::TurnBudgetExceeded { limit } => {
                    self.handle_limit_event(LimitTrigger::TurnBudgetExceeded { limit })
                        .await;
                    return (StreamOutcome::LimitExceeded, tool_batch);
                }
                TurnEvent::Finished(reason) => {
                    self.handle_finish_event(reason).await;
                    return (StreamOutcome::Finished(reason), tool_batch);
                }
                TurnEvent::LoopDetected => {
                    let mut state_guard = self.turn_state.lock().await;
                    state_guard.as_mut().unwrap().loop_detected_flag = true;
                    return (StreamOutcome::LoopDetected, tool_batch);
                }
                TurnEvent::Retry => {
                    let retry_outcome = self.handle_retry_event().await;
                    if let Some(outcome) = retry_outcome {
                        return (outcome, tool_batch);
                    }
                }
            }
        }
    }

    async fn handle_mid_stream_error(&self, err: TurnError) -> StreamOutcome {
        match err {
            TurnError::Unauthorized { .. } => {
                (self.on_auth_error)();
                StreamOutcome::Errored
            }
            TurnError::Cancelled => StreamOutcome::Cancelled,
            TurnError::ProviderRetryExhausted {
                attempts,
                error_codes,
                last_error,
            } => {
                self.handle_provider_failure(attempts, error_codes, last_error)
                    .await;
                StreamOutcome::Errored
            }
            other => {
                self.emit_error(format!("{other}")).await;
                StreamOutcome::Errored
            }
        }
    }

    async fn mark_cancelled_and_emit_info(&self) {
        let mut history = self.history.lock().await;
        if let Pending::ToolGroup { calls } = history.pending_mut() {
            for call in calls.iter_mut() {
                call.status = ToolCallStatus::Cancelled;
            }
        }
        history.append(
            self.clock.as_ref(),
            HistoryEntryKind::Info {
                text: "User cancelled the request.".to_string(),
            },
        );
        history.discard_pending();
    }

    async fn emit_error(&self, text: String) {
        warn!(message = %text, "emitting error history entry");
        let mut history = self.history.lock().await;
        history.append(self.clock.as_ref(), HistoryEntryKind::Error { text });
    }

    async fn emit_info(&self, text: String) {
        let mut history = self.history.lock().await;
        history.append(self.clock.as_ref(), HistoryEntryKind::Info { text });
    }

    /// Like `emit_info`, but gated by `recovery_cooldown_secs`
    /// (SPEC_FULL.md §10.5): suppresses a repeated recovery notice shown
    /// less than the cooldown after the previous one. A cooldown of zero
    /// (the default) disables gating entirely, mirroring
    /// `ErrorRecoveryState::can_prompt_user`/`mark_prompt_shown`.
    async fn emit_recovery_notice(&self, text: String) {
        let cooldown_secs = self.config.recovery_cooldown_secs;
        if cooldown_secs > 0 {
            let now = self.clock.now();
            let mut last = self.last_recovery_notice_at.lock().await;
            if let Some(previous) = *last {
                let elapsed = (now - previous).num_seconds().max(0) as u64;
                if elapsed < cooldown_secs {
                    tracing::debug!(elapsed, cooldown_secs, "recovery notice suppressed by cooldown");
                    return;
                }
            }
            *last = Some(now);
        }
        self.emit_info(text).await;
    }

    async fn snapshot_text(&self) -> String {
        let history = self.history.lock().await;
        build_recovery_snapshot(history.entries())
    }

    /// Stream-stall recovery (category: auto). Returns `Some(outcome)` when
    /// the stream loop must stop; `None` to keep consuming.
    async fn handle_retry_event(&self) -> Option<StreamOutcome> {
        let limit = self.config.recovery_limits.stream_retry_limit;
        let retry_attempts = {
            let mut state_guard = self.turn_state.lock().await;
            let state = state_guard.as_mut().unwrap();
            state.retry_attempts += 1;
            state.retry_attempts
        };

        {
            let mut history = self.history.lock().await;
            history.discard_pending();
        }
        self.emit_recovery_notice(format!(
            "Model response stalled. Retrying attempt {retry_attempts}/{limit}..."
        ))
        .await;

        if retry_attempts < limit {
            return None;
        }

        let can_queue = {
            let mut state_guard = self.turn_state.lock().await;
            let state = state_guard.as_mut().unwrap();
            if state.auto_recovery_attempts < self.config.recovery_limits.auto_recovery_max_attempts {
                state.auto_recovery_attempts += 1;
                true
            } else {
                false
            }
        };

        if !can_queue {
            self.emit_error("Streaming stalled and automatic recovery was already used.".into())
                .await;
            return Some(StreamOutcome::Errored);
        }

        let snapshot = self.snapshot_text().await;
        self.queue_recovery(RecoveryCategory::Auto, planner::stream_stall_prompt(&snapshot), SkipResetFlags::default())
            .await;
        Some(StreamOutcome::RetryLimitExceeded)
    }

    async fn handle_limit_event(&self, trigger: LimitTrigger) {
        self.emit_error(planner::limit_description(&trigger)).await;

        let state_token = {
            let state_guard = self.turn_state.lock().await;
            state_guard.as_ref().unwrap().cancellation_token.clone()
        };
        state_token.cancel();
        self.scheduler.reset();
        {
            let mut history = self.history.lock().await;
            history.discard_pending();
        }

        let can_queue = {
            let mut state_guard = self.turn_state.lock().await;
            let state = state_guard.as_mut().unwrap();
            if state.limit_recovery_attempts < self.config.recovery_limits.limit_recovery_max_attempts {
                state.limit_recovery_attempts += 1;
                true
            } else {
                false
            }
        };

        if !can_queue {
            self.emit_error("Limit recovery budget exhausted.".into()).await;
            return;
        }

        let snapshot = self.snapshot_text().await;
        let category = match &trigger {
            LimitTrigger::MaxSessionTurns => RecoveryCategory::Limit(LimitKind::MaxSessionTurns),
            LimitTrigger::SessionTokenLimit { .. } => {
                RecoveryCategory::Limit(LimitKind::SessionTokenLimit)
            }
            LimitTrigger::TurnBudgetExceeded { .. } => RecoveryCategory::Limit(LimitKind::TurnBudget),
        };
        self.queue_recovery(
            category,
            planner::limit_recovery_prompt(&trigger, &snapshot),
            SkipResetFlags {
                skip_loop_reset: true,
                skip_provider_reset: true,
                skip_limit_reset: true,
                skip_finish_reset: true,
            },
        )
        .await;
    }

    async fn handle_finish_event(&self, reason: FinishReason) {
        if !reason.triggers_finish_recovery() {
            return;
        }

        self.emit_recovery_notice(format!("Model finished with reason {reason:?}.")).await;

        let already_pending = {
            let state_guard = self.turn_state.lock().await;
            state_guard.as_ref().unwrap().pending_recovery.is_some()
        };
        if already_pending {
            return;
        }

        let can_queue = {
            let mut state_guard = self.turn_state.lock().await;
            let state = state_guard.as_mut().unwrap();
            if state.finish_recovery_attempts < self.config.recovery_limits.finish_recovery_max_attempts {
                state.finish_recovery_attempts += 1;
                true
            } else {
                false
            }
        };
        if !can_queue {
            return;
        }

        let snapshot = self.snapshot_text().await;
        self.queue_recovery(
            RecoveryCategory::Finish,
            planner::finish_recovery_prompt(reason, &snapshot),
            SkipResetFlags::default(),
        )
        .await;
    }

    /// Provider-failure recovery (category: provider). Queues a pending
    /// recovery if the budget allows; the caller is responsible for
    /// resolving the recovery decision afterward (the right moment differs
    /// depending on whether the failure was caught at stream setup or
    /// mid-stream).
    async fn handle_provider_failure(&self, attempts: u32, error_codes: Vec<String>, last_error: String) {
        let snapshot = self.snapshot_text().await;
        self.emit_recovery_notice(format!(
            "Provider failed after {attempts} attempt(s) ({}): {last_error}\n\n{snapshot}",
            error_codes.join(", ")
        ))
        .await;

        if let Err(err) = self.model_client.reset_chat().await {
            self.emit_error(format!("Failed to reset model client after provider failure: {err}"))
                .await;
            return;
        }

        let can_queue = {
            let mut state_guard = self.turn_state.lock().await;
            let state = state_guard.as_mut().unwrap();
            if state.provider_recovery_attempts < self.config.recovery_limits.provider_recovery_max_attempts {
                state.provider_recovery_attempts += 1;
                true
            } else {
                false
            }
        };
        if !can_queue {
            self.emit_error("Provider recovery budget exhausted.".into()).await;
            return;
        }

        self.queue_recovery(
            RecoveryCategory::Provider,
            planner::provider_recovery_prompt(attempts, &error_codes, &last_error, &snapshot),
            SkipResetFlags {
                skip_loop_reset: true,
                skip_provider_reset: true,
                skip_limit_reset: false,
                skip_finish_reset: false,
            },
        )
        .await;
    }

    async fn queue_recovery(&self, category: RecoveryCategory, prompt: String, skip_reset_flags: SkipResetFlags) {
        let mut state_guard = self.turn_state.lock().await;
        let state = state_guard.as_mut().unwrap();
        let attempt = match category {
            RecoveryCategory::Auto => state.auto_recovery_attempts,
            RecoveryCategory::Loop => state.loop_recovery_attempts,
            RecoveryCategory::Provider => state.provider_recovery_attempts,
            RecoveryCategory::Limit(_) => state.limit_recovery_attempts,
            RecoveryCategory::Finish => state.finish_recovery_attempts,
        };
        let prompt_id = self.ids.recovery_prompt_id(&state.turn_id, category, attempt);
        state.queue_recovery_if_absent(PendingRecovery {
            prompt_id,
            query_text: prompt,
            timestamp: self.clock.now(),
            is_continuation: true,
            skip_reset_flags,
        });
    }

    /// Draining phase (spec.md §4.1): finalize pending content, run
    /// deferred loop recovery, dispatch any accumulated tool batch, then
    /// decide the next step.
    async fn drain_turn(&self, outcome: StreamOutcome, tool_batch: Vec<ToolCallRequest>) -> NextStep {
        self.set_phase(TurnPhase::Draining).await;
        {
            let mut history = self.history.lock().await;
            history.finalize_pending(self.clock.as_ref());
        }

        if matches!(outcome, StreamOutcome::LoopDetected) {
            self.handle_loop_recovery().await;
        }

        let forward_step = if !tool_batch.is_empty() {
            self.dispatch_tool_batch(tool_batch).await
        } else {
            None
        };

        self.resolve_recovery_decision_with(forward_step).await
    }

    async fn handle_loop_recovery(&self) {
        let token = {
            let state_guard = self.turn_state.lock().await;
            state_guard.as_ref().unwrap().cancellation_token.clone()
        };
        token.cancel();
        self.scheduler.reset();
        {
            let mut history = self.history.lock().await;
            history.discard_pending();
        }

        let snapshot = self.snapshot_text().await;
        self.emit_recovery_notice(snapshot.clone()).await;

        let can_queue = {
            let mut state_guard = self.turn_state.lock().await;
            let state = state_guard.as_mut().unwrap();
            if state.loop_recovery_attempts < self.config.recovery_limits.loop_recovery_max_attempts {
                state.loop_recovery_attempts += 1;
                true
            } else {
                false
            }
        };

        if !can_queue {
            self.emit_error("Loop recovery budget exhausted.".into()).await;
            return;
        }

        self.emit_recovery_notice("Attempting automatic recovery…".into()).await;
        self.queue_recovery(
            RecoveryCategory::Loop,
            planner::loop_recovery_prompt(&snapshot),
            SkipResetFlags {
                skip_loop_reset: true,
                ..SkipResetFlags::default()
            },
        )
        .await;
    }

    /// Dispatch the accumulated tool-call batch and await its completion,
    /// returning the tool-result continuation payload, if forwarding is
    /// appropriate (spec.md §4.2's completion-callback handling).
    async fn dispatch_tool_batch(
        &self,
        requests: Vec<ToolCallRequest>,
    ) -> Option<(ModelPayload, String)> {
        let client_initiated: std::collections::HashMap<String, bool> = requests
            .iter()
            .map(|r| (r.call_id.clone(), r.client_initiated))
            .collect();
        let first_prompt_id = requests
            .first()
            .map(|r| r.prompt_id.clone())
            .unwrap_or_default();

        {
            let mut history = self.history.lock().await;
            let tracked: Vec<TrackedToolCall> = requests
                .iter()
                .cloned()
                .map(TrackedToolCall::new)
                .collect();
            *history.pending_mut() = Pending::ToolGroup { calls: tracked };
        }

        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let callback: CompletionCallback = Arc::new(move |outcomes: Vec<ToolCallOutcome>| {
            if let Ok(mut guard) = tx.lock() {
                if let Some(tx) = guard.take() {
                    let _ = tx.send(outcomes);
                }
            }
        });

        let snapshot = self.build_conversation_snapshot().await;
        self.scheduler.schedule(requests, snapshot, callback).await;
        let outcomes = rx.await.unwrap_or_default();

        // Apply terminal statuses to the tracked calls, then read back which
        // ones are "ripe" (Invariant 2: terminal and not yet forwarded) to
        // decide what actually gets submitted upstream.
        let forwardable_ids_and_parts: Vec<(String, ResponsePart)> = {
            let mut history = self.history.lock().await;
            let selected = if let Pending::ToolGroup { calls } = history.pending_mut() {
                for call in calls.iter_mut() {
                    if let Some(outcome) = outcomes.iter().find(|o| o.call_id == call.request.call_id) {
                        call.status = outcome.status;
                        call.response = Some(vec![outcome.response.clone()]);
                    }
                }
                let selected: Vec<(String, ResponsePart)> = calls
                    .iter()
                    .filter(|call| call.is_ripe())
                    .filter(|call| !client_initiated.get(&call.request.call_id).copied().unwrap_or(false))
                    .filter_map(|call| {
                        call.response
                            .as_ref()
                            .and_then(|parts| parts.first())
                            .map(|part| (call.request.call_id.clone(), part.clone()))
                    })
                    .collect();
                for call in calls.iter_mut() {
                    if selected.iter().any(|(id, _)| *id == call.request.call_id) {
                        call.response_submitted = true;
                    }
                }
                selected
            } else {
                Vec::new()
            };
            history.finalize_pending(self.clock.as_ref());
            selected
        };

        self.run_save_memory_hooks(&outcomes).await;

        if !forwardable_ids_and_parts.is_empty() {
            let ids: Vec<String> = forwardable_ids_and_parts.iter().map(|(id, _)| id.clone()).collect();
            self.scheduler.mark_submitted(&ids);
        }

        if self.model_switched_from_quota_error.load(Ordering::SeqCst) {
            return None;
        }

        let all_cancelled = !outcomes.is_empty()
            && outcomes.iter().all(|o| o.status == ToolCallStatus::Cancelled);

        if all_cancelled {
            let parts: Vec<ResponsePart> = outcomes.into_iter().map(|o| o.response).collect();
            self.model_client.inject_cancelled_batch(parts);
            return None;
        }

        if forwardable_ids_and_parts.is_empty() {
            return None;
        }

        let forwardable: Vec<ResponsePart> = forwardable_ids_and_parts.into_iter().map(|(_, part)| part).collect();
        Some((ModelPayload::ToolResults(forwardable), first_prompt_id))
    }

    /// Builds the point-in-time conversation view handed to the scheduler
    /// for checkpointing (spec.md §4.2's "read the current conversation
    /// history").
    async fn build_conversation_snapshot(&self) -> ConversationSnapshot {
        let history = {
            let history = self.history.lock().await;
            serde_json::to_value(history.entries()).unwrap_or(serde_json::Value::Null)
        };
        let client_history = self.model_client.conversation_snapshot();
        ConversationSnapshot { history, client_history }
    }

    async fn run_save_memory_hooks(&self, outcomes: &[ToolCallOutcome]) {
        for outcome in outcomes {
            if outcome.name != SAVE_MEMORY_TOOL || outcome.status != ToolCallStatus::Success {
                continue;
            }
            let mut dedup = self.processed_save_memory.lock().await;
            if dedup.insert_if_absent(outcome.call_id.clone()) {
                (self.on_memory_refresh)(outcome.call_id.clone());
            }
        }
    }

    async fn resolve_recovery_decision(&self) -> NextStep {
        self.resolve_recovery_decision_with(None).await
    }

    /// RecoveryDecision phase (spec.md §4.1): a queued `pending_recovery`
    /// takes priority over an ordinary tool-result continuation, since it
    /// represents a failure the turn must address before proceeding.
    async fn resolve_recovery_decision_with(
        &self,
        forward_step: Option<(ModelPayload, String)>,
    ) -> NextStep {
        self.set_phase(TurnPhase::RecoveryDecision).await;
        let pending = {
            let mut state_guard = self.turn_state.lock().await;
            state_guard.as_mut().unwrap().take_pending_recovery()
        };

        if let Some(recovery) = pending {
            let options = SubmitOptions {
                is_continuation: true,
                skip_loop_reset: recovery.skip_reset_flags.skip_loop_reset,
                skip_provider_reset: recovery.skip_reset_flags.skip_provider_reset,
                skip_limit_reset: recovery.skip_reset_flags.skip_limit_reset,
                skip_finish_reset: recovery.skip_reset_flags.skip_finish_reset,
            };
            return NextStep::Continuation {
                payload: ModelPayload::Text(recovery.query_text),
                options,
                prompt_id: recovery.prompt_id,
            };
        }

        if let Some((payload, prompt_id)) = forward_step {
            return NextStep::Continuation {
                payload,
                options: SubmitOptions {
                    is_continuation: true,
                    ..SubmitOptions::default()
                },
                prompt_id,
            };
        }

        let mut state_guard = self.turn_state.lock().await;
        *state_guard = None;
        drop(state_guard);
        self.set_phase(TurnPhase::Idle).await;
        NextStep::Idle
    }
}
