//! End-to-end scenario tests (spec.md §8).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use turn_controller::{
    ApprovalMode, AssistantTurnController, AtcConfig, Clock as ClockTrait,
    DefaultCheckpointWriter, FinishReason, HistoryEntryKind, InMemoryToolScheduler, ModelClient,
    ModelPayload, ResponsePart, StreamingState, SystemClock, ToolCallRequest, ToolExecutor,
    TurnError, TurnEvent, TurnEventStream, TurnPhase,
};

/// Scripted model client: each call to `stream` pops the next programmed
/// event sequence off the front of the queue.
struct ScriptedModelClient {
    turns: Mutex<VecDeque<Vec<Result<TurnEvent, TurnError>>>>,
    injected_cancelled_batches: Mutex<Vec<Vec<ResponsePart>>>,
    reset_count: AtomicUsize,
}

impl ScriptedModelClient {
    fn new(turns: Vec<Vec<Result<TurnEvent, TurnError>>>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            injected_cancelled_batches: Mutex::new(Vec::new()),
            reset_count: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn stream(
        &self,
        _payload: ModelPayload,
        _cancellation: CancellationToken,
    ) -> Result<TurnEventStream, TurnError> {
        let events = self
            .turns
            .lock()
            .pop_front()
            .expect("scripted model client ran out of programmed turns");
        let boxed: TurnEventStream = Box::pin(stream::iter(events));
        Ok(boxed)
    }

    async fn reset_chat(&self) -> Result<(), TurnError> {
        self.reset_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn inject_cancelled_batch(&self, parts: Vec<ResponsePart>) {
        self.injected_cancelled_batches.lock().push(parts);
    }

    fn conversation_snapshot(&self) -> Value {
        serde_json::json!([])
    }
}

struct EchoExecutor {
    fail_names: Vec<String>,
}

#[async_trait]
impl ToolExecutor for EchoExecutor {
    async fn execute(
        &self,
        request: &ToolCallRequest,
        _cancellation: CancellationToken,
    ) -> Result<Value, String> {
        if self.fail_names.contains(&request.name) {
            return Err("boom".to_string());
        }
        Ok(serde_json::json!({"ok": true, "name": request.name}))
    }
}

fn tool_request(call_id: &str, name: &str, args: Value) -> ToolCallRequest {
    ToolCallRequest {
        call_id: call_id.into(),
        name: name.into(),
        arguments: args,
        prompt_id: "p0".into(),
        client_initiated: false,
    }
}

fn noop_auth() -> Arc<dyn Fn() + Send + Sync> {
    Arc::new(|| {})
}

fn noop_memory() -> Arc<dyn Fn(String) + Send + Sync> {
    Arc::new(|_| {})
}

#[tokio::test]
async fn clean_turn_produces_two_entries_and_goes_idle() {
    let model = Arc::new(ScriptedModelClient::new(vec![vec![
        Ok(TurnEvent::Content("Hi".to_string())),
        Ok(TurnEvent::Finished(FinishReason::Stop)),
    ]]));
    let executor = Arc::new(EchoExecutor { fail_names: vec![] });
    let checkpoint = Arc::new(DefaultCheckpointWriter::new(
        std::env::temp_dir().join("atc-test-ckpt-1"),
    ));
    let scheduler = Arc::new(InMemoryToolScheduler::new(
        executor,
        checkpoint,
        ApprovalMode::Default,
        turn_controller::config::MUTATING_TOOLS,
        std::env::temp_dir(),
    ));
    let clock: Arc<dyn ClockTrait> = Arc::new(SystemClock);

    let controller = AssistantTurnController::new(
        model,
        scheduler,
        clock,
        AtcConfig::default(),
        "sess1",
        noop_auth(),
        noop_memory(),
    );

    controller
        .submit_query("hello".to_string(), Default::default(), None)
        .await;

    let entries = controller.history_entries().await;
    assert_eq!(entries.len(), 2);
    assert_eq!(
        entries[0].kind,
        HistoryEntryKind::User { text: "hello".into() }
    );
    assert_eq!(
        entries[1].kind,
        HistoryEntryKind::Assistant { text: "Hi".into() }
    );

    assert_eq!(controller.streaming_state().await, StreamingState::Idle);
}

#[tokio::test]
async fn three_retries_then_self_recovery_continuation() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        vec![
            Ok(TurnEvent::Retry),
            Ok(TurnEvent::Retry),
            Ok(TurnEvent::Retry),
        ],
        vec![
            Ok(TurnEvent::Content("recovered".to_string())),
            Ok(TurnEvent::Finished(FinishReason::Stop)),
        ],
    ]));
    let executor = Arc::new(EchoExecutor { fail_names: vec![] });
    let checkpoint = Arc::new(DefaultCheckpointWriter::new(
        std::env::temp_dir().join("atc-test-ckpt-2"),
    ));
    let scheduler = Arc::new(InMemoryToolScheduler::new(
        executor,
        checkpoint,
        ApprovalMode::Default,
        turn_controller::config::MUTATING_TOOLS,
        std::env::temp_dir(),
    ));
    let clock: Arc<dyn ClockTrait> = Arc::new(SystemClock);

    let controller = AssistantTurnController::new(
        model,
        scheduler,
        clock,
        AtcConfig::default(),
        "sess2",
        noop_auth(),
        noop_memory(),
    );

    controller
        .submit_query("do it".to_string(), Default::default(), None)
        .await;

    let entries = controller.history_entries().await;
    let info_texts: Vec<&str> = entries
        .iter()
        .filter_map(|e| match &e.kind {
            HistoryEntryKind::Info { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();

    assert!(
        info_texts
            .iter()
            .filter(|t| t.contains("Retrying attempt"))
            .count()
            >= 3,
        "expected three retry notices, got {info_texts:?}"
    );

    let assistant_text = entries.iter().find_map(|e| match &e.kind {
        HistoryEntryKind::Assistant { text } => Some(text.clone()),
        _ => None,
    });
    assert_eq!(assistant_text, Some("recovered".to_string()));
}

#[tokio::test]
async fn loop_detection_triggers_recovery_continuation() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        vec![
            Ok(TurnEvent::Content("looping".to_string())),
            Ok(TurnEvent::LoopDetected),
        ],
        vec![
            Ok(TurnEvent::Content("changed approach".to_string())),
            Ok(TurnEvent::Finished(FinishReason::Stop)),
        ],
    ]));
    let executor = Arc::new(EchoExecutor { fail_names: vec![] });
    let checkpoint = Arc::new(DefaultCheckpointWriter::new(
        std::env::temp_dir().join("atc-test-ckpt-3"),
    ));
    let scheduler = Arc::new(InMemoryToolScheduler::new(
        executor,
        checkpoint,
        ApprovalMode::Default,
        turn_controller::config::MUTATING_TOOLS,
        std::env::temp_dir(),
    ));
    let clock: Arc<dyn ClockTrait> = Arc::new(SystemClock);

    let controller = AssistantTurnController::new(
        model,
        scheduler,
        clock,
        AtcConfig::default(),
        "sess3",
        noop_auth(),
        noop_memory(),
    );

    controller
        .submit_query("go".to_string(), Default::default(), None)
        .await;

    let entries = controller.history_entries().await;
    let assistant_texts: Vec<String> = entries
        .iter()
        .filter_map(|e| match &e.kind {
            HistoryEntryKind::Assistant { text } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert!(assistant_texts.contains(&"looping".to_string()));
    assert!(assistant_texts.contains(&"changed approach".to_string()));

    let info_texts: Vec<String> = entries
        .iter()
        .filter_map(|e| match &e.kind {
            HistoryEntryKind::Info { text } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert!(info_texts
        .iter()
        .any(|t| t.contains("Attempting automatic recovery")));
}

#[tokio::test]
async fn token_limit_exceeded_emits_error_and_recovers() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        vec![Ok(TurnEvent::SessionTokenLimitExceeded {
            current_tokens: 130_000,
            limit: 128_000,
            message: None,
        })],
        vec![Ok(TurnEvent::Finished(FinishReason::Stop))],
    ]));
    let executor = Arc::new(EchoExecutor { fail_names: vec![] });
    let checkpoint = Arc::new(DefaultCheckpointWriter::new(
        std::env::temp_dir().join("atc-test-ckpt-4"),
    ));
    let scheduler = Arc::new(InMemoryToolScheduler::new(
        executor,
        checkpoint,
        ApprovalMode::Default,
        turn_controller::config::MUTATING_TOOLS,
        std::env::temp_dir(),
    ));
    let clock: Arc<dyn ClockTrait> = Arc::new(SystemClock);

    let controller = AssistantTurnController::new(
        model,
        scheduler,
        clock,
        AtcConfig::default(),
        "sess4",
        noop_auth(),
        noop_memory(),
    );

    controller
        .submit_query("keep going".to_string(), Default::default(), None)
        .await;

    let entries = controller.history_entries().await;
    let error_texts: Vec<String> = entries
        .iter()
        .filter_map(|e| match &e.kind {
            HistoryEntryKind::Error { text } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert!(
        error_texts
            .iter()
            .any(|t| t.contains("130,000") && t.contains("128,000")),
        "expected a formatted token-limit error, got {error_texts:?}"
    );
}

#[tokio::test]
async fn all_cancelled_tool_batch_injects_synthetic_message_without_continuation() {
    let model = Arc::new(ScriptedModelClient::new(vec![vec![
        Ok(TurnEvent::ToolCallRequest(tool_request(
            "c1",
            "edit",
            serde_json::json!({}),
        ))),
        Ok(TurnEvent::ToolCallRequest(tool_request(
            "c2",
            "edit",
            serde_json::json!({}),
        ))),
        Ok(TurnEvent::Finished(FinishReason::Stop)),
    ]]));
    let model_for_assert = model.clone();

    let executor = Arc::new(EchoExecutor { fail_names: vec![] });
    let checkpoint = Arc::new(DefaultCheckpointWriter::new(
        std::env::temp_dir().join("atc-test-ckpt-5"),
    ));
    let scheduler = Arc::new(InMemoryToolScheduler::new(
        executor,
        checkpoint,
        ApprovalMode::Default,
        turn_controller::config::MUTATING_TOOLS,
        std::env::temp_dir(),
    ));
    let scheduler_for_deny = scheduler.clone();

    // Both calls require approval (mutating tool); deny them so the batch
    // completes as all-cancelled without ever executing.
    let denier = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        scheduler_for_deny.deny("c1");
        scheduler_for_deny.deny("c2");
    });

    let clock: Arc<dyn ClockTrait> = Arc::new(SystemClock);

    let controller = AssistantTurnController::new(
        model,
        scheduler,
        clock,
        AtcConfig::default(),
        "sess5",
        noop_auth(),
        noop_memory(),
    );

    controller
        .submit_query("edit two files".to_string(), Default::default(), None)
        .await;
    denier.await.unwrap();

    let entries = controller.history_entries().await;
    let tool_group = entries.iter().find_map(|e| match &e.kind {
        HistoryEntryKind::ToolGroup { calls } => Some(calls.clone()),
        _ => None,
    });
    assert!(tool_group.is_some(), "expected a tool_group history entry");
    let calls = tool_group.unwrap();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.status == "cancelled"));

    assert_eq!(model_for_assert.injected_cancelled_batches.lock().len(), 1);
}

#[tokio::test]
async fn approval_gated_edit_writes_checkpoint_before_executing() {
    let dir = tempfile::tempdir().unwrap();

    let model = Arc::new(ScriptedModelClient::new(vec![
        vec![
            Ok(TurnEvent::ToolCallRequest(tool_request(
                "c1",
                "edit",
                serde_json::json!({"file_path": "/p/a.ts"}),
            ))),
            Ok(TurnEvent::Finished(FinishReason::Stop)),
        ],
        // The edit succeeds and is not client-initiated, so its result is
        // forwarded back to the model as a continuation turn.
        vec![Ok(TurnEvent::Finished(FinishReason::Stop))],
    ]));

    let executor = Arc::new(EchoExecutor { fail_names: vec![] });
    let checkpoint_dir = dir.path().join("checkpoints");
    let checkpoint = Arc::new(DefaultCheckpointWriter::new(checkpoint_dir.clone()));
    let scheduler = Arc::new(InMemoryToolScheduler::new(
        executor,
        checkpoint,
        ApprovalMode::Default,
        turn_controller::config::MUTATING_TOOLS,
        dir.path(),
    ));
    let scheduler_for_approval = scheduler.clone();

    let approver = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        scheduler_for_approval.approve("c1");
    });

    let clock: Arc<dyn ClockTrait> = Arc::new(SystemClock);
    let controller = AssistantTurnController::new(
        model,
        scheduler,
        clock,
        AtcConfig::default(),
        "sess6",
        noop_auth(),
        noop_memory(),
    );

    controller
        .submit_query("edit the file".to_string(), Default::default(), None)
        .await;
    approver.await.unwrap();

    let mut found_file_path = false;
    let mut found_commit_hash = false;
    let mut found_history = false;
    let mut entries = tokio::fs::read_dir(&checkpoint_dir).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let contents = tokio::fs::read_to_string(entry.path()).await.unwrap();
        let payload: turn_controller::checkpoint::CheckpointPayload =
            serde_json::from_str(&contents).unwrap();
        assert_eq!(payload.file_path, "/p/a.ts");
        found_file_path = true;
        found_commit_hash = !payload.commit_hash.is_empty();
        // The checkpoint is taken while the "edit the file" user turn is the
        // only entry in history, so it must show up in the snapshot.
        let history = payload.history.as_array().cloned().unwrap_or_default();
        found_history = history
            .iter()
            .any(|entry| entry.to_string().contains("edit the file"));
    }
    assert!(
        found_file_path,
        "expected a checkpoint file under {checkpoint_dir:?}"
    );
    assert!(found_commit_hash);
    assert!(
        found_history,
        "expected checkpoint payload.history to include the prior user turn"
    );
}

#[tokio::test]
async fn recovery_cooldown_suppresses_rapid_duplicate_notices() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let model = Arc::new(ScriptedModelClient::new(vec![
        vec![
            Ok(TurnEvent::Retry),
            Ok(TurnEvent::Retry),
            Ok(TurnEvent::Retry),
        ],
        vec![
            Ok(TurnEvent::Content("recovered".to_string())),
            Ok(TurnEvent::Finished(FinishReason::Stop)),
        ],
    ]));
    let executor = Arc::new(EchoExecutor { fail_names: vec![] });
    let checkpoint = Arc::new(DefaultCheckpointWriter::new(
        std::env::temp_dir().join("atc-test-ckpt-7"),
    ));
    let scheduler = Arc::new(InMemoryToolScheduler::new(
        executor,
        checkpoint,
        ApprovalMode::Default,
        turn_controller::config::MUTATING_TOOLS,
        std::env::temp_dir(),
    ));
    let clock: Arc<dyn ClockTrait> = Arc::new(SystemClock);

    let config = AtcConfig {
        recovery_cooldown_secs: 3600,
        ..AtcConfig::default()
    };
    let controller = AssistantTurnController::new(
        model,
        scheduler,
        clock,
        config,
        "sess7",
        noop_auth(),
        noop_memory(),
    );

    controller
        .submit_query("do it".to_string(), Default::default(), None)
        .await;

    let entries = controller.history_entries().await;
    let retry_notices = entries
        .iter()
        .filter(|e| matches!(&e.kind, HistoryEntryKind::Info { text } if text.contains("Retrying attempt")))
        .count();
    assert_eq!(
        retry_notices, 1,
        "an hour-long cooldown should suppress the second and third retry notices"
    );
}

#[tokio::test]
async fn turn_phase_and_stats_settle_after_a_clean_turn() {
    let model = Arc::new(ScriptedModelClient::new(vec![vec![
        Ok(TurnEvent::Content("Hi".to_string())),
        Ok(TurnEvent::Finished(FinishReason::Stop)),
    ]]));
    let executor = Arc::new(EchoExecutor { fail_names: vec![] });
    let checkpoint = Arc::new(DefaultCheckpointWriter::new(
        std::env::temp_dir().join("atc-test-ckpt-8"),
    ));
    let scheduler = Arc::new(InMemoryToolScheduler::new(
        executor,
        checkpoint,
        ApprovalMode::Default,
        turn_controller::config::MUTATING_TOOLS,
        std::env::temp_dir(),
    ));
    let clock: Arc<dyn ClockTrait> = Arc::new(SystemClock);

    let controller = AssistantTurnController::new(
        model,
        scheduler,
        clock,
        AtcConfig::default(),
        "sess8",
        noop_auth(),
        noop_memory(),
    );

    assert_eq!(controller.turn_phase().await, TurnPhase::Idle);

    controller
        .submit_query("hello".to_string(), Default::default(), None)
        .await;

    assert_eq!(controller.turn_phase().await, TurnPhase::Idle);

    let stats = controller.turn_stats().await;
    assert_eq!(stats.turns_executed, 1);
    assert_eq!(stats.turn_durations_ms.len(), 1);
    assert_eq!(stats.total_duration_ms, stats.turn_durations_ms[0]);
}
