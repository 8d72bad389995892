//! Checkpoint writer (SPEC_FULL.md §4.2's "Checkpoint policy").
//!
//! Grounded on `vtcode_core::git_info` (shelling out to `git` rather than
//! linking `libgit2`, tolerating non-repository workspaces) and
//! `vtcode_core::core::agent::snapshots` (timestamped JSON blobs written
//! under a project-local directory).

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TurnError;

/// JSON payload written to a checkpoint file (SPEC_FULL.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointPayload {
    pub history: serde_json::Value,
    pub client_history: serde_json::Value,
    pub tool_call: CheckpointToolCall,
    pub commit_hash: String,
    pub file_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointToolCall {
    pub name: String,
    pub args: serde_json::Value,
}

/// Request to snapshot a single mutating tool call before approval.
#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub history: serde_json::Value,
    pub client_history: serde_json::Value,
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub file_path: String,
    pub workspace_root: PathBuf,
}

/// External collaborator invoked before an approval-gated mutating tool
/// runs (SPEC_FULL.md §2's "Checkpoint Writer").
#[async_trait]
pub trait CheckpointWriter: Send + Sync {
    async fn checkpoint(&self, request: CheckpointRequest) -> Result<(), TurnError>;
}

/// Git-snapshot + JSON-blob checkpoint writer.
pub struct DefaultCheckpointWriter {
    checkpoint_dir: PathBuf,
}

impl DefaultCheckpointWriter {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
        }
    }

    /// Best-effort `git rev-parse --short HEAD`, tolerant of a
    /// non-repository workspace. Internal plumbing uses `anyhow` to
    /// aggregate the process-spawn and non-zero-exit failure modes; only
    /// the public boundary collapses them to the `"unknown"` fallback.
    fn head_commit_hash(workspace_root: &Path) -> String {
        Self::try_head_commit_hash(workspace_root).unwrap_or_else(|_| "unknown".to_string())
    }

    fn try_head_commit_hash(workspace_root: &Path) -> anyhow::Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", "--short", "HEAD"])
            .current_dir(workspace_root)
            .output()?;

        anyhow::ensure!(output.status.success(), "git rev-parse exited with {}", output.status);

        let hash = String::from_utf8(output.stdout)?.trim().to_string();
        anyhow::ensure!(!hash.is_empty(), "git rev-parse produced an empty hash");
        Ok(hash)
    }

    fn filename(timestamp: DateTime<Utc>, file_path: &str, tool_name: &str) -> String {
        let iso = timestamp.format("%Y-%m-%dT%H-%M-%S_%3f").to_string();
        let basename = Path::new(file_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");
        format!("{iso}-{basename}-{tool_name}.json")
    }
}

#[async_trait]
impl CheckpointWriter for DefaultCheckpointWriter {
    async fn checkpoint(&self, request: CheckpointRequest) -> Result<(), TurnError> {
        let commit_hash = Self::head_commit_hash(&request.workspace_root);
        let payload = CheckpointPayload {
            history: request.history,
            client_history: request.client_history,
            tool_call: CheckpointToolCall {
                name: request.tool_name.clone(),
                args: request.tool_args,
            },
            commit_hash,
            file_path: request.file_path.clone(),
        };

        let timestamp = Utc::now();
        let filename = Self::filename(timestamp, &request.file_path, &request.tool_name);

        tokio::fs::create_dir_all(&self.checkpoint_dir)
            .await
            .map_err(|e| TurnError::Checkpoint(format!("failed to create checkpoint dir: {e}")))?;

        let serialized = serde_json::to_vec_pretty(&payload)
            .map_err(|e| TurnError::Checkpoint(format!("failed to serialize checkpoint: {e}")))?;

        let path = self.checkpoint_dir.join(filename);
        tokio::fs::write(&path, serialized)
            .await
            .map_err(|e| TurnError::Checkpoint(format!("failed to write checkpoint: {e}")))
    }
}

/// A checkpoint writer that records every call without touching disk, for
/// tests that only need to assert a checkpoint was attempted.
#[cfg(test)]
pub struct RecordingCheckpointWriter {
    pub requests: parking_lot::Mutex<Vec<CheckpointRequest>>,
}

#[cfg(test)]
impl Default for RecordingCheckpointWriter {
    fn default() -> Self {
        Self {
            requests: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl CheckpointWriter for RecordingCheckpointWriter {
    async fn checkpoint(&self, request: CheckpointRequest) -> Result<(), TurnError> {
        self.requests.lock().push(request);
        Ok(())
    }
}

/// Helper invoked by the scheduler: checkpoint failures are logged but
/// never abort the triggering tool call (spec.md §4.2).
pub async fn checkpoint_best_effort(writer: &dyn CheckpointWriter, request: CheckpointRequest) {
    if let Err(err) = writer.checkpoint(request).await {
        warn!(error = %err, "checkpoint write failed; continuing tool call");
    }
}
