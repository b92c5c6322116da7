//! Checkpoint records as persisted in the namespace ledger

use crate::hash::ContentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One durable, content-addressed snapshot taken at a stage boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `<profile>-<stage>-<utc micros>`
    pub id: String,
    /// Storage namespace (run id) that owns this checkpoint
    pub namespace: String,
    /// Strictly increasing position within the namespace
    pub sequence: u64,
    /// Lane the run was executing under
    pub profile: String,
    /// Declared stage number (not completion order)
    pub stage_number: u32,
    /// Stage name
    pub stage_name: String,
    /// Revision pointer at capture time, if revision control was reachable
    pub revision: Option<String>,
    /// Branch at capture time, if revision control was reachable
    pub branch: Option<String>,
    /// Digest over the captured file set
    pub content_hash: ContentHash,
    /// Manifest of the captured file set
    pub files: Vec<SnapshotEntry>,
    /// Stage and capture metrics
    pub metrics: CheckpointMetrics,
    /// Whether the stage transition that produced this checkpoint succeeded
    pub success: bool,
    /// Failure message of the stage, if any
    pub error_message: Option<String>,
    /// Capture time
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build the identifier for a checkpoint
    #[must_use]
    pub fn make_id(profile: &str, stage_number: u32, micros: i64) -> String {
        format!("{profile}-{stage_number:02}-{micros}")
    }

    /// Paths of files that existed when the checkpoint was taken
    pub fn present_paths(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .filter(|f| f.present)
            .map(|f| f.path.as_str())
    }
}

/// One file of the critical-state set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Workspace-relative path
    pub path: String,
    /// Whether the file existed at capture time
    pub present: bool,
    /// Size in bytes (0 when absent)
    pub size: u64,
}

/// Timing and resource figures stored with a checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    /// Wall time of the stage that produced the checkpoint
    pub stage_duration_ms: Option<u64>,
    /// Attempt number of that stage (1-based)
    pub attempt: u32,
    /// Worker count of the batch the stage ran in, if it ran in the pool
    pub worker_count: Option<usize>,
    /// Logical cores visible to the host at capture time
    pub host_cores: usize,
    /// Total bytes copied into storage
    pub captured_bytes: u64,
    /// Time spent capturing the snapshot
    pub capture_ms: u64,
    /// Free-form numeric figures supplied by the caller
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, f64>,
}

/// Parameters for [`CheckpointManager::create`](crate::CheckpointManager::create)
#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    /// Lane name
    pub profile: String,
    /// Declared stage number
    pub stage_number: u32,
    /// Stage name
    pub stage_name: String,
    /// Outcome of the stage transition
    pub success: bool,
    /// Failure message, if any
    pub error_message: Option<String>,
    /// Caller-side metrics; capture figures are filled in by the manager
    pub metrics: CheckpointMetrics,
}

impl CheckpointRequest {
    /// Request a checkpoint for a successful stage transition
    #[must_use]
    pub fn success(profile: impl Into<String>, stage_number: u32, stage_name: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            stage_number,
            stage_name: stage_name.into(),
            success: true,
            error_message: None,
            metrics: CheckpointMetrics::default(),
        }
    }

    /// Request a checkpoint for a failed stage transition
    #[must_use]
    pub fn failure(
        profile: impl Into<String>,
        stage_number: u32,
        stage_name: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error_message: Some(error_message.into()),
            ..Self::success(profile, stage_number, stage_name)
        }
    }

    /// Attach stage metrics
    #[inline]
    #[must_use]
    pub fn with_metrics(mut self, metrics: CheckpointMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}
