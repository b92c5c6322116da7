//! Error types for the pipeline engine
//!
//! Provides error handling for:
//! - Profile lookup and configuration
//! - Stage failures crossing the worker boundary
//! - SLA breaches
//! - Exhausted recovery, escalated to an operator with diagnostics
//! - Host resources the pool cannot size itself from

use crate::recovery::RecoveryStrategy;
use crate::sla::SlaSeverity;
use crate::state_machine::TransitionError;
use crate::types::{FailureType, StageExecutionRecord, StageId};
use laneway_checkpoint::CheckpointError;
use serde::Serialize;
use std::time::Duration;

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No profile registered under this name
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// A stage body reported failure
    #[error(transparent)]
    StageExecution(#[from] StageExecutionError),

    /// Checkpoint capture, storage or restore failed
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// A stage breached its SLA target
    #[error("SLA {severity} on stage {stage_id}: {observed_ms}ms against {target_ms}ms target")]
    SlaBreach {
        /// Stage that breached
        stage_id: StageId,
        /// Breach level
        severity: SlaSeverity,
        /// Observed duration
        observed_ms: u64,
        /// Target duration
        target_ms: u64,
    },

    /// Every recovery action failed or none was applicable
    #[error("recovery exhausted for stage {}: {}", .0.stage_id, .0.classification)]
    RecoveryExhausted(Box<Escalation>),

    /// Host resources could not be determined or are insufficient
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Worker pool failure
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// Stage graph is malformed
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Configuration is missing or invalid
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Lifecycle transition rejected by the transition table
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Run was cancelled
    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Check if error requires an operator
    #[inline]
    #[must_use]
    pub fn requires_operator(&self) -> bool {
        matches!(self, Self::RecoveryExhausted(_))
    }

    /// Check if error is a checkpoint corruption
    #[inline]
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Checkpoint(e) if e.is_corruption())
    }
}

/// Failure reported by a stage body, with its classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("stage {stage_id} failed ({classification}): {message}")]
pub struct StageExecutionError {
    /// Failing stage
    pub stage_id: StageId,
    /// Classification assigned at the worker boundary
    pub classification: FailureType,
    /// Body's message
    pub message: String,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// `wait_all` called with nothing submitted
    #[error("no units submitted")]
    EmptyBatch,

    /// Same stage submitted twice in one batch
    #[error("stage submitted twice in one batch: {0}")]
    DuplicateStage(StageId),

    /// Pool semaphore closed underneath a waiting unit
    #[error("pool closed")]
    Closed,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Read {
        /// Config path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or schema error
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// YAML syntax or schema error
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Unsupported file extension
    #[error("unsupported config format: {0} (expected .toml, .yaml or .yml)")]
    UnsupportedFormat(String),

    /// Values parsed but are inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Diagnostic context surfaced when recovery is exhausted
#[derive(Debug, Clone, Serialize)]
pub struct Escalation {
    /// Stage that could not be recovered
    pub stage_id: StageId,
    /// Declared stage number
    pub stage_number: u32,
    /// Failure classification
    pub classification: FailureType,
    /// Last error reported by the stage
    pub last_error: Option<String>,
    /// Lane the run was using
    pub profile: String,
    /// Actions tried, in order, with their result
    pub attempted: Vec<AttemptedAction>,
    /// Every stage execution of the run so far
    pub history: Vec<StageExecutionRecord>,
    /// Operator guidance
    pub guidance: Vec<String>,
}

/// One recovery action the orchestrator tried
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptedAction {
    /// Strategy applied
    pub strategy: RecoveryStrategy,
    /// What happened
    pub result: String,
    /// Time spent
    #[serde(with = "crate::types::millis", rename = "elapsed_ms")]
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_display() {
        let err = EngineError::ProfileNotFound("turbo".to_string());
        assert!(err.to_string().contains("profile not found: turbo"));
    }

    #[test]
    fn stage_execution_error_display() {
        let err = StageExecutionError {
            stage_id: StageId::new("unit"),
            classification: FailureType::TestFailure,
            message: "2 failed".into(),
        };
        assert_eq!(err.to_string(), "stage unit failed (test_failure): 2 failed");
    }

    #[test]
    fn recovery_exhausted_requires_operator() {
        let err = EngineError::RecoveryExhausted(Box::new(Escalation {
            stage_id: StageId::new("deploy"),
            stage_number: 4,
            classification: FailureType::Unknown,
            last_error: None,
            profile: "heavy".into(),
            attempted: vec![],
            history: vec![],
            guidance: vec![],
        }));
        assert!(err.requires_operator());
        assert!(err.to_string().contains("deploy"));
        assert!(!EngineError::Cancelled.requires_operator());
    }

    #[test]
    fn sla_breach_display() {
        let err = EngineError::SlaBreach {
            stage_id: StageId::new("e2e"),
            severity: SlaSeverity::Critical,
            observed_ms: 61_000,
            target_ms: 30_000,
        };
        assert!(err.to_string().contains("critical"));
    }
}
