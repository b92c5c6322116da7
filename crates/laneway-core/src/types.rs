//! Core types for the pipeline engine
//!
//! Defines the fundamental value types shared by every component:
//! - Run, stage and worker identifiers
//! - Failure classification
//! - Run and stage lifecycle states
//! - Stage outcomes and execution records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use ulid::Ulid;

/// Unique run identifier (ULID for sortability); doubles as storage namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Storage namespace for this run
    #[must_use]
    pub fn namespace(&self) -> String {
        format!("run-{}", self.0.to_string().to_lowercase())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage identifier, unique within a pipeline
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub String);

impl StageId {
    /// Create stage ID
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Pool slot a unit ran on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Category of a stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Stage exceeded its timeout
    Timeout,
    /// Test suite reported failures
    TestFailure,
    /// Coverage, lint or other quality threshold not met
    QualityGateFailure,
    /// Memory, disk or descriptor exhaustion
    ResourceExhaustion,
    /// Network or remote service unreachable
    NetworkError,
    /// Revision-control operation failed
    RevisionControlError,
    /// Anything else
    Unknown,
}

impl FailureType {
    /// All classifications
    pub const ALL: [FailureType; 7] = [
        Self::Timeout,
        Self::TestFailure,
        Self::QualityGateFailure,
        Self::ResourceExhaustion,
        Self::NetworkError,
        Self::RevisionControlError,
        Self::Unknown,
    ];

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::TestFailure => "test_failure",
            Self::QualityGateFailure => "quality_gate_failure",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::NetworkError => "network_error",
            Self::RevisionControlError => "revision_control_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown failure type: {s}"))
    }
}

/// Run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Created, not started
    Init,
    /// Walking the stage graph
    Running,
    /// Every stage done or skipped
    Success,
    /// A stage failed and recovery was exhausted
    Failed,
    /// Cancelled or rolled back
    Aborted,
}

impl RunState {
    /// Whether the run has finished
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }
}

/// Stage lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    /// Not started
    Pending,
    /// Body executing
    Running,
    /// Completed successfully
    Done,
    /// Body reported failure
    Failed,
    /// Skipped by recovery (optional stages only)
    Skipped,
}

/// How a body is isolated from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Runs inside the engine process; cancellation is cooperative
    #[default]
    Thread,
    /// Runs as a child process; cancellation kills it
    Process,
}

/// Dominant resource a body consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    /// Mostly waiting on I/O
    #[default]
    IoBound,
    /// Mostly computing
    CpuBound,
}

/// Value returned by a stage body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageOutcome {
    /// Whether the stage passed
    pub success: bool,
    /// Failure description
    pub error_message: Option<String>,
    /// Classification chosen by the body, overriding message heuristics
    pub failure_hint: Option<FailureType>,
}

impl StageOutcome {
    /// Successful outcome
    #[inline]
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// Failed outcome, classified from the message
    #[inline]
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            failure_hint: None,
        }
    }

    /// Failed outcome with explicit classification
    #[inline]
    #[must_use]
    pub fn failed_as(kind: FailureType, message: impl Into<String>) -> Self {
        Self {
            failure_hint: Some(kind),
            ..Self::failed(message)
        }
    }
}

/// One run of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecutionRecord {
    /// Stage identifier
    pub stage_id: StageId,
    /// Declared stage number
    pub stage_number: u32,
    /// Stage name
    pub stage_name: String,
    /// Attempt (1-based)
    pub attempt: u32,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Wall time
    #[serde(with = "millis", rename = "duration_ms")]
    pub duration: Duration,
    /// Whether the stage passed
    pub success: bool,
    /// Present exactly when `success` is false
    pub failure: Option<FailureType>,
    /// Failure description
    pub error_message: Option<String>,
    /// Pool slot, `None` for inline execution
    pub worker_id: Option<WorkerId>,
    /// Isolation used
    pub isolation: Isolation,
}

impl StageExecutionRecord {
    /// Build a finalized record; `failure` is kept only for failed outcomes
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn finalize(
        stage: &StageKey,
        attempt: u32,
        started_at: DateTime<Utc>,
        duration: Duration,
        outcome: &StageOutcome,
        failure: FailureType,
        worker_id: Option<WorkerId>,
        isolation: Isolation,
    ) -> Self {
        let finished_at = started_at
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            stage_id: stage.id.clone(),
            stage_number: stage.number,
            stage_name: stage.name.clone(),
            attempt,
            started_at,
            finished_at,
            duration,
            success: outcome.success,
            failure: (!outcome.success).then_some(failure),
            error_message: if outcome.success {
                None
            } else {
                outcome.error_message.clone()
            },
            worker_id,
            isolation,
        }
    }
}

/// Identity of a stage as carried through the pool
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageKey {
    /// Stage identifier
    pub id: StageId,
    /// Declared number
    pub number: u32,
    /// Name
    pub name: String,
}

impl StageKey {
    /// Create key
    #[must_use]
    pub fn new(id: impl Into<StageId>, number: u32, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            number,
            name: name.into(),
        }
    }
}

impl From<String> for StageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds
    ///
    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds
    ///
    /// # Errors
    /// Propagates deserializer errors.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_type_parses_wire_names() {
        for t in FailureType::ALL {
            assert_eq!(t.as_str().parse::<FailureType>().unwrap(), t);
        }
        assert_eq!(
            "network-error".parse::<FailureType>().unwrap(),
            FailureType::NetworkError
        );
        assert!("flaky".parse::<FailureType>().is_err());
    }

    #[test]
    fn failure_type_serde_is_snake_case() {
        let json = serde_json::to_string(&FailureType::QualityGateFailure).unwrap();
        assert_eq!(json, "\"quality_gate_failure\"");
    }

    #[test]
    fn record_has_classification_only_on_failure() {
        let key = StageKey::new("lint", 1, "Lint");
        let now = Utc::now();
        let ok = StageExecutionRecord::finalize(
            &key,
            1,
            now,
            Duration::from_millis(5),
            &StageOutcome::ok(),
            FailureType::Unknown,
            None,
            Isolation::Thread,
        );
        assert!(ok.success);
        assert_eq!(ok.failure, None);

        let failed = StageExecutionRecord::finalize(
            &key,
            1,
            now,
            Duration::from_millis(5),
            &StageOutcome::failed("boom"),
            FailureType::TestFailure,
            Some(WorkerId(0)),
            Isolation::Thread,
        );
        assert_eq!(failed.failure, Some(FailureType::TestFailure));
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn run_namespace_is_lowercase_and_prefixed() {
        let id = RunId::new();
        let ns = id.namespace();
        assert!(ns.starts_with("run-"));
        assert_eq!(ns, ns.to_lowercase());
    }

    #[test]
    fn record_duration_serializes_as_millis() {
        let key = StageKey::new("build", 2, "Build");
        let rec = StageExecutionRecord::finalize(
            &key,
            1,
            Utc::now(),
            Duration::from_millis(1500),
            &StageOutcome::ok(),
            FailureType::Unknown,
            None,
            Isolation::Process,
        );
        let value = serde_json::to_value(&rec).unwrap();
        assert_eq!(value["duration_ms"], 1500);
    }
}
