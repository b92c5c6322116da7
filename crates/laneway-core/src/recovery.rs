//! Recovery planning
//!
//! Maps a failure classification and a lane to an ordered list of
//! [`RecoveryAction`]s. The orchestrator executes the first viable action and
//! falls back through the rest. Plans are never empty: when nothing automatic
//! applies to a mandatory stage, the plan ends with [`RecoveryStrategy::Manual`].

use crate::profile::ExecutionProfile;
use crate::types::FailureType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Time budgeted for restoring a checkpoint in estimates
const RESTORE_ESTIMATE: Duration = Duration::from_secs(5);
/// Time budgeted for transient-artifact cleanup in estimates
const CLEANUP_ESTIMATE: Duration = Duration::from_secs(10);

/// How a lane trades retries against escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryBias {
    /// Base table as-is
    #[default]
    Balanced,
    /// Re-execution first, one extra attempt
    Latency,
    /// One automatic strategy at most, then an operator
    Strict,
}

impl fmt::Display for RecoveryBias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Balanced => "balanced",
            Self::Latency => "latency",
            Self::Strict => "strict",
        })
    }
}

/// Recovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Rerun the stage with backoff
    Retry,
    /// Restore the last good checkpoint, rerun, continue
    Resume,
    /// Mark an optional stage skipped
    Skip,
    /// Restore the last good checkpoint and abort the run
    Rollback,
    /// Remove transient artifacts, then rerun
    RetryAfterCleanup,
    /// Escalate to an operator
    Manual,
}

impl RecoveryStrategy {
    /// All strategies
    pub const ALL: [RecoveryStrategy; 6] = [
        Self::Retry,
        Self::Resume,
        Self::Skip,
        Self::Rollback,
        Self::RetryAfterCleanup,
        Self::Manual,
    ];

    /// Whether the orchestrator can apply it without an operator
    #[inline]
    #[must_use]
    pub fn is_automatic(&self) -> bool {
        !matches!(self, Self::Manual)
    }

    /// Whether the strategy re-executes the failed stage
    #[inline]
    #[must_use]
    pub fn reruns(&self) -> bool {
        matches!(self, Self::Retry | Self::Resume | Self::RetryAfterCleanup)
    }

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Resume => "resume",
            Self::Skip => "skip",
            Self::Rollback => "rollback",
            Self::RetryAfterCleanup => "retry_after_cleanup",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == normalized)
            .ok_or_else(|| format!("unknown recovery strategy: {s}"))
    }
}

/// One step of an action, interpreted by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RecoveryOperation {
    /// Restore the last successful checkpoint taken before the failed
    /// stage's segment started
    RestoreLatestCheckpoint,
    /// Re-execute the failed stage
    RerunStage {
        /// Attempts allowed
        attempts: u32,
        /// Delay before the first attempt; doubles after each
        backoff_ms: u64,
    },
    /// Remove configured transient artifacts
    CleanupArtifacts,
    /// Mark the stage skipped
    SkipStage,
    /// End the run as aborted
    AbortRun,
    /// Hand over to an operator
    NotifyOperator {
        /// What the operator should look at
        guidance: String,
    },
}

/// A recovery option
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAction {
    /// Strategy
    pub strategy: RecoveryStrategy,
    /// Human description
    pub description: String,
    /// Steps, in order
    pub operations: Vec<RecoveryOperation>,
    /// Expected time to apply
    #[serde(with = "crate::types::millis", rename = "estimated_duration_ms")]
    pub estimated_duration: Duration,
    /// Steps to run if this action fails before falling back
    pub rollback_on_failure: Vec<RecoveryOperation>,
    /// Applies to optional stages only
    pub optional_only: bool,
}

impl RecoveryAction {
    /// Rerun parameters, if the action re-executes the stage
    #[must_use]
    pub fn rerun(&self) -> Option<(u32, Duration)> {
        self.operations.iter().find_map(|op| match op {
            RecoveryOperation::RerunStage {
                attempts,
                backoff_ms,
            } => Some((*attempts, Duration::from_millis(*backoff_ms))),
            _ => None,
        })
    }
}

/// Builds recovery plans
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryPlanner;

impl RecoveryPlanner {
    /// Create planner
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Base strategies for a failure, before lane bias
    #[must_use]
    pub fn base_strategies(failure: FailureType) -> &'static [RecoveryStrategy] {
        use RecoveryStrategy::*;
        match failure {
            FailureType::Timeout => &[Retry, Resume],
            FailureType::TestFailure => &[Retry, Skip],
            FailureType::QualityGateFailure => &[Skip],
            FailureType::ResourceExhaustion => &[Rollback, RetryAfterCleanup],
            FailureType::NetworkError => &[Resume, Retry],
            FailureType::RevisionControlError => &[Rollback],
            FailureType::Unknown => &[Manual],
        }
    }

    /// Strategy order for a failure under a lane bias
    #[must_use]
    pub fn strategies(failure: FailureType, bias: RecoveryBias) -> Vec<RecoveryStrategy> {
        let base = Self::base_strategies(failure);
        let mut plan: Vec<RecoveryStrategy> = match bias {
            RecoveryBias::Balanced => base.to_vec(),
            RecoveryBias::Latency => {
                let (front, back): (Vec<_>, Vec<_>) = base.iter().partition(|s| s.reruns());
                front.into_iter().chain(back).collect()
            }
            RecoveryBias::Strict => {
                let preferred = match failure {
                    FailureType::TestFailure
                    | FailureType::QualityGateFailure
                    | FailureType::ResourceExhaustion => Some(RecoveryStrategy::Rollback),
                    _ => base.iter().copied().find(RecoveryStrategy::is_automatic),
                };
                preferred.into_iter().collect()
            }
        };

        let needs_manual = bias == RecoveryBias::Strict
            || !plan
                .iter()
                .any(|s| s.is_automatic() && *s != RecoveryStrategy::Skip);
        if needs_manual && plan.last() != Some(&RecoveryStrategy::Manual) {
            plan.push(RecoveryStrategy::Manual);
        }
        plan
    }

    /// Ordered recovery actions for a failure on a lane; never empty
    #[must_use]
    pub fn get_recovery_plan(
        &self,
        failure: FailureType,
        profile: &ExecutionProfile,
    ) -> Vec<RecoveryAction> {
        let plan: Vec<RecoveryAction> = Self::strategies(failure, profile.recovery_bias)
            .into_iter()
            .map(|s| self.action(s, failure, profile))
            .collect();
        tracing::debug!(
            %failure,
            profile = %profile.name,
            plan = ?plan.iter().map(|a| a.strategy.as_str()).collect::<Vec<_>>(),
            "recovery plan built"
        );
        plan
    }

    fn action(
        &self,
        strategy: RecoveryStrategy,
        failure: FailureType,
        profile: &ExecutionProfile,
    ) -> RecoveryAction {
        let mut attempts = profile.max_retries.max(1);
        if profile.recovery_bias == RecoveryBias::Latency {
            attempts += 1;
        }
        let backoff = profile.retry_backoff();
        let stage_time = Duration::from_millis(profile.default_sla_ms);
        let rerun = RecoveryOperation::RerunStage {
            attempts,
            backoff_ms: profile.retry_backoff_ms,
        };
        let rerun_estimate = stage_time * attempts + total_backoff(backoff, attempts);
        let restore_on_failure = if profile.recovery_bias == RecoveryBias::Latency {
            Vec::new()
        } else {
            vec![RecoveryOperation::RestoreLatestCheckpoint]
        };

        let (description, operations, estimated_duration, rollback_on_failure) = match strategy {
            RecoveryStrategy::Retry => (
                format!("rerun the stage up to {attempts} time(s) with exponential backoff"),
                vec![rerun],
                rerun_estimate,
                restore_on_failure,
            ),
            RecoveryStrategy::Resume => (
                "restore the last successful checkpoint, rerun the stage and continue".to_string(),
                vec![RecoveryOperation::RestoreLatestCheckpoint, rerun],
                RESTORE_ESTIMATE + rerun_estimate,
                restore_on_failure,
            ),
            RecoveryStrategy::RetryAfterCleanup => (
                "remove transient artifacts to free resources, then rerun the stage".to_string(),
                vec![RecoveryOperation::CleanupArtifacts, rerun],
                CLEANUP_ESTIMATE + rerun_estimate,
                restore_on_failure,
            ),
            RecoveryStrategy::Skip => (
                "skip the stage; allowed for optional stages only".to_string(),
                vec![RecoveryOperation::SkipStage],
                Duration::ZERO,
                Vec::new(),
            ),
            RecoveryStrategy::Rollback => (
                "restore the last successful checkpoint and abort the run".to_string(),
                vec![
                    RecoveryOperation::RestoreLatestCheckpoint,
                    RecoveryOperation::AbortRun,
                ],
                RESTORE_ESTIMATE,
                vec![RecoveryOperation::NotifyOperator {
                    guidance: "rollback could not restore a clean state; inspect the checkpoint ledger"
                        .to_string(),
                }],
            ),
            RecoveryStrategy::Manual => (
                "escalate to an operator with full diagnostics".to_string(),
                vec![RecoveryOperation::NotifyOperator {
                    guidance: Self::guidance(failure).to_string(),
                }],
                Duration::ZERO,
                Vec::new(),
            ),
        };

        RecoveryAction {
            strategy,
            description,
            operations,
            estimated_duration,
            rollback_on_failure,
            optional_only: strategy == RecoveryStrategy::Skip,
        }
    }

    /// Operator hint per classification
    #[must_use]
    pub fn guidance(failure: FailureType) -> &'static str {
        match failure {
            FailureType::Timeout => "stage keeps exceeding its timeout; profile it or raise the lane SLA",
            FailureType::TestFailure => "inspect the failing tests in the stage log",
            FailureType::QualityGateFailure => "mandatory quality gate not met; fix coverage or lint findings",
            FailureType::ResourceExhaustion => "host ran out of memory, disk or descriptors; free resources or lower pool caps",
            FailureType::NetworkError => "remote dependency unreachable; check connectivity and credentials",
            FailureType::RevisionControlError => "repository state is inconsistent; check the working tree and remotes",
            FailureType::Unknown => "unclassified failure; read the stage output and attempted actions",
        }
    }
}

fn total_backoff(base: Duration, attempts: u32) -> Duration {
    (0..attempts).map(|i| base * 2u32.saturating_pow(i)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use RecoveryStrategy::*;

    fn strategies(plan: &[RecoveryAction]) -> Vec<RecoveryStrategy> {
        plan.iter().map(|a| a.strategy).collect()
    }

    #[test]
    fn balanced_table() {
        let planner = RecoveryPlanner::new();
        let standard = ExecutionProfile::standard();
        let cases = [
            (FailureType::Timeout, vec![Retry, Resume]),
            (FailureType::TestFailure, vec![Retry, Skip]),
            (FailureType::QualityGateFailure, vec![Skip, Manual]),
            (FailureType::ResourceExhaustion, vec![Rollback, RetryAfterCleanup]),
            (FailureType::NetworkError, vec![Resume, Retry]),
            (FailureType::RevisionControlError, vec![Rollback]),
            (FailureType::Unknown, vec![Manual]),
        ];
        for (failure, expected) in cases {
            assert_eq!(
                strategies(&planner.get_recovery_plan(failure, &standard)),
                expected,
                "{failure}"
            );
        }
    }

    #[test]
    fn strict_keeps_one_automatic_and_ends_manual() {
        let heavy = ExecutionProfile::heavy();
        let planner = RecoveryPlanner::new();
        for failure in FailureType::ALL {
            let plan = strategies(&planner.get_recovery_plan(failure, &heavy));
            assert_eq!(plan.last(), Some(&Manual), "{failure}");
            assert!(plan.iter().filter(|s| s.is_automatic()).count() <= 1, "{failure}");
        }
        assert_eq!(
            strategies(&planner.get_recovery_plan(FailureType::TestFailure, &heavy)),
            vec![Rollback, Manual]
        );
    }

    #[test]
    fn latency_moves_reruns_to_front() {
        let light = ExecutionProfile::light();
        let planner = RecoveryPlanner::new();
        let plan = planner.get_recovery_plan(FailureType::ResourceExhaustion, &light);
        assert_eq!(strategies(&plan), vec![RetryAfterCleanup, Rollback]);
        assert_eq!(plan[0].rerun().map(|(n, _)| n), Some(light.max_retries + 1));
    }

    #[test]
    fn skip_is_optional_only() {
        let plan = RecoveryPlanner::new()
            .get_recovery_plan(FailureType::TestFailure, &ExecutionProfile::standard());
        let skip = plan.iter().find(|a| a.strategy == Skip).unwrap();
        assert!(skip.optional_only);
        assert!(plan.iter().filter(|a| a.strategy != Skip).all(|a| !a.optional_only));
    }

    #[test]
    fn resume_restores_then_reruns() {
        let plan = RecoveryPlanner::new()
            .get_recovery_plan(FailureType::NetworkError, &ExecutionProfile::standard());
        assert_eq!(
            plan[0].operations[0],
            RecoveryOperation::RestoreLatestCheckpoint
        );
        assert!(plan[0].rerun().is_some());
        assert!(plan[0].estimated_duration > Duration::ZERO);
    }

    #[test]
    fn strategy_parses() {
        assert_eq!("retry-after-cleanup".parse::<RecoveryStrategy>().unwrap(), RetryAfterCleanup);
        assert!("pray".parse::<RecoveryStrategy>().is_err());
    }
}
