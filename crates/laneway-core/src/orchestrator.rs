//! Stage orchestrator
//!
//! Drives one run through its pipeline:
//! - Walks segments in declared order (inline stages, pool batches)
//! - Checkpoints every stage transition
//! - Observes durations through the SLA gate
//! - Classifies failures, plans recovery and applies it
//! - Escalates with full diagnostics when recovery is exhausted

use crate::error::{ConfigError, EngineError, Escalation, AttemptedAction, StageExecutionError};
use crate::pipeline::{Pipeline, Segment, StageDescriptor};
use crate::pool::{run_inline, BatchAnalysis, PoolMetrics, UnitReport, WorkerPool};
use crate::recovery::{RecoveryAction, RecoveryOperation, RecoveryPlanner, RecoveryStrategy};
use crate::resources::{PoolSettings, ResourceProbe, SystemProbe};
use crate::sla::{SlaEvent, SlaManager, SlaSeverity, SlaThresholds};
use crate::stage::RunContext;
use crate::state_machine::{validate_run_transition, validate_stage_transition};
use crate::types::{
    millis, FailureType, RunId, RunState, StageExecutionRecord, StageId, StageState,
};
use indexmap::IndexMap;
use laneway_checkpoint::{CheckpointManager, CheckpointMetrics, CheckpointRequest};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One applied recovery action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryLogEntry {
    /// Stage being recovered
    pub stage_id: StageId,
    /// Strategy applied
    pub strategy: RecoveryStrategy,
    /// What happened
    pub result: String,
    /// Checkpoint restored by the action, if any
    pub restored_checkpoint: Option<String>,
    /// Whether the action recovered the stage
    pub recovered: bool,
}

/// Everything a run produced
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run
    pub run_id: RunId,
    /// Lane
    pub profile: String,
    /// Final state
    pub state: RunState,
    /// Final state of every stage
    pub stage_states: IndexMap<StageId, StageState>,
    /// Every stage execution, in execution order
    pub records: Vec<StageExecutionRecord>,
    /// Checkpoint ids, in creation order
    pub checkpoints: Vec<String>,
    /// SLA events
    pub sla_events: Vec<SlaEvent>,
    /// False when any SLA event is critical
    pub sla_passed: bool,
    /// Analysis of every pool batch
    pub batches: Vec<BatchAnalysis>,
    /// Pool size
    pub workers: usize,
    /// Pool counters
    pub pool: PoolMetrics,
    /// Recovery actions applied
    pub recovery: Vec<RecoveryLogEntry>,
    /// Checkpoint restored by a rollback that ended the run
    pub rollback_target: Option<String>,
    /// Stage failure that ended the run
    pub failure: Option<StageExecutionError>,
    /// Operator escalation, when recovery was exhausted
    pub escalation: Option<Escalation>,
    /// Run was cancelled
    pub cancelled: bool,
    /// Wall time
    #[serde(with = "millis", rename = "duration_ms")]
    pub duration: Duration,
}

impl RunReport {
    /// Whether the run succeeded
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Success
    }

    /// Convert a non-successful run into its error
    ///
    /// # Errors
    /// - `RecoveryExhausted` when escalated to an operator
    /// - `SlaBreach` when the SLA gate failed
    /// - `Cancelled` when the run was cancelled
    /// - `StageExecution` when a rollback ended the run
    pub fn into_result(self) -> Result<Self, EngineError> {
        if self.state == RunState::Success {
            return Ok(self);
        }
        if let Some(escalation) = self.escalation {
            return Err(EngineError::RecoveryExhausted(Box::new(escalation)));
        }
        if self.cancelled {
            return Err(EngineError::Cancelled);
        }
        if let Some(failure) = self.failure {
            return Err(EngineError::StageExecution(failure));
        }
        match self
            .sla_events
            .into_iter()
            .find(|e| e.severity == SlaSeverity::Critical)
        {
            Some(e) => Err(EngineError::SlaBreach {
                stage_id: e.stage_id,
                severity: e.severity,
                observed_ms: u64::try_from(e.observed.as_millis()).unwrap_or(u64::MAX),
                target_ms: u64::try_from(e.target.as_millis()).unwrap_or(u64::MAX),
            }),
            None => Err(EngineError::Cancelled),
        }
    }
}

/// Mutable bookkeeping of a run in progress
struct Progress {
    run_state: RunState,
    states: IndexMap<StageId, StageState>,
    records: Vec<StageExecutionRecord>,
    checkpoints: Vec<String>,
    /// Last successful checkpoint before the current segment started
    restore_point: Option<String>,
    batches: Vec<BatchAnalysis>,
    recovery: Vec<RecoveryLogEntry>,
    rollback_target: Option<String>,
    failure: Option<StageExecutionError>,
    escalation: Option<Escalation>,
    cancelled: bool,
}

impl Progress {
    fn new(pipeline: &Pipeline) -> Self {
        Self {
            run_state: RunState::Init,
            states: pipeline
                .stages()
                .iter()
                .map(|s| (s.id.clone(), StageState::Pending))
                .collect(),
            records: Vec::new(),
            checkpoints: Vec::new(),
            restore_point: None,
            batches: Vec::new(),
            recovery: Vec::new(),
            rollback_target: None,
            failure: None,
            escalation: None,
            cancelled: false,
        }
    }

    fn run_to(&mut self, to: RunState) -> Result<(), EngineError> {
        validate_run_transition(self.run_state, to)?;
        self.run_state = to;
        Ok(())
    }

    fn stage_to(&mut self, id: &StageId, to: StageState) -> Result<(), EngineError> {
        let from = self.states.get(id).copied().unwrap_or(StageState::Pending);
        validate_stage_transition(from, to)?;
        self.states.insert(id.clone(), to);
        Ok(())
    }
}

/// How recovery of one stage ended
enum Recovery {
    Recovered,
    Skipped,
    RolledBack(Option<String>),
    Exhausted(Escalation),
    Cancelled,
}

/// Result of applying one action
enum Applied {
    Recovered,
    Skipped,
    Aborted(Option<String>),
    Failed(String),
    Cancelled,
}

/// Drives one run
pub struct StageOrchestrator {
    run: Arc<RunContext>,
    checkpoints: Arc<CheckpointManager>,
    planner: RecoveryPlanner,
    sla_thresholds: SlaThresholds,
    pool_settings: PoolSettings,
    probe: Arc<dyn ResourceProbe>,
}

impl std::fmt::Debug for StageOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageOrchestrator")
            .field("run_id", &self.run.run_id)
            .field("profile", &self.run.profile.name)
            .field("namespace", &self.checkpoints.namespace())
            .finish_non_exhaustive()
    }
}

impl StageOrchestrator {
    /// Create an orchestrator for one run
    ///
    /// # Errors
    /// Returns `Config` if the checkpoint manager writes to another run's namespace.
    pub fn new(run: Arc<RunContext>, checkpoints: Arc<CheckpointManager>) -> Result<Self, EngineError> {
        let expected = run.run_id.namespace();
        if checkpoints.namespace() != expected {
            return Err(ConfigError::Invalid(format!(
                "checkpoint namespace {} does not belong to run {} (expected {expected})",
                checkpoints.namespace(),
                run.run_id
            ))
            .into());
        }
        let pool_settings = PoolSettings::default();
        Ok(Self {
            run,
            checkpoints,
            planner: RecoveryPlanner::new(),
            sla_thresholds: SlaThresholds::default(),
            probe: Arc::new(SystemProbe::new(pool_settings.assumed_memory_gb)),
            pool_settings,
        })
    }

    /// With pool settings
    #[must_use]
    pub fn with_pool_settings(mut self, settings: PoolSettings) -> Self {
        self.pool_settings = settings;
        self
    }

    /// With resource probe
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// With SLA thresholds
    #[must_use]
    pub fn with_sla_thresholds(mut self, thresholds: SlaThresholds) -> Self {
        self.sla_thresholds = thresholds;
        self
    }

    /// Run context
    #[inline]
    #[must_use]
    pub fn run_context(&self) -> &Arc<RunContext> {
        &self.run
    }

    /// Execute the pipeline to a terminal state
    ///
    /// Stage failures, rollbacks and cancellation end in a report, not an
    /// error; use [`RunReport::into_result`] to turn them into one.
    ///
    /// # Errors
    /// - `ResourceUnavailable` if the pool cannot be sized
    /// - `Checkpoint` if a checkpoint cannot be written
    pub async fn run(&self, pipeline: &Pipeline) -> Result<RunReport, EngineError> {
        let started = Instant::now();
        let profile = Arc::clone(&self.run.profile);
        let mut pool = WorkerPool::for_host(Arc::clone(&self.run), self.probe.as_ref(), &self.pool_settings)?;
        let sla = SlaManager::new(self.sla_thresholds);
        let mut progress = Progress::new(pipeline);
        progress.run_to(RunState::Running)?;

        tracing::info!(
            run_id = %self.run.run_id,
            profile = %profile.name,
            stages = pipeline.len(),
            workers = pool.workers(),
            "run started"
        );

        'segments: for segment in pipeline.segments() {
            if self.run.is_cancelled() {
                progress.cancelled = true;
                break;
            }
            progress.restore_point = self.checkpoints.latest_successful()?.map(|cp| cp.id);

            let reports = match &segment {
                Segment::Inline(i) => {
                    let stage = &pipeline.stages()[*i];
                    vec![run_inline(&self.run, stage.key(), Arc::clone(&stage.body), 1).await]
                }
                Segment::Batch(indices) => {
                    for &i in indices {
                        let stage = &pipeline.stages()[i];
                        pool.submit(stage.key(), Arc::clone(&stage.body), 1)?;
                    }
                    let outcome = pool.wait_all().await?;
                    progress.batches.push(outcome.analysis.clone());
                    outcome
                        .records
                        .into_iter()
                        .map(|record| UnitReport {
                            cancelled: outcome.cancelled.contains(&record.stage_id),
                            record,
                        })
                        .collect()
                }
            };

            let workers = matches!(segment, Segment::Batch(_)).then_some(pool.workers());
            self.observe(&sla, reports.iter().map(|r| &r.record));
            let mut failed = Vec::new();
            for report in reports {
                let Some(stage) = pipeline
                    .position(&report.record.stage_id)
                    .and_then(|i| pipeline.stage(i))
                else {
                    continue;
                };
                self.settle(stage, &report, workers, &mut progress)?;
                if report.cancelled {
                    progress.cancelled = true;
                } else if !report.record.success {
                    failed.push((stage, report));
                }
            }
            if progress.cancelled {
                break;
            }

            for (stage, report) in failed {
                match self.recover(stage, &report, &sla, &mut progress).await? {
                    Recovery::Recovered | Recovery::Skipped => {}
                    Recovery::RolledBack(target) => {
                        progress.rollback_target = target;
                        progress.failure = report.error();
                        break 'segments;
                    }
                    Recovery::Exhausted(escalation) => {
                        progress.escalation = Some(escalation);
                        break 'segments;
                    }
                    Recovery::Cancelled => {
                        progress.cancelled = true;
                        break 'segments;
                    }
                }
            }
        }

        let sla_events = sla.events();
        let sla_passed = !sla_events.iter().any(|e| e.severity == SlaSeverity::Critical);
        let final_state = if progress.cancelled || progress.rollback_target.is_some() || progress.failure.is_some() {
            RunState::Aborted
        } else if progress.escalation.is_some() || !sla_passed {
            RunState::Failed
        } else {
            RunState::Success
        };
        progress.run_to(final_state)?;

        let duration = started.elapsed();
        metrics::counter!("laneway_runs_total", "state" => format!("{final_state:?}").to_lowercase())
            .increment(1);
        metrics::histogram!("laneway_run_duration_seconds").record(duration.as_secs_f64());
        tracing::info!(
            run_id = %self.run.run_id,
            state = ?final_state,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            checkpoints = progress.checkpoints.len(),
            sla_events = sla_events.len(),
            "run finished"
        );

        Ok(RunReport {
            run_id: self.run.run_id,
            profile: profile.name.clone(),
            state: final_state,
            stage_states: progress.states,
            records: progress.records,
            checkpoints: progress.checkpoints,
            sla_events,
            sla_passed,
            batches: progress.batches,
            workers: pool.workers(),
            pool: pool.metrics(),
            recovery: progress.recovery,
            rollback_target: progress.rollback_target,
            failure: progress.failure,
            escalation: progress.escalation,
            cancelled: progress.cancelled,
            duration,
        })
    }

    /// Pass executions through the SLA gate
    ///
    /// Successes and timeouts are measured; a timed-out unit ran at least
    /// its full timeout, which is where critical breaches show up.
    fn observe<'a>(&self, sla: &SlaManager, records: impl IntoIterator<Item = &'a StageExecutionRecord>) {
        let measured: Vec<StageExecutionRecord> = records
            .into_iter()
            .filter(|r| r.success || r.failure == Some(FailureType::Timeout))
            .cloned()
            .collect();
        if measured.is_empty() {
            return;
        }
        let (passed, events) = sla.check_all(&measured, &self.run.profile);
        if !passed {
            tracing::warn!(
                run_id = %self.run.run_id,
                critical = events.iter().filter(|e| e.severity == SlaSeverity::Critical).count(),
                "SLA gate failed"
            );
        }
    }

    /// Record a finished execution: state, checkpoint
    fn settle(
        &self,
        stage: &StageDescriptor,
        report: &UnitReport,
        workers: Option<usize>,
        progress: &mut Progress,
    ) -> Result<(), EngineError> {
        let record = &report.record;
        if report.cancelled && record.worker_id.is_none() && record.duration.is_zero() {
            // never started: stays pending, nothing to checkpoint
            return Ok(());
        }
        progress.stage_to(&stage.id, StageState::Running)?;
        progress.stage_to(
            &stage.id,
            if record.success {
                StageState::Done
            } else {
                StageState::Failed
            },
        )?;
        progress.records.push(record.clone());

        let profile = &self.run.profile.name;
        let request = if record.success {
            CheckpointRequest::success(profile, stage.number, &stage.name)
        } else {
            CheckpointRequest::failure(
                profile,
                stage.number,
                &stage.name,
                record.error_message.clone().unwrap_or_default(),
            )
        };
        let metrics = CheckpointMetrics {
            stage_duration_ms: Some(u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX)),
            attempt: record.attempt,
            worker_count: workers,
            ..CheckpointMetrics::default()
        };
        let checkpoint = self.checkpoints.create(request.with_metrics(metrics))?;
        progress.checkpoints.push(checkpoint.id);
        Ok(())
    }

    async fn recover(
        &self,
        stage: &StageDescriptor,
        report: &UnitReport,
        sla: &SlaManager,
        progress: &mut Progress,
    ) -> Result<Recovery, EngineError> {
        let classification = report.record.failure.unwrap_or(FailureType::Unknown);
        let plan = self.planner.get_recovery_plan(classification, &self.run.profile);
        let mut attempted = Vec::new();
        let mut attempt = report.record.attempt;
        let mut last_error = report.record.error_message.clone();

        tracing::warn!(
            run_id = %self.run.run_id,
            stage = %stage.id,
            %classification,
            plan = ?plan.iter().map(|a| a.strategy.as_str()).collect::<Vec<_>>(),
            "stage failed; planning recovery"
        );

        for action in &plan {
            if self.run.is_cancelled() {
                return Ok(Recovery::Cancelled);
            }
            let started = Instant::now();
            if action.optional_only && !stage.optional {
                attempted.push(AttemptedAction {
                    strategy: action.strategy,
                    result: "not applicable: stage is mandatory".into(),
                    elapsed: Duration::ZERO,
                });
                continue;
            }
            if !action.strategy.is_automatic() {
                attempted.push(AttemptedAction {
                    strategy: action.strategy,
                    result: "escalated to operator".into(),
                    elapsed: Duration::ZERO,
                });
                break;
            }

            let mut restored = None;
            let applied = self
                .apply(action, stage, &mut attempt, &mut last_error, &mut restored, sla, progress)
                .await?;
            let elapsed = started.elapsed();
            let (result, recovered) = match &applied {
                Applied::Recovered => (format!("recovered on attempt {attempt}"), true),
                Applied::Skipped => ("stage skipped".to_string(), true),
                Applied::Aborted(target) => (
                    format!(
                        "rolled back to {}",
                        target.as_deref().unwrap_or("the initial workspace state")
                    ),
                    true,
                ),
                Applied::Failed(msg) => (msg.clone(), false),
                Applied::Cancelled => ("cancelled".to_string(), false),
            };
            tracing::info!(
                run_id = %self.run.run_id,
                stage = %stage.id,
                strategy = %action.strategy,
                recovered,
                result = %result,
                "recovery action applied"
            );
            progress.recovery.push(RecoveryLogEntry {
                stage_id: stage.id.clone(),
                strategy: action.strategy,
                result: result.clone(),
                restored_checkpoint: restored.clone(),
                recovered,
            });
            attempted.push(AttemptedAction {
                strategy: action.strategy,
                result,
                elapsed,
            });

            match applied {
                Applied::Recovered => return Ok(Recovery::Recovered),
                Applied::Skipped => return Ok(Recovery::Skipped),
                Applied::Aborted(target) => return Ok(Recovery::RolledBack(target)),
                Applied::Cancelled => return Ok(Recovery::Cancelled),
                Applied::Failed(_) => {
                    self.unwind(&action.rollback_on_failure, stage, progress.restore_point.as_deref());
                }
            }
        }

        let mut guidance: Vec<String> = plan
            .iter()
            .flat_map(|a| &a.operations)
            .filter_map(|op| match op {
                RecoveryOperation::NotifyOperator { guidance } => Some(guidance.clone()),
                _ => None,
            })
            .collect();
        if guidance.is_empty() {
            guidance.push(RecoveryPlanner::guidance(classification).to_string());
        }
        if let Some(cp) = self.checkpoints.latest_successful()? {
            guidance.push(format!("last good checkpoint: {}", cp.id));
        }

        tracing::error!(
            run_id = %self.run.run_id,
            stage = %stage.id,
            %classification,
            attempts = attempted.len(),
            "recovery exhausted; escalating to operator"
        );
        Ok(Recovery::Exhausted(Escalation {
            stage_id: stage.id.clone(),
            stage_number: stage.number,
            classification,
            last_error,
            profile: self.run.profile.name.clone(),
            attempted,
            history: progress.records.clone(),
            guidance,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        action: &RecoveryAction,
        stage: &StageDescriptor,
        attempt: &mut u32,
        last_error: &mut Option<String>,
        restored: &mut Option<String>,
        sla: &SlaManager,
        progress: &mut Progress,
    ) -> Result<Applied, EngineError> {
        for op in &action.operations {
            match op {
                RecoveryOperation::RestoreLatestCheckpoint => {
                    let Some(id) = progress.restore_point.clone() else {
                        return Ok(Applied::Failed("no successful checkpoint to restore".into()));
                    };
                    if let Err(e) = self.checkpoints.restore(&id) {
                        return Ok(Applied::Failed(format!("restore of {id} failed: {e}")));
                    }
                    *restored = Some(id);
                }
                RecoveryOperation::CleanupArtifacts => {
                    if let Err(e) = self.checkpoints.cleanup_transient() {
                        return Ok(Applied::Failed(format!("cleanup failed: {e}")));
                    }
                }
                RecoveryOperation::SkipStage => {
                    progress.stage_to(&stage.id, StageState::Skipped)?;
                    return Ok(Applied::Skipped);
                }
                RecoveryOperation::AbortRun => return Ok(Applied::Aborted(restored.clone())),
                RecoveryOperation::RerunStage {
                    attempts,
                    backoff_ms,
                } => {
                    let mut delay = Duration::from_millis(*backoff_ms);
                    for _ in 0..*attempts {
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = self.run.cancel_token().cancelled() => return Ok(Applied::Cancelled),
                        }
                        delay = delay.saturating_mul(2);
                        *attempt += 1;
                        let report = run_inline(&self.run, stage.key(), Arc::clone(&stage.body), *attempt).await;
                        self.settle(stage, &report, None, progress)?;
                        self.observe(sla, [&report.record]);
                        if report.record.success {
                            return Ok(Applied::Recovered);
                        }
                        if report.cancelled {
                            return Ok(Applied::Cancelled);
                        }
                        last_error.clone_from(&report.record.error_message);
                    }
                    return Ok(Applied::Failed(format!(
                        "{attempts} rerun(s) failed; last error: {}",
                        last_error.as_deref().unwrap_or("none")
                    )));
                }
                RecoveryOperation::NotifyOperator { .. } => {
                    return Ok(Applied::Failed("operator action required".into()));
                }
            }
        }
        Ok(Applied::Failed("action completed without recovering the stage".into()))
    }

    /// Best-effort cleanup after a failed action
    fn unwind(&self, operations: &[RecoveryOperation], stage: &StageDescriptor, restore_point: Option<&str>) {
        for op in operations {
            match op {
                RecoveryOperation::RestoreLatestCheckpoint => {
                    if let Some(id) = restore_point {
                        if let Err(e) = self.checkpoints.restore(id) {
                            tracing::warn!(stage = %stage.id, checkpoint_id = id, error = %e, "unwind restore failed");
                        }
                    }
                }
                RecoveryOperation::NotifyOperator { guidance } => {
                    tracing::error!(stage = %stage.id, %guidance, "operator attention required");
                }
                RecoveryOperation::CleanupArtifacts => {
                    if let Err(e) = self.checkpoints.cleanup_transient() {
                        tracing::warn!(stage = %stage.id, error = %e, "unwind cleanup failed");
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageDescriptor;
    use crate::profile::{ExecutionProfile, WorkerStrategy};
    use crate::resources::{HostResources, StaticProbe};
    use crate::stage::{FnStage, StageBody, StageContext};
    use crate::types::StageOutcome;
    use laneway_checkpoint::{CheckpointSettings, MemoryCheckpointStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        _dir: tempfile::TempDir,
        orchestrator: StageOrchestrator,
        checkpoints: Arc<CheckpointManager>,
    }

    fn harness(profile: ExecutionProfile) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("state.txt"), "v0").unwrap();
        let run = Arc::new(RunContext::new(RunId::new(), Arc::new(profile), dir.path()));
        let store = Arc::new(MemoryCheckpointStore::new(run.run_id.namespace()));
        let checkpoints = Arc::new(CheckpointManager::new(
            CheckpointSettings::new(dir.path()).with_critical_files(["state.txt"]),
            store,
        ));
        let orchestrator = StageOrchestrator::new(run, Arc::clone(&checkpoints))
            .unwrap()
            .with_probe(Arc::new(StaticProbe(HostResources::new(4, 16.0))));
        Harness {
            _dir: dir,
            orchestrator,
            checkpoints,
        }
    }

    fn fast(profile: ExecutionProfile) -> ExecutionProfile {
        profile.with_retries(1, Duration::from_millis(1))
    }

    fn ok() -> Arc<dyn StageBody> {
        Arc::new(FnStage::new(|_| async { StageOutcome::ok() }))
    }

    fn always(kind: FailureType) -> Arc<dyn StageBody> {
        Arc::new(FnStage::new(move |_| async move { StageOutcome::failed_as(kind, "broken") }))
    }

    fn fails_first(kind: FailureType) -> Arc<dyn StageBody> {
        Arc::new(FnStage::new(move |ctx: StageContext| async move {
            if ctx.attempt == 1 {
                StageOutcome::failed_as(kind, "transient")
            } else {
                StageOutcome::ok()
            }
        }))
    }

    #[tokio::test]
    async fn successful_run_checkpoints_every_stage() {
        let h = harness(fast(ExecutionProfile::standard()));
        let pipeline = Pipeline::new(vec![
            StageDescriptor::new("a", 1, "A", ok()),
            StageDescriptor::new("b", 2, "B", ok()).parallel(),
            StageDescriptor::new("c", 3, "C", ok()).parallel(),
        ])
        .unwrap();
        let report = h.orchestrator.run(&pipeline).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.checkpoints.len(), 3);
        assert_eq!(report.batches.len(), 1);
        assert!(report.stage_states.values().all(|s| *s == StageState::Done));
        assert_eq!(h.checkpoints.list().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn timeout_is_retried_then_recovers() {
        let h = harness(fast(ExecutionProfile::standard()));
        let pipeline = Pipeline::new(vec![StageDescriptor::new(
            "flaky",
            1,
            "Flaky",
            fails_first(FailureType::Timeout),
        )])
        .unwrap();
        let report = h.orchestrator.run(&pipeline).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.recovery[0].strategy, RecoveryStrategy::Retry);
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[1].attempt, 2);
    }

    #[tokio::test]
    async fn mandatory_quality_gate_is_never_skipped() {
        let h = harness(fast(ExecutionProfile::standard()));
        let pipeline = Pipeline::new(vec![StageDescriptor::new(
            "coverage",
            1,
            "Coverage",
            always(FailureType::QualityGateFailure),
        )])
        .unwrap();
        let report = h.orchestrator.run(&pipeline).await.unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.stage_states[&StageId::new("coverage")], StageState::Failed);
        let err = report.into_result().unwrap_err();
        assert!(err.requires_operator());
    }

    #[tokio::test]
    async fn optional_stage_is_skipped() {
        let h = harness(fast(ExecutionProfile::standard()));
        let pipeline = Pipeline::new(vec![
            StageDescriptor::new("docs", 1, "Docs", always(FailureType::QualityGateFailure)).optional(),
            StageDescriptor::new("build", 2, "Build", ok()),
        ])
        .unwrap();
        let report = h.orchestrator.run(&pipeline).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.stage_states[&StageId::new("docs")], StageState::Skipped);
        assert_eq!(report.stage_states[&StageId::new("build")], StageState::Done);
    }

    #[tokio::test]
    async fn revision_error_rolls_back_and_aborts() {
        let h = harness(fast(ExecutionProfile::standard()));
        let pipeline = Pipeline::new(vec![
            StageDescriptor::new("a", 1, "A", ok()),
            StageDescriptor::new("b", 2, "B", always(FailureType::RevisionControlError)),
            StageDescriptor::new("c", 3, "C", ok()),
        ])
        .unwrap();
        let report = h.orchestrator.run(&pipeline).await.unwrap();
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.rollback_target.as_deref(), Some(report.checkpoints[0].as_str()));
        assert_eq!(report.stage_states[&StageId::new("c")], StageState::Pending);
        assert!(matches!(report.into_result(), Err(EngineError::StageExecution(_))));
    }

    #[tokio::test]
    async fn unknown_failure_escalates_with_history() {
        let h = harness(fast(ExecutionProfile::standard()));
        let pipeline = Pipeline::new(vec![
            StageDescriptor::new("a", 1, "A", ok()),
            StageDescriptor::new("b", 2, "B", always(FailureType::Unknown)),
        ])
        .unwrap();
        let report = h.orchestrator.run(&pipeline).await.unwrap();
        let escalation = report.escalation.clone().unwrap();
        assert_eq!(escalation.stage_id, StageId::new("b"));
        assert_eq!(escalation.history.len(), 2);
        assert_eq!(escalation.attempted[0].strategy, RecoveryStrategy::Manual);
        assert!(escalation.guidance.iter().any(|g| g.starts_with("last good checkpoint")));
    }

    #[tokio::test]
    async fn cancelled_run_is_aborted() {
        let h = harness(fast(ExecutionProfile::standard().with_strategy(WorkerStrategy::FixedThread)));
        let run = Arc::clone(h.orchestrator.run_context());
        let counter = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&counter);
        let first: Arc<dyn StageBody> = Arc::new(FnStage::new(move |ctx: StageContext| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                ctx.run.cancel();
                StageOutcome::ok()
            }
        }));
        let pipeline = Pipeline::new(vec![
            StageDescriptor::new("a", 1, "A", first),
            StageDescriptor::new("b", 2, "B", ok()),
        ])
        .unwrap();
        let report = h.orchestrator.run(&pipeline).await.unwrap();
        assert!(run.is_cancelled());
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.checkpoints.len(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(matches!(report.into_result(), Err(EngineError::Cancelled)));
    }

    #[test]
    fn foreign_namespace_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let run = Arc::new(RunContext::new(
            RunId::new(),
            Arc::new(ExecutionProfile::standard()),
            dir.path(),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            CheckpointSettings::new(dir.path()),
            Arc::new(MemoryCheckpointStore::new("run-other")),
        ));
        assert!(StageOrchestrator::new(run, checkpoints).is_err());
    }
}
