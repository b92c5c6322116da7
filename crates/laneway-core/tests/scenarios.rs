//! End-to-end runs through the orchestrator:
//! - adaptive pool sizing on a large host
//! - SLA violation reporting, critical breaches failing the run
//! - resume from the last good checkpoint after a network error
//! - checkpoint ordering for batches
//! - shell-command pipelines loaded from TOML

use laneway_core::{
    EngineError, ExecutionProfile, FailureType, FnStage, Pipeline, PipelineFile, RecoveryPlanner,
    RecoveryStrategy, RunState, SlaManager, SlaSeverity, SlaThresholds, StageBody, StageContext,
    StageDescriptor, StageId, StageOutcome, StageState, WorkerStrategy,
};
use laneway_test_utils::{fast, fail_with, flaky, sleep_for, static_probe, succeed, write_file, TestWorkspace};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn adaptive_pool_on_large_host() {
    let ws = TestWorkspace::new();
    let (orchestrator, _) = ws.orchestrator(fast(ExecutionProfile::light()));
    let orchestrator = orchestrator.with_probe(static_probe(8, 16.0));
    assert_eq!(orchestrator.run_context().profile.strategy, WorkerStrategy::Adaptive);

    let pipeline = Pipeline::new(vec![
        StageDescriptor::new("lint", 1, "Lint", sleep_for(10)).parallel(),
        StageDescriptor::new("unit", 2, "Unit tests", sleep_for(10)).parallel(),
        StageDescriptor::new("docs", 3, "Docs", sleep_for(10)).parallel(),
    ])
    .unwrap();
    let report = orchestrator.run(&pipeline).await.unwrap();

    assert_eq!(report.workers, 16);
    assert_eq!(report.state, RunState::Success);
    assert_eq!(report.batches.len(), 1);
    assert!(report.failure.is_none());
    assert!(report.records.iter().all(|r| r.success && r.worker_id.is_some()));
    assert_eq!(report.pool.units_run, 3);
}

#[test]
fn thirty_five_seconds_on_thirty_second_target_is_one_violation() {
    let sla = SlaManager::new(SlaThresholds::default());
    let event = sla
        .check(&StageId::new("build"), Duration::from_secs(35), Duration::from_secs(30))
        .unwrap();
    assert_eq!(event.severity, SlaSeverity::Violation);
    assert_eq!(sla.count(SlaSeverity::Violation), 1);
    assert_eq!(sla.events().len(), 1);
}

#[tokio::test]
async fn slow_stage_reports_violation_without_failing_gate() {
    let ws = TestWorkspace::new();
    let mut profile = ExecutionProfile::standard().with_stage_sla("build", Duration::from_millis(100));
    profile.timeout_multiplier = 10.0;
    let (orchestrator, _) = ws.orchestrator(profile);

    let pipeline = Pipeline::new(vec![StageDescriptor::new("build", 1, "Build", sleep_for(130))]).unwrap();
    let report = orchestrator.run(&pipeline).await.unwrap();

    assert_eq!(report.sla_events.len(), 1);
    assert!(report.sla_events[0].severity >= SlaSeverity::Violation);
    if report.sla_events[0].severity == SlaSeverity::Violation {
        assert!(report.sla_passed);
        assert_eq!(report.state, RunState::Success);
    }
}

#[tokio::test]
async fn stage_timing_out_on_standard_lane_is_critical() {
    let ws = TestWorkspace::new();
    let profile = fast(ExecutionProfile::standard().with_stage_sla("slow", Duration::from_millis(100)));
    let (orchestrator, _) = ws.orchestrator(profile);

    let pipeline = Pipeline::new(vec![StageDescriptor::new("slow", 1, "Slow", sleep_for(1_000))]).unwrap();
    let report = orchestrator.run(&pipeline).await.unwrap();

    assert_eq!(report.records[0].failure, Some(FailureType::Timeout));
    assert!(report
        .sla_events
        .iter()
        .any(|e| e.stage_id.as_str() == "slow" && e.severity == SlaSeverity::Critical));
    assert!(!report.sla_passed);
    assert_eq!(report.state, RunState::Failed);
}

/// Critical breach on a stage that still completes inside its timeout
fn critical_but_successful(parallel: bool) -> Pipeline {
    let slow = StageDescriptor::new("slow", 1, "Slow", sleep_for(250));
    let stages = if parallel {
        vec![slow.parallel(), StageDescriptor::new("quick", 2, "Quick", succeed()).parallel()]
    } else {
        vec![slow]
    };
    Pipeline::new(stages).unwrap()
}

#[tokio::test]
async fn critical_breach_fails_the_run() {
    for parallel in [false, true] {
        let ws = TestWorkspace::new();
        let mut profile = ExecutionProfile::standard().with_stage_sla("slow", Duration::from_millis(100));
        profile.timeout_multiplier = 5.0;
        let (orchestrator, _) = ws.orchestrator(fast(profile));

        let report = orchestrator.run(&critical_but_successful(parallel)).await.unwrap();

        assert!(report.records.iter().all(|r| r.success), "parallel={parallel}");
        assert!(report.escalation.is_none());
        assert!(report.sla_events.iter().any(|e| e.severity == SlaSeverity::Critical));
        assert!(!report.sla_passed);
        assert_eq!(report.state, RunState::Failed, "parallel={parallel}");
        assert!(matches!(
            report.into_result(),
            Err(EngineError::SlaBreach { severity: SlaSeverity::Critical, .. })
        ));
    }
}

/// First execution corrupts the state file and fails with a network error
fn corrupting_network_failure() -> (Arc<dyn StageBody>, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let body = FnStage::new(move |ctx: StageContext| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = std::fs::write(ctx.workspace().join(".laneway/state.json"), "corrupt");
                StageOutcome::failed("connection reset by peer while fetching artifacts")
            } else {
                StageOutcome::ok()
            }
        }
    });
    (Arc::new(body), calls)
}

#[tokio::test]
async fn network_error_resumes_from_last_good_checkpoint() {
    let plan = RecoveryPlanner::new().get_recovery_plan(FailureType::NetworkError, &ExecutionProfile::standard());
    let strategies: Vec<_> = plan.iter().map(|a| a.strategy).collect();
    assert_eq!(strategies, vec![RecoveryStrategy::Resume, RecoveryStrategy::Retry]);

    let ws = TestWorkspace::new();
    let (orchestrator, manager) = ws.orchestrator(fast(ExecutionProfile::standard()));
    let (fetch, calls) = corrupting_network_failure();
    let pipeline = Pipeline::new(vec![
        StageDescriptor::new("prepare", 1, "Prepare", write_file(".laneway/state.json", "{\"stage\":1}")),
        StageDescriptor::new("fetch", 2, "Fetch", fetch),
        StageDescriptor::new("package", 3, "Package", succeed()),
    ])
    .unwrap();
    let report = orchestrator.run(&pipeline).await.unwrap();

    assert_eq!(report.state, RunState::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.recovery.len(), 1);
    assert_eq!(report.recovery[0].strategy, RecoveryStrategy::Resume);
    assert_eq!(report.recovery[0].restored_checkpoint.as_deref(), Some(report.checkpoints[0].as_str()));
    assert_eq!(ws.read(".laneway/state.json").as_deref(), Some("{\"stage\":1}"));

    let executed: Vec<(&str, u32)> = report
        .records
        .iter()
        .map(|r| (r.stage_id.as_str(), r.attempt))
        .collect();
    assert_eq!(executed, vec![("prepare", 1), ("fetch", 1), ("fetch", 2), ("package", 1)]);

    // prepare, failed fetch, recovered fetch, package
    let ledger = manager.list().unwrap();
    assert_eq!(ledger.len(), 4);
    assert!(!ledger[2].success);
}

#[tokio::test]
async fn batch_failure_restores_checkpoint_from_before_the_batch() {
    let ws = TestWorkspace::new();
    let (orchestrator, _) = ws.orchestrator(fast(ExecutionProfile::standard()));
    let (fetch, calls) = flaky(1, FailureType::NetworkError);
    let pipeline = Pipeline::new(vec![
        StageDescriptor::new("prepare", 1, "Prepare", write_file(".laneway/state.json", "{\"stage\":1}")),
        StageDescriptor::new("bundle", 2, "Bundle", write_file("bundle.txt", "packed")).parallel(),
        StageDescriptor::new("fetch", 3, "Fetch", fetch).parallel(),
    ])
    .unwrap();
    let report = orchestrator.run(&pipeline).await.unwrap();

    assert_eq!(report.state, RunState::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.recovery[0].strategy, RecoveryStrategy::Resume);
    // prepare's checkpoint, not the one bundle took inside the batch
    assert_eq!(report.recovery[0].restored_checkpoint.as_deref(), Some(report.checkpoints[0].as_str()));
    assert_ne!(report.recovery[0].restored_checkpoint.as_deref(), Some(report.checkpoints[1].as_str()));
}

#[tokio::test]
async fn batch_checkpoints_follow_declared_order() {
    let ws = TestWorkspace::new();
    let (orchestrator, manager) = ws.orchestrator(fast(ExecutionProfile::standard()));
    let pipeline = Pipeline::new(vec![
        StageDescriptor::new("checkout", 1, "Checkout", succeed()),
        StageDescriptor::new("slow", 2, "Slow", sleep_for(60)).parallel(),
        StageDescriptor::new("fast", 3, "Fast", sleep_for(1)).parallel(),
        StageDescriptor::new("package", 4, "Package", succeed()),
    ])
    .unwrap();
    let report = orchestrator.run(&pipeline).await.unwrap();
    assert!(report.succeeded());

    let mut ledger = manager.list().unwrap();
    ledger.reverse();
    let numbers: Vec<u32> = ledger.iter().map(|c| c.stage_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert!(ledger.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(ledger.windows(2).all(|w| w[0].created_at < w[1].created_at));
    assert!(ledger.iter().all(|c| c.namespace == orchestrator.run_context().run_id.namespace()));
}

#[tokio::test]
async fn flaky_test_stage_recovers_by_retry() {
    let ws = TestWorkspace::new();
    let (orchestrator, _) = ws.orchestrator(fast(ExecutionProfile::standard()));
    let (tests, calls) = flaky(2, FailureType::TestFailure);
    let pipeline = Pipeline::new(vec![StageDescriptor::new("tests", 1, "Tests", tests)]).unwrap();
    let report = orchestrator.run(&pipeline).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.recovery[0].strategy, RecoveryStrategy::Retry);
}

#[tokio::test]
async fn heavy_lane_escalates_after_rollback_fails() {
    let ws = TestWorkspace::new();
    let (orchestrator, _) = ws.orchestrator(fast(ExecutionProfile::heavy()));
    let pipeline = Pipeline::new(vec![StageDescriptor::new(
        "fetch",
        1,
        "Fetch",
        fail_with(FailureType::NetworkError, "network unreachable"),
    )])
    .unwrap();
    let report = orchestrator.run(&pipeline).await.unwrap();

    // strict lane: resume has no checkpoint to restore, then manual
    assert_eq!(report.state, RunState::Failed);
    let escalation = report.escalation.clone().unwrap();
    let tried: Vec<_> = escalation.attempted.iter().map(|a| a.strategy).collect();
    assert_eq!(tried, vec![RecoveryStrategy::Resume, RecoveryStrategy::Manual]);
    assert_eq!(report.stage_states[&StageId::new("fetch")], StageState::Failed);
    assert!(report.into_result().unwrap_err().requires_operator());
}

#[cfg(unix)]
#[tokio::test]
async fn toml_command_pipeline_runs_end_to_end() {
    let ws = TestWorkspace::new();
    let pipeline = PipelineFile::from_toml(
        r#"
        [[stage]]
        id = "stamp"
        command = "echo \"$LANEWAY_STAGE\" > stamp.txt"

        [[stage]]
        id = "check-a"
        command = "test -f stamp.txt"
        parallel = true

        [[stage]]
        id = "check-b"
        command = "grep -q stamp stamp.txt"
        parallel = true
        "#,
    )
    .unwrap()
    .into_pipeline()
    .unwrap();
    let (orchestrator, _) = ws.orchestrator(fast(ExecutionProfile::standard()));
    let report = orchestrator.run(&pipeline).await.unwrap();

    assert_eq!(report.state, RunState::Success, "{:?}", report.failure);
    assert_eq!(ws.read("stamp.txt").as_deref(), Some("stamp\n"));
    assert_eq!(report.checkpoints.len(), 3);
}
