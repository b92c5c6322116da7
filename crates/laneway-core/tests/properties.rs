//! Property tests:
//! - pool size stays within `1..=caps.high` for every strategy and host
//! - SLA severity is monotonic in the observed duration
//! - every (failure, lane) pair has a non-empty plan with a non-skip path

use laneway_core::{
    worker_count, ExecutionProfile, FailureType, HostResources, PoolSettings, RecoveryPlanner,
    RecoveryStrategy, SlaSeverity, SlaThresholds, WorkerStrategy,
};
use proptest::prelude::*;
use std::time::Duration;

fn strategy() -> impl Strategy<Value = WorkerStrategy> {
    prop::sample::select(WorkerStrategy::ALL.to_vec())
}

proptest! {
    #[test]
    fn pool_size_is_bounded(
        strategy in strategy(),
        cores in 1usize..512,
        memory in 0.0f64..256.0,
        fixed in prop::option::of(1usize..128),
    ) {
        let settings = PoolSettings::default();
        let n = worker_count(strategy, HostResources::new(cores, memory), &settings, fixed).unwrap();
        prop_assert!(n >= 1);
        prop_assert!(n <= settings.caps.high);
        if strategy == WorkerStrategy::Sequential {
            prop_assert_eq!(n, 1);
        }
        if strategy == WorkerStrategy::FixedProcess {
            prop_assert!(n <= settings.caps.mid);
        }
    }

    #[test]
    fn zero_cores_is_unavailable(strategy in strategy(), memory in 0.0f64..64.0) {
        let result = worker_count(strategy, HostResources::new(0, memory), &PoolSettings::default(), None);
        prop_assert!(result.is_err());
    }

    #[test]
    fn sla_severity_is_monotonic(target_ms in 1u64..100_000, a in 0u64..400_000, b in 0u64..400_000) {
        let t = SlaThresholds::default();
        let target = Duration::from_millis(target_ms);
        let (lo, hi) = (a.min(b), a.max(b));
        let s_lo = t.classify(Duration::from_millis(lo), target);
        let s_hi = t.classify(Duration::from_millis(hi), target);
        prop_assert!(s_lo <= s_hi);
    }

    #[test]
    fn sla_boundaries_are_exact(target_ms in 1u64..1_000_000) {
        let t = SlaThresholds::default();
        let target = Duration::from_millis(target_ms);
        let at = |pct: u64| Duration::from_millis(target_ms * pct / 100);
        if target_ms % 100 == 0 {
            prop_assert_eq!(t.classify(at(80), target), Some(SlaSeverity::Warning));
            prop_assert_eq!(t.classify(at(200), target), Some(SlaSeverity::Critical));
        }
        prop_assert_eq!(t.classify(target, target), Some(SlaSeverity::Violation));
        prop_assert_eq!(t.classify(Duration::ZERO, target), None);
    }
}

#[test]
fn every_failure_and_lane_has_a_usable_plan() {
    let planner = RecoveryPlanner::new();
    let lanes = [ExecutionProfile::light(), ExecutionProfile::standard(), ExecutionProfile::heavy()];
    for lane in &lanes {
        for failure in FailureType::ALL {
            let plan = planner.get_recovery_plan(failure, lane);
            assert!(!plan.is_empty(), "{failure} on {}", lane.name);
            assert!(
                plan.iter().any(|a| !a.optional_only),
                "{failure} on {} has only optional-stage actions",
                lane.name
            );
            assert!(
                plan.iter().all(|a| !a.operations.is_empty()),
                "{failure} on {} has an empty action",
                lane.name
            );
        }
    }
}

#[test]
fn strict_lane_always_ends_with_manual() {
    let planner = RecoveryPlanner::new();
    for failure in FailureType::ALL {
        let plan = planner.get_recovery_plan(failure, &ExecutionProfile::heavy());
        assert_eq!(plan.last().map(|a| a.strategy), Some(RecoveryStrategy::Manual));
        assert!(plan.iter().filter(|a| a.strategy.is_automatic()).count() <= 1);
    }
}
