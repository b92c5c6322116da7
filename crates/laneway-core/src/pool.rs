//! Bounded worker pool for parallel stage batches
//!
//! Provides:
//! - Sizing from the lane's worker strategy and host resources
//! - A hard concurrency bound (semaphore + worker slot free-list)
//! - Per-unit timeouts and panic capture at the worker boundary
//! - Drain (thread strategies) or hard (process strategies) cancellation
//! - Batch analysis: bottlenecks, utilization and sizing recommendations

use crate::classify::classify;
use crate::error::{EngineError, PoolError, StageExecutionError};
use crate::profile::WorkerStrategy;
use crate::resources::{worker_count, PoolSettings, ResourceProbe};
use crate::stage::{RunContext, StageBody, StageContext};
use crate::types::{
    millis, FailureType, Isolation, StageExecutionRecord, StageId, StageKey, StageOutcome,
    WorkerId, WorkloadClass,
};
use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Units slower than this multiple of the batch mean are bottlenecks
const BOTTLENECK_FACTOR: f64 = 1.5;
/// Bottlenecks reported per batch
const MAX_BOTTLENECKS: usize = 3;
/// Below this utilization the pool is oversized
const LOW_UTILIZATION: f64 = 0.5;
/// Above this utilization the pool is undersized
const HIGH_UTILIZATION: f64 = 0.9;
/// Slowest/fastest ratio above which the batch is unbalanced
const IMBALANCE_RATIO: f64 = 3.0;

/// Counters accumulated over the pool's lifetime
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    /// Units that started executing
    pub units_run: u64,
    /// Units that failed (including timeouts)
    pub failures: u64,
    /// Units that hit their timeout
    pub timeouts: u64,
    /// Highest number of units executing at once
    pub peak_concurrency: usize,
    /// Summed unit wall time
    #[serde(with = "millis", rename = "busy_ms")]
    pub busy: Duration,
}

/// A unit much slower than its batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bottleneck {
    /// Stage
    pub stage_id: StageId,
    /// Its duration
    #[serde(with = "millis", rename = "duration_ms")]
    pub duration: Duration,
    /// duration / batch mean
    pub ratio_to_mean: f64,
}

/// Pool tuning suggestion
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recommendation {
    /// Pool mostly idle
    ReduceWorkers {
        /// Current size
        current: usize,
        /// Suggested size
        suggested: usize,
        /// Observed utilization
        utilization: f64,
    },
    /// Pool saturated
    IncreaseWorkers {
        /// Current size
        current: usize,
        /// Suggested size, bounded by the resource ceiling
        suggested: usize,
        /// Observed utilization
        utilization: f64,
    },
    /// One unit dominates the batch
    Rebalance {
        /// Slowest stage
        stage_id: StageId,
        /// slowest / fastest
        max_min_ratio: f64,
    },
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReduceWorkers {
                current,
                suggested,
                utilization,
            } => write!(
                f,
                "utilization {:.0}%: reduce workers from {current} to {suggested}",
                utilization * 100.0
            ),
            Self::IncreaseWorkers {
                current,
                suggested,
                utilization,
            } => write!(
                f,
                "utilization {:.0}%: increase workers from {current} to {suggested}",
                utilization * 100.0
            ),
            Self::Rebalance {
                stage_id,
                max_min_ratio,
            } => write!(
                f,
                "stage {stage_id} runs {max_min_ratio:.1}x longer than the fastest unit: split or rebalance it"
            ),
        }
    }
}

/// Post-batch performance analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchAnalysis {
    /// Mean unit duration
    #[serde(with = "millis", rename = "mean_ms")]
    pub mean: Duration,
    /// Batch wall time
    #[serde(with = "millis", rename = "wall_ms")]
    pub wall: Duration,
    /// busy / (workers × wall), within `0..=1`
    pub utilization: f64,
    /// Slowest outliers, slowest first
    pub bottlenecks: Vec<Bottleneck>,
    /// Tuning suggestions
    pub recommendations: Vec<Recommendation>,
}

impl BatchAnalysis {
    /// Analyze executed units
    #[must_use]
    pub fn compute(
        records: &[StageExecutionRecord],
        workers: usize,
        ceiling: usize,
        wall: Duration,
    ) -> Self {
        if records.is_empty() {
            return Self {
                wall,
                ..Self::default()
            };
        }
        let busy: Duration = records.iter().map(|r| r.duration).sum();
        let count = u32::try_from(records.len()).unwrap_or(u32::MAX);
        let mean = busy / count;

        let mut bottlenecks: Vec<Bottleneck> = records
            .iter()
            .filter(|r| !mean.is_zero() && r.duration.as_secs_f64() > mean.as_secs_f64() * BOTTLENECK_FACTOR)
            .map(|r| Bottleneck {
                stage_id: r.stage_id.clone(),
                duration: r.duration,
                ratio_to_mean: r.duration.as_secs_f64() / mean.as_secs_f64(),
            })
            .collect();
        bottlenecks.sort_by(|a, b| b.duration.cmp(&a.duration));
        bottlenecks.truncate(MAX_BOTTLENECKS);

        let mut recommendations = Vec::new();
        let utilization = if wall.is_zero() || workers == 0 {
            0.0
        } else {
            (busy.as_secs_f64() / (wall.as_secs_f64() * workers as f64)).min(1.0)
        };
        if !wall.is_zero() {
            if utilization < LOW_UTILIZATION && workers > 1 {
                let needed = (busy.as_secs_f64() / wall.as_secs_f64()).ceil() as usize;
                let suggested = needed.clamp(1, workers - 1);
                recommendations.push(Recommendation::ReduceWorkers {
                    current: workers,
                    suggested,
                    utilization,
                });
            } else if utilization > HIGH_UTILIZATION && workers < ceiling {
                let suggested = (workers + (workers / 2).max(1)).min(ceiling);
                recommendations.push(Recommendation::IncreaseWorkers {
                    current: workers,
                    suggested,
                    utilization,
                });
            }
        }

        if records.len() >= 2 {
            let slowest = records.iter().max_by_key(|r| r.duration);
            let fastest = records.iter().map(|r| r.duration).min().unwrap_or_default();
            if let Some(slowest) = slowest {
                let floor = fastest.max(Duration::from_millis(1));
                let ratio = slowest.duration.as_secs_f64() / floor.as_secs_f64();
                if ratio > IMBALANCE_RATIO {
                    recommendations.push(Recommendation::Rebalance {
                        stage_id: slowest.stage_id.clone(),
                        max_min_ratio: ratio,
                    });
                }
            }
        }

        Self {
            mean,
            wall,
            utilization,
            bottlenecks,
            recommendations,
        }
    }
}

/// Result of draining a batch
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Every unit succeeded
    pub all_succeeded: bool,
    /// Failed units with their classified error
    pub errors: Vec<(StageId, StageExecutionError)>,
    /// One record per submitted unit, in declared stage order
    pub records: Vec<StageExecutionRecord>,
    /// Units stopped by run cancellation
    pub cancelled: Vec<StageId>,
    /// Batch deadline expired
    pub timed_out: bool,
    /// Performance analysis
    pub analysis: BatchAnalysis,
}

/// Result of one unit
#[derive(Debug, Clone)]
pub struct UnitReport {
    /// Finalized record
    pub record: StageExecutionRecord,
    /// Stopped by run cancellation
    pub cancelled: bool,
}

impl UnitReport {
    /// Classified error, if the unit failed
    #[must_use]
    pub fn error(&self) -> Option<StageExecutionError> {
        record_error(&self.record)
    }

    fn not_started(key: &StageKey, attempt: u32, isolation: Isolation, outcome: &StageOutcome) -> Self {
        let failure = classify(outcome);
        Self {
            record: StageExecutionRecord::finalize(
                key,
                attempt,
                Utc::now(),
                Duration::ZERO,
                outcome,
                failure,
                None,
                isolation,
            ),
            cancelled: failure != FailureType::Timeout,
        }
    }
}

fn record_error(record: &StageExecutionRecord) -> Option<StageExecutionError> {
    record.failure.map(|classification| StageExecutionError {
        stage_id: record.stage_id.clone(),
        classification,
        message: record
            .error_message
            .clone()
            .unwrap_or_else(|| "stage failed without a message".to_string()),
    })
}

struct Submitted {
    key: StageKey,
    attempt: u32,
    isolation: Isolation,
    timeout: Duration,
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Returns the worker slot and clears the active entry when the unit ends
struct SlotGuard {
    stage: StageId,
    worker: Option<WorkerId>,
    slots: Arc<Mutex<Vec<WorkerId>>>,
    active: Arc<DashMap<StageId, Option<WorkerId>>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.active.remove(&self.stage);
        if let Some(w) = self.worker {
            self.slots.lock().push(w);
        }
    }
}

/// Bounded pool executing one batch at a time
pub struct WorkerPool {
    run: Arc<RunContext>,
    strategy: WorkerStrategy,
    workers: usize,
    ceiling: usize,
    startup_overhead: Duration,
    semaphore: Arc<Semaphore>,
    slots: Arc<Mutex<Vec<WorkerId>>>,
    active: Arc<DashMap<StageId, Option<WorkerId>>>,
    metrics: Arc<Mutex<PoolMetrics>>,
    tasks: JoinSet<UnitReport>,
    submitted: IndexMap<StageId, Submitted>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("strategy", &self.strategy)
            .field("workers", &self.workers)
            .field("pending", &self.submitted.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Create a pool of exactly `workers` slots (at least 1)
    #[must_use]
    pub fn new(run: Arc<RunContext>, workers: usize, settings: &PoolSettings) -> Self {
        let workers = workers.max(1);
        let strategy = run.profile.strategy;
        metrics::gauge!("laneway_pool_workers").set(workers as f64);
        Self {
            run,
            strategy,
            workers,
            ceiling: settings.caps.high.max(workers),
            startup_overhead: settings.startup_overhead(),
            semaphore: Arc::new(Semaphore::new(workers)),
            slots: Arc::new(Mutex::new((0..workers).rev().map(WorkerId).collect())),
            active: Arc::new(DashMap::new()),
            metrics: Arc::new(Mutex::new(PoolMetrics::default())),
            tasks: JoinSet::new(),
            submitted: IndexMap::new(),
        }
    }

    /// Create a pool sized from the lane's strategy and probed host resources
    ///
    /// # Errors
    /// Returns `ResourceUnavailable` if the probe fails or reports zero cores.
    pub fn for_host(
        run: Arc<RunContext>,
        probe: &dyn ResourceProbe,
        settings: &PoolSettings,
    ) -> Result<Self, EngineError> {
        let resources = probe.probe()?;
        let workers = worker_count(
            run.profile.strategy,
            resources,
            settings,
            run.profile.fixed_workers,
        )?;
        tracing::info!(
            run_id = %run.run_id,
            strategy = %run.profile.strategy,
            cores = resources.logical_cores,
            memory_gb = resources.available_memory_gb,
            workers,
            "worker pool sized"
        );
        Ok(Self::new(run, workers, settings))
    }

    /// Pool size
    #[inline]
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Strategy in use
    #[inline]
    #[must_use]
    pub fn strategy(&self) -> WorkerStrategy {
        self.strategy
    }

    /// Units currently executing
    #[inline]
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Lifetime counters
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        self.metrics.lock().clone()
    }

    /// Enqueue a unit of the current batch; it starts as soon as a slot frees
    ///
    /// # Errors
    /// - `PoolError::DuplicateStage` if the stage is already in this batch
    /// - `PoolError::Closed` if the pool was shut down
    pub fn submit(
        &mut self,
        key: StageKey,
        body: Arc<dyn StageBody>,
        attempt: u32,
    ) -> Result<(), PoolError> {
        if self.submitted.contains_key(&key.id) {
            return Err(PoolError::DuplicateStage(key.id));
        }
        if self.semaphore.is_closed() {
            return Err(PoolError::Closed);
        }
        let timeout = self.run.profile.stage_timeout(&key.id);
        let isolation = body.isolation();
        self.submitted.insert(
            key.id.clone(),
            Submitted {
                key: key.clone(),
                attempt,
                isolation,
                timeout,
            },
        );

        let run = Arc::clone(&self.run);
        let semaphore = Arc::clone(&self.semaphore);
        let slots = Arc::clone(&self.slots);
        let active = Arc::clone(&self.active);
        let metrics = Arc::clone(&self.metrics);
        let strategy = self.strategy;

        self.tasks.spawn(async move {
            let permit = tokio::select! {
                biased;
                () = run.cancel_token().cancelled() => None,
                p = semaphore.acquire_owned() => p.ok(),
            };
            let Some(_permit) = permit else {
                return UnitReport::not_started(
                    &key,
                    attempt,
                    isolation,
                    &StageOutcome::failed("cancelled before start"),
                );
            };

            let worker = slots.lock().pop();
            let _slot = SlotGuard {
                stage: key.id.clone(),
                worker,
                slots,
                active: Arc::clone(&active),
            };
            active.insert(key.id.clone(), worker);
            {
                let mut m = metrics.lock();
                m.peak_concurrency = m.peak_concurrency.max(active.len());
            }

            let report = execute_unit(&run, key, body, attempt, timeout, worker, strategy).await;
            {
                let mut m = metrics.lock();
                m.units_run += 1;
                m.busy += report.record.duration;
                if !report.record.success {
                    m.failures += 1;
                }
                if report.record.failure == Some(FailureType::Timeout) {
                    m.timeouts += 1;
                }
            }
            report
        });
        Ok(())
    }

    /// Wait for every submitted unit and analyze the batch
    ///
    /// A failing unit never cancels its siblings. When the batch deadline
    /// (slowest member timeout per wave plus startup overhead) expires,
    /// remaining units are cancelled and recorded as timeouts.
    ///
    /// # Errors
    /// Returns `PoolError::EmptyBatch` if nothing was submitted.
    pub async fn wait_all(&mut self) -> Result<BatchOutcome, PoolError> {
        if self.submitted.is_empty() {
            return Err(PoolError::EmptyBatch);
        }
        let submitted = std::mem::take(&mut self.submitted);
        let max_timeout = submitted.values().map(|s| s.timeout).max().unwrap_or_default();
        let waves = u32::try_from(submitted.len().div_ceil(self.workers)).unwrap_or(u32::MAX);
        let batch_timeout = max_timeout.saturating_mul(waves) + self.startup_overhead;
        let deadline = tokio::time::Instant::now() + batch_timeout;
        let started = Instant::now();

        let mut reports: IndexMap<StageId, UnitReport> = IndexMap::with_capacity(submitted.len());
        let mut timed_out = false;
        loop {
            tokio::select! {
                next = self.tasks.join_next() => match next {
                    Some(Ok(report)) => {
                        reports.insert(report.record.stage_id.clone(), report);
                    }
                    Some(Err(e)) => tracing::error!(error = %e, "pool unit task ended abnormally"),
                    None => break,
                },
                () = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    tracing::warn!(
                        run_id = %self.run.run_id,
                        timeout_ms = u64::try_from(batch_timeout.as_millis()).unwrap_or(u64::MAX),
                        pending = submitted.len() - reports.len(),
                        "batch timeout expired; cancelling remaining units"
                    );
                    self.tasks.shutdown().await;
                    break;
                }
            }
        }

        for (id, s) in &submitted {
            if !reports.contains_key(id) {
                let outcome = StageOutcome::failed_as(
                    FailureType::Timeout,
                    format!("batch timeout of {}ms expired before completion", batch_timeout.as_millis()),
                );
                let mut report = UnitReport::not_started(&s.key, s.attempt, s.isolation, &outcome);
                report.record.duration = started.elapsed();
                self.metrics.lock().timeouts += 1;
                reports.insert(id.clone(), report);
            }
        }

        let mut reports: Vec<UnitReport> = reports.into_values().collect();
        reports.sort_by(|a, b| {
            (a.record.stage_number, &a.record.stage_id).cmp(&(b.record.stage_number, &b.record.stage_id))
        });

        let executed: Vec<StageExecutionRecord> = reports
            .iter()
            .filter(|r| r.record.worker_id.is_some())
            .map(|r| r.record.clone())
            .collect();
        let analysis = BatchAnalysis::compute(&executed, self.workers, self.ceiling, started.elapsed());
        for rec in &analysis.recommendations {
            tracing::info!(run_id = %self.run.run_id, recommendation = %rec, "pool recommendation");
        }

        let cancelled = reports
            .iter()
            .filter(|r| r.cancelled)
            .map(|r| r.record.stage_id.clone())
            .collect();
        let errors: Vec<(StageId, StageExecutionError)> = reports
            .iter()
            .filter(|r| !r.cancelled)
            .filter_map(|r| r.error().map(|e| (r.record.stage_id.clone(), e)))
            .collect();
        let records: Vec<StageExecutionRecord> = reports.into_iter().map(|r| r.record).collect();
        let all_succeeded = records.iter().all(|r| r.success);

        Ok(BatchOutcome {
            all_succeeded,
            errors,
            records,
            cancelled,
            timed_out,
            analysis,
        })
    }

    /// Stop accepting units and abort anything in flight
    pub async fn shutdown(&mut self) {
        self.semaphore.close();
        self.tasks.shutdown().await;
        self.submitted.clear();
    }
}

/// Execute one unit outside the pool, with the same timeout, panic capture
/// and cancellation rules
pub async fn run_inline(
    run: &Arc<RunContext>,
    key: StageKey,
    body: Arc<dyn StageBody>,
    attempt: u32,
) -> UnitReport {
    if run.is_cancelled() {
        let isolation = body.isolation();
        return UnitReport::not_started(&key, attempt, isolation, &StageOutcome::failed("cancelled before start"));
    }
    let timeout = run.profile.stage_timeout(&key.id);
    execute_unit(run, key, body, attempt, timeout, None, run.profile.strategy).await
}

async fn execute_unit(
    run: &Arc<RunContext>,
    key: StageKey,
    body: Arc<dyn StageBody>,
    attempt: u32,
    timeout: Duration,
    worker: Option<WorkerId>,
    strategy: WorkerStrategy,
) -> UnitReport {
    let isolation = body.isolation();
    let offload = strategy.offloads_cpu_bound()
        && isolation == Isolation::Thread
        && body.workload() == WorkloadClass::CpuBound;
    let hard = strategy.hard_cancel() || isolation == Isolation::Process;

    let ctx = StageContext::new(Arc::clone(run), key.clone(), attempt, worker);
    let token = ctx.cancel_token().clone();
    let _cancel_on_exit = token.clone().drop_guard();

    tracing::debug!(
        run_id = %run.run_id,
        stage = %key.id,
        attempt,
        worker = ?worker,
        offload,
        "unit started"
    );
    let started_at = Utc::now();
    let start = Instant::now();

    let handle = if offload {
        let rt = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || rt.block_on(async move { body.run(&ctx).await }))
    } else {
        tokio::spawn(async move { body.run(&ctx).await })
    };
    let mut handle = AbortOnDrop(handle);

    let mut cancelled = false;
    let outcome = tokio::select! {
        res = tokio::time::timeout(timeout, &mut handle.0) => match res {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => join_failure(e),
            Err(_) => {
                token.cancel();
                StageOutcome::failed_as(
                    FailureType::Timeout,
                    format!("stage exceeded its {}ms timeout", timeout.as_millis()),
                )
            }
        },
        () = hard_cancelled(run.cancel_token(), hard) => {
            cancelled = true;
            token.cancel();
            StageOutcome::failed("cancelled while running")
        }
    };
    drop(handle);
    if !outcome.success && run.is_cancelled() {
        cancelled = true;
    }

    let duration = start.elapsed();
    let failure = if outcome.success {
        FailureType::Unknown
    } else {
        classify(&outcome)
    };
    let record = StageExecutionRecord::finalize(
        &key, attempt, started_at, duration, &outcome, failure, worker, isolation,
    );

    metrics::histogram!("laneway_stage_duration_seconds", "stage" => key.id.to_string())
        .record(duration.as_secs_f64());
    if record.success {
        metrics::counter!("laneway_units_total", "outcome" => "success").increment(1);
        tracing::debug!(
            run_id = %run.run_id,
            stage = %key.id,
            attempt,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "unit succeeded"
        );
    } else {
        metrics::counter!("laneway_units_total", "outcome" => failure.as_str()).increment(1);
        tracing::warn!(
            run_id = %run.run_id,
            stage = %key.id,
            attempt,
            %failure,
            cancelled,
            error = record.error_message.as_deref().unwrap_or(""),
            "unit failed"
        );
    }

    UnitReport { record, cancelled }
}

async fn hard_cancelled(token: &CancellationToken, hard: bool) {
    if hard {
        token.cancelled().await;
    } else {
        std::future::pending::<()>().await;
    }
}

fn join_failure(e: JoinError) -> StageOutcome {
    if e.is_panic() {
        let payload = e.into_panic();
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        StageOutcome::failed_as(FailureType::Unknown, format!("stage panicked: {msg}"))
    } else {
        StageOutcome::failed_as(FailureType::Unknown, "stage task was aborted")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ExecutionProfile;
    use crate::stage::FnStage;
    use crate::types::RunId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run_with(profile: ExecutionProfile) -> Arc<RunContext> {
        Arc::new(RunContext::new(RunId::new(), Arc::new(profile), "."))
    }

    fn profile(strategy: WorkerStrategy) -> ExecutionProfile {
        ExecutionProfile::new("test", strategy, Duration::from_secs(5))
    }

    fn settings() -> PoolSettings {
        PoolSettings {
            startup_overhead_ms: 100,
            ..PoolSettings::default()
        }
    }

    fn sleeper(ms: u64) -> Arc<dyn StageBody> {
        Arc::new(FnStage::new(move |_| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            StageOutcome::ok()
        }))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_bound() {
        let mut pool = WorkerPool::new(run_with(profile(WorkerStrategy::FixedThread)), 3, &settings());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for i in 0..8u32 {
            let (current, peak) = (Arc::clone(&current), Arc::clone(&peak));
            let body = FnStage::new(move |_| {
                let (current, peak) = (Arc::clone(&current), Arc::clone(&peak));
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    StageOutcome::ok()
                }
            });
            pool.submit(StageKey::new(format!("s{i}"), i + 1, "unit"), Arc::new(body), 1)
                .unwrap();
        }
        let outcome = pool.wait_all().await.unwrap();
        assert!(outcome.all_succeeded);
        assert_eq!(outcome.records.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.metrics().peak_concurrency <= 3);
        assert_eq!(pool.metrics().units_run, 8);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn failure_does_not_cancel_siblings() {
        let mut pool = WorkerPool::new(run_with(profile(WorkerStrategy::FixedThread)), 2, &settings());
        pool.submit(
            StageKey::new("bad", 1, "bad"),
            Arc::new(FnStage::new(|_| async { StageOutcome::failed("connection refused") })),
            1,
        )
        .unwrap();
        pool.submit(StageKey::new("good", 2, "good"), sleeper(20), 1).unwrap();

        let outcome = pool.wait_all().await.unwrap();
        assert!(!outcome.all_succeeded);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].1.classification, FailureType::NetworkError);
        assert!(outcome.records[1].success);
    }

    #[tokio::test]
    async fn panic_is_captured_as_failure() {
        let mut pool = WorkerPool::new(run_with(profile(WorkerStrategy::FixedThread)), 1, &settings());
        pool.submit(
            StageKey::new("boom", 1, "boom"),
            Arc::new(FnStage::new(|ctx: StageContext| async move {
                if ctx.attempt > 0 {
                    panic!("kaboom");
                }
                StageOutcome::ok()
            })),
            1,
        )
        .unwrap();
        let outcome = pool.wait_all().await.unwrap();
        let msg = outcome.records[0].error_message.clone().unwrap();
        assert!(msg.contains("kaboom"));
        assert_eq!(outcome.records[0].failure, Some(FailureType::Unknown));
    }

    #[tokio::test]
    async fn unit_timeout_is_classified() {
        let p = profile(WorkerStrategy::FixedThread).with_stage_sla("slow", Duration::from_millis(20));
        let mut pool = WorkerPool::new(run_with(p), 1, &settings());
        pool.submit(StageKey::new("slow", 1, "slow"), sleeper(2_000), 1).unwrap();
        let outcome = pool.wait_all().await.unwrap();
        assert_eq!(outcome.records[0].failure, Some(FailureType::Timeout));
        assert!(outcome.records[0].duration < Duration::from_secs(1));
        assert_eq!(pool.metrics().timeouts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cpu_bound_units_run_on_blocking_pool() {
        let mut pool = WorkerPool::new(run_with(profile(WorkerStrategy::Hybrid)), 2, &settings());
        let body = FnStage::new(|_| async {
            let sum: u64 = (0..100_000u64).sum();
            if sum > 0 {
                StageOutcome::ok()
            } else {
                StageOutcome::failed("no work")
            }
        })
        .cpu_bound();
        pool.submit(StageKey::new("cpu", 1, "cpu"), Arc::new(body), 1).unwrap();
        assert!(pool.wait_all().await.unwrap().all_succeeded);
    }

    #[tokio::test]
    async fn drain_cancellation_lets_running_units_finish() {
        let run = run_with(profile(WorkerStrategy::FixedThread));
        let mut pool = WorkerPool::new(Arc::clone(&run), 1, &settings());
        let body = FnStage::new(|ctx: StageContext| async move {
            ctx.cancelled().await;
            StageOutcome::failed("stopped on request")
        });
        pool.submit(StageKey::new("a", 1, "a"), Arc::new(body), 1).unwrap();
        pool.submit(StageKey::new("b", 2, "b"), sleeper(10), 1).unwrap();

        let canceller = Arc::clone(&run);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });
        let outcome = pool.wait_all().await.unwrap();
        assert_eq!(outcome.cancelled.len(), 2);
        assert!(outcome.errors.is_empty());
        assert_eq!(
            outcome.records[0].error_message.as_deref(),
            Some("stopped on request")
        );
        assert_eq!(outcome.records[1].worker_id, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_strategy_hard_cancels() {
        let run = run_with(profile(WorkerStrategy::FixedProcess));
        let mut pool = WorkerPool::new(Arc::clone(&run), 2, &settings());
        pool.submit(
            StageKey::new("sleep", 1, "sleep"),
            Arc::new(crate::stage::CommandStage::new("sleep 5")),
            1,
        )
        .unwrap();
        let canceller = Arc::clone(&run);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        let outcome = pool.wait_all().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(outcome.cancelled, vec![StageId::new("sleep")]);
        assert_eq!(outcome.records[0].isolation, Isolation::Process);
    }

    #[tokio::test]
    async fn empty_and_duplicate_batches_are_rejected() {
        let mut pool = WorkerPool::new(run_with(profile(WorkerStrategy::Sequential)), 1, &settings());
        assert!(matches!(pool.wait_all().await, Err(PoolError::EmptyBatch)));
        pool.submit(StageKey::new("x", 1, "x"), sleeper(1), 1).unwrap();
        assert!(matches!(
            pool.submit(StageKey::new("x", 1, "x"), sleeper(1), 1),
            Err(PoolError::DuplicateStage(_))
        ));
        assert!(pool.wait_all().await.unwrap().all_succeeded);
    }

    fn rec(id: &str, ms: u64) -> StageExecutionRecord {
        StageExecutionRecord::finalize(
            &StageKey::new(id, 1, id),
            1,
            Utc::now(),
            Duration::from_millis(ms),
            &StageOutcome::ok(),
            FailureType::Unknown,
            Some(WorkerId(0)),
            Isolation::Thread,
        )
    }

    #[test]
    fn analysis_reports_bottlenecks_and_imbalance() {
        let records = [rec("a", 100), rec("b", 100), rec("c", 100), rec("d", 900)];
        let a = BatchAnalysis::compute(&records, 4, 16, Duration::from_millis(900));
        assert_eq!(a.mean, Duration::from_millis(300));
        assert_eq!(a.bottlenecks.len(), 1);
        assert_eq!(a.bottlenecks[0].stage_id, StageId::new("d"));
        assert!(a
            .recommendations
            .iter()
            .any(|r| matches!(r, Recommendation::Rebalance { stage_id, .. } if stage_id.as_str() == "d")));
    }

    #[test]
    fn analysis_sizing_recommendations() {
        let idle = BatchAnalysis::compute(&[rec("a", 100)], 8, 16, Duration::from_millis(100));
        assert!(matches!(
            idle.recommendations[0],
            Recommendation::ReduceWorkers { current: 8, suggested: 1, .. }
        ));

        let busy = [rec("a", 100), rec("b", 100)];
        let saturated = BatchAnalysis::compute(&busy, 2, 16, Duration::from_millis(100));
        assert!(matches!(
            saturated.recommendations[0],
            Recommendation::IncreaseWorkers { current: 2, suggested: 3, .. }
        ));

        let capped = BatchAnalysis::compute(&busy, 2, 2, Duration::from_millis(100));
        assert!(capped.recommendations.is_empty());
    }
}
