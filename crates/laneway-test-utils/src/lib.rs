//! Testing utilities for the laneway workspace
//!
//! Shared fixtures: a temporary workspace wired to a checkpoint manager,
//! scripted stage bodies and a settable clock.

#![allow(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use laneway_checkpoint::{
    CheckpointManager, CheckpointSettings, CheckpointStore, Clock, FsCheckpointStore,
    MemoryCheckpointStore,
};
use laneway_core::{
    ExecutionProfile, FailureType, FnStage, HostResources, RunContext, RunId, StageBody,
    StageContext, StageOrchestrator, StageOutcome, StaticProbe,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn at(t: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(t)))
    }

    pub fn advance(&self, by: ChronoDuration) {
        *self.0.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

/// Temporary workspace with critical files and a run-scoped checkpoint manager
pub struct TestWorkspace {
    pub dir: tempfile::TempDir,
    pub storage: tempfile::TempDir,
    pub critical_files: Vec<String>,
}

impl TestWorkspace {
    /// Workspace holding `Cargo.toml`, `Cargo.lock` and `.laneway/state.json`
    pub fn new() -> Self {
        let ws = Self {
            dir: tempfile::tempdir().unwrap(),
            storage: tempfile::tempdir().unwrap(),
            critical_files: vec![
                "Cargo.toml".into(),
                "Cargo.lock".into(),
                ".laneway/state.json".into(),
            ],
        };
        ws.write("Cargo.toml", "[package]\nname = \"fixture\"\n");
        ws.write("Cargo.lock", "# lock v1\n");
        ws.write(".laneway/state.json", "{\"stage\":0}");
        ws
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let p = self.dir.path().join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, contents).unwrap();
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.dir.path().join(rel)).ok()
    }

    pub fn settings(&self) -> CheckpointSettings {
        CheckpointSettings::new(self.dir.path()).with_critical_files(self.critical_files.clone())
    }

    /// Manager over an in-memory store in `run`'s namespace
    pub fn memory_manager(&self, run: RunId) -> Arc<CheckpointManager> {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new(run.namespace()));
        Arc::new(CheckpointManager::new(self.settings(), store))
    }

    /// Manager over an on-disk store in `run`'s namespace
    pub fn fs_manager(&self, run: RunId) -> Arc<CheckpointManager> {
        let store: Arc<dyn CheckpointStore> =
            Arc::new(FsCheckpointStore::open(self.storage.path(), run.namespace()).unwrap());
        Arc::new(CheckpointManager::new(self.settings(), store))
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage.path().to_path_buf()
    }

    /// Run context for `profile` rooted at this workspace
    pub fn run(&self, profile: ExecutionProfile) -> Arc<RunContext> {
        Arc::new(RunContext::new(RunId::new(), Arc::new(profile), self.dir.path()))
    }

    /// Orchestrator on a fixed 4-core / 16 GB host with an in-memory store
    pub fn orchestrator(&self, profile: ExecutionProfile) -> (StageOrchestrator, Arc<CheckpointManager>) {
        let run = self.run(profile);
        let manager = self.memory_manager(run.run_id);
        let orchestrator = StageOrchestrator::new(run, Arc::clone(&manager))
            .unwrap()
            .with_probe(static_probe(4, 16.0));
        (orchestrator, manager)
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

pub fn static_probe(cores: usize, memory_gb: f64) -> Arc<StaticProbe> {
    Arc::new(StaticProbe(HostResources::new(cores, memory_gb)))
}

/// Lane with millisecond retry backoff so recovery tests stay fast
pub fn fast(profile: ExecutionProfile) -> ExecutionProfile {
    let retries = profile.max_retries;
    profile.with_retries(retries, Duration::from_millis(1))
}

pub fn succeed() -> Arc<dyn StageBody> {
    Arc::new(FnStage::new(|_| async { StageOutcome::ok() }))
}

pub fn sleep_for(ms: u64) -> Arc<dyn StageBody> {
    Arc::new(FnStage::new(move |_| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        StageOutcome::ok()
    }))
}

pub fn fail_with(kind: FailureType, message: &str) -> Arc<dyn StageBody> {
    let message = message.to_string();
    Arc::new(FnStage::new(move |_| {
        let message = message.clone();
        async move { StageOutcome::failed_as(kind, message) }
    }))
}

/// Fails the first `n` executions, then succeeds; returns the call counter
pub fn flaky(n: u32, kind: FailureType) -> (Arc<dyn StageBody>, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let body = FnStage::new(move |_| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < n {
                StageOutcome::failed_as(kind, "scripted failure")
            } else {
                StageOutcome::ok()
            }
        }
    });
    (Arc::new(body), calls)
}

/// Writes `contents` to a workspace file, then succeeds
pub fn write_file(rel: &'static str, contents: &'static str) -> Arc<dyn StageBody> {
    Arc::new(FnStage::new(move |ctx: StageContext| async move {
        match std::fs::write(ctx.workspace().join(rel), contents) {
            Ok(()) => StageOutcome::ok(),
            Err(e) => StageOutcome::failed(e.to_string()),
        }
    }))
}
