//! Subcommand handlers
//!
//! Each handler returns an [`Outcome`] for expected failures (invalid
//! workspace, refused restore, failed run) and an error for everything else.

use anyhow::{Context, Result};
use laneway_checkpoint::{
    Checkpoint, CheckpointManager, CheckpointRequest, CheckpointStore, FsCheckpointStore, GitCli,
};
use laneway_core::{
    ChangeMetadata, EngineConfig, ExecutionProfile, FailureType, MetricsSnapshot, PipelineFile,
    ProfileSelection, RecoveryPlanner, RunContext, RunId, RunReport, StageOrchestrator, SystemProbe,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Config file picked up from the workspace when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "laneway.toml";

/// How a command ended; maps to the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    ValidationFailed,
    RestoreFailed,
    PlanUnavailable,
    RunFailed,
}

impl Outcome {
    /// Process exit code
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ValidationFailed => 2,
            Self::RestoreFailed => 3,
            Self::PlanUnavailable => 4,
            Self::RunFailed => 5,
        }
    }
}

/// Exit code for errors outside the command's own failure modes
pub const EXIT_ERROR: i32 = 1;

/// Shared command environment
#[derive(Debug)]
pub struct Env {
    pub workspace: PathBuf,
    pub config: EngineConfig,
    pub namespace: String,
    pub json: bool,
}

impl Env {
    /// Resolve workspace and configuration
    ///
    /// # Errors
    /// Returns error if the configuration cannot be loaded.
    pub fn load(workspace: PathBuf, config: Option<&Path>, namespace: String, json: bool) -> Result<Self> {
        let discovered = workspace.join(DEFAULT_CONFIG_FILE);
        let config = match config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None if discovered.is_file() => EngineConfig::load(&discovered)
                .with_context(|| format!("loading configuration from {}", discovered.display()))?,
            None => EngineConfig::default(),
        };
        Ok(Self {
            workspace,
            config,
            namespace,
            json,
        })
    }

    fn storage_root(&self) -> PathBuf {
        self.config.storage_root(&self.workspace)
    }

    fn manager_for(&self, namespace: &str) -> Result<CheckpointManager> {
        let root = self.storage_root();
        let store: Arc<dyn CheckpointStore> = Arc::new(
            FsCheckpointStore::open(&root, namespace)
                .with_context(|| format!("opening checkpoint store {}/{namespace}", root.display()))?,
        );
        Ok(
            CheckpointManager::new(self.config.checkpoint_settings(&self.workspace), store)
                .with_revision_control(Arc::new(GitCli::new(&self.workspace))),
        )
    }

    fn manager(&self) -> Result<CheckpointManager> {
        self.manager_for(&self.namespace)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn summary_line(cp: &Checkpoint) -> String {
    format!(
        "{:<40} #{:<4} stage {:>2} {:<16} {:<4} {} {}",
        cp.id,
        cp.sequence,
        cp.stage_number,
        cp.stage_name,
        if cp.success { "ok" } else { "FAIL" },
        cp.content_hash.short(),
        cp.created_at.format("%Y-%m-%d %H:%M:%S"),
    )
}

pub fn checkpoint(env: &Env, profile: &str, stage: u32, name: &str, failed: Option<&str>) -> Result<Outcome> {
    let request = match failed {
        Some(message) => CheckpointRequest::failure(profile, stage, name, message),
        None => CheckpointRequest::success(profile, stage, name),
    };
    let cp = env.manager()?.create(request).context("creating checkpoint")?;
    if env.json {
        print_json(&cp)?;
    } else {
        println!("{}", cp.id);
    }
    Ok(Outcome::Ok)
}

pub fn restore(env: &Env, id: &str) -> Result<Outcome> {
    match env.manager()?.restore(id) {
        Ok(changed) => {
            if changed {
                println!("restored {id}");
            } else {
                println!("workspace already matches {id}");
            }
            Ok(Outcome::Ok)
        }
        Err(e) => {
            eprintln!("restore of {id} failed: {e}");
            Ok(Outcome::RestoreFailed)
        }
    }
}

pub fn validate(env: &Env) -> Result<Outcome> {
    let report = env.manager()?.validate_state().context("validating workspace")?;
    if env.json {
        print_json(&report)?;
    } else if report.is_valid() {
        println!("workspace valid");
    } else {
        for violation in &report.violations {
            println!("{violation}");
        }
    }
    Ok(if report.is_valid() {
        Outcome::Ok
    } else {
        Outcome::ValidationFailed
    })
}

pub fn cleanup(env: &Env) -> Result<Outcome> {
    let report = env.manager()?.cleanup().context("cleaning up")?;
    if env.json {
        print_json(&report)?;
    } else {
        println!(
            "removed {} checkpoint(s) and {} artifact path(s)",
            report.removed_checkpoints.len(),
            report.removed_artifacts.len()
        );
    }
    Ok(Outcome::Ok)
}

pub fn list(env: &Env, all: bool) -> Result<Outcome> {
    let namespaces = if all {
        FsCheckpointStore::namespaces(env.storage_root()).context("listing namespaces")?
    } else {
        vec![env.namespace.clone()]
    };
    let mut listed = Vec::new();
    for ns in &namespaces {
        listed.push((ns.clone(), env.manager_for(ns)?.list().context("listing checkpoints")?));
    }
    if env.json {
        let value: serde_json::Map<String, serde_json::Value> = listed
            .into_iter()
            .map(|(ns, cps)| Ok((ns, serde_json::to_value(cps)?)))
            .collect::<Result<_, serde_json::Error>>()?;
        print_json(&value)?;
        return Ok(Outcome::Ok);
    }
    for (ns, cps) in listed {
        if all {
            println!("[{ns}]");
        }
        if cps.is_empty() {
            println!("no checkpoints");
        }
        for cp in &cps {
            println!("{}", summary_line(cp));
        }
    }
    Ok(Outcome::Ok)
}

pub fn detail(env: &Env, id: &str) -> Result<Outcome> {
    let cp = env.manager()?.detail(id).with_context(|| format!("reading checkpoint {id}"))?;
    print_json(&cp)?;
    Ok(Outcome::Ok)
}

pub fn plan(env: &Env, failure: &str, lane: &str) -> Result<Outcome> {
    let failure: FailureType = match failure.parse() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{e}");
            return Ok(Outcome::PlanUnavailable);
        }
    };
    let profile = match env.config.registry().get(lane) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            return Ok(Outcome::PlanUnavailable);
        }
    };
    let plan = RecoveryPlanner::new().get_recovery_plan(failure, &profile);
    if env.json {
        print_json(&plan)?;
        return Ok(Outcome::Ok);
    }
    println!("{failure} on {lane} ({} bias):", profile.recovery_bias);
    for (i, action) in plan.iter().enumerate() {
        let scope = if action.optional_only { " [optional stages only]" } else { "" };
        println!(
            "  {}. {}: {} (~{}s){scope}",
            i + 1,
            action.strategy,
            action.description,
            action.estimated_duration.as_secs()
        );
    }
    Ok(Outcome::Ok)
}

pub fn profiles(env: &Env) -> Result<Outcome> {
    let registry = env.config.registry();
    let lanes = registry.list();
    if env.json {
        let lanes: Vec<&ExecutionProfile> = lanes.iter().map(|p| &**p).collect();
        print_json(&lanes)?;
        return Ok(Outcome::Ok);
    }
    for p in lanes {
        println!(
            "{:<12} {:<14} sla {:>6}s  retries {}  bias {:<8} {}",
            p.name,
            p.strategy,
            p.default_sla_ms / 1000,
            p.max_retries,
            p.recovery_bias,
            p.description
        );
    }
    Ok(Outcome::Ok)
}

fn selection(lane: Option<&str>, paths: &[String], added: usize, removed: usize) -> ProfileSelection {
    match lane {
        Some(name) => ProfileSelection::Explicit(name.to_string()),
        None => ProfileSelection::Auto(ChangeMetadata::from_paths(paths).with_lines(added, removed)),
    }
}

pub fn select(env: &Env, lane: Option<&str>, paths: &[String], added: usize, removed: usize) -> Result<Outcome> {
    let profile = env.config.registry().select(&selection(lane, paths, added, removed))?;
    println!("{}", profile.name);
    Ok(Outcome::Ok)
}

/// Options of `laneway run`
#[derive(Debug, Default)]
pub struct RunOptions {
    pub pipeline: PathBuf,
    pub lane: Option<String>,
    pub changed: Vec<String>,
    pub added: usize,
    pub removed: usize,
    pub metrics_out: Option<PathBuf>,
}

pub async fn run(env: &Env, opts: RunOptions) -> Result<Outcome> {
    let pipeline = PipelineFile::load(&opts.pipeline)
        .with_context(|| format!("loading pipeline {}", opts.pipeline.display()))?
        .into_pipeline()?;
    let profile = env
        .config
        .registry()
        .select(&selection(opts.lane.as_deref(), &opts.changed, opts.added, opts.removed))?;

    let run_id = RunId::new();
    let run = Arc::new(RunContext::new(run_id, profile, env.workspace.clone()));
    let checkpoints = Arc::new(env.manager_for(&run_id.namespace())?);
    let orchestrator = StageOrchestrator::new(Arc::clone(&run), checkpoints)?
        .with_pool_settings(env.config.pool.clone())
        .with_sla_thresholds(env.config.sla)
        .with_probe(Arc::new(SystemProbe::new(env.config.pool.assumed_memory_gb)));

    let interrupt = Arc::clone(&run);
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(run_id = %interrupt.run_id, "interrupt received; cancelling run");
            interrupt.cancel();
        }
    });
    let report = orchestrator.run(&pipeline).await;
    watcher.abort();
    let report = report?;

    if let Some(path) = &opts.metrics_out {
        MetricsSnapshot::from_report(&report)
            .write_to(path)
            .with_context(|| format!("writing metrics to {}", path.display()))?;
    }
    if env.json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(if report.succeeded() {
        Outcome::Ok
    } else {
        Outcome::RunFailed
    })
}

fn print_report(report: &RunReport) {
    println!(
        "run {} on {} ({} workers): {:?} in {}ms",
        report.run_id,
        report.profile,
        report.workers,
        report.state,
        report.duration.as_millis()
    );
    for r in &report.records {
        let status = match r.failure {
            None => "ok".to_string(),
            Some(kind) => format!("FAIL ({kind})"),
        };
        println!(
            "  {:<20} attempt {} {:>7}ms  {status}",
            r.stage_id,
            r.attempt,
            r.duration.as_millis()
        );
    }
    for e in &report.sla_events {
        println!(
            "  sla {}: {} took {}ms against {}ms",
            e.severity,
            e.stage_id,
            e.observed.as_millis(),
            e.target.as_millis()
        );
    }
    for entry in &report.recovery {
        println!("  recovery {} on {}: {}", entry.strategy, entry.stage_id, entry.result);
    }
    if let Some(target) = &report.rollback_target {
        println!("  rolled back to {target}");
    }
    if let Some(escalation) = &report.escalation {
        println!("  escalated: stage {} ({})", escalation.stage_id, escalation.classification);
        for hint in &escalation.guidance {
            println!("    - {hint}");
        }
    }
}
