//! Stage bodies and the context they run in
//!
//! A body is anything implementing [`StageBody`]. Two are provided:
//! - [`FnStage`]: wraps an async closure, runs in-process
//! - [`CommandStage`]: runs a shell command as a child process

use crate::profile::{ExecutionProfile, QualityThresholds};
use crate::types::{Isolation, RunId, StageKey, StageOutcome, WorkerId, WorkloadClass};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Lines of stderr kept in a failed command's error message
const STDERR_TAIL_LINES: usize = 20;

/// Per-run state shared by every stage of the run
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Run identifier
    pub run_id: RunId,
    /// Lane
    pub profile: Arc<ExecutionProfile>,
    /// Workspace root
    pub workspace: PathBuf,
    cancel: CancellationToken,
}

impl RunContext {
    /// Create a run context with a fresh cancellation token
    #[must_use]
    pub fn new(run_id: RunId, profile: Arc<ExecutionProfile>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            run_id,
            profile,
            workspace: workspace.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// With externally owned cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Run-level cancellation token
    #[inline]
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the run
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the run was cancelled
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// What a body sees while it executes
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Owning run
    pub run: Arc<RunContext>,
    /// Stage identity
    pub stage: StageKey,
    /// Attempt (1-based)
    pub attempt: u32,
    /// Pool slot, `None` when run inline
    pub worker_id: Option<WorkerId>,
    cancel: CancellationToken,
}

impl StageContext {
    /// Create context; its token is a child of the run's
    #[must_use]
    pub fn new(run: Arc<RunContext>, stage: StageKey, attempt: u32, worker_id: Option<WorkerId>) -> Self {
        let cancel = run.cancel_token().child_token();
        Self {
            run,
            stage,
            attempt,
            worker_id,
            cancel,
        }
    }

    /// Unit cancellation token (cancelled on timeout or run cancellation)
    #[inline]
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the body should stop
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the body should stop
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Workspace root
    #[inline]
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.run.workspace
    }

    /// Lane quality gates
    #[inline]
    #[must_use]
    pub fn quality(&self) -> &QualityThresholds {
        &self.run.profile.quality
    }
}

/// Executable body of a stage
///
/// Failures are values: return [`StageOutcome::failed`] rather than panicking.
/// Panics are still caught at the worker boundary and reported as failures.
#[async_trait]
pub trait StageBody: Send + Sync {
    /// Execute once
    async fn run(&self, ctx: &StageContext) -> StageOutcome;

    /// Isolation the body provides
    fn isolation(&self) -> Isolation {
        Isolation::Thread
    }

    /// Dominant resource the body consumes
    fn workload(&self) -> WorkloadClass {
        WorkloadClass::IoBound
    }
}

/// In-process body from an async closure
pub struct FnStage<F> {
    f: F,
    workload: WorkloadClass,
}

impl<F, Fut> FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = StageOutcome> + Send,
{
    /// Wrap an I/O-bound closure
    #[must_use]
    pub fn new(f: F) -> Self {
        Self {
            f,
            workload: WorkloadClass::IoBound,
        }
    }

    /// Mark the body CPU-bound
    #[must_use]
    pub fn cpu_bound(mut self) -> Self {
        self.workload = WorkloadClass::CpuBound;
        self
    }
}

impl<F> std::fmt::Debug for FnStage<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("workload", &self.workload)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> StageBody for FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StageOutcome> + Send + 'static,
{
    async fn run(&self, ctx: &StageContext) -> StageOutcome {
        (self.f)(ctx.clone()).await
    }

    fn workload(&self) -> WorkloadClass {
        self.workload
    }
}

/// Shell command run as a child process
///
/// The child is killed when the unit times out or the run is hard-cancelled.
#[derive(Debug, Clone)]
pub struct CommandStage {
    command: String,
    workdir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl CommandStage {
    /// Create from a shell command line
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workdir: None,
            env: BTreeMap::new(),
        }
    }

    /// Working directory relative to the workspace
    #[must_use]
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Extra environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Command line
    #[inline]
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    fn shell(&self) -> tokio::process::Command {
        #[cfg(windows)]
        {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.arg("/C").arg(&self.command);
            cmd
        }
        #[cfg(not(windows))]
        {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(&self.command);
            cmd
        }
    }
}

#[async_trait]
impl StageBody for CommandStage {
    async fn run(&self, ctx: &StageContext) -> StageOutcome {
        let dir = match &self.workdir {
            Some(d) => ctx.workspace().join(d),
            None => ctx.workspace().to_path_buf(),
        };
        let mut command = self.shell();
        command
            .kill_on_drop(true)
            .current_dir(&dir)
            .envs(&self.env)
            .env("LANEWAY_RUN_ID", ctx.run.run_id.to_string())
            .env("LANEWAY_STAGE", ctx.stage.id.as_str())
            .env("LANEWAY_ATTEMPT", ctx.attempt.to_string())
            .env("LANEWAY_PROFILE", &ctx.run.profile.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(stage = %ctx.stage.id, command = %self.command, "spawning command");
        let output = tokio::select! {
            out = command.output() => out,
            () = ctx.cancelled() => {
                return StageOutcome::failed("command cancelled");
            }
        };

        match output {
            Ok(out) if out.status.success() => StageOutcome::ok(),
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let tail = tail_lines(&stderr, STDERR_TAIL_LINES);
                let status = out
                    .status
                    .code()
                    .map_or_else(|| "terminated by signal".to_string(), |c| format!("exit status {c}"));
                if tail.is_empty() {
                    StageOutcome::failed(format!("`{}` failed: {status}", self.command))
                } else {
                    StageOutcome::failed(format!("`{}` failed: {status}\n{tail}", self.command))
                }
            }
            Err(e) => StageOutcome::failed(format!("cannot spawn `{}`: {e}", self.command)),
        }
    }

    fn isolation(&self) -> Isolation {
        Isolation::Process
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
