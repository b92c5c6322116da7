//! Laneway Core - lane-aware pipeline execution engine
//!
//! Runs an ordered, partially parallel sequence of validation stages under
//! an execution profile ("lane"):
//! - Resolves the lane explicitly or from the size of the change
//! - Dispatches independent stages to a bounded, resource-sized worker pool
//! - Gates stage durations against the lane's SLA targets
//! - Checkpoints workspace state after every stage
//! - Classifies failures and applies a lane-biased recovery plan
//!
//! # Example
//!
//! ```rust,ignore
//! use laneway_core::prelude::*;
//! use laneway_checkpoint::{CheckpointManager, CheckpointSettings, FsCheckpointStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ProfileRegistry::with_defaults();
//! let profile = registry.select(&ProfileSelection::Explicit("standard".into()))?;
//! let run = Arc::new(RunContext::new(RunId::new(), profile, "."));
//!
//! let store = Arc::new(FsCheckpointStore::open(".laneway/checkpoints", run.run_id.namespace())?);
//! let checkpoints = Arc::new(CheckpointManager::new(CheckpointSettings::new("."), store));
//!
//! let pipeline = PipelineFile::load("pipeline.toml")?.into_pipeline()?;
//! let report = StageOrchestrator::new(run, checkpoints)?.run(&pipeline).await?;
//! println!("run ended {:?} after {} checkpoints", report.state, report.checkpoints.len());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

// Core modules
pub mod classify;
pub mod config;
pub mod error;
pub mod export;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod profile;
pub mod recovery;
pub mod resources;
pub mod sla;
pub mod stage;
pub mod state_machine;
pub mod types;

// Re-exports for convenience
pub use classify::{classify, classify_message};
pub use config::{EngineConfig, StorageConfig, WorkspaceConfig, DEFAULT_STORAGE_ROOT};
pub use error::{AttemptedAction, ConfigError, EngineError, Escalation, PoolError, StageExecutionError};
pub use export::{MetricsSnapshot, StageTiming};
pub use orchestrator::{RecoveryLogEntry, RunReport, StageOrchestrator};
pub use pipeline::{CommandStageSpec, Pipeline, PipelineFile, Segment, StageDescriptor};
pub use pool::{
    run_inline, BatchAnalysis, BatchOutcome, Bottleneck, PoolMetrics, Recommendation, UnitReport,
    WorkerPool,
};
pub use profile::{
    AutoSelectRules, ChangeCategory, ChangeMetadata, ExecutionProfile, ProfileRegistry,
    ProfileSelection, QualityThresholds, WorkerStrategy, HEAVY, LIGHT, STANDARD,
};
pub use recovery::{RecoveryAction, RecoveryBias, RecoveryOperation, RecoveryPlanner, RecoveryStrategy};
pub use resources::{
    worker_count, HostResources, PoolCaps, PoolSettings, ResourceProbe, StaticProbe, SystemProbe,
};
pub use sla::{SlaEvent, SlaManager, SlaSeverity, SlaThresholds};
pub use stage::{CommandStage, FnStage, RunContext, StageBody, StageContext};
pub use state_machine::{validate_run_transition, validate_stage_transition, TransitionError};
pub use types::{
    FailureType, Isolation, RunId, RunState, StageExecutionRecord, StageId, StageKey, StageOutcome,
    StageState, WorkerId, WorkloadClass,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a run
    pub use crate::{
        EngineConfig, EngineError, ExecutionProfile, FailureType, FnStage, Pipeline, PipelineFile,
        ProfileRegistry, ProfileSelection, RunContext, RunId, RunReport, StageBody, StageContext,
        StageDescriptor, StageOrchestrator, StageOutcome, WorkerStrategy,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
