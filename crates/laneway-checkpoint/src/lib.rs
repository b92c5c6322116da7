//! Laneway checkpoints
//!
//! Durable, content-addressed snapshots of a workspace's critical-state
//! files, taken at pipeline stage boundaries:
//! - [`ContentHash`] / [`SnapshotHasher`]: Blake3 digest over a file set
//! - [`CheckpointStore`]: append-only, per-namespace storage (disk or memory)
//! - [`CheckpointManager`]: create, list, restore, validate, cleanup
//! - [`RevisionControl`]: revision pointer recorded with each checkpoint
//!
//! # Example
//!
//! ```rust,ignore
//! use laneway_checkpoint::{CheckpointManager, CheckpointRequest, CheckpointSettings, FsCheckpointStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(FsCheckpointStore::open(".laneway/checkpoints", "run-01")?);
//! let settings = CheckpointSettings::new(".").with_critical_files(["Cargo.toml", "Cargo.lock"]);
//! let manager = CheckpointManager::new(settings, store);
//!
//! let cp = manager.create(CheckpointRequest::success("standard", 1, "lint"))?;
//! manager.restore(&cp.id)?;
//! ```

pub mod clock;
pub mod error;
pub mod hash;
pub mod manager;
pub mod record;
pub mod revision;
pub mod store;

pub use clock::{Clock, SystemClock};
pub use error::CheckpointError;
pub use hash::{ContentHash, HashError, SnapshotHasher};
pub use manager::{
    CheckpointManager, CheckpointSettings, CleanupReport, StateViolation, ValidationReport,
    DEFAULT_RETENTION_DAYS,
};
pub use record::{Checkpoint, CheckpointMetrics, CheckpointRequest, SnapshotEntry};
pub use revision::{GitCli, NoRevisionControl, RevisionControl, RevisionError};
pub use store::{CheckpointStore, FsCheckpointStore, MemoryCheckpointStore, SnapshotFiles};
