//! Checkpoint manager
//!
//! Captures the critical-state file set of a workspace after each stage
//! transition, and restores it on demand:
//! - `create`: revision lookup, hash, copy, metrics, ledger append
//! - `restore`: verify stored hash, then rewrite the workspace all-or-nothing
//! - `validate_state`: critical files, latest hash, environment sanity
//! - `cleanup`: transient artifacts and checkpoints past retention

use crate::clock::{Clock, SystemClock};
use crate::error::CheckpointError;
use crate::hash::{ContentHash, SnapshotHasher};
use crate::record::{Checkpoint, CheckpointRequest, SnapshotEntry};
use crate::revision::{NoRevisionControl, RevisionControl};
use crate::store::{check_relative, normalize_relative, CheckpointStore, SnapshotFiles};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Default retention window for `cleanup`
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// What to capture and how long to keep it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSettings {
    /// Workspace root the critical files are relative to
    pub workspace: PathBuf,
    /// Critical-state file set (workspace-relative)
    pub critical_files: Vec<String>,
    /// Transient build outputs removed by `cleanup` (workspace-relative)
    pub transient_artifacts: Vec<String>,
    /// Checkpoints older than this many days are removed by `cleanup`
    pub retention_days: u32,
    /// Environment variables `validate_state` requires
    pub required_env: Vec<String>,
    /// Executables `validate_state` requires on `PATH`
    pub required_tools: Vec<String>,
}

impl CheckpointSettings {
    /// Settings for `workspace` with an empty file set
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            critical_files: Vec::new(),
            transient_artifacts: Vec::new(),
            retention_days: DEFAULT_RETENTION_DAYS,
            required_env: Vec::new(),
            required_tools: Vec::new(),
        }
    }

    /// With critical-state files
    #[must_use]
    pub fn with_critical_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_files = files.into_iter().map(Into::into).collect();
        self
    }

    /// With transient artifact paths
    #[must_use]
    pub fn with_transient_artifacts<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transient_artifacts = paths.into_iter().map(Into::into).collect();
        self
    }

    /// With retention window
    #[inline]
    #[must_use]
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }
}

/// One problem found by `validate_state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateViolation {
    /// Workspace directory does not exist
    WorkspaceMissing {
        /// Expected workspace path
        path: PathBuf,
    },
    /// A critical file is absent
    MissingCriticalFile {
        /// Workspace-relative path
        path: String,
    },
    /// Workspace drifted from the latest checkpoint
    HashMismatch {
        /// Latest checkpoint id
        checkpoint_id: String,
        /// Hash stored with the checkpoint
        expected: ContentHash,
        /// Hash of the current workspace
        actual: ContentHash,
    },
    /// Required environment variable is unset
    MissingEnvVar {
        /// Variable name
        name: String,
    },
    /// Required executable not found on `PATH`
    MissingTool {
        /// Executable name
        name: String,
    },
}

impl fmt::Display for StateViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkspaceMissing { path } => write!(f, "workspace missing: {}", path.display()),
            Self::MissingCriticalFile { path } => write!(f, "critical file missing: {path}"),
            Self::HashMismatch {
                checkpoint_id,
                expected,
                actual,
            } => write!(
                f,
                "workspace hash {} differs from checkpoint {checkpoint_id} ({})",
                actual.short(),
                expected.short()
            ),
            Self::MissingEnvVar { name } => write!(f, "environment variable not set: {name}"),
            Self::MissingTool { name } => write!(f, "required tool not on PATH: {name}"),
        }
    }
}

/// Result of `validate_state`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Problems found
    pub violations: Vec<StateViolation>,
}

impl ValidationReport {
    /// Whether no violation was found
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// `(valid, violations)`
    #[must_use]
    pub fn into_parts(self) -> (bool, Vec<StateViolation>) {
        (self.violations.is_empty(), self.violations)
    }
}

/// Result of `cleanup`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Checkpoints removed for exceeding retention
    pub removed_checkpoints: Vec<String>,
    /// Transient artifact paths removed from the workspace
    pub removed_artifacts: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    sequence: u64,
    micros: i64,
}

/// Creates, lists, restores and prunes checkpoints for one namespace
pub struct CheckpointManager {
    settings: CheckpointSettings,
    store: Arc<dyn CheckpointStore>,
    revision: Arc<dyn RevisionControl>,
    clock: Arc<dyn Clock>,
    cursor: Mutex<Option<Cursor>>,
}

impl fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("namespace", &self.store.namespace())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CheckpointManager {
    /// Create a manager over `store` with no revision control and the system clock
    #[must_use]
    pub fn new(settings: CheckpointSettings, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            settings,
            store,
            revision: Arc::new(NoRevisionControl),
            clock: Arc::new(SystemClock),
            cursor: Mutex::new(None),
        }
    }

    /// With revision-control collaborator
    #[must_use]
    pub fn with_revision_control(mut self, revision: Arc<dyn RevisionControl>) -> Self {
        self.revision = revision;
        self
    }

    /// With time source
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Settings in use
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &CheckpointSettings {
        &self.settings
    }

    /// Namespace written by this manager
    #[inline]
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.store.namespace()
    }

    /// Capture a checkpoint of the critical-state file set
    ///
    /// Revision-control failures are logged and leave the revision fields
    /// empty; all other failures abort the checkpoint.
    ///
    /// # Errors
    /// Returns error if a critical file cannot be read or storage fails.
    pub fn create(&self, request: CheckpointRequest) -> Result<Checkpoint, CheckpointError> {
        let revision = match self.revision.current_revision() {
            Ok(rev) => Some(rev),
            Err(e) => {
                tracing::warn!(error = %e, "revision unavailable, checkpoint metadata degraded");
                None
            }
        };
        let branch = self.revision.current_branch().ok();

        let started = Instant::now();
        let (files, manifest, content_hash) = self.capture()?;
        let captured_bytes = files.values().map(|b| b.len() as u64).sum();

        let mut metrics = request.metrics;
        metrics.host_cores = std::thread::available_parallelism().map_or(1, usize::from);
        metrics.captured_bytes = captured_bytes;

        let mut cursor = self.cursor.lock();
        let next = self.next_cursor(*cursor)?;
        let created_at = micros_to_datetime(next.micros).unwrap_or_else(|| self.clock.now());
        let id = Checkpoint::make_id(&request.profile, request.stage_number, next.micros);

        self.store.write_snapshot(&id, &files)?;
        metrics.capture_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let checkpoint = Checkpoint {
            id,
            namespace: self.store.namespace().to_string(),
            sequence: next.sequence,
            profile: request.profile,
            stage_number: request.stage_number,
            stage_name: request.stage_name,
            revision,
            branch,
            content_hash,
            files: manifest,
            metrics,
            success: request.success,
            error_message: request.error_message,
            created_at,
        };
        self.store.append(&checkpoint)?;
        *cursor = Some(next);
        drop(cursor);

        tracing::info!(
            checkpoint_id = %checkpoint.id,
            stage = checkpoint.stage_number,
            success = checkpoint.success,
            hash = %checkpoint.content_hash.short(),
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    /// All checkpoints, newest first
    ///
    /// # Errors
    /// Returns error if the ledger cannot be read.
    pub fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut records = self.store.records()?;
        records.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(records)
    }

    /// One checkpoint by id
    ///
    /// # Errors
    /// Returns `NotFound` if the namespace has no such checkpoint.
    pub fn detail(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        self.store
            .records()?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| CheckpointError::NotFound(id.to_string()))
    }

    /// Most recent checkpoint
    ///
    /// # Errors
    /// Returns error if the ledger cannot be read.
    pub fn latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.store.records()?.into_iter().max_by_key(|r| r.sequence))
    }

    /// Most recent checkpoint of a successful stage transition
    ///
    /// # Errors
    /// Returns error if the ledger cannot be read.
    pub fn latest_successful(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .store
            .records()?
            .into_iter()
            .filter(|r| r.success)
            .max_by_key(|r| r.sequence))
    }

    /// Hash of the workspace's current critical-state file set
    ///
    /// # Errors
    /// Returns error if a critical file exists but cannot be read.
    pub fn current_hash(&self) -> Result<ContentHash, CheckpointError> {
        Ok(self.capture()?.2)
    }

    /// Restore the workspace to a checkpoint
    ///
    /// The stored snapshot is verified against the recorded hash before any
    /// file is touched. Returns whether the workspace changed.
    ///
    /// # Errors
    /// - `NotFound` for an unknown id
    /// - `Corruption` if the stored snapshot no longer matches its hash;
    ///   the workspace is left untouched
    /// - `RestoreFailure` if writing fails; files already written are reverted
    pub fn restore(&self, id: &str) -> Result<bool, CheckpointError> {
        let record = self.detail(id)?;
        let present: Vec<&str> = record.present_paths().collect();
        let stored = self.store.read_snapshot(id, &present)?;

        let mut hasher = SnapshotHasher::new();
        for entry in &record.files {
            match stored.get(&entry.path) {
                Some(bytes) if entry.present => hasher.add_file(entry.path.clone(), bytes),
                _ => hasher.add_missing(entry.path.clone()),
            }
        }
        let actual = hasher.finish();
        if actual != record.content_hash {
            tracing::error!(
                checkpoint_id = id,
                expected = %record.content_hash.short(),
                actual = %actual.short(),
                "checkpoint snapshot corrupt, restore refused"
            );
            return Err(CheckpointError::Corruption {
                id: id.to_string(),
                expected: record.content_hash,
                actual,
            });
        }

        let mut backups: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::with_capacity(record.files.len());
        for entry in &record.files {
            let path = self.workspace_path(&entry.path)?;
            backups.push((path.clone(), read_optional(&path)?));
        }

        let mut changed = false;
        for (entry, (path, before)) in record.files.iter().zip(&backups) {
            let desired = stored.get(&entry.path).filter(|_| entry.present);
            if desired == before.as_ref() {
                continue;
            }
            changed = true;
            if let Err(e) = write_optional(path, desired.map(Vec::as_slice)) {
                tracing::error!(checkpoint_id = id, path = %path.display(), error = %e, "restore write failed, reverting");
                for (p, original) in &backups {
                    if let Err(revert) = write_optional(p, original.as_deref()) {
                        tracing::error!(path = %p.display(), error = %revert, "revert failed");
                    }
                }
                return Err(CheckpointError::RestoreFailure {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        tracing::info!(checkpoint_id = id, changed, "checkpoint restored");
        Ok(changed)
    }

    /// Check critical files, drift from the latest checkpoint, and environment
    ///
    /// # Errors
    /// Returns error only if storage or a present file cannot be read.
    pub fn validate_state(&self) -> Result<ValidationReport, CheckpointError> {
        let mut violations = Vec::new();

        if !self.settings.workspace.is_dir() {
            violations.push(StateViolation::WorkspaceMissing {
                path: self.settings.workspace.clone(),
            });
            return Ok(ValidationReport { violations });
        }

        for rel in &self.settings.critical_files {
            if !self.workspace_path(rel)?.exists() {
                violations.push(StateViolation::MissingCriticalFile { path: rel.clone() });
            }
        }

        if let Some(latest) = self.latest()? {
            let actual = self.current_hash()?;
            if actual != latest.content_hash {
                violations.push(StateViolation::HashMismatch {
                    checkpoint_id: latest.id,
                    expected: latest.content_hash,
                    actual,
                });
            }
        }

        for name in &self.settings.required_env {
            if std::env::var_os(name).map_or(true, |v| v.is_empty()) {
                violations.push(StateViolation::MissingEnvVar { name: name.clone() });
            }
        }
        for name in &self.settings.required_tools {
            if !tool_on_path(name) {
                violations.push(StateViolation::MissingTool { name: name.clone() });
            }
        }

        if !violations.is_empty() {
            tracing::warn!(count = violations.len(), "workspace state validation failed");
        }
        Ok(ValidationReport { violations })
    }

    /// Remove transient artifacts and checkpoints older than retention
    ///
    /// # Errors
    /// Returns error if removal fails.
    pub fn cleanup(&self) -> Result<CleanupReport, CheckpointError> {
        let removed_artifacts = self.cleanup_transient()?;

        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(self.settings.retention_days));
        let expired: Vec<String> = self
            .store
            .records()?
            .into_iter()
            .filter(|r| r.created_at < cutoff)
            .map(|r| r.id)
            .collect();
        self.store.remove(&expired)?;

        tracing::info!(
            removed_checkpoints = expired.len(),
            removed_artifacts = removed_artifacts.len(),
            retention_days = self.settings.retention_days,
            "cleanup finished"
        );
        Ok(CleanupReport {
            removed_checkpoints: expired,
            removed_artifacts,
        })
    }

    /// Remove transient build artifacts only
    ///
    /// # Errors
    /// Returns error if an existing artifact cannot be removed.
    pub fn cleanup_transient(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        let mut removed = Vec::new();
        for rel in &self.settings.transient_artifacts {
            let path = self.workspace_path(rel)?;
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed.push(path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::io(&path, e)),
            }
        }
        Ok(removed)
    }

    fn workspace_path(&self, rel: &str) -> Result<PathBuf, CheckpointError> {
        Ok(self.settings.workspace.join(check_relative(rel)?))
    }

    fn capture(&self) -> Result<(SnapshotFiles, Vec<SnapshotEntry>, ContentHash), CheckpointError> {
        let mut files = SnapshotFiles::new();
        let mut manifest = Vec::with_capacity(self.settings.critical_files.len());
        let mut hasher = SnapshotHasher::new();

        let keys = self
            .settings
            .critical_files
            .iter()
            .map(|rel| normalize_relative(rel))
            .collect::<Result<BTreeSet<_>, _>>()?;
        for rel in &keys {
            let path = self.workspace_path(rel)?;
            match read_optional(&path)? {
                Some(bytes) => {
                    hasher.add_file(rel.clone(), &bytes);
                    manifest.push(SnapshotEntry {
                        path: rel.clone(),
                        present: true,
                        size: bytes.len() as u64,
                    });
                    files.insert(rel.clone(), bytes);
                }
                None => {
                    hasher.add_missing(rel.clone());
                    manifest.push(SnapshotEntry {
                        path: rel.clone(),
                        present: false,
                        size: 0,
                    });
                }
            }
        }
        Ok((files, manifest, hasher.finish()))
    }

    fn next_cursor(&self, current: Option<Cursor>) -> Result<Cursor, CheckpointError> {
        let last = match current {
            Some(c) => Some(c),
            None => self
                .store
                .records()?
                .iter()
                .max_by_key(|r| r.sequence)
                .map(|r| Cursor {
                    sequence: r.sequence,
                    micros: r.created_at.timestamp_micros(),
                }),
        };
        let now = self.clock.now().timestamp_micros();
        Ok(match last {
            Some(c) => Cursor {
                sequence: c.sequence + 1,
                micros: now.max(c.micros + 1),
            },
            None => Cursor {
                sequence: 1,
                micros: now,
            },
        })
    }
}

fn micros_to_datetime(micros: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).ok()?;
    chrono::DateTime::from_timestamp(micros.div_euclid(1_000_000), nanos)
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, CheckpointError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CheckpointError::io(path, e)),
    }
}

fn write_optional(path: &Path, contents: Option<&[u8]>) -> std::io::Result<()> {
    match contents {
        Some(bytes) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, bytes)
        }
        None => match fs::remove_file(path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    }
}

fn tool_on_path(name: &str) -> bool {
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
    })
}
