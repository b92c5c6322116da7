//! Revision-control collaborator
//!
//! Checkpoints record which revision they were taken at. Revision control
//! being unreachable only degrades checkpoint metadata; it never fails a
//! checkpoint.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Failure to read revision information
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RevisionError {
    /// Tool missing or workspace is not under revision control
    #[error("revision control unavailable: {0}")]
    Unavailable(String),

    /// Tool ran but reported an error
    #[error("revision control command failed: {0}")]
    CommandFailed(String),
}

/// Read-only view of the revision-control system
#[cfg_attr(test, mockall::automock)]
pub trait RevisionControl: Send + Sync {
    /// Identifier of the checked-out revision
    fn current_revision(&self) -> Result<String, RevisionError>;

    /// Name of the checked-out branch
    fn current_branch(&self) -> Result<String, RevisionError>;
}

/// `git` command-line implementation
#[derive(Debug, Clone)]
pub struct GitCli {
    repo: PathBuf,
}

impl GitCli {
    /// Read revisions of the repository containing `repo`
    #[must_use]
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    fn git(&self, args: &[&str]) -> Result<String, RevisionError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            .output()
            .map_err(|e| RevisionError::Unavailable(e.to_string()))?;
        if !output.status.success() {
            return Err(RevisionError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Repository path
    #[inline]
    #[must_use]
    pub fn repo(&self) -> &Path {
        &self.repo
    }
}

impl RevisionControl for GitCli {
    fn current_revision(&self) -> Result<String, RevisionError> {
        self.git(&["rev-parse", "HEAD"])
    }

    fn current_branch(&self) -> Result<String, RevisionError> {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }
}

/// Stand-in for workspaces without revision control
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRevisionControl;

impl RevisionControl for NoRevisionControl {
    fn current_revision(&self) -> Result<String, RevisionError> {
        Err(RevisionError::Unavailable("no revision control configured".into()))
    }

    fn current_branch(&self) -> Result<String, RevisionError> {
        Err(RevisionError::Unavailable("no revision control configured".into()))
    }
}
