//! Error types for checkpoint capture, storage and restore

use crate::hash::{ContentHash, HashError};
use std::path::PathBuf;

/// Checkpoint subsystem error
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Stored snapshot no longer matches the hash recorded at creation
    #[error("checkpoint {id} is corrupt: expected hash {expected}, snapshot hashes to {actual}")]
    Corruption {
        /// Checkpoint being restored
        id: String,
        /// Hash recorded in the ledger
        expected: ContentHash,
        /// Hash recomputed from the stored snapshot
        actual: ContentHash,
    },

    /// Restore could not be completed; the workspace was reverted
    #[error("restore of checkpoint {id} failed: {reason}")]
    RestoreFailure {
        /// Checkpoint being restored
        id: String,
        /// Underlying cause
        reason: String,
    },

    /// No checkpoint with this id in the namespace
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    /// Filesystem access failed
    #[error("i/o error at {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Ledger entry could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored hash is malformed
    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    /// Path escapes the workspace or is otherwise unusable
    #[error("invalid snapshot path: {0}")]
    InvalidPath(String),
}

impl CheckpointError {
    /// Wrap an I/O error with the path it occurred at
    #[inline]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error indicates a tampered or damaged snapshot
    #[inline]
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}
