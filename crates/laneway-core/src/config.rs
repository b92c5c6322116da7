//! Engine configuration
//!
//! Loaded from TOML or YAML by file extension. Every section is optional;
//! missing values take the built-in defaults.
//!
//! ```toml
//! [storage]
//! root = ".laneway/checkpoints"
//! retention_days = 7
//!
//! [workspace]
//! critical_files = ["Cargo.toml", "Cargo.lock"]
//! transient_artifacts = ["target/tmp"]
//!
//! [pool.caps]
//! low = 4
//! mid = 8
//! high = 16
//!
//! [[profiles]]
//! name = "nightly"
//! strategy = "FIXED_PROCESS"
//! default_sla_ms = 3600000
//! ```

use crate::error::ConfigError;
use crate::profile::{AutoSelectRules, ExecutionProfile, ProfileRegistry};
use crate::resources::PoolSettings;
use crate::sla::SlaThresholds;
use laneway_checkpoint::{CheckpointSettings, DEFAULT_RETENTION_DAYS};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default checkpoint storage root, relative to the workspace
pub const DEFAULT_STORAGE_ROOT: &str = ".laneway/checkpoints";

/// Checkpoint storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    /// Storage root; relative paths resolve against the workspace
    pub root: PathBuf,
    /// Checkpoints older than this are removed by cleanup
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

/// What the checkpoint manager snapshots and checks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkspaceConfig {
    /// Critical-state files (workspace-relative)
    pub critical_files: Vec<String>,
    /// Transient build outputs removed by cleanup
    pub transient_artifacts: Vec<String>,
    /// Environment variables that must be set
    pub required_env: Vec<String>,
    /// Executables that must be on `PATH`
    pub required_tools: Vec<String>,
}

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Checkpoint storage
    pub storage: StorageConfig,
    /// Workspace file sets
    pub workspace: WorkspaceConfig,
    /// Worker pool sizing
    pub pool: PoolSettings,
    /// SLA severity boundaries
    pub sla: SlaThresholds,
    /// Lane auto-selection
    pub selection: AutoSelectRules,
    /// Extra lanes; a lane named like a built-in replaces it
    pub profiles: Vec<ExecutionProfile>,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a `.toml`, `.yaml` or `.yml` file
    ///
    /// # Errors
    /// - `Read` if the file cannot be read
    /// - `UnsupportedFormat` for other extensions
    /// - `Toml` / `Yaml` on syntax or unknown keys
    /// - `Invalid` if values are inconsistent
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !matches!(ext.as_str(), "toml" | "yaml" | "yml") {
            return Err(ConfigError::UnsupportedFormat(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = if ext == "toml" {
            Self::from_toml(&text)?
        } else {
            Self::from_yaml(&text)?
        };
        tracing::debug!(path = %path.display(), profiles = config.profiles.len(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// Returns `Toml` or `Invalid`.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML text
    ///
    /// # Errors
    /// Returns `Yaml` or `Invalid`.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values are recognized and consistent
    ///
    /// # Errors
    /// Returns `Invalid` naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        if !self.sla.is_increasing() || self.sla.warning_pct == 0 {
            return Err(ConfigError::Invalid(format!(
                "sla ratios must satisfy 0 < warning < violation < critical (got {}, {}, {})",
                self.sla.warning_pct, self.sla.violation_pct, self.sla.critical_pct
            )));
        }
        if self.storage.retention_days == 0 {
            return Err(ConfigError::Invalid("storage.retention_days must be > 0".into()));
        }
        let rules = &self.selection;
        if rules.light_max_files > rules.heavy_min_files || rules.light_max_lines > rules.heavy_min_lines {
            return Err(ConfigError::Invalid(
                "selection: light limits must not exceed heavy thresholds".into(),
            ));
        }
        let mut names = HashSet::new();
        for profile in &self.profiles {
            profile.validate()?;
            if !names.insert(profile.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate profile name: {}", profile.name)));
            }
        }
        Ok(())
    }

    /// Built-in lanes plus configured ones, with the configured selection rules
    #[must_use]
    pub fn registry(&self) -> ProfileRegistry {
        let mut registry = ProfileRegistry::new(self.selection.clone());
        registry.register(ExecutionProfile::light());
        registry.register(ExecutionProfile::standard());
        registry.register(ExecutionProfile::heavy());
        for profile in &self.profiles {
            registry.register(profile.clone());
        }
        registry
    }

    /// Storage root resolved against `workspace`
    #[must_use]
    pub fn storage_root(&self, workspace: &Path) -> PathBuf {
        if self.storage.root.is_absolute() {
            self.storage.root.clone()
        } else {
            workspace.join(&self.storage.root)
        }
    }

    /// Checkpoint manager settings for `workspace`
    #[must_use]
    pub fn checkpoint_settings(&self, workspace: &Path) -> CheckpointSettings {
        let mut settings = CheckpointSettings::new(workspace)
            .with_critical_files(self.workspace.critical_files.iter().cloned())
            .with_transient_artifacts(self.workspace.transient_artifacts.iter().cloned())
            .with_retention_days(self.storage.retention_days);
        settings.required_env.clone_from(&self.workspace.required_env);
        settings.required_tools.clone_from(&self.workspace.required_tools);
        settings
    }
}
