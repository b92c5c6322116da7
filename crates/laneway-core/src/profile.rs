//! Execution profiles ("lanes") and their registry
//!
//! A profile fixes, for the lifetime of a run:
//! - per-stage SLA targets
//! - the worker strategy the pool sizes itself with
//! - quality thresholds handed to stage bodies
//! - how aggressively failures are retried versus escalated
//!
//! [`ProfileRegistry`] resolves a profile from an explicit name or from the
//! size and shape of the change being validated.

use crate::error::{ConfigError, EngineError};
use crate::recovery::RecoveryBias;
use crate::types::StageId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Built-in lane names
pub const LIGHT: &str = "light";
/// Built-in lane names
pub const STANDARD: &str = "standard";
/// Built-in lane names
pub const HEAVY: &str = "heavy";

/// How the worker pool executes and sizes a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStrategy {
    /// Fixed number of thread workers
    FixedThread,
    /// Process-isolated workers, one per core
    FixedProcess,
    /// Threads for I/O-bound bodies, blocking pool for CPU-bound bodies
    Hybrid,
    /// Sized from available memory and cores
    Adaptive,
    /// One worker, for deterministic debugging
    Sequential,
}

impl WorkerStrategy {
    /// All strategies
    pub const ALL: [WorkerStrategy; 5] = [
        Self::FixedThread,
        Self::FixedProcess,
        Self::Hybrid,
        Self::Adaptive,
        Self::Sequential,
    ];

    /// Whether in-flight units are hard-cancelled rather than drained
    #[inline]
    #[must_use]
    pub fn hard_cancel(&self) -> bool {
        matches!(self, Self::FixedProcess)
    }

    /// Whether CPU-bound in-process bodies go to the blocking pool
    #[inline]
    #[must_use]
    pub fn offloads_cpu_bound(&self) -> bool {
        matches!(self, Self::Hybrid | Self::FixedProcess)
    }

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedThread => "FIXED_THREAD",
            Self::FixedProcess => "FIXED_PROCESS",
            Self::Hybrid => "HYBRID",
            Self::Adaptive => "ADAPTIVE",
            Self::Sequential => "SEQUENTIAL",
        }
    }
}

impl fmt::Display for WorkerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|w| w.as_str() == normalized)
            .ok_or_else(|| format!("unknown worker strategy: {s}"))
    }
}

/// Quality gates a lane enforces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityThresholds {
    /// Minimum line coverage percent
    pub min_coverage_pct: f64,
    /// Maximum lint warnings tolerated
    pub max_lint_warnings: u32,
    /// Whether the security scan stage is mandatory
    pub require_security_scan: bool,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_coverage_pct: 70.0,
            max_lint_warnings: 10,
            require_security_scan: false,
        }
    }
}

/// A named lane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionProfile {
    /// Lane name
    pub name: String,
    /// Human description
    #[serde(default)]
    pub description: String,
    /// Pool strategy
    pub strategy: WorkerStrategy,
    /// SLA target for stages without their own entry
    pub default_sla_ms: u64,
    /// Per-stage SLA targets keyed by stage id
    #[serde(default)]
    pub stage_sla_ms: BTreeMap<String, u64>,
    /// Quality gates
    #[serde(default)]
    pub quality: QualityThresholds,
    /// Retry-versus-escalate bias of the recovery planner
    #[serde(default)]
    pub recovery_bias: RecoveryBias,
    /// Automatic re-executions allowed per recovery action
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Stage timeout = SLA target × this multiplier
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,
    /// Base delay between retries (doubles each attempt)
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Worker count for `FIXED_THREAD` (defaults to core count)
    #[serde(default)]
    pub fixed_workers: Option<usize>,
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    2
}

fn default_timeout_multiplier() -> f64 {
    2.0
}

impl ExecutionProfile {
    /// Create a profile with default quality gates and no per-stage targets
    #[must_use]
    pub fn new(name: impl Into<String>, strategy: WorkerStrategy, default_sla: Duration) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            strategy,
            default_sla_ms: duration_ms(default_sla),
            stage_sla_ms: BTreeMap::new(),
            quality: QualityThresholds::default(),
            recovery_bias: RecoveryBias::Balanced,
            max_retries: 2,
            timeout_multiplier: 2.0,
            retry_backoff_ms: default_backoff_ms(),
            fixed_workers: None,
        }
    }

    /// Fast lane: adaptive pool, latency-biased recovery
    #[must_use]
    pub fn light() -> Self {
        Self {
            description: "Docs/config-only or small changes; fast feedback".into(),
            quality: QualityThresholds {
                min_coverage_pct: 60.0,
                max_lint_warnings: 25,
                require_security_scan: false,
            },
            recovery_bias: RecoveryBias::Latency,
            max_retries: 3,
            timeout_multiplier: 1.5,
            retry_backoff_ms: 250,
            ..Self::new(LIGHT, WorkerStrategy::Adaptive, Duration::from_secs(60))
        }
    }

    /// Default lane
    #[must_use]
    pub fn standard() -> Self {
        Self {
            description: "Typical source changes".into(),
            ..Self::new(STANDARD, WorkerStrategy::Hybrid, Duration::from_secs(300))
        }
    }

    /// Strict lane: process isolation, few retries, early escalation
    #[must_use]
    pub fn heavy() -> Self {
        Self {
            description: "Large or dependency-changing changes; strict gates".into(),
            quality: QualityThresholds {
                min_coverage_pct: 80.0,
                max_lint_warnings: 0,
                require_security_scan: true,
            },
            recovery_bias: RecoveryBias::Strict,
            max_retries: 1,
            retry_backoff_ms: 1_000,
            ..Self::new(HEAVY, WorkerStrategy::FixedProcess, Duration::from_secs(900))
        }
    }

    /// With SLA target for one stage
    #[must_use]
    pub fn with_stage_sla(mut self, stage: impl Into<String>, target: Duration) -> Self {
        self.stage_sla_ms.insert(stage.into(), duration_ms(target));
        self
    }

    /// With worker strategy
    #[inline]
    #[must_use]
    pub fn with_strategy(mut self, strategy: WorkerStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// With recovery bias
    #[inline]
    #[must_use]
    pub fn with_recovery_bias(mut self, bias: RecoveryBias) -> Self {
        self.recovery_bias = bias;
        self
    }

    /// With automatic retry budget and base backoff
    #[inline]
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = duration_ms(backoff);
        self
    }

    /// SLA target of a stage
    #[must_use]
    pub fn sla_target(&self, stage: &StageId) -> Duration {
        Duration::from_millis(
            self.stage_sla_ms
                .get(stage.as_str())
                .copied()
                .unwrap_or(self.default_sla_ms),
        )
    }

    /// Hard timeout of a stage: SLA target × safety multiplier
    #[must_use]
    pub fn stage_timeout(&self, stage: &StageId) -> Duration {
        self.sla_target(stage).mul_f64(self.timeout_multiplier)
    }

    /// Base retry backoff
    #[inline]
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Check values are usable
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(format!("profile '{}': {msg}", self.name)));
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("profile name must not be empty".into()));
        }
        if self.default_sla_ms == 0 {
            return invalid("default_sla_ms must be > 0".into());
        }
        if let Some((stage, _)) = self.stage_sla_ms.iter().find(|(_, ms)| **ms == 0) {
            return invalid(format!("stage_sla_ms.{stage} must be > 0"));
        }
        if !self.timeout_multiplier.is_finite() || self.timeout_multiplier < 1.0 {
            return invalid("timeout_multiplier must be >= 1.0".into());
        }
        if !(0.0..=100.0).contains(&self.quality.min_coverage_pct) {
            return invalid("quality.min_coverage_pct must be within 0..=100".into());
        }
        if self.fixed_workers == Some(0) {
            return invalid("fixed_workers must be > 0".into());
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Kind of changed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCategory {
    /// Production source
    Source,
    /// Tests
    Test,
    /// Documentation
    Docs,
    /// Configuration files
    Config,
    /// Dependency manifests and lockfiles
    Dependency,
}

impl ChangeCategory {
    /// Categorize a changed path by name
    #[must_use]
    pub fn of_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        let file = lower.rsplit('/').next().unwrap_or(&lower);
        const MANIFESTS: [&str; 10] = [
            "cargo.toml",
            "cargo.lock",
            "package.json",
            "package-lock.json",
            "yarn.lock",
            "requirements.txt",
            "pyproject.toml",
            "poetry.lock",
            "go.mod",
            "go.sum",
        ];
        if MANIFESTS.contains(&file) {
            Self::Dependency
        } else if lower.starts_with("tests/")
            || lower.contains("/tests/")
            || lower.contains("/test/")
            || file.starts_with("test_")
            || file.contains("_test.")
            || file.contains(".test.")
        {
            Self::Test
        } else if lower.starts_with("docs/")
            || file.ends_with(".md")
            || file.ends_with(".rst")
            || file.ends_with(".txt")
        {
            Self::Docs
        } else if [".toml", ".yaml", ".yml", ".json", ".ini", ".cfg", ".env"]
            .iter()
            .any(|ext| file.ends_with(ext))
        {
            Self::Config
        } else {
            Self::Source
        }
    }
}

/// Shape of the change under validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    /// Changed-unit counts per category
    pub files_by_category: BTreeMap<ChangeCategory, usize>,
    /// Lines added
    pub lines_added: usize,
    /// Lines removed
    pub lines_removed: usize,
}

impl ChangeMetadata {
    /// Empty change
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count changed paths by category
    #[must_use]
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut meta = Self::new();
        for p in paths {
            *meta
                .files_by_category
                .entry(ChangeCategory::of_path(p.as_ref()))
                .or_insert(0) += 1;
        }
        meta
    }

    /// With changed-file count for a category
    #[must_use]
    pub fn with_files(mut self, category: ChangeCategory, count: usize) -> Self {
        self.files_by_category.insert(category, count);
        self
    }

    /// With line volume
    #[must_use]
    pub fn with_lines(mut self, added: usize, removed: usize) -> Self {
        self.lines_added = added;
        self.lines_removed = removed;
        self
    }

    /// Total changed files
    #[must_use]
    pub fn total_files(&self) -> usize {
        self.files_by_category.values().sum()
    }

    /// Total changed lines
    #[inline]
    #[must_use]
    pub fn total_lines(&self) -> usize {
        self.lines_added + self.lines_removed
    }

    /// Files in one category
    #[must_use]
    pub fn files(&self, category: ChangeCategory) -> usize {
        self.files_by_category.get(&category).copied().unwrap_or(0)
    }
}

/// Thresholds for automatic lane selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AutoSelectRules {
    /// Light lane: at most this many files
    pub light_max_files: usize,
    /// Light lane: at most this many changed lines
    pub light_max_lines: usize,
    /// Heavy lane: at least this many files
    pub heavy_min_files: usize,
    /// Heavy lane: at least this many changed lines
    pub heavy_min_lines: usize,
    /// Lane chosen for small non-source changes
    pub light_lane: String,
    /// Lane chosen otherwise
    pub standard_lane: String,
    /// Lane chosen for large or dependency-changing changes
    pub heavy_lane: String,
}

impl Default for AutoSelectRules {
    fn default() -> Self {
        Self {
            light_max_files: 10,
            light_max_lines: 200,
            heavy_min_files: 50,
            heavy_min_lines: 2_000,
            light_lane: LIGHT.into(),
            standard_lane: STANDARD.into(),
            heavy_lane: HEAVY.into(),
        }
    }
}

impl AutoSelectRules {
    /// Lane name for a change
    #[must_use]
    pub fn lane_for(&self, change: &ChangeMetadata) -> &str {
        let files = change.total_files();
        let lines = change.total_lines();
        if change.files(ChangeCategory::Dependency) > 0
            || files >= self.heavy_min_files
            || lines >= self.heavy_min_lines
        {
            return &self.heavy_lane;
        }
        let source_free = change.files(ChangeCategory::Source) == 0;
        if source_free && files <= self.light_max_files && lines <= self.light_max_lines {
            return &self.light_lane;
        }
        &self.standard_lane
    }
}

/// How a run picks its lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSelection {
    /// Named lane; always wins over heuristics
    Explicit(String),
    /// Lane derived from the change
    Auto(ChangeMetadata),
}

/// Registry of lanes, in registration order
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: IndexMap<String, Arc<ExecutionProfile>>,
    rules: AutoSelectRules,
}

impl ProfileRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new(rules: AutoSelectRules) -> Self {
        Self {
            profiles: IndexMap::new(),
            rules,
        }
    }

    /// Create registry with the light, standard and heavy lanes
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new(AutoSelectRules::default());
        registry.register(ExecutionProfile::light());
        registry.register(ExecutionProfile::standard());
        registry.register(ExecutionProfile::heavy());
        registry
    }

    /// Register a lane, replacing any lane of the same name in place
    pub fn register(&mut self, profile: ExecutionProfile) {
        tracing::debug!(profile = %profile.name, strategy = %profile.strategy, "profile registered");
        self.profiles
            .insert(profile.name.clone(), Arc::new(profile));
    }

    /// Resolve a lane
    ///
    /// # Errors
    /// Returns `ProfileNotFound` if the named (or auto-chosen) lane is not registered.
    pub fn select(&self, selection: &ProfileSelection) -> Result<Arc<ExecutionProfile>, EngineError> {
        let name = match selection {
            ProfileSelection::Explicit(name) => name.as_str(),
            ProfileSelection::Auto(change) => {
                let lane = self.rules.lane_for(change);
                tracing::info!(
                    lane,
                    files = change.total_files(),
                    lines = change.total_lines(),
                    "lane auto-selected"
                );
                lane
            }
        };
        self.get(name)
    }

    /// Look up a lane by name
    ///
    /// # Errors
    /// Returns `ProfileNotFound` if not registered.
    pub fn get(&self, name: &str) -> Result<Arc<ExecutionProfile>, EngineError> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ProfileNotFound(name.to_string()))
    }

    /// All lanes in registration order
    #[must_use]
    pub fn list(&self) -> Vec<Arc<ExecutionProfile>> {
        self.profiles.values().cloned().collect()
    }

    /// Auto-selection rules
    #[inline]
    #[must_use]
    pub fn rules(&self) -> &AutoSelectRules {
        &self.rules
    }

    /// Number of lanes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether no lane is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_registered_in_order() {
        let registry = ProfileRegistry::with_defaults();
        let names: Vec<_> = registry.list().iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, vec![LIGHT, STANDARD, HEAVY]);
    }

    #[test]
    fn explicit_name_overrides_heuristics() {
        let registry = ProfileRegistry::with_defaults();
        let p = registry
            .select(&ProfileSelection::Explicit(LIGHT.into()))
            .unwrap();
        assert_eq!(p.name, LIGHT);
    }

    #[test]
    fn unknown_explicit_name_is_not_found() {
        let registry = ProfileRegistry::with_defaults();
        let err = registry
            .select(&ProfileSelection::Explicit("turbo".into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::ProfileNotFound(name) if name == "turbo"));
    }

    #[test]
    fn docs_only_change_selects_light() {
        let registry = ProfileRegistry::with_defaults();
        let change = ChangeMetadata::new()
            .with_files(ChangeCategory::Docs, 3)
            .with_lines(40, 5);
        assert_eq!(registry.select(&ProfileSelection::Auto(change)).unwrap().name, LIGHT);
    }

    #[test]
    fn source_change_selects_standard() {
        let registry = ProfileRegistry::with_defaults();
        let change = ChangeMetadata::new()
            .with_files(ChangeCategory::Source, 4)
            .with_files(ChangeCategory::Test, 2)
            .with_lines(300, 120);
        assert_eq!(
            registry.select(&ProfileSelection::Auto(change)).unwrap().name,
            STANDARD
        );
    }

    #[test]
    fn dependency_or_large_change_selects_heavy() {
        let registry = ProfileRegistry::with_defaults();
        let deps = ChangeMetadata::new().with_files(ChangeCategory::Dependency, 1);
        assert_eq!(registry.select(&ProfileSelection::Auto(deps)).unwrap().name, HEAVY);

        let big = ChangeMetadata::new()
            .with_files(ChangeCategory::Source, 5)
            .with_lines(1_800, 400);
        assert_eq!(registry.select(&ProfileSelection::Auto(big)).unwrap().name, HEAVY);
    }

    #[test]
    fn register_replaces_in_place() {
        let mut registry = ProfileRegistry::with_defaults();
        registry.register(ExecutionProfile::standard().with_strategy(WorkerStrategy::Sequential));
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.list()[1].strategy, WorkerStrategy::Sequential);
    }

    #[test]
    fn categorizes_paths() {
        assert_eq!(ChangeCategory::of_path("Cargo.lock"), ChangeCategory::Dependency);
        assert_eq!(ChangeCategory::of_path("crates/a/tests/it.rs"), ChangeCategory::Test);
        assert_eq!(ChangeCategory::of_path("README.md"), ChangeCategory::Docs);
        assert_eq!(ChangeCategory::of_path("config/app.yaml"), ChangeCategory::Config);
        assert_eq!(ChangeCategory::of_path("src/main.rs"), ChangeCategory::Source);

        let meta = ChangeMetadata::from_paths(["src/a.rs", "src/b.rs", "docs/x.md"]);
        assert_eq!(meta.files(ChangeCategory::Source), 2);
        assert_eq!(meta.total_files(), 3);
    }

    #[test]
    fn stage_sla_and_timeout() {
        let p = ExecutionProfile::standard().with_stage_sla("unit", Duration::from_secs(30));
        assert_eq!(p.sla_target(&StageId::new("unit")), Duration::from_secs(30));
        assert_eq!(p.sla_target(&StageId::new("other")), Duration::from_secs(300));
        assert_eq!(p.stage_timeout(&StageId::new("unit")), Duration::from_secs(60));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut p = ExecutionProfile::standard();
        p.timeout_multiplier = 0.5;
        assert!(p.validate().is_err());

        let mut p = ExecutionProfile::standard();
        p.default_sla_ms = 0;
        assert!(p.validate().is_err());

        assert!(ExecutionProfile::heavy().validate().is_ok());
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("adaptive".parse::<WorkerStrategy>().unwrap(), WorkerStrategy::Adaptive);
        assert_eq!(
            "fixed-process".parse::<WorkerStrategy>().unwrap(),
            WorkerStrategy::FixedProcess
        );
    }
}
