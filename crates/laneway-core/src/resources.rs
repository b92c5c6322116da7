//! Host resources and worker-count sizing

use crate::error::{ConfigError, EngineError};
use crate::profile::WorkerStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the host offers the pool
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostResources {
    /// Logical cores
    pub logical_cores: usize,
    /// Available memory in GiB
    pub available_memory_gb: f64,
}

impl HostResources {
    /// Create resources
    #[inline]
    #[must_use]
    pub fn new(logical_cores: usize, available_memory_gb: f64) -> Self {
        Self {
            logical_cores,
            available_memory_gb,
        }
    }
}

/// Source of [`HostResources`]
pub trait ResourceProbe: Send + Sync {
    /// Probe current resources
    ///
    /// # Errors
    /// Returns `ResourceUnavailable` if cores cannot be determined.
    fn probe(&self) -> Result<HostResources, EngineError>;
}

/// Probes the running host
///
/// Cores come from `available_parallelism`; memory from `MemAvailable` in
/// `/proc/meminfo`, or `assumed_memory_gb` where that is not readable.
#[derive(Debug, Clone, Copy)]
pub struct SystemProbe {
    assumed_memory_gb: f64,
}

impl SystemProbe {
    /// Create probe with a memory fallback
    #[inline]
    #[must_use]
    pub fn new(assumed_memory_gb: f64) -> Self {
        Self { assumed_memory_gb }
    }

    fn available_memory_gb(&self) -> f64 {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo_available_kb(&s))
            .map_or(self.assumed_memory_gb, |kb| kb as f64 / (1024.0 * 1024.0))
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(PoolSettings::default().assumed_memory_gb)
    }
}

impl ResourceProbe for SystemProbe {
    fn probe(&self) -> Result<HostResources, EngineError> {
        let cores = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .map_err(|e| EngineError::ResourceUnavailable(format!("cannot determine core count: {e}")))?;
        Ok(HostResources::new(cores, self.available_memory_gb()))
    }
}

fn parse_meminfo_available_kb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|l| l.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

/// Fixed resources, for tests and dry runs
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub HostResources);

impl ResourceProbe for StaticProbe {
    fn probe(&self) -> Result<HostResources, EngineError> {
        Ok(self.0)
    }
}

/// Upper bounds on pool size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolCaps {
    /// Low-memory bound
    pub low: usize,
    /// Mid bound; also the process-pool bound
    pub mid: usize,
    /// Absolute bound
    pub high: usize,
}

impl Default for PoolCaps {
    fn default() -> Self {
        Self {
            low: 4,
            mid: 8,
            high: 16,
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolSettings {
    /// Size caps
    pub caps: PoolCaps,
    /// `FIXED_THREAD` count when the lane does not set one
    pub fixed_workers: Option<usize>,
    /// Slack added to a batch's timeout for scheduling
    pub startup_overhead_ms: u64,
    /// Memory assumed when the host does not report it
    pub assumed_memory_gb: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            caps: PoolCaps::default(),
            fixed_workers: None,
            startup_overhead_ms: 2_000,
            assumed_memory_gb: 8.0,
        }
    }
}

impl PoolSettings {
    /// Startup overhead as duration
    #[inline]
    #[must_use]
    pub fn startup_overhead(&self) -> Duration {
        Duration::from_millis(self.startup_overhead_ms)
    }

    /// Check values are consistent
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if caps are zero or unordered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let PoolCaps { low, mid, high } = self.caps;
        if low == 0 {
            return Err(ConfigError::Invalid("pool.caps.low must be > 0".into()));
        }
        if !(low <= mid && mid <= high) {
            return Err(ConfigError::Invalid(format!(
                "pool caps must satisfy low <= mid <= high (got {low}, {mid}, {high})"
            )));
        }
        if self.fixed_workers == Some(0) {
            return Err(ConfigError::Invalid("pool.fixed_workers must be > 0".into()));
        }
        if !self.assumed_memory_gb.is_finite() || self.assumed_memory_gb <= 0.0 {
            return Err(ConfigError::Invalid("pool.assumed_memory_gb must be > 0".into()));
        }
        Ok(())
    }
}

/// Worker count for a strategy on a host; always at least 1
///
/// `fixed` overrides the configured `FIXED_THREAD` count.
///
/// # Errors
/// Returns `ResourceUnavailable` when the host reports zero cores.
pub fn worker_count(
    strategy: WorkerStrategy,
    resources: HostResources,
    settings: &PoolSettings,
    fixed: Option<usize>,
) -> Result<usize, EngineError> {
    let c = resources.logical_cores;
    if c == 0 {
        return Err(EngineError::ResourceUnavailable(
            "host reported zero logical cores".into(),
        ));
    }
    let caps = settings.caps;
    let m = resources.available_memory_gb;
    let n = match strategy {
        WorkerStrategy::Adaptive if m > 8.0 => (2 * c).min(caps.high),
        WorkerStrategy::Adaptive if m > 4.0 => c.min(caps.mid),
        WorkerStrategy::Adaptive => (c / 2).min(caps.low),
        WorkerStrategy::FixedThread => fixed
            .or(settings.fixed_workers)
            .unwrap_or(c)
            .min(caps.high),
        WorkerStrategy::FixedProcess => c.min(caps.mid),
        WorkerStrategy::Hybrid => (c + c / 2).min(caps.high),
        WorkerStrategy::Sequential => 1,
    };
    Ok(n.max(1))
}
