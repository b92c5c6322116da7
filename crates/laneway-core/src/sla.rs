//! SLA gate
//!
//! Compares observed stage durations with the lane's targets. Ratios are
//! integer percents and compared exactly: `observed × 100 ≥ target × pct`.

use crate::profile::ExecutionProfile;
use crate::types::{StageExecutionRecord, StageId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Breach level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaSeverity {
    /// Approaching the target
    Warning,
    /// Over the target
    Violation,
    /// Far over the target; fails the gate
    Critical,
}

impl SlaSeverity {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Violation => "violation",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for SlaSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity boundaries as percent of target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SlaThresholds {
    /// Warning from this percent
    pub warning_pct: u32,
    /// Violation from this percent
    pub violation_pct: u32,
    /// Critical from this percent
    pub critical_pct: u32,
}

impl Default for SlaThresholds {
    fn default() -> Self {
        Self {
            warning_pct: 80,
            violation_pct: 100,
            critical_pct: 200,
        }
    }
}

impl SlaThresholds {
    /// Whether the boundaries strictly increase
    #[inline]
    #[must_use]
    pub fn is_increasing(&self) -> bool {
        self.warning_pct < self.violation_pct && self.violation_pct < self.critical_pct
    }

    /// Classify an observed duration; `None` below the warning boundary
    #[must_use]
    pub fn classify(&self, observed: Duration, target: Duration) -> Option<SlaSeverity> {
        let observed = observed.as_millis() * 100;
        let target = target.as_millis();
        let reaches = |pct: u32| observed >= target * u128::from(pct);
        if reaches(self.critical_pct) {
            Some(SlaSeverity::Critical)
        } else if reaches(self.violation_pct) {
            Some(SlaSeverity::Violation)
        } else if reaches(self.warning_pct) {
            Some(SlaSeverity::Warning)
        } else {
            None
        }
    }
}

/// One recorded breach
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaEvent {
    /// Stage
    pub stage_id: StageId,
    /// Level
    pub severity: SlaSeverity,
    /// Observed duration
    #[serde(with = "crate::types::millis", rename = "observed_ms")]
    pub observed: Duration,
    /// Target duration
    #[serde(with = "crate::types::millis", rename = "target_ms")]
    pub target: Duration,
    /// observed / target
    pub ratio: f64,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Run-scoped SLA tracker
#[derive(Debug, Default)]
pub struct SlaManager {
    thresholds: SlaThresholds,
    events: Mutex<Vec<SlaEvent>>,
}

impl SlaManager {
    /// Create manager
    #[must_use]
    pub fn new(thresholds: SlaThresholds) -> Self {
        Self {
            thresholds,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Thresholds in use
    #[inline]
    #[must_use]
    pub fn thresholds(&self) -> SlaThresholds {
        self.thresholds
    }

    /// Check one duration, retaining and returning the event if any
    pub fn check(&self, stage_id: &StageId, duration: Duration, target: Duration) -> Option<SlaEvent> {
        let severity = self.thresholds.classify(duration, target)?;
        let ratio = if target.is_zero() {
            f64::INFINITY
        } else {
            duration.as_secs_f64() / target.as_secs_f64()
        };
        let event = SlaEvent {
            stage_id: stage_id.clone(),
            severity,
            observed: duration,
            target,
            ratio,
            recorded_at: Utc::now(),
        };

        match severity {
            SlaSeverity::Warning => tracing::info!(
                stage = %stage_id,
                observed_ms = duration.as_millis() as u64,
                target_ms = target.as_millis() as u64,
                "SLA warning"
            ),
            _ => tracing::warn!(
                stage = %stage_id,
                %severity,
                observed_ms = duration.as_millis() as u64,
                target_ms = target.as_millis() as u64,
                "SLA breached"
            ),
        }
        metrics::counter!("laneway_sla_events_total", "severity" => severity.as_str()).increment(1);

        self.events.lock().push(event.clone());
        Some(event)
    }

    /// Check every record against its lane target
    ///
    /// Returns `(pass, events)`; the gate fails when any event is critical.
    pub fn check_all(
        &self,
        records: &[StageExecutionRecord],
        profile: &ExecutionProfile,
    ) -> (bool, Vec<SlaEvent>) {
        let events: Vec<SlaEvent> = records
            .iter()
            .filter_map(|r| self.check(&r.stage_id, r.duration, profile.sla_target(&r.stage_id)))
            .collect();
        let pass = !events.iter().any(|e| e.severity == SlaSeverity::Critical);
        (pass, events)
    }

    /// Events retained so far
    #[must_use]
    pub fn events(&self) -> Vec<SlaEvent> {
        self.events.lock().clone()
    }

    /// Count of retained events at a level
    #[must_use]
    pub fn count(&self, severity: SlaSeverity) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.severity == severity)
            .count()
    }
}
