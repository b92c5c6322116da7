//! JSON metrics export of a finished run

use crate::orchestrator::RunReport;
use crate::pool::{Bottleneck, PoolMetrics, Recommendation};
use crate::sla::{SlaEvent, SlaSeverity};
use crate::types::{millis, FailureType, RunId, RunState, StageId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Timing of one stage execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    /// Stage
    pub stage_id: StageId,
    /// Attempt (1-based)
    pub attempt: u32,
    /// Wall time
    #[serde(with = "millis", rename = "duration_ms")]
    pub duration: Duration,
    /// Passed
    pub success: bool,
    /// Classification of a failure
    pub failure: Option<FailureType>,
}

/// Exportable snapshot of a run's performance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Run
    pub run_id: RunId,
    /// Lane
    pub profile: String,
    /// Final state
    pub state: RunState,
    /// Run wall time
    #[serde(with = "millis", rename = "duration_ms")]
    pub duration: Duration,
    /// Pool size
    pub workers: usize,
    /// Every stage execution in order
    pub stages: Vec<StageTiming>,
    /// SLA events
    pub sla_events: Vec<SlaEvent>,
    /// Event count per severity
    pub sla_summary: BTreeMap<SlaSeverity, usize>,
    /// Gate result
    pub sla_passed: bool,
    /// Bottlenecks of every batch
    pub bottlenecks: Vec<Bottleneck>,
    /// Busy-time weighted utilization across batches, `None` without batches
    pub utilization: Option<f64>,
    /// Pool tuning suggestions
    pub recommendations: Vec<Recommendation>,
    /// Pool counters
    pub pool: PoolMetrics,
}

impl MetricsSnapshot {
    /// Build from a run report
    #[must_use]
    pub fn from_report(report: &RunReport) -> Self {
        let stages = report
            .records
            .iter()
            .map(|r| StageTiming {
                stage_id: r.stage_id.clone(),
                attempt: r.attempt,
                duration: r.duration,
                success: r.success,
                failure: r.failure,
            })
            .collect();

        let mut sla_summary = BTreeMap::new();
        for event in &report.sla_events {
            *sla_summary.entry(event.severity).or_insert(0) += 1;
        }

        let total_wall: f64 = report.batches.iter().map(|b| b.wall.as_secs_f64()).sum();
        let utilization = (!report.batches.is_empty()).then(|| {
            if total_wall > 0.0 {
                report
                    .batches
                    .iter()
                    .map(|b| b.utilization * b.wall.as_secs_f64())
                    .sum::<f64>()
                    / total_wall
            } else {
                0.0
            }
        });

        Self {
            run_id: report.run_id,
            profile: report.profile.clone(),
            state: report.state,
            duration: report.duration,
            workers: report.workers,
            stages,
            sla_events: report.sla_events.clone(),
            sla_summary,
            sla_passed: report.sla_passed,
            bottlenecks: report
                .batches
                .iter()
                .flat_map(|b| b.bottlenecks.iter().cloned())
                .collect(),
            utilization,
            recommendations: report
                .batches
                .iter()
                .flat_map(|b| b.recommendations.iter().cloned())
                .collect(),
            pool: report.pool.clone(),
        }
    }

    /// Pretty JSON
    ///
    /// # Errors
    /// Returns the serializer error.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write pretty JSON to `path`
    ///
    /// # Errors
    /// Returns I/O or serialization errors.
    pub fn write_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path.as_ref(), json)?;
        tracing::debug!(path = %path.as_ref().display(), "metrics snapshot written");
        Ok(())
    }
}
