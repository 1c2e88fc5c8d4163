//! Cycle aggregates, threshold alerts, and the observers that receive them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::orchestrator::{ErrorKind, RunResult, RunStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub total: usize,
    pub unchanged: usize,
    pub updated: usize,
    pub source_failed: usize,
    pub sink_failed: usize,
    pub cancelled: usize,
}

impl CycleStats {
    pub fn from_results(results: &[RunResult]) -> Self {
        let mut stats = Self::default();
        for result in results {
            stats.total += 1;
            match result.status {
                RunStatus::Unchanged => stats.unchanged += 1,
                RunStatus::Updated => stats.updated += 1,
                RunStatus::SourceFailed => stats.source_failed += 1,
                RunStatus::SinkFailed => stats.sink_failed += 1,
                RunStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn count(&self, status: RunStatus) -> usize {
        match status {
            RunStatus::Unchanged => self.unchanged,
            RunStatus::Updated => self.updated,
            RunStatus::SourceFailed => self.source_failed,
            RunStatus::SinkFailed => self.sink_failed,
            RunStatus::Cancelled => self.cancelled,
        }
    }

    fn ratio(&self, count: usize) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            count as f64 / self.total as f64
        }
    }

    /// Share of entities that ended in `source_failed` or `sink_failed`.
    pub fn error_rate(&self) -> f64 {
        self.ratio(self.source_failed + self.sink_failed)
    }

    pub fn source_failed_ratio(&self) -> f64 {
        self.ratio(self.source_failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<RunResult>,
    pub stats: CycleStats,
}

/// Flattened per-entity failure line: one per failed source or failed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    pub entity_id: String,
    pub source_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl CycleReport {
    pub fn result_for(&self, entity_id: &str) -> Option<&RunResult> {
        self.results.iter().find(|r| r.entity_id == entity_id)
    }

    pub fn failures(&self) -> Vec<FailureDetail> {
        let mut details = Vec::new();
        for result in &self.results {
            for failure in &result.source_failures {
                details.push(FailureDetail {
                    entity_id: result.entity_id.clone(),
                    source_id: Some(failure.source_id.clone()),
                    kind: failure.kind,
                    message: failure.message.clone(),
                });
            }
            for step in result.failure.iter().chain(&result.warnings) {
                details.push(FailureDetail {
                    entity_id: result.entity_id.clone(),
                    source_id: None,
                    kind: step.kind,
                    message: step.message.clone(),
                });
            }
        }
        details
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AlertPolicy {
    pub max_source_failed_ratio: f64,
    pub max_error_rate: f64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            max_source_failed_ratio: 0.25,
            max_error_rate: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SourceFailedRatio,
    ErrorRate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub observed: f64,
    pub threshold: f64,
    pub message: String,
}

impl AlertPolicy {
    /// Alerts for every ratio strictly above its threshold.
    pub fn evaluate(&self, stats: &CycleStats) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let source_ratio = stats.source_failed_ratio();
        if source_ratio > self.max_source_failed_ratio {
            alerts.push(Alert {
                kind: AlertKind::SourceFailedRatio,
                observed: source_ratio,
                threshold: self.max_source_failed_ratio,
                message: format!(
                    "{} of {} entities could not be fetched from any source",
                    stats.source_failed, stats.total
                ),
            });
        }
        let error_rate = stats.error_rate();
        if error_rate > self.max_error_rate {
            alerts.push(Alert {
                kind: AlertKind::ErrorRate,
                observed: error_rate,
                threshold: self.max_error_rate,
                message: format!(
                    "{} of {} entities failed this cycle",
                    stats.source_failed + stats.sink_failed,
                    stats.total
                ),
            });
        }
        alerts
    }
}

/// Receives every finished cycle with the alerts it raised.
#[async_trait]
pub trait CycleObserver: Send + Sync {
    async fn observe(&self, report: &CycleReport, alerts: &[Alert]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

#[async_trait]
impl CycleObserver for TracingObserver {
    async fn observe(&self, report: &CycleReport, alerts: &[Alert]) -> Result<()> {
        for failure in report.failures() {
            warn!(
                run_id = %report.run_id,
                entity_id = %failure.entity_id,
                source_id = failure.source_id.as_deref().unwrap_or("-"),
                kind = failure.kind.as_str(),
                message = %failure.message,
                "entity failure"
            );
        }
        for alert in alerts {
            error!(
                run_id = %report.run_id,
                kind = ?alert.kind,
                observed = alert.observed,
                threshold = alert.threshold,
                "{}",
                alert.message
            );
        }
        Ok(())
    }
}

/// Writes `<reports_dir>/<run_id>/run_report.json` and `summary.md`.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    reports_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.reports_dir.join(run_id.to_string())
    }
}

#[async_trait]
impl CycleObserver for ReportWriter {
    async fn observe(&self, report: &CycleReport, alerts: &[Alert]) -> Result<()> {
        let dir = self.run_dir(report.run_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let json = serde_json::to_vec_pretty(&serde_json::json!({
            "report": report,
            "alerts": alerts,
        }))
        .context("serializing run report")?;
        fs::write(dir.join("run_report.json"), json)
            .await
            .context("writing run_report.json")?;
        fs::write(dir.join("summary.md"), summary_markdown(report, alerts))
            .await
            .context("writing summary.md")?;
        info!(path = %dir.display(), "run report written");
        Ok(())
    }
}

pub fn summary_markdown(report: &CycleReport, alerts: &[Alert]) -> String {
    let stats = &report.stats;
    let mut lines = vec![
        "# FounderCap Sync Summary".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Entities: {}", stats.total),
        String::new(),
        "## Status Counts".to_string(),
    ];
    for status in [
        RunStatus::Updated,
        RunStatus::Unchanged,
        RunStatus::SourceFailed,
        RunStatus::SinkFailed,
        RunStatus::Cancelled,
    ] {
        lines.push(format!("- {}: {}", status.as_str(), stats.count(status)));
    }

    let mut changed: BTreeMap<&str, usize> = BTreeMap::new();
    for result in &report.results {
        if let Some(patch) = &result.patch {
            for field in patch.fields() {
                *changed.entry(field).or_default() += 1;
            }
        }
    }
    if !changed.is_empty() {
        lines.push(String::new());
        lines.push("## Changed Fields".to_string());
        lines.extend(changed.iter().map(|(field, n)| format!("- {field}: {n}")));
    }

    let failures = report.failures();
    if !failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        lines.extend(failures.iter().map(|f| {
            format!(
                "- `{}` {} [{}]: {}",
                f.entity_id,
                f.source_id.as_deref().unwrap_or("-"),
                f.kind.as_str(),
                f.message
            )
        }));
    }

    if !alerts.is_empty() {
        lines.push(String::new());
        lines.push("## Alerts".to_string());
        lines.extend(alerts.iter().map(|a| {
            format!(
                "- {:?}: {:.2} > {:.2} ({})",
                a.kind, a.observed, a.threshold, a.message
            )
        }));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Evaluates the policy and hands the report to every observer. Observer
/// failures are logged and never fail the cycle.
pub async fn publish(
    report: &CycleReport,
    policy: &AlertPolicy,
    observers: &[Arc<dyn CycleObserver>],
) -> Vec<Alert> {
    let alerts = policy.evaluate(&report.stats);
    for observer in observers {
        if let Err(err) = observer.observe(report, &alerts).await {
            warn!(run_id = %report.run_id, error = %err, "cycle observer failed");
        }
    }
    alerts
}
