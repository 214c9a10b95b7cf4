//! Runtime metrics for throughput reporting.
//!
//! The orchestrator records each bring-up step and every per-reference
//! attempt outcome; the saved document feeds the final report and lets us
//! estimate wall-clock time for full-inventory runs.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::write_json_atomic;

/// Timing for a named orchestration step (login, export, bring-up).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetric {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// Timing and outcome for one reference attempt lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceMetric {
    pub reference: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate view of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_inventory: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub remaining: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub runtime_seconds: f64,
}

#[derive(Debug, Serialize)]
struct MetricsDocument<'a> {
    metadata: &'a HashMap<String, String>,
    steps: &'a [StepMetric],
    references: &'a [ReferenceMetric],
    summary: &'a Option<RunSummary>,
}

#[derive(Debug, Default)]
struct MetricsState {
    metadata: HashMap<String, String>,
    steps: Vec<StepMetric>,
    references: Vec<ReferenceMetric>,
    in_flight: HashMap<String, (DateTime<Utc>, Instant)>,
    summary: Option<RunSummary>,
}

/// Collects step and per-reference timings for one run.
pub struct RunMetrics {
    started_at: DateTime<Utc>,
    started_instant: Instant,
    state: Mutex<MetricsState>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started_instant: Instant::now(),
            state: Mutex::new(MetricsState::default()),
        }
    }

    /// Attach run metadata (settings worth reporting).
    pub async fn add_metadata(&self, key: &str, value: impl ToString) {
        let mut state = self.state.lock().await;
        state.metadata.insert(key.to_string(), value.to_string());
    }

    /// Record a completed orchestration step.
    pub async fn record_step(&self, name: &str, started_at: DateTime<Utc>, elapsed: Duration) {
        let mut state = self.state.lock().await;
        state.steps.push(StepMetric {
            name: name.to_string(),
            started_at,
            duration_seconds: elapsed.as_secs_f64(),
        });
    }

    /// Mark the beginning of a reference attempt lifecycle.
    pub async fn start_reference(&self, reference: &str) {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .insert(reference.to_string(), (Utc::now(), Instant::now()));
    }

    /// Mark the end of a reference lifecycle with its terminal status.
    pub async fn end_reference(&self, reference: &str, status: &str, error: Option<String>) {
        let mut state = self.state.lock().await;
        let (started_at, started_instant) = state
            .in_flight
            .remove(reference)
            .unwrap_or_else(|| (Utc::now(), Instant::now()));
        state.references.push(ReferenceMetric {
            reference: reference.to_string(),
            started_at,
            duration_seconds: started_instant.elapsed().as_secs_f64(),
            status: status.to_string(),
            error,
        });
    }

    /// Average seconds per reference with the given status.
    pub async fn average_duration_secs(&self, status: &str) -> Option<f64> {
        let state = self.state.lock().await;
        let durations: Vec<f64> = state
            .references
            .iter()
            .filter(|m| m.status == status && m.duration_seconds > 0.0)
            .map(|m| m.duration_seconds)
            .collect();
        if durations.is_empty() {
            return None;
        }
        Some(durations.iter().sum::<f64>() / durations.len() as f64)
    }

    /// Estimated wall-clock seconds to process `target` references at the
    /// observed success rate. None until at least one success is recorded.
    pub async fn estimate_secs_for(&self, target: usize) -> Option<f64> {
        let avg = self.average_duration_secs("success").await?;
        Some(avg * target as f64)
    }

    /// Record the run summary and freeze the document.
    pub async fn finalize(
        &self,
        total_inventory: usize,
        attempted: usize,
        succeeded: usize,
        failed: usize,
    ) {
        let mut state = self.state.lock().await;
        state.summary = Some(RunSummary {
            total_inventory,
            attempted,
            succeeded,
            failed,
            remaining: total_inventory.saturating_sub(succeeded + failed),
            started_at: self.started_at,
            completed_at: Utc::now(),
            runtime_seconds: self.started_instant.elapsed().as_secs_f64(),
        });
    }

    pub async fn summary(&self) -> Option<RunSummary> {
        self.state.lock().await.summary.clone()
    }

    /// Terminal failures with their recorded error, for the final report.
    pub async fn terminal_failures(&self) -> Vec<ReferenceMetric> {
        let state = self.state.lock().await;
        state
            .references
            .iter()
            .filter(|m| m.status == "failed")
            .cloned()
            .collect()
    }

    /// Persist the metrics document.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let state = self.state.lock().await;
        write_json_atomic(
            path,
            &MetricsDocument {
                metadata: &state.metadata,
                steps: &state.steps,
                references: &state.references,
                summary: &state.summary,
            },
        )
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}
