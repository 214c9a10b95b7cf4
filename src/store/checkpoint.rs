//! Run-level progress checkpoint.
//!
//! Counters are monotonic except the consecutive-failure streak, which
//! resets on every success. The document is rewritten after each terminal
//! per-reference outcome so a killed process can report accurate totals on
//! resume.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use super::write_json_atomic;

/// Consecutive failures at which the run is considered stalled.
const STALL_THRESHOLD: u64 = 5;

/// The persisted checkpoint document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointRecord {
    pub run_started_at: DateTime<Utc>,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub consecutive_failures: u64,
    pub last_reference: Option<String>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl CheckpointRecord {
    fn new() -> Self {
        Self {
            run_started_at: Utc::now(),
            attempted: 0,
            succeeded: 0,
            failed: 0,
            consecutive_failures: 0,
            last_reference: None,
            last_updated_at: None,
        }
    }

    /// Too many failures in a row without a success.
    pub fn is_stalled(&self) -> bool {
        self.consecutive_failures >= STALL_THRESHOLD
    }
}

/// Durable checkpoint with single-writer persistence.
pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<CheckpointRecord>,
}

impl CheckpointStore {
    pub fn load_or_init(path: PathBuf) -> Result<Self> {
        let record = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let record: CheckpointRecord = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            info!(
                succeeded = record.succeeded,
                failed = record.failed,
                "loaded existing checkpoint"
            );
            record
        } else {
            CheckpointRecord::new()
        };
        Ok(Self {
            path,
            state: Mutex::new(record),
        })
    }

    /// Record a terminal success for `reference`.
    pub async fn record_success(&self, reference: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.attempted += 1;
        state.succeeded += 1;
        state.consecutive_failures = 0;
        state.last_reference = Some(reference.to_string());
        state.last_updated_at = Some(Utc::now());
        write_json_atomic(&self.path, &*state)
    }

    /// Record a terminal failure for `reference`.
    pub async fn record_failure(&self, reference: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.attempted += 1;
        state.failed += 1;
        state.consecutive_failures += 1;
        state.last_reference = Some(reference.to_string());
        state.last_updated_at = Some(Utc::now());
        write_json_atomic(&self.path, &*state)
    }

    pub async fn snapshot(&self) -> CheckpointRecord {
        self.state.lock().await.clone()
    }
}
