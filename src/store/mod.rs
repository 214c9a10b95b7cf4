//! Durable run state: tracking, checkpoint, and metrics documents.
//!
//! Every document is a single JSON file rewritten in full on each update.
//! Writes go to a sibling temp file first and are renamed into place, so a
//! crash at any point leaves either the previous document or the new one,
//! never a truncated file.

mod checkpoint;
mod metrics;
mod tracking;

pub use checkpoint::{CheckpointRecord, CheckpointStore};
pub use metrics::{ReferenceMetric, RunMetrics, RunSummary, StepMetric};
pub use tracking::{ReferenceStatus, TrackingStore};

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing document")?;
    write_bytes_atomic(path, json.as_bytes())
}

/// Atomically replace `path` with `bytes` via a temp file in the same
/// directory (rename is atomic only within a filesystem).
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no file name", path.display()))?;
    let tmp = parent.join(format!(".{file_name}.tmp"));

    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_existing_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");

        write_bytes_atomic(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        write_bytes_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn atomic_write_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run_data").join("tracking.json");
        write_json_atomic(&path, &serde_json::json!({"165199": null})).unwrap();
        assert!(path.exists());
    }
}
