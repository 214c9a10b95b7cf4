//! Per-reference download tracking.
//!
//! The tracking document maps every reference in the current inventory to
//! `"downloaded"`, `"failed"`, or `null` (pending). A reference that reaches
//! `downloaded` is never demoted; `failed` references become pending again on
//! a later run when their PDF is missing from disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::write_json_atomic;

/// Terminal per-reference outcome. Pending is modeled as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceStatus {
    Downloaded,
    Failed,
}

/// Durable `reference -> status` map with single-writer persistence.
pub struct TrackingStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, Option<ReferenceStatus>>>,
}

impl TrackingStore {
    /// Load the tracking document if it exists, then fold in the current
    /// inventory: new references start pending, existing entries keep their
    /// recorded status.
    pub fn load_or_init(path: PathBuf, references: &[String]) -> Result<Self> {
        let mut state: BTreeMap<String, Option<ReferenceStatus>> = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let loaded = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            info!(path = %path.display(), "loaded existing tracking document");
            loaded
        } else {
            BTreeMap::new()
        };

        for reference in references {
            state.entry(reference.clone()).or_insert(None);
        }

        write_json_atomic(&path, &state)?;
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn persist(state: &BTreeMap<String, Option<ReferenceStatus>>, path: &Path) -> Result<()> {
        write_json_atomic(path, state)
    }

    /// Mark `reference` downloaded. Success is terminal; this never
    /// overwrites an earlier `downloaded` with anything else.
    pub async fn mark_downloaded(&self, reference: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.insert(reference.to_string(), Some(ReferenceStatus::Downloaded));
        Self::persist(&state, &self.path).await
    }

    /// Mark `reference` failed unless it already succeeded.
    pub async fn mark_failed(&self, reference: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.get(reference) {
            Some(Some(ReferenceStatus::Downloaded)) => {
                debug!(reference, "ignoring failure for already-downloaded reference");
                return Ok(());
            }
            _ => {
                state.insert(reference.to_string(), Some(ReferenceStatus::Failed));
            }
        }
        Self::persist(&state, &self.path).await
    }

    /// References still needing work, in inventory order: pending entries
    /// always; failed entries only when `pdfs/<ref>.pdf` is absent.
    pub async fn pending_references(&self, ordered: &[String], pdf_dir: &Path) -> Vec<String> {
        let state = self.state.lock().await;
        ordered
            .iter()
            .filter(|reference| match state.get(*reference) {
                None | Some(None) => true,
                Some(Some(ReferenceStatus::Failed)) => {
                    !pdf_dir.join(format!("{reference}.pdf")).exists()
                }
                Some(Some(ReferenceStatus::Downloaded)) => false,
            })
            .cloned()
            .collect()
    }

    pub async fn status_of(&self, reference: &str) -> Option<ReferenceStatus> {
        self.state.lock().await.get(reference).copied().flatten()
    }

    /// Count of (downloaded, failed, pending) entries.
    pub async fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock().await;
        let mut downloaded = 0;
        let mut failed = 0;
        let mut pending = 0;
        for status in state.values() {
            match status {
                Some(ReferenceStatus::Downloaded) => downloaded += 1,
                Some(ReferenceStatus::Failed) => failed += 1,
                None => pending += 1,
            }
        }
        (downloaded, failed, pending)
    }

    /// Load a tracking document read-only (status/validate subcommands).
    pub fn read_document(path: &Path) -> Result<BTreeMap<String, Option<ReferenceStatus>>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn refs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn init_seeds_pending_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracking.json");
        let store = TrackingStore::load_or_init(path.clone(), &refs(&["165199", "165200"])).unwrap();

        assert_eq!(store.counts().await, (0, 0, 2));

        let raw = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["165199"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn downloaded_is_never_demoted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracking.json");
        let store = TrackingStore::load_or_init(path.clone(), &refs(&["165199"])).unwrap();

        store.mark_downloaded("165199").await.unwrap();
        store.mark_failed("165199").await.unwrap();
        assert_eq!(
            store.status_of("165199").await,
            Some(ReferenceStatus::Downloaded)
        );

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"downloaded\""));
    }

    #[tokio::test]
    async fn reload_skips_downloaded_and_retries_failed_without_pdf() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracking.json");
        let pdf_dir = dir.path().join("pdfs");
        std::fs::create_dir_all(&pdf_dir).unwrap();

        {
            let store =
                TrackingStore::load_or_init(path.clone(), &refs(&["A", "B", "C"])).unwrap();
            store.mark_downloaded("A").await.unwrap();
            store.mark_failed("B").await.unwrap();
            store.mark_failed("C").await.unwrap();
        }

        // C's PDF exists on disk, so only B is retried alongside nothing pending.
        std::fs::write(pdf_dir.join("C.pdf"), b"%PDF-1.4").unwrap();

        let store = TrackingStore::load_or_init(path.clone(), &refs(&["A", "B", "C"])).unwrap();

        let pending = store
            .pending_references(&refs(&["A", "B", "C"]), &pdf_dir)
            .await;
        assert_eq!(pending, vec!["B"]);
    }
}
