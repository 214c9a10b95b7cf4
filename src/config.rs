//! Runtime settings and run-directory resolution.
//!
//! Settings come from environment variables (loaded via `.env` at startup)
//! and can be overridden by CLI flags. Each run writes into a dated folder
//! under the download root; if the day's folder already holds run artifacts
//! a numeric discriminator is appended so reruns never clobber each other.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use tracing::warn;

use crate::browser::selectors;

/// Worker-tab counts above this are accepted but rarely help throughput.
const RECOMMENDED_MAX_TABS: usize = 7;

/// Engine configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub username: String,
    pub password: String,
    /// Run the browser without a visible window.
    pub headless: bool,
    /// Abort image/stylesheet/font/media requests for throughput.
    pub block_resources: bool,
    /// Cap on references processed this run. 0 means all.
    pub max_downloads: usize,
    /// Number of worker tabs sharing the authenticated context. The
    /// environment variable keeps the historical CONCURRENT_CONTEXTS name
    /// even though these are tabs, not contexts.
    pub worker_tabs: usize,
    pub task_timeout: Duration,
    pub stuck_threshold: Duration,
    pub watchdog_interval: Duration,
    pub max_retries: u32,
    pub download_root: PathBuf,
    pub login_url: String,
    pub inventory_url: String,
    /// Header name of the reference column in the exported CSV.
    pub reference_column: String,
}

impl Settings {
    /// Read settings from the environment. Credentials are required; every
    /// other option has a default.
    pub fn from_env() -> Result<Self> {
        let username = std::env::var("BOOKFETCH_USERNAME")
            .context("BOOKFETCH_USERNAME is not set (put it in .env or the environment)")?;
        let password = std::env::var("BOOKFETCH_PASSWORD")
            .context("BOOKFETCH_PASSWORD is not set (put it in .env or the environment)")?;

        let settings = Self {
            username,
            password,
            headless: env_bool("BOOKFETCH_HEADLESS", true),
            block_resources: env_bool("BOOKFETCH_BLOCK_RESOURCES", true),
            max_downloads: env_parse("BOOKFETCH_MAX_DOWNLOADS", 0)?,
            worker_tabs: env_parse("BOOKFETCH_CONCURRENT_CONTEXTS", 5)?,
            task_timeout: Duration::from_secs(env_parse("BOOKFETCH_TASK_TIMEOUT_SECS", 180)?),
            stuck_threshold: Duration::from_secs(env_parse(
                "BOOKFETCH_STUCK_THRESHOLD_SECS",
                300,
            )?),
            watchdog_interval: Duration::from_secs(env_parse(
                "BOOKFETCH_WATCHDOG_INTERVAL_SECS",
                60,
            )?),
            max_retries: env_parse("BOOKFETCH_MAX_RETRIES", 2)?,
            download_root: std::env::var("BOOKFETCH_DOWNLOAD_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("downloads")),
            login_url: std::env::var("BOOKFETCH_LOGIN_URL")
                .unwrap_or_else(|_| selectors::DEFAULT_LOGIN_URL.to_string()),
            inventory_url: std::env::var("BOOKFETCH_INVENTORY_URL")
                .unwrap_or_else(|_| selectors::DEFAULT_INVENTORY_URL.to_string()),
            reference_column: std::env::var("BOOKFETCH_REFERENCE_COLUMN")
                .unwrap_or_else(|_| "Reference Number".to_string()),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Sanity-check the resolved settings.
    pub fn validate(&self) -> Result<()> {
        if self.worker_tabs == 0 {
            bail!("worker tab count must be at least 1");
        }
        if self.worker_tabs > RECOMMENDED_MAX_TABS {
            warn!(
                tabs = self.worker_tabs,
                "more than {} worker tabs rarely improves throughput", RECOMMENDED_MAX_TABS
            );
        }
        if self.task_timeout.is_zero() {
            bail!("task timeout must be positive");
        }
        Ok(())
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {v:?}")),
        Err(_) => Ok(default),
    }
}

/// Resolved output locations for one run.
#[derive(Debug, Clone)]
pub struct RunDirs {
    /// Dated run folder, possibly with a numeric discriminator.
    pub root: PathBuf,
    /// PDF outputs, one `<reference>.pdf` per item.
    pub pdfs: PathBuf,
    /// Tracking, checkpoint, metrics and the exported inventory CSV.
    pub run_data: PathBuf,
}

impl RunDirs {
    /// Resolve and create the run directory for today under `download_root`.
    ///
    /// The base name is `MM-DD-YYYY`; if that folder already contains run
    /// artifacts, ` (2)`, ` (3)`, ... are tried. A folder that exists but
    /// holds no artifacts is reused.
    pub fn prepare(download_root: &Path) -> Result<Self> {
        let stamp = Local::now().format("%m-%d-%Y").to_string();
        Self::prepare_for_stamp(download_root, &stamp)
    }

    fn prepare_for_stamp(download_root: &Path, stamp: &str) -> Result<Self> {
        let mut candidate = download_root.join(stamp);
        let mut counter = 1usize;
        while has_run_artifacts(&candidate) {
            counter += 1;
            if counter > 100 {
                bail!(
                    "more than 100 runs for {stamp}; clean up {}",
                    download_root.display()
                );
            }
            candidate = download_root.join(format!("{stamp} ({counter})"));
        }
        Self::at(candidate)
    }

    /// Use an explicit run folder (resume, validate, status).
    pub fn at(root: PathBuf) -> Result<Self> {
        let dirs = Self {
            pdfs: root.join("pdfs"),
            run_data: root.join("run_data"),
            root,
        };
        std::fs::create_dir_all(&dirs.pdfs)
            .with_context(|| format!("creating {}", dirs.pdfs.display()))?;
        std::fs::create_dir_all(&dirs.run_data)
            .with_context(|| format!("creating {}", dirs.run_data.display()))?;
        Ok(dirs)
    }

    pub fn tracking_path(&self) -> PathBuf {
        self.run_data.join("tracking.json")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.run_data.join("checkpoint.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.run_data.join("metrics.json")
    }

    pub fn pdf_path(&self, reference: &str) -> PathBuf {
        self.pdfs.join(format!("{reference}.pdf"))
    }
}

/// A folder counts as used when a previous run left PDFs or tracking state.
fn has_run_artifacts(dir: &Path) -> bool {
    if !dir.exists() {
        return false;
    }
    if dir.join("run_data").join("tracking.json").exists() {
        return true;
    }
    match std::fs::read_dir(dir.join("pdfs")) {
        Ok(mut entries) => entries.any(|e| {
            e.map(|e| e.path().extension().is_some_and(|ext| ext == "pdf"))
                .unwrap_or(false)
        }),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_day_uses_base_name() {
        let root = tempdir().unwrap();
        let dirs = RunDirs::prepare_for_stamp(root.path(), "10-05-2025").unwrap();
        assert_eq!(dirs.root, root.path().join("10-05-2025"));
        assert!(dirs.pdfs.is_dir());
        assert!(dirs.run_data.is_dir());
    }

    #[test]
    fn empty_existing_folder_is_reused() {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("10-05-2025")).unwrap();
        let dirs = RunDirs::prepare_for_stamp(root.path(), "10-05-2025").unwrap();
        assert_eq!(dirs.root, root.path().join("10-05-2025"));
    }

    #[test]
    fn used_folder_gets_discriminator() {
        let root = tempdir().unwrap();
        let first = RunDirs::prepare_for_stamp(root.path(), "10-05-2025").unwrap();
        std::fs::write(first.tracking_path(), "{}").unwrap();

        let second = RunDirs::prepare_for_stamp(root.path(), "10-05-2025").unwrap();
        assert_eq!(second.root, root.path().join("10-05-2025 (2)"));

        std::fs::write(second.pdfs.join("165199.pdf"), b"%PDF-1.4").unwrap();
        let third = RunDirs::prepare_for_stamp(root.path(), "10-05-2025").unwrap();
        assert_eq!(third.root, root.path().join("10-05-2025 (3)"));
    }

    #[test]
    fn pdf_path_is_reference_stem() {
        let root = tempdir().unwrap();
        let dirs = RunDirs::at(root.path().join("run")).unwrap();
        assert!(dirs.pdf_path("165199").ends_with("pdfs/165199.pdf"));
    }
}
