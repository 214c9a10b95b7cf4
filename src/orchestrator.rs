//! Run orchestration: session bring-up, work distribution, drain, teardown.
//!
//! Bring-up is strictly serialized: launch, login on the first tab, export
//! the inventory, then create the remaining worker tabs. Only after every
//! tab is on the inventory view do workers start. Setup failures here are
//! fatal and surface as errors; per-reference failures never are.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::browser::{inventory_page, pdf, BrowserSession, PagePool, PdfGate};
use crate::config::{RunDirs, Settings};
use crate::inventory;
use crate::queue::TaskQueue;
use crate::report::RunReport;
use crate::store::{CheckpointStore, RunMetrics, TrackingStore};
use crate::watchdog::Watchdog;
use crate::worker::{BookoutProcessor, Worker, WorkerContext};

/// Drive one complete run. Returns the final report on clean drain.
pub async fn run(settings: Settings) -> Result<RunReport> {
    let dirs = RunDirs::prepare(&settings.download_root)?;
    info!(run_dir = %dirs.root.display(), "run directory ready");

    let metrics = Arc::new(RunMetrics::new());
    metrics.add_metadata("worker_tabs", settings.worker_tabs).await;
    metrics.add_metadata("headless", settings.headless).await;
    metrics
        .add_metadata("max_retries", settings.max_retries)
        .await;

    // --- Session bring-up (fatal on failure) ---------------------------
    let step_started = (Utc::now(), Instant::now());
    let session = Arc::new(
        BrowserSession::launch(&settings)
            .await
            .context("browser launch failed")?,
    );
    metrics
        .record_step("launch", step_started.0, step_started.1.elapsed())
        .await;

    let result = bring_up_and_drain(&settings, &dirs, &session, &metrics).await;

    // Teardown happens whatever the outcome; the session must not outlive
    // the run.
    if let Err(e) = metrics.save(&dirs.metrics_path()).await {
        warn!(error = %e, "metrics save failed");
    }
    session.close().await;
    result
}

async fn bring_up_and_drain(
    settings: &Settings,
    dirs: &RunDirs,
    session: &Arc<BrowserSession>,
    metrics: &Arc<RunMetrics>,
) -> Result<RunReport> {
    // Login on the first tab. The site allows one active session; this is
    // the only login of the run.
    let step_started = (Utc::now(), Instant::now());
    let first_page = session.new_page().await?;
    session
        .login(&first_page)
        .await
        .context("login failed (fatal)")?;
    inventory_page::navigate_to_inventory(&first_page, &settings.inventory_url).await?;
    inventory_page::clear_filters(&first_page).await?;
    metrics
        .record_step("login", step_started.0, step_started.1.elapsed())
        .await;

    // Export the inventory and build the pending set.
    let step_started = (Utc::now(), Instant::now());
    let csv_path = inventory_page::export_inventory_csv(&first_page, &dirs.run_data)
        .await
        .context("inventory export failed (fatal)")?;
    let references = inventory::read_references(&csv_path, &settings.reference_column)?;
    metrics
        .record_step("export", step_started.0, step_started.1.elapsed())
        .await;

    let tracking = Arc::new(TrackingStore::load_or_init(
        dirs.tracking_path(),
        &references,
    )?);
    let checkpoint = Arc::new(CheckpointStore::load_or_init(dirs.checkpoint_path())?);

    let mut pending = tracking.pending_references(&references, &dirs.pdfs).await;
    if settings.max_downloads > 0 {
        pending.truncate(settings.max_downloads);
    }
    info!(
        inventory = references.len(),
        pending = pending.len(),
        "pending set built"
    );

    if pending.is_empty() {
        info!("nothing to do; all references already downloaded");
        session.logout(&first_page).await;
        metrics.finalize(references.len(), 0, 0, 0).await;
        return assemble_report(metrics, &checkpoint).await;
    }

    // Worker tabs only exist after authentication so they inherit the
    // session without logging in again.
    let step_started = (Utc::now(), Instant::now());
    let tabs = settings.worker_tabs.min(pending.len());
    let pool = PagePool::initialize(session, first_page, tabs, &settings.inventory_url).await?;
    metrics
        .record_step("page_pool", step_started.0, step_started.1.elapsed())
        .await;

    // --- Parallel section ---------------------------------------------
    let queue = Arc::new(TaskQueue::new(pending.clone()));
    let gate = Arc::new(PdfGate::new());
    let client = session.http_client().await?;

    let ctx = Arc::new(WorkerContext {
        queue: queue.clone(),
        tracking: tracking.clone(),
        checkpoint: checkpoint.clone(),
        metrics: metrics.clone(),
        task_timeout: settings.task_timeout,
        max_retries: settings.max_retries,
    });

    let mut worker_tasks = Vec::with_capacity(tabs);
    for worker_id in 0..tabs {
        let processor = Arc::new(BookoutProcessor::new(
            session.clone(),
            pool.page(worker_id).clone(),
            client.clone(),
            gate.clone(),
            dirs.clone(),
            settings.clone(),
        ));
        let worker = Worker::new(worker_id, ctx.clone(), processor);
        worker_tasks.push(tokio::spawn(worker.run()));
    }

    let watchdog = Watchdog::new(
        queue.clone(),
        checkpoint.clone(),
        settings.watchdog_interval,
        settings.stuck_threshold,
    );
    let watchdog_task = tokio::spawn(watchdog.run());

    let progress = spawn_progress_bar(queue.clone(), pending.len());

    // Wait for drain, honoring operator interrupt. On ctrl-c the workers
    // are cancelled at their next await; stores are already durable per
    // reference, so the next run resumes.
    let abort_handles: Vec<_> = worker_tasks.iter().map(|t| t.abort_handle()).collect();
    let join_workers = async move {
        for task in worker_tasks {
            let _ = task.await;
        }
    };
    let interrupted = tokio::select! {
        _ = join_workers => false,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, cancelling workers");
            for handle in &abort_handles {
                handle.abort();
            }
            true
        }
    };
    watchdog_task.abort();
    progress.finish_and_clear();

    if interrupted {
        // Popups opened by a cancelled worker would otherwise leak.
        let _ = pdf::close_stray_report_tabs(session).await;
    } else {
        session.logout(pool.page(0)).await;
    }
    pool.close_all().await;

    let stats = queue.stats().await;
    metrics
        .finalize(
            pending.len(),
            stats.completed + stats.failed,
            stats.completed,
            stats.failed,
        )
        .await;

    if interrupted {
        anyhow::bail!(
            "interrupted with {} references unprocessed; rerun to resume",
            stats.pending + stats.in_progress
        );
    }

    assemble_report(metrics, &checkpoint).await
}

async fn assemble_report(
    metrics: &Arc<RunMetrics>,
    checkpoint: &Arc<CheckpointStore>,
) -> Result<RunReport> {
    let summary = metrics
        .summary()
        .await
        .context("metrics summary missing at report time")?;
    Ok(RunReport {
        average_success_secs: metrics.average_duration_secs("success").await,
        estimated_full_inventory_secs: metrics.estimate_secs_for(2000).await,
        terminal_failures: metrics.terminal_failures().await,
        checkpoint: checkpoint.snapshot().await,
        summary,
    })
}

/// A background task keeping a progress bar in step with queue stats.
fn spawn_progress_bar(queue: Arc<TaskQueue>, total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let handle = bar.clone();
    tokio::spawn(async move {
        loop {
            let stats = queue.stats().await;
            handle.set_position((stats.completed + stats.failed) as u64);
            handle.set_message(format!(
                "{} active, {} failed",
                stats.in_progress, stats.failed
            ));
            if stats.drained() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    });
    bar
}
