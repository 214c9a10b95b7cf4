//! Worker loop: pull references from the queue, run the processing
//! procedure under a deadline, and record terminal outcomes.
//!
//! The `ReferenceProcessor` trait is the seam between the engine and the
//! browser: the production implementation drives a worker tab; tests plug
//! in a scripted processor and exercise the same loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::browser::{inventory_page, pdf, BrowserSession, PdfGate};
use crate::config::{RunDirs, Settings};
use crate::error::FailureKind;
use crate::queue::{FailOutcome, TaskQueue};
use crate::store::{write_bytes_atomic, CheckpointStore, RunMetrics, TrackingStore};

/// Idle backoff when the queue is empty but siblings still hold work.
const IDLE_POLL: Duration = Duration::from_secs(2);

/// Post-success pacing so a fast worker does not hammer the grid.
const SUCCESS_PACING: Duration = Duration::from_secs(1);

/// One unit of per-reference work.
#[async_trait]
pub trait ReferenceProcessor: Send + Sync {
    /// Produce `pdfs/<reference>.pdf`. An error is one failed attempt; the
    /// queue decides whether it retries.
    async fn process(&self, worker_id: usize, reference: &str) -> Result<()>;

    /// Return the worker's resources to a known-good state after a failure
    /// or cancellation.
    async fn recover(&self, worker_id: usize) {
        let _ = worker_id;
    }
}

/// Shared engine state handed to every worker.
pub struct WorkerContext {
    pub queue: Arc<TaskQueue>,
    pub tracking: Arc<TrackingStore>,
    pub checkpoint: Arc<CheckpointStore>,
    pub metrics: Arc<RunMetrics>,
    pub task_timeout: Duration,
    pub max_retries: u32,
}

/// One logical worker.
pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
    processor: Arc<dyn ReferenceProcessor>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>, processor: Arc<dyn ReferenceProcessor>) -> Self {
        Self { id, ctx, processor }
    }

    /// Run until the queue drains.
    pub async fn run(self) {
        info!(worker = self.id, "worker started");
        loop {
            match self.ctx.queue.get(self.id).await {
                Some(reference) => self.handle(&reference).await,
                None => {
                    if self.ctx.queue.is_drained().await {
                        break;
                    }
                    debug!(worker = self.id, "queue empty, work outstanding; waiting");
                    sleep(IDLE_POLL).await;
                }
            }
        }
        info!(worker = self.id, "worker drained, exiting");
    }

    async fn handle(&self, reference: &str) {
        self.ctx.metrics.start_reference(reference).await;

        let outcome = timeout(
            self.ctx.task_timeout,
            self.processor.process(self.id, reference),
        )
        .await;

        match outcome {
            Ok(Ok(())) => self.record_success(reference).await,
            Ok(Err(error)) => {
                warn!(worker = self.id, reference, error = %error, "attempt failed");
                let kind = FailureKind::classify(&error);
                self.record_failure(reference, kind, error.to_string()).await;
            }
            Err(_elapsed) => {
                warn!(
                    worker = self.id,
                    reference,
                    timeout = ?self.ctx.task_timeout,
                    "attempt timed out, cancelling"
                );
                // The in-flight procedure was dropped at its last await;
                // clean up anything it may have left open.
                self.processor.recover(self.id).await;
                self.record_failure(
                    reference,
                    FailureKind::TaskTimeout,
                    format!("exceeded task deadline of {:?}", self.ctx.task_timeout),
                )
                .await;
            }
        }
    }

    async fn record_success(&self, reference: &str) {
        if !self.ctx.queue.complete(reference).await {
            // A sibling finished this reference while we were stuck on it.
            debug!(worker = self.id, reference, "duplicate completion ignored");
            self.ctx
                .metrics
                .end_reference(reference, "superseded", None)
                .await;
            return;
        }
        if let Err(e) = self.ctx.tracking.mark_downloaded(reference).await {
            warn!(reference, error = %e, "tracking update failed");
        }
        if let Err(e) = self.ctx.checkpoint.record_success(reference).await {
            warn!(reference, error = %e, "checkpoint update failed");
        }
        self.ctx.metrics.end_reference(reference, "success", None).await;
        info!(worker = self.id, reference, "downloaded");
        sleep(SUCCESS_PACING).await;
    }

    async fn record_failure(&self, reference: &str, kind: FailureKind, error: String) {
        let outcome = self
            .ctx
            .queue
            .fail(reference, self.id, self.ctx.max_retries)
            .await;
        match outcome {
            FailOutcome::Superseded => {
                debug!(worker = self.id, reference, "stale failure ignored");
                self.ctx
                    .metrics
                    .end_reference(reference, "superseded", None)
                    .await;
            }
            FailOutcome::Requeued { next_attempt } => {
                debug!(worker = self.id, reference, next_attempt, "will retry");
                self.ctx
                    .metrics
                    .end_reference(reference, "retried", Some(error))
                    .await;
            }
            FailOutcome::Terminal { attempts } => {
                warn!(
                    worker = self.id,
                    reference,
                    attempts,
                    kind = kind.as_str(),
                    "terminal failure"
                );
                if let Err(e) = self.ctx.tracking.mark_failed(reference).await {
                    warn!(reference, error = %e, "tracking update failed");
                }
                if let Err(e) = self.ctx.checkpoint.record_failure(reference).await {
                    warn!(reference, error = %e, "checkpoint update failed");
                }
                self.ctx
                    .metrics
                    .end_reference(
                        reference,
                        "failed",
                        Some(format!("{}: {error}", kind.as_str())),
                    )
                    .await;
            }
        }
    }
}

/// Production processor: drives one worker tab through filter → book view →
/// gated PDF download → atomic write → back to inventory.
pub struct BookoutProcessor {
    session: Arc<BrowserSession>,
    page: chromiumoxide::Page,
    client: reqwest::Client,
    gate: Arc<PdfGate>,
    dirs: RunDirs,
    settings: Settings,
}

impl BookoutProcessor {
    pub fn new(
        session: Arc<BrowserSession>,
        page: chromiumoxide::Page,
        client: reqwest::Client,
        gate: Arc<PdfGate>,
        dirs: RunDirs,
        settings: Settings,
    ) -> Self {
        Self {
            session,
            page,
            client,
            gate,
            dirs,
            settings,
        }
    }

    async fn process_once(&self, reference: &str) -> Result<()> {
        // A sibling's failed login or an idle timeout can bounce this tab
        // back to the login surface; re-authenticate under the gate so only
        // one worker refreshes the shared session.
        if self.session.is_logged_out(&self.page).await {
            let _guard = self.gate.acquire().await;
            if self.session.is_logged_out(&self.page).await {
                self.session.refresh_session(&self.page).await?;
            }
            inventory_page::navigate_to_inventory(&self.page, &self.settings.inventory_url)
                .await?;
        }

        inventory_page::filter_by_reference(&self.page, reference).await?;
        inventory_page::open_book_view(&self.page, reference).await?;

        let bytes = pdf::download_report_pdf(
            &self.session,
            &self.page,
            &self.client,
            &self.gate,
            reference,
        )
        .await?;

        write_bytes_atomic(&self.dirs.pdf_path(reference), &bytes)?;

        inventory_page::navigate_to_inventory(&self.page, &self.settings.inventory_url).await?;
        Ok(())
    }

    /// Close stray report tabs and put the tab back on the inventory view.
    async fn recover_to_inventory(&self) {
        {
            // Sweep under the gate: with it held no sibling is mid-popup,
            // so any report tab in the context is an orphan of ours.
            let _guard = self.gate.acquire().await;
            if let Err(e) = pdf::close_stray_report_tabs(&self.session).await {
                warn!(error = %e, "stray-tab sweep failed during recovery");
            }
        }
        if let Err(e) =
            inventory_page::navigate_to_inventory(&self.page, &self.settings.inventory_url).await
        {
            warn!(error = %e, "could not return tab to inventory");
            return;
        }
        let _ = inventory_page::clear_filters(&self.page).await;
    }
}

#[async_trait]
impl ReferenceProcessor for BookoutProcessor {
    async fn process(&self, worker_id: usize, reference: &str) -> Result<()> {
        match self.process_once(reference).await {
            Ok(()) => Ok(()),
            Err(first) => {
                // One in-procedure recovery before the attempt counts as
                // failed: transient grid hiccups usually clear after a
                // return to the inventory view.
                warn!(
                    worker = worker_id,
                    reference,
                    error = %first,
                    "procedure failed, recovering and retrying in-place"
                );
                self.recover_to_inventory().await;
                sleep(Duration::from_secs(3)).await;
                self.process_once(reference).await
            }
        }
    }

    async fn recover(&self, _worker_id: usize) {
        self.recover_to_inventory().await;
    }
}
