//! The PDF critical section.
//!
//! The site opens generated reports in a new tab belonging to the shared
//! context, and tab-opening cannot be attributed to the worker that clicked.
//! Two workers clicking Create PDF near-simultaneously will happily grab
//! each other's popups, saving reference A's report under reference B's
//! name. The whole popup-opening sequence therefore runs under one
//! process-wide gate: snapshot tabs, click, adopt the one new report tab,
//! download its bytes, close it, wait for the context to quiesce, and sweep
//! any stray report tabs before letting the next worker click.
//!
//! Navigation and grid filtering stay outside the gate; only popup handling
//! is inherently shared.

use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::Page;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::browser::{current_url, selectors, wait_for_element, BrowserSession};
use crate::error::StepError;

/// How long the clicked report has to open its tab.
const POPUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll cadence while waiting for the popup tab.
const POPUP_POLL: Duration = Duration::from_millis(250);

/// Extra load time for the report viewer once its tab exists.
const POPUP_LOAD_SETTLE: Duration = Duration::from_secs(2);

/// Wait between closing the popup and releasing the gate. The context can
/// still deliver the new-page event for the just-closed tab; releasing
/// earlier lets the next worker adopt a ghost.
const QUIESCENCE_DELAY: Duration = Duration::from_secs(1);

/// Process-wide mutual exclusion over the popup-opening sequence.
///
/// Also serializes mid-run re-authentication, which mutates the same shared
/// session state.
pub struct PdfGate {
    lock: Mutex<()>,
}

impl PdfGate {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    /// Acquire the gate. Held for the whole popup-through-quiescence block;
    /// dropping the guard (including on cancellation) releases it.
    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Default for PdfGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Download the bookout report for the vehicle open on `page`.
///
/// Preconditions: the worker's page is on the vehicle detail view. The
/// returned bytes are the PDF body; the caller owns writing them to disk.
pub async fn download_report_pdf(
    session: &BrowserSession,
    page: &Page,
    client: &reqwest::Client,
    gate: &PdfGate,
    reference: &str,
) -> Result<Vec<u8>> {
    // The report modal is outside the critical section: it only touches
    // this worker's own page.
    let print_button =
        wait_for_element(page, selectors::PRINT_REPORTS_BUTTON, Duration::from_secs(20))
            .await
            .map_err(|e| StepError::OpenBookView(format!("print control: {e}")))?;
    print_button.click().await?;
    sleep(Duration::from_secs(1)).await;

    let create_pdf =
        wait_for_element(page, selectors::CREATE_PDF_BUTTON, Duration::from_secs(10))
            .await
            .map_err(|e| StepError::OpenBookView(format!("create-PDF control: {e}")))?;

    let guard = gate.acquire().await;
    debug!(reference, "pdf gate acquired");

    let result = locked_popup_download(session, client, &create_pdf, reference).await;

    // Quiescence before release, success or not: the context may still be
    // processing the tab closure, and stray report tabs must not leak into
    // the next worker's critical section.
    sleep(QUIESCENCE_DELAY).await;
    if let Err(e) = close_stray_report_tabs(session).await {
        warn!(reference, error = %e, "stray-tab sweep failed");
    }
    drop(guard);
    debug!(reference, "pdf gate released");

    result
}

/// The gate-protected body: click, adopt the popup, pull the bytes, close.
async fn locked_popup_download(
    session: &BrowserSession,
    client: &reqwest::Client,
    create_pdf: &chromiumoxide::Element,
    reference: &str,
) -> Result<Vec<u8>> {
    let before: Vec<_> = session
        .pages()
        .await?
        .iter()
        .map(|p| p.target_id().clone())
        .collect();

    create_pdf.click().await?;

    let popup = wait_for_report_popup(session, &before).await?;
    let popup_url = current_url(&popup).await;
    info!(reference, url = %popup_url, "report tab opened");
    sleep(POPUP_LOAD_SETTLE).await;

    let download = download_bytes(client, &popup_url, reference).await;

    // Always close the popup, even when the download failed; a lingering
    // report tab poisons the next critical section.
    if let Err(e) = popup.close().await {
        warn!(reference, error = %e, "report tab close failed");
    }

    download
}

/// Wait for exactly one new report tab to appear in the context.
async fn wait_for_report_popup(
    session: &BrowserSession,
    before: &[chromiumoxide::cdp::browser_protocol::target::TargetId],
) -> Result<Page> {
    let deadline = tokio::time::Instant::now() + POPUP_TIMEOUT;
    loop {
        for candidate in session.pages().await? {
            if before.contains(candidate.target_id()) {
                continue;
            }
            let url = current_url(&candidate).await;
            // New tabs start at about:blank; only adopt once the report URL
            // is in place.
            if url.contains(selectors::REPORT_PATH_MARKER) {
                return Ok(candidate);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(StepError::PopupTimeout(POPUP_TIMEOUT).into());
        }
        sleep(POPUP_POLL).await;
    }
}

/// Pull the PDF bytes over HTTP with the context's session cookies.
async fn download_bytes(
    client: &reqwest::Client,
    url: &str,
    reference: &str,
) -> Result<Vec<u8>> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| StepError::Download(e.to_string()))?;
    if !response.status().is_success() {
        return Err(StepError::Download(format!("HTTP {}", response.status())).into());
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| StepError::Download(e.to_string()))?;
    if !bytes.starts_with(b"%PDF") {
        return Err(StepError::Download(format!(
            "response for {reference} is not a PDF ({} bytes)",
            bytes.len()
        ))
        .into());
    }
    debug!(reference, size = bytes.len(), "report bytes downloaded");
    Ok(bytes.to_vec())
}

/// Close every open tab whose URL is on the report path. Used inside the
/// gate before release and by worker recovery after cancellation.
pub async fn close_stray_report_tabs(session: &BrowserSession) -> Result<usize> {
    let mut closed = 0;
    for page in session.pages().await.context("listing context tabs")? {
        let url = current_url(&page).await;
        if url.contains(selectors::REPORT_PATH_MARKER) {
            warn!(url = %url, "closing stray report tab");
            if page.close().await.is_ok() {
                closed += 1;
            }
        }
    }
    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// The gate must never admit two holders at once, whatever the
    /// interleaving. Each task records the number of concurrent holders it
    /// observed while inside.
    #[tokio::test]
    async fn gate_admits_one_holder_at_a_time() {
        let gate = Arc::new(PdfGate::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let _guard = gate.acquire().await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    /// Cancelling a holder mid-section must release the gate for the next
    /// worker (guards drop on abort).
    #[tokio::test]
    async fn cancelled_holder_releases_gate() {
        let gate = Arc::new(PdfGate::new());

        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _guard = gate.acquire().await;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
        };
        tokio::task::yield_now().await;
        holder.abort();
        let _ = holder.await;

        let acquired =
            tokio::time::timeout(Duration::from_secs(1), gate.acquire()).await;
        assert!(acquired.is_ok(), "gate still held after holder cancellation");
    }
}
