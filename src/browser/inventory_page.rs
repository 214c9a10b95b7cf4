//! Inventory-grid interactions on a single worker tab.
//!
//! The grid is a DevExpress server-rendered table: filter changes go through
//! the site's own JS hook, and the per-row book action only reacts to a real
//! DOM click on the icon's parent anchor.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::Page;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::browser::{element_present, selectors, wait_for_element};
use crate::error::StepError;

/// Grid-refresh settle time after filter changes.
const GRID_SETTLE: Duration = Duration::from_secs(2);

/// How long to wait for the exported CSV to land on disk.
const EXPORT_TIMEOUT: Duration = Duration::from_secs(60);

/// Navigate `page` to the inventory view and let the grid settle.
pub async fn navigate_to_inventory(page: &Page, inventory_url: &str) -> Result<()> {
    page.goto(inventory_url).await?;
    page.wait_for_navigation().await?;
    sleep(GRID_SETTLE).await;
    Ok(())
}

/// Clear any persisted grid filters. Best-effort: a grid with no active
/// filter shows no clear control, which is fine.
pub async fn clear_filters(page: &Page) -> Result<()> {
    if element_present(page, selectors::CLEAR_FILTERS_BUTTON).await {
        debug!("clearing persisted grid filters");
        page.find_element(selectors::CLEAR_FILTERS_BUTTON)
            .await?
            .click()
            .await?;
        sleep(GRID_SETTLE).await;
    } else if element_present(page, selectors::CREATE_FILTER_BUTTON).await {
        debug!("no active filters");
    } else {
        warn!("filter controls not found; grid may still be loading");
    }
    Ok(())
}

/// Filter the grid down to `reference` and verify the input took the value.
pub async fn filter_by_reference(page: &Page, reference: &str) -> Result<()> {
    let input = wait_for_element(page, selectors::STOCK_NUMBER_INPUT, Duration::from_secs(10))
        .await
        .map_err(|e| StepError::Filter(e.to_string()))?;

    // Clear the previous value through the DOM; type_str appends otherwise.
    page.evaluate(format!(
        "document.querySelector('{}').value = ''",
        selectors::STOCK_NUMBER_INPUT
    ))
    .await
    .map_err(|e| StepError::Filter(format!("clearing filter input: {e}")))?;

    input
        .click()
        .await
        .map_err(|e| StepError::Filter(format!("focusing filter input: {e}")))?;
    input
        .type_str(reference)
        .await
        .map_err(|e| StepError::Filter(format!("typing reference: {e}")))?;

    // The grid applies column filters through its own change hook.
    page.evaluate(selectors::FILTER_CHANGED_HOOK)
        .await
        .map_err(|e| StepError::Filter(format!("filter hook: {e}")))?;
    sleep(GRID_SETTLE).await;

    let value: String = page
        .evaluate(format!(
            "document.querySelector('{}').value",
            selectors::STOCK_NUMBER_INPUT
        ))
        .await
        .map_err(|e| StepError::Filter(format!("reading back filter input: {e}")))?
        .into_value()
        .unwrap_or_default();

    if value != reference {
        return Err(StepError::Filter(format!(
            "filter input holds {value:?}, expected {reference:?}"
        ))
        .into());
    }
    debug!(reference, "grid filtered");
    Ok(())
}

/// Open the book view for the single filtered row.
pub async fn open_book_view(page: &Page, reference: &str) -> Result<()> {
    wait_for_element(page, selectors::BOOK_ICON, Duration::from_secs(10))
        .await
        .map_err(|_| {
            StepError::OpenBookView(format!("no book action for {reference} in filtered grid"))
        })?;

    page.evaluate(selectors::BOOK_ICON_JS_CLICK)
        .await
        .map_err(|e| StepError::OpenBookView(format!("book click: {e}")))?;
    page.wait_for_navigation()
        .await
        .map_err(|e| StepError::OpenBookView(format!("navigation after book click: {e}")))?;
    sleep(GRID_SETTLE).await;
    info!(reference, "book view open");
    Ok(())
}

/// Export the inventory grid to CSV, waiting for the file to land in
/// `dest_dir`, and normalize its name to `inventory.csv`.
pub async fn export_inventory_csv(page: &Page, dest_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("creating {}", dest_dir.display()))?;

    // Route browser downloads into the run directory.
    let behavior = SetDownloadBehaviorParams::builder()
        .behavior(SetDownloadBehaviorBehavior::Allow)
        .download_path(dest_dir.to_string_lossy().to_string())
        .build()
        .map_err(|e| anyhow!("building download behavior: {e}"))?;
    page.execute(behavior).await?;

    let existing = csv_files_in(dest_dir)?;

    info!("exporting inventory CSV");
    wait_for_element(page, selectors::EXPORT_MENU_BUTTON, Duration::from_secs(10))
        .await?
        .click()
        .await?;
    sleep(Duration::from_millis(500)).await;
    wait_for_element(page, selectors::EXPORT_ALL_COLUMNS, Duration::from_secs(10))
        .await?
        .click()
        .await?;
    sleep(Duration::from_millis(500)).await;
    wait_for_element(page, selectors::EXPORT_TO_CSV, Duration::from_secs(10))
        .await?
        .click()
        .await?;

    // CDP reports download progress per target; polling the directory is
    // simpler and also covers renames done by the browser.
    let deadline = tokio::time::Instant::now() + EXPORT_TIMEOUT;
    let downloaded = loop {
        let now_files = csv_files_in(dest_dir)?;
        if let Some(new_file) = now_files.iter().find(|f| !existing.contains(*f)) {
            // Chrome writes to a .crdownload first; wait until it is gone.
            if !new_file.to_string_lossy().ends_with(".crdownload") {
                break new_file.clone();
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("inventory CSV export timed out"));
        }
        sleep(Duration::from_millis(500)).await;
    };

    let csv_path = dest_dir.join("inventory.csv");
    if downloaded != csv_path {
        std::fs::rename(&downloaded, &csv_path)
            .with_context(|| format!("renaming {} to inventory.csv", downloaded.display()))?;
    }
    info!(path = %csv_path.display(), "inventory CSV exported");
    Ok(csv_path)
}

fn csv_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.ends_with(".csv") || name.ends_with(".crdownload") {
            files.push(path);
        }
    }
    Ok(files)
}
