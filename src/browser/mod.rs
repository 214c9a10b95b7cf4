//! Browser driving over CDP: session bring-up, the worker page pool, the
//! inventory-grid interactions, and the serialized PDF download.

pub mod inventory_page;
pub mod pdf;
pub mod pool;
pub mod selectors;
pub mod session;

pub use pdf::PdfGate;
pub use pool::PagePool;
pub use session::BrowserSession;

use std::time::Duration;

use anyhow::{anyhow, Result};
use chromiumoxide::{Element, Page};
use tokio::time::sleep;

/// How often element polling re-queries the DOM.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Wait for `selector` to appear on `page`, polling until `timeout`.
///
/// `find_element` fails immediately when the node is absent, so waiting is
/// a poll loop rather than a single timed call.
pub async fn wait_for_element(page: &Page, selector: &str, timeout: Duration) -> Result<Element> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match page.find_element(selector).await {
            Ok(element) => return Ok(element),
            Err(_) if tokio::time::Instant::now() < deadline => sleep(POLL_INTERVAL).await,
            Err(e) => {
                return Err(anyhow!(
                    "element {selector:?} not found within {timeout:?}: {e}"
                ))
            }
        }
    }
}

/// True when `selector` is currently present on `page`.
pub async fn element_present(page: &Page, selector: &str) -> bool {
    page.find_element(selector).await.is_ok()
}

/// Current URL of `page`, empty string when unavailable.
pub async fn current_url(page: &Page) -> String {
    match page.url().await {
        Ok(Some(url)) => url.to_string(),
        _ => String::new(),
    }
}
