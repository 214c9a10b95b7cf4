//! Worker page pool.
//!
//! N tabs inside the single authenticated context. P0 is the tab that
//! performed login; the rest are created only after authentication so they
//! inherit the session, and each worker owns exactly one tab for its whole
//! lifetime.

use anyhow::{Context, Result};
use chromiumoxide::Page;
use tracing::{info, warn};

use crate::browser::{inventory_page, BrowserSession};

/// Fixed set of worker tabs sharing one session.
pub struct PagePool {
    pages: Vec<Page>,
}

impl PagePool {
    /// Build the pool: `first_page` (already authenticated and on the
    /// inventory view) plus `total - 1` fresh tabs, each navigated to the
    /// inventory view.
    pub async fn initialize(
        session: &BrowserSession,
        first_page: Page,
        total: usize,
        inventory_url: &str,
    ) -> Result<Self> {
        let mut pages = Vec::with_capacity(total);
        pages.push(first_page);

        for index in 1..total {
            let page = session
                .new_page()
                .await
                .with_context(|| format!("creating worker tab {index}"))?;
            inventory_page::navigate_to_inventory(&page, inventory_url)
                .await
                .with_context(|| format!("navigating worker tab {index} to inventory"))?;
            info!(tab = index, total, "worker tab ready");
            pages.push(page);
        }

        Ok(Self { pages })
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// The tab owned by worker `index`.
    pub fn page(&self, index: usize) -> &Page {
        &self.pages[index]
    }

    /// Close every tab. Called during teardown, after workers have exited.
    pub async fn close_all(self) {
        let count = self.pages.len();
        for (index, page) in self.pages.into_iter().enumerate() {
            if let Err(e) = page.close().await {
                warn!(tab = index, error = %e, "failed to close worker tab");
            }
        }
        info!(count, "worker tabs closed");
    }
}
