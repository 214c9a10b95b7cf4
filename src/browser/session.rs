//! Browser session: launch, authentication, and cookie export.
//!
//! One browser, one context. The first page logs in; every later page is
//! created in the same context and inherits the authenticated session. The
//! site enforces a single active session, so logging in from more than one
//! context is never attempted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, SetBlockedUrLsParams, SetUserAgentOverrideParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::browser::{current_url, element_present, selectors, wait_for_element};
use crate::config::Settings;
use crate::error::StepError;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Time allowed for the post-login navigation to settle.
const LOGIN_SETTLE: Duration = Duration::from_secs(2);

/// A launched browser hosting the single authenticated context.
pub struct BrowserSession {
    browser: Mutex<Browser>,
    handler_task: JoinHandle<()>,
    settings: Settings,
}

impl BrowserSession {
    /// Common Chrome executable locations, checked before PATH lookup.
    const CHROME_PATHS: &'static [&'static str] = &[
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/opt/google/chrome/google-chrome",
    ];

    /// Launch Chrome and spawn the CDP event-handler task.
    pub async fn launch(settings: &Settings) -> Result<Self> {
        let chrome_path = Self::find_chrome()?;
        info!(headless = settings.headless, "launching browser");

        let mut builder = BrowserConfig::builder().chrome_executable(chrome_path);
        if !settings.headless {
            builder = builder.with_head();
        }
        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--no-sandbox")
            .arg("--disable-gpu");

        let config = builder
            .build()
            .map_err(|e| anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch browser")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            browser: Mutex::new(browser),
            handler_task,
            settings: settings.clone(),
        })
    }

    fn find_chrome() -> Result<PathBuf> {
        for path in Self::CHROME_PATHS {
            let p = std::path::Path::new(path);
            if p.exists() {
                debug!(path, "found Chrome executable");
                return Ok(p.to_path_buf());
            }
        }
        for cmd in &["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
            if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        debug!(path, "found Chrome in PATH");
                        return Ok(PathBuf::from(path));
                    }
                }
            }
        }
        Err(anyhow!(
            "Chrome/Chromium not found; install it or put it on PATH"
        ))
    }

    /// Open a fresh tab in the shared context.
    pub async fn new_page(&self) -> Result<Page> {
        let browser = self.browser.lock().await;
        let page = browser.new_page("about:blank").await?;
        page.execute(SetUserAgentOverrideParams::new(USER_AGENT.to_string()))
            .await?;
        if self.settings.block_resources {
            self.block_static_resources(&page).await?;
        }
        Ok(page)
    }

    /// All pages currently open in the context, popups included.
    pub async fn pages(&self) -> Result<Vec<Page>> {
        let browser = self.browser.lock().await;
        Ok(browser.pages().await?)
    }

    /// Abort static-asset requests on `page` for throughput.
    async fn block_static_resources(&self, page: &Page) -> Result<()> {
        page.execute(EnableParams::default()).await?;
        let patterns: Vec<String> = selectors::BLOCKED_URL_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .collect();
        page.execute(SetBlockedUrLsParams::new(patterns)).await?;
        Ok(())
    }

    /// Log in on `page`. Fills the form, submits, and handles the optional
    /// license-acceptance interstitial. Fatal when credentials are rejected.
    pub async fn login(&self, page: &Page) -> Result<()> {
        info!("logging in");
        page.goto(self.settings.login_url.as_str()).await?;
        page.wait_for_navigation().await?;

        let username = wait_for_element(page, selectors::USERNAME_INPUT, Duration::from_secs(15))
            .await
            .context("login form did not appear")?;
        username.click().await?.type_str(&self.settings.username).await?;

        page.find_element(selectors::PASSWORD_INPUT)
            .await?
            .click()
            .await?
            .type_str(&self.settings.password)
            .await?;

        page.find_element(selectors::LOGIN_BUTTON).await?.click().await?;
        page.wait_for_navigation().await?;
        sleep(LOGIN_SETTLE).await;

        self.accept_license_if_present(page).await;

        // Still on the login form means the credentials were rejected.
        if element_present(page, selectors::USERNAME_INPUT).await {
            return Err(anyhow!("login rejected for {}", self.settings.username));
        }
        info!("login complete");
        Ok(())
    }

    /// Tick the license-agreement checkbox when the interstitial shows up.
    /// Absence is the common case and not an error.
    pub async fn accept_license_if_present(&self, page: &Page) {
        match page.find_element(selectors::LICENSE_CHECKBOX).await {
            Ok(checkbox) => {
                info!("accepting license agreement");
                if let Err(e) = checkbox.click().await {
                    warn!(error = %e, "could not click license checkbox");
                }
                let _ = page.wait_for_navigation().await;
            }
            Err(_) => debug!("no license interstitial"),
        }
    }

    /// True when `page` has been bounced back to the login surface.
    pub async fn is_logged_out(&self, page: &Page) -> bool {
        let url = current_url(page).await;
        url.contains(selectors::LOGIN_PATH_MARKER)
            || element_present(page, selectors::USERNAME_INPUT).await
    }

    /// Re-authenticate `page` after a mid-run logout. Callers serialize this
    /// behind the PDF gate so only one worker refreshes the session.
    pub async fn refresh_session(&self, page: &Page) -> Result<()> {
        warn!("session lost mid-run, re-authenticating");
        self.login(page)
            .await
            .map_err(|e| StepError::SessionRefresh(e.to_string()).into())
    }

    /// Best-effort logout on shutdown.
    pub async fn logout(&self, page: &Page) {
        match page.find_element(selectors::LOGOUT_BUTTON).await {
            Ok(button) => {
                if let Err(e) = button.click().await {
                    warn!(error = %e, "logout click failed");
                } else {
                    sleep(Duration::from_secs(1)).await;
                    info!("logged out");
                }
            }
            Err(_) => debug!("logout control not present"),
        }
    }

    /// Build an HTTP client that shares the context's session identity, for
    /// downloading report bytes outside the browser.
    pub async fn http_client(&self) -> Result<reqwest::Client> {
        let cookies = {
            let browser = self.browser.lock().await;
            browser.get_cookies().await?
        };
        let jar = reqwest::cookie::Jar::default();
        for cookie in &cookies {
            let scheme = if cookie.secure { "https" } else { "http" };
            let origin = format!("{scheme}://{}/", cookie.domain.trim_start_matches('.'));
            if let Ok(url) = origin.parse() {
                let cookie_str = format!(
                    "{}={}; Domain={}; Path={}",
                    cookie.name, cookie.value, cookie.domain, cookie.path
                );
                jar.add_cookie_str(&cookie_str, &url);
            }
        }
        debug!(count = cookies.len(), "exported context cookies to HTTP client");
        Ok(reqwest::Client::builder()
            .cookie_provider(Arc::new(jar))
            .user_agent(USER_AGENT)
            .gzip(true)
            .timeout(Duration::from_secs(120))
            .build()?)
    }

    /// Close the browser and stop the handler task.
    pub async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!(error = %e, "browser close failed");
        }
        self.handler_task.abort();
        info!("browser closed");
    }
}
