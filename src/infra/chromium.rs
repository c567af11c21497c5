//! Chromium-backed rendering sessions using chromiumoxide.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::ports::{RenderSession, SessionFactory};
use crate::common::error::{PageFailure, Result, ScraperError};
use crate::config::RendererConfig;

const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// Locate a Chromium-compatible binary: the configured path first, then PATH.
pub fn find_chromium(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ScraperError::BrowserSetup(format!(
            "configured browser binary '{}' does not exist",
            path.display()
        )));
    }

    for candidate in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(candidate) {
            debug!("Using browser binary {}", path.display());
            return Ok(path);
        }
    }

    Err(ScraperError::BrowserSetup(
        "no Chrome/Chromium binary found on PATH; set renderer.chrome_path or CRIME_CHROME_PATH"
            .into(),
    ))
}

fn cdp_error(context: &str, e: impl std::fmt::Display) -> ScraperError {
    ScraperError::page(PageFailure::Navigation, format!("{context}: {e}"))
}

/// Launches one browser per session so every attempt starts clean.
pub struct ChromiumSessionFactory {
    config: RendererConfig,
}

impl ChromiumSessionFactory {
    pub fn new(config: RendererConfig) -> Self {
        Self { config }
    }
}

/// Headless selection goes through the builder, which adds its own flag.
fn headless_mode(config: &RendererConfig) -> HeadlessMode {
    if config.headless {
        HeadlessMode::New
    } else {
        HeadlessMode::False
    }
}

fn launch_args(config: &RendererConfig) -> Vec<String> {
    vec![
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-gpu".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-extensions".to_string(),
        format!("--user-agent={}", config.user_agent),
    ]
}

#[async_trait]
impl SessionFactory for ChromiumSessionFactory {
    async fn open(&self, download_dir: Option<&Path>) -> Result<Box<dyn RenderSession>> {
        let chrome_path = find_chromium(self.config.chrome_path.as_deref())?;
        let profile_dir = std::env::temp_dir().join(format!("crime-scraper-{}", uuid::Uuid::new_v4()));

        let builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .user_data_dir(&profile_dir)
            .headless_mode(headless_mode(&self.config))
            .args(launch_args(&self.config));
        let browser_config = builder
            .build()
            .map_err(|e| ScraperError::BrowserSetup(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| ScraperError::page(PageFailure::Session, format!("failed to launch browser: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let mut session = ChromiumSession {
            browser,
            page: None,
            handler_task,
            profile_dir,
            downloads: download_dir.is_some(),
        };

        if let Err(e) = session.prepare(&self.config.user_agent, download_dir).await {
            session.shutdown().await;
            return Err(e);
        }

        info!("Opened browser session");
        Ok(Box::new(session))
    }
}

pub struct ChromiumSession {
    browser: Browser,
    page: Option<Page>,
    handler_task: JoinHandle<()>,
    profile_dir: PathBuf,
    /// Navigations are expected to end in a file transfer
    downloads: bool,
}

impl ChromiumSession {
    async fn prepare(&mut self, user_agent: &str, download_dir: Option<&Path>) -> Result<()> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScraperError::page(PageFailure::Session, format!("failed to open tab: {e}")))?;

        page.enable_stealth_mode_with_agent(user_agent)
            .await
            .map_err(|e| cdp_error("failed to apply stealth settings", e))?;

        if let Some(dir) = download_dir {
            std::fs::create_dir_all(dir)?;
            let absolute = std::fs::canonicalize(dir)?;
            let params = SetDownloadBehaviorParams::builder()
                .behavior(SetDownloadBehaviorBehavior::Allow)
                .download_path(absolute.to_string_lossy().to_string())
                .build()
                .map_err(|e| ScraperError::BrowserSetup(format!("invalid download settings: {e}")))?;
            self.browser
                .execute(params)
                .await
                .map_err(|e| cdp_error("failed to configure downloads", e))?;
            debug!("Downloads directed to {}", absolute.display());
        }

        self.page = Some(page);
        Ok(())
    }

    fn page(&self) -> Result<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| ScraperError::page(PageFailure::Session, "session has no open tab"))
    }

    async fn shutdown(mut self) {
        if let Some(page) = self.page.take() {
            let _ = page.close().await;
        }
        if let Err(e) = self.browser.close().await {
            debug!("Browser close reported: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        if let Err(e) = std::fs::remove_dir_all(&self.profile_dir) {
            debug!("Could not remove profile dir {}: {}", self.profile_dir.display(), e);
        }
    }
}

#[async_trait]
impl RenderSession for ChromiumSession {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        let page = self.page()?;
        match tokio::time::timeout(timeout, page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            // A navigation that turns into a file transfer is reported as aborted
            Ok(Err(e)) if self.downloads && e.to_string().contains("ERR_ABORTED") => {
                debug!("Navigation to {} handed off to a download", url);
                Ok(())
            }
            Ok(Err(e)) => Err(cdp_error(&format!("navigation to {url} failed"), e)),
            Err(_) if self.downloads => {
                warn!("Navigation to {} did not settle within {:?}; polling for the file anyway", url, timeout);
                Ok(())
            }
            Err(_) => Err(ScraperError::page(
                PageFailure::Timeout,
                format!("navigation to {url} exceeded {}s", timeout.as_secs()),
            )),
        }
    }

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<bool> {
        let page = self.page()?;
        let deadline = Instant::now() + timeout;
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(SELECTOR_POLL).await;
        }
    }

    async fn click_if_present(&mut self, selector: &str) -> Result<bool> {
        let page = self.page()?;
        match page.find_element(selector).await {
            Ok(element) => {
                element
                    .click()
                    .await
                    .map_err(|e| cdp_error(&format!("click on '{selector}' failed"), e))?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn title(&mut self) -> Result<String> {
        let page = self.page()?;
        let title = page
            .get_title()
            .await
            .map_err(|e| cdp_error("failed to read title", e))?;
        Ok(title.unwrap_or_default())
    }

    async fn content(&mut self) -> Result<String> {
        let page = self.page()?;
        page.content()
            .await
            .map_err(|e| cdp_error("failed to read content", e))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        (*self).shutdown().await;
        debug!("Closed browser session");
        Ok(())
    }
}
