use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::app::ports::{PageRenderer, RenderSession, SessionFactory};
use crate::common::error::{PageFailure, Result, ScraperError};
use crate::config::RendererConfig;

/// Drives a rendering session through the portal's page protocol: wait for
/// the resource list, accept cookies, sit out a bot check once.
pub struct PageRendererClient {
    sessions: Arc<dyn SessionFactory>,
    config: RendererConfig,
}

impl PageRendererClient {
    pub fn new(sessions: Arc<dyn SessionFactory>, config: RendererConfig) -> Self {
        Self { sessions, config }
    }

    /// True when the title or body carries one of the configured challenge markers.
    pub fn is_challenge(&self, title: &str, body: &str) -> bool {
        let title = title.to_lowercase();
        let body = body.to_lowercase();
        self.config.challenge_markers.iter().any(|marker| {
            let marker = marker.to_lowercase();
            title.contains(&marker) || body.contains(&marker)
        })
    }

    async fn detect_challenge(&self, session: &mut dyn RenderSession) -> Result<bool> {
        let title = session.title().await?;
        let body = session.content().await?;
        Ok(self.is_challenge(&title, &body))
    }

    async fn drive(&self, session: &mut dyn RenderSession, url: &str) -> Result<String> {
        let timeout = self.config.navigation_timeout();
        session.navigate(url, timeout).await?;

        // Settle any bot check before waiting on the resource list
        if self.detect_challenge(session).await? {
            let wait = self.config.challenge_wait();
            warn!("Challenge page detected, waiting {:?} before re-checking", wait);
            tokio::time::sleep(wait).await;
            if self.detect_challenge(session).await? {
                return Err(self.challenge_error(url));
            }
        }

        let ready = session
            .wait_for_selector(&self.config.ready_selector, timeout)
            .await?;
        if !ready {
            if self.detect_challenge(session).await? {
                return Err(self.challenge_error(url));
            }
            return Err(ScraperError::page(
                PageFailure::Timeout,
                format!(
                    "'{}' did not appear within {}s",
                    self.config.ready_selector, self.config.navigation_timeout_secs
                ),
            ));
        }

        if session.click_if_present(&self.config.consent_selector).await? {
            debug!("Accepted cookie consent");
        }

        session.content().await
    }

    fn challenge_error(&self, url: &str) -> ScraperError {
        ScraperError::page(PageFailure::Challenge, format!("challenge still present at {url}"))
    }
}

#[async_trait]
impl PageRenderer for PageRendererClient {
    #[instrument(skip(self))]
    async fn render(&self, url: &str) -> Result<String> {
        let mut session = self.sessions.open(None).await.map_err(|e| match e {
            ScraperError::BrowserSetup(_) => e,
            other => ScraperError::page(PageFailure::Session, other.to_string()),
        })?;

        let outcome = self.drive(session.as_mut(), url).await;

        if let Err(e) = session.close().await {
            warn!("Failed to close rendering session: {}", e);
        }

        let html = outcome?;
        info!("Rendered {} ({} bytes)", url, html.len());
        Ok(html)
    }
}
