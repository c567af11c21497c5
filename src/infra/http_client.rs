use async_trait::async_trait;
use reqwest::header::CONTENT_DISPOSITION;
use scraper::{Html, Selector};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::app::ports::{RenderSession, SessionFactory};
use crate::common::error::{PageFailure, Result, ScraperError};
use crate::config::RendererConfig;

/// Sessions backed by plain HTTP requests. No script runs, so this only
/// works when the portal serves its listing without a challenge, but the
/// download protocol is the same as with a browser.
pub struct HttpSessionFactory {
    client: reqwest::Client,
}

impl HttpSessionFactory {
    pub fn new(config: &RendererConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .gzip(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open(&self, download_dir: Option<&Path>) -> Result<Box<dyn RenderSession>> {
        if let Some(dir) = download_dir {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            download_dir: download_dir.map(Path::to_path_buf),
            body: String::new(),
        }))
    }
}

pub struct HttpSession {
    client: reqwest::Client,
    download_dir: Option<PathBuf>,
    body: String,
}

/// Keep only the final path component; empty, `.` and `..` are rejected.
fn safe_file_name(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next()?.trim();
    match Path::new(name).file_name().and_then(|n| n.to_str()) {
        Some(n) if !n.is_empty() && n != "." && n != ".." => Some(n.to_string()),
        _ => None,
    }
}

/// Name for a transferred file: Content-Disposition, then the URL's last segment.
/// Always a bare file name inside the download directory.
fn transfer_name(url: &str, disposition: Option<&str>) -> String {
    let from_header = disposition.and_then(|d| {
        d.split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix("filename="))
            .and_then(|n| safe_file_name(n.trim_matches('"')))
    });
    if let Some(name) = from_header {
        return name;
    }
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .and_then(|seg| urlencoding::decode(&seg).ok().map(|s| s.into_owned()))
        .and_then(|name| safe_file_name(&name))
        .unwrap_or_else(|| "download.csv".to_string())
}

impl HttpSession {
    async fn fetch(&mut self, url: &str) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScraperError::page(PageFailure::Navigation, format!("GET {url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScraperError::page(
                PageFailure::Navigation,
                format!("GET {url} returned {status}"),
            ));
        }

        match &self.download_dir {
            Some(dir) => {
                let disposition = response
                    .headers()
                    .get(CONTENT_DISPOSITION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let name = transfer_name(url, disposition.as_deref());
                let final_path = dir.join(&name);
                let partial = dir.join(format!("{name}.part"));

                let bytes = response.bytes().await?;
                let mut file = tokio::fs::File::create(&partial).await?;
                file.write_all(&bytes).await?;
                file.flush().await?;
                drop(file);
                tokio::fs::rename(&partial, &final_path).await?;
                info!("Saved {} bytes to {}", bytes.len(), final_path.display());
            }
            None => {
                self.body = response.text().await?;
                debug!("Fetched {} ({} bytes)", url, self.body.len());
            }
        }
        Ok(())
    }

    fn matches(&self, selector: &str) -> bool {
        match Selector::parse(selector) {
            Ok(sel) => Html::parse_document(&self.body).select(&sel).next().is_some(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl RenderSession for HttpSession {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.fetch(url)).await {
            Ok(result) => result,
            Err(_) => Err(ScraperError::page(
                PageFailure::Timeout,
                format!("GET {url} exceeded {}s", timeout.as_secs()),
            )),
        }
    }

    async fn wait_for_selector(&mut self, selector: &str, _timeout: Duration) -> Result<bool> {
        // Static content: it either matched on arrival or never will
        Ok(self.matches(selector))
    }

    async fn click_if_present(&mut self, _selector: &str) -> Result<bool> {
        Ok(false)
    }

    async fn title(&mut self) -> Result<String> {
        let document = Html::parse_document(&self.body);
        let title = Selector::parse("title")
            .ok()
            .and_then(|sel| document.select(&sel).next().map(|t| t.text().collect::<String>()))
            .unwrap_or_default();
        Ok(title.trim().to_string())
    }

    async fn content(&mut self) -> Result<String> {
        Ok(self.body.clone())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_name_from_url() {
        assert_eq!(
            transfer_name(
                "https://data.london.gov.uk/download/x/y/MPS%20Ward%20Level%20Crime.csv",
                None
            ),
            "MPS Ward Level Crime.csv"
        );
        assert_eq!(transfer_name("https://example.org/", None), "download.csv");
    }

    #[test]
    fn test_transfer_name_prefers_disposition() {
        assert_eq!(
            transfer_name(
                "https://example.org/download?id=3",
                Some("attachment; filename=\"borough.csv\"")
            ),
            "borough.csv"
        );
    }

    #[test]
    fn test_transfer_name_stays_inside_download_dir() {
        let dir = Path::new("/srv/data/downloads");

        let name = transfer_name("https://example.org/x/..%2F..%2Flondon_crime_data.db", None);
        assert_eq!(name, "london_crime_data.db");
        assert_eq!(dir.join(&name), dir.join("london_crime_data.db"));

        let name = transfer_name(
            "https://example.org/download?id=3",
            Some("attachment; filename=\"/etc/cron.d/evil\""),
        );
        assert_eq!(name, "evil");
        assert!(dir.join(&name).starts_with(dir));

        assert_eq!(transfer_name("https://example.org/x/..", None), "download.csv");
        assert_eq!(transfer_name("https://example.org/x/%2E%2E", None), "download.csv");
        assert_eq!(
            transfer_name("https://example.org/", Some("attachment; filename=\"..\"")),
            "download.csv"
        );
        assert_eq!(
            transfer_name("https://example.org/a/b.csv", Some("attachment; filename=\"..\\..\\x.csv\"")),
            "x.csv"
        );
    }

    #[tokio::test]
    async fn test_selector_and_title_on_static_body() {
        let mut session = HttpSession {
            client: reqwest::Client::new(),
            download_dir: None,
            body: "<html><head><title> Recorded Crime </title></head>\
                   <body><div class=\"dp-container\"></div></body></html>"
                .to_string(),
        };
        assert!(session
            .wait_for_selector("div.dp-container", Duration::ZERO)
            .await
            .unwrap());
        assert!(!session.wait_for_selector("div.missing", Duration::ZERO).await.unwrap());
        assert_eq!(session.title().await.unwrap(), "Recorded Crime");
        assert!(!session.click_if_present("#ccc-notify-accept").await.unwrap());
    }
}
