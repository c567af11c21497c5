use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, instrument, warn};

use crate::app::ports::SessionFactory;
use crate::common::error::{Result, ScraperError};
use crate::config::DownloadConfig;
use crate::pipeline::ingestion::backoff::Backoff;

/// File mtimes come from a coarser clock than `SystemTime::now()`, so a file
/// written just after navigation can look slightly older than it. Staging is
/// emptied before each attempt, so nothing stale falls inside this window.
const MTIME_TOLERANCE: Duration = Duration::from_secs(2);

/// Where a browser-driven transfer stands, as seen from the download directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    /// Nothing qualifying has appeared yet
    Pending,
    /// An in-progress marker file is present
    InProgress,
    /// A finished file newer than the navigation start is present
    Complete(PathBuf),
    /// The poll budget ran out
    Failed,
}

/// A completed, verified download
#[derive(Debug, Clone, Serialize)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Look at `dir` once and classify the transfer.
pub fn inspect_directory(
    dir: &Path,
    started: SystemTime,
    min_bytes: u64,
    in_progress_suffixes: &[String],
) -> io::Result<TransferState> {
    let mut in_progress = false;
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if in_progress_suffixes.iter().any(|s| name.ends_with(&s.to_lowercase())) {
            in_progress = true;
            continue;
        }
        let modified = metadata.modified()?;
        if metadata.len() < min_bytes || modified < started {
            continue;
        }
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, entry.path()));
        }
    }

    Ok(match (in_progress, newest) {
        (true, _) => TransferState::InProgress,
        (false, Some((_, path))) => TransferState::Complete(path),
        (false, None) => TransferState::Pending,
    })
}

/// Bounded poll loop over [`inspect_directory`].
#[derive(Debug)]
pub struct TransferPoller {
    dir: PathBuf,
    started: SystemTime,
    min_bytes: u64,
    suffixes: Vec<String>,
    max_polls: u32,
    polls: u32,
}

impl TransferPoller {
    pub fn new(dir: &Path, started: SystemTime, config: &DownloadConfig) -> Self {
        let interval = config.poll_interval().as_millis().max(1);
        let max_polls = (config.timeout().as_millis() / interval).max(1) as u32;
        Self {
            dir: dir.to_path_buf(),
            started,
            min_bytes: config.min_file_bytes,
            suffixes: config.in_progress_suffixes.clone(),
            max_polls,
            polls: 0,
        }
    }

    pub fn max_polls(&self) -> u32 {
        self.max_polls
    }

    /// One observation. Returns `Failed` once the budget is spent without completion.
    pub fn poll(&mut self) -> io::Result<TransferState> {
        self.polls += 1;
        let state = inspect_directory(&self.dir, self.started, self.min_bytes, &self.suffixes)?;
        match state {
            TransferState::Complete(_) => Ok(state),
            _ if self.polls >= self.max_polls => Ok(TransferState::Failed),
            other => Ok(other),
        }
    }
}

/// Triggers downloads through a rendering session and waits for the file to land.
pub struct DownloadManager {
    sessions: Arc<dyn SessionFactory>,
    config: DownloadConfig,
    staging_dir: PathBuf,
    navigation_timeout: Duration,
}

impl DownloadManager {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        config: DownloadConfig,
        staging_dir: PathBuf,
        navigation_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            config,
            staging_dir,
            navigation_timeout,
        }
    }

    /// Download `url` into `target`, retrying whole attempts through `backoff`.
    #[instrument(skip(self, backoff))]
    pub async fn download(&self, backoff: &Backoff, url: &str, target: &Path) -> Result<DownloadedFile> {
        backoff
            .retry("download", |attempt| async move {
                let removed = self.clear_staging()?;
                if removed > 0 {
                    debug!(attempt, "Removed {} stale files from staging", removed);
                }
                self.attempt(url, target).await
            })
            .await
    }

    async fn attempt(&self, url: &str, target: &Path) -> Result<DownloadedFile> {
        fs::create_dir_all(&self.staging_dir)?;
        let now = SystemTime::now();
        let started = now.checked_sub(MTIME_TOLERANCE).unwrap_or(now);

        let mut session = self.sessions.open(Some(self.staging_dir.as_path())).await?;
        let navigated = session.navigate(url, self.navigation_timeout).await;
        let polled = match navigated {
            Ok(()) => self.wait_for_completion(started).await,
            Err(e) => Err(e),
        };
        if let Err(e) = session.close().await {
            warn!("Failed to close download session: {}", e);
        }

        let completed = polled?;
        move_into_place(&completed, target)?;
        let (bytes, sha256) = digest_file(target)?;
        info!("Downloaded {} to {} ({} bytes, sha256 {})", url, target.display(), bytes, sha256);
        Ok(DownloadedFile {
            path: target.to_path_buf(),
            bytes,
            sha256,
        })
    }

    async fn wait_for_completion(&self, started: SystemTime) -> Result<PathBuf> {
        let mut poller = TransferPoller::new(&self.staging_dir, started, &self.config);
        loop {
            tokio::time::sleep(self.config.poll_interval()).await;
            match poller.poll()? {
                TransferState::Complete(path) => return Ok(path),
                TransferState::Failed => {
                    let removed = self.clear_staging()?;
                    if removed > 0 {
                        debug!("Cleared {} partial files after timeout", removed);
                    }
                    return Err(ScraperError::TransferTimeout {
                        waited_secs: self.config.timeout_secs,
                    });
                }
                TransferState::InProgress => debug!("Transfer in progress"),
                TransferState::Pending => {}
            }
        }
    }

    /// Remove in-progress markers and leftovers from earlier attempts.
    pub fn clear_staging(&self) -> Result<usize> {
        if !self.staging_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.staging_dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Move `from` onto `to`, replacing whatever was there.
fn move_into_place(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if to.exists() {
        fs::remove_file(to)?;
    }
    if fs::rename(from, to).is_err() {
        // Different filesystem
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

fn digest_file(path: &Path) -> Result<(u64, String)> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let bytes = io::copy(&mut file, &mut hasher)?;
    Ok((bytes, hex::encode(hasher.finalize())))
}
