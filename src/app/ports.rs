use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::common::error::Result;
use crate::common::types::RawTable;

/// Anything that can turn a URL into fully rendered document content.
///
/// The pipeline never cares how the page was obtained (headless browser,
/// stealth tweaks, plain HTTP); it only needs the final markup.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<String>;
}

/// Hands out fresh rendering sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a new session. When `download_dir` is given, file transfers
    /// triggered by navigation are written into that directory.
    async fn open(&self, download_dir: Option<&Path>) -> Result<Box<dyn RenderSession>>;
}

/// One browser-like session (a tab plus whatever process backs it).
#[async_trait]
pub trait RenderSession: Send {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()>;
    /// Wait until `selector` matches at least one element; `false` on timeout.
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<bool>;
    /// Click the first element matching `selector`; `false` when there is none.
    async fn click_if_present(&mut self, selector: &str) -> Result<bool>;
    async fn title(&mut self) -> Result<String>;
    async fn content(&mut self) -> Result<String>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Key-indexed table store with whole-table replace semantics.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Replace `name` with `table`. Readers see either the old table or the
    /// new one, never a mix; on error the old table is left intact.
    async fn replace_table(&self, name: &str, table: &RawTable) -> Result<()>;
    async fn read_table(&self, name: &str) -> Result<Option<RawTable>>;
    async fn table_exists(&self, name: &str) -> Result<bool>;
}
