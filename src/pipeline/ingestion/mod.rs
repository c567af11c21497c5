// Pipeline ingestion: page rendering, resource location, downloads and retries

pub mod backoff;
pub mod download;
pub mod locator;
pub mod matcher;
pub mod renderer;

// Re-export key types for external use
pub use backoff::Backoff;
pub use download::{DownloadManager, DownloadedFile, TransferState};
pub use locator::{LocatedResources, ResourceLocator};
pub use matcher::PatternMatcher;
pub use renderer::PageRendererClient;
