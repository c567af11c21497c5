pub mod chromium;
pub mod http_client;
pub mod memory_store;
pub mod sqlite_store;

use std::sync::Arc;

use crate::app::ports::SessionFactory;
use crate::common::error::Result;
use crate::config::{RendererBackend, RendererConfig};

/// Session factory for the configured backend.
pub fn session_factory(config: &RendererConfig) -> Result<Arc<dyn SessionFactory>> {
    Ok(match config.backend {
        RendererBackend::Chromium => Arc::new(chromium::ChromiumSessionFactory::new(config.clone())),
        RendererBackend::Http => Arc::new(http_client::HttpSessionFactory::new(config)?),
    })
}
