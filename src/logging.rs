use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Respect RUST_LOG if set; otherwise info for this crate.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crime_scraper=info"))
}

/// Initializes the logging system with both console and file output.
///
/// File output is JSON, rotated daily under `log_dir`. The returned guard
/// flushes buffered file output when dropped, so hold it for the life of
/// the process. Only the first call installs a subscriber.
pub fn init_logging(log_dir: &Path) -> Option<WorkerGuard> {
    if let Err(e) = fs::create_dir_all(log_dir) {
        let console_layer = fmt::layer().with_writer(std::io::stdout);
        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(console_layer)
            .try_init();
        tracing::warn!("File logging disabled, cannot create {}: {}", log_dir.display(), e);
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "crime_scraper.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().with_writer(std::io::stdout);

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(console_layer)
        .try_init();

    Some(guard)
}
