use thiserror::Error;

/// Why a rendered page could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFailure {
    /// The resource list marker never appeared within the navigation timeout.
    Timeout,
    /// An interstitial bot check was still present after the second look.
    Challenge,
    /// A rendering session could not be acquired.
    Session,
    /// Navigation itself failed (DNS, TLS, aborted load, non-success status).
    Navigation,
}

impl std::fmt::Display for PageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PageFailure::Timeout => "timed out waiting for resource list",
            PageFailure::Challenge => "challenge page persisted",
            PageFailure::Session => "session acquisition failed",
            PageFailure::Navigation => "navigation failed",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum ScraperError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("CSV parsing failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Browser setup failed: {0}")]
    BrowserSetup(String),

    #[error("Page unavailable ({kind}): {message}")]
    PageUnavailable { kind: PageFailure, message: String },

    #[error("Transfer did not complete within {waited_secs}s")]
    TransferTimeout { waited_secs: u64 },

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last_error: Box<ScraperError>,
    },

    #[error("Missing required column in '{table}': none of {candidates:?}")]
    MissingColumn {
        table: String,
        candidates: Vec<String>,
    },

    #[error("Table '{0}' not found")]
    MissingTable(String),

    #[error("Table '{0}' is empty")]
    EmptyTable(String),

    #[error("Combined result is empty after filtering")]
    EmptyResult,
}

impl ScraperError {
    pub fn page(kind: PageFailure, message: impl Into<String>) -> Self {
        ScraperError::PageUnavailable {
            kind,
            message: message.into(),
        }
    }

    /// Errors the backoff controller is expected to see and retry through.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScraperError::PageUnavailable { .. }
                | ScraperError::TransferTimeout { .. }
                | ScraperError::Http(_)
        )
    }

    /// The error behind any retry wrapping.
    pub fn root(&self) -> &ScraperError {
        match self {
            ScraperError::RetriesExhausted { last_error, .. } => last_error.root(),
            other => other,
        }
    }

    /// Errors that make the whole run unusable rather than one category.
    pub fn is_environment(&self) -> bool {
        matches!(
            self.root(),
            ScraperError::BrowserSetup(_) | ScraperError::Io(_) | ScraperError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ScraperError>;
