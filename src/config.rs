use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::common::constants::{self, *};
use crate::common::error::{Result, ScraperError};
use crate::common::types::DatasetCategory;

/// Immutable configuration for one pipeline run.
///
/// Built once (from `config.toml` when present, otherwise from defaults) and
/// handed to each component at construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dataset_url: String,
    pub database_path: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub retry: RetryConfig,
    pub renderer: RendererConfig,
    pub download: DownloadConfig,
    pub locator: LocatorConfig,
    pub categories: Vec<DatasetCategory>,
    pub combine: CombineConfig,
    pub mapping: MappingConfig,
    pub fallback_resources: Vec<FallbackResource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererBackend {
    Chromium,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub backend: RendererBackend,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub user_agent: String,
    pub navigation_timeout_secs: u64,
    /// Marker element that shows the resource list has rendered
    pub ready_selector: String,
    pub consent_selector: String,
    /// Title/body substrings that identify an interstitial bot check
    pub challenge_markers: Vec<String>,
    pub challenge_wait_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
    pub min_file_bytes: u64,
    pub in_progress_suffixes: Vec<String>,
    pub keep_downloads: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub item_selector: String,
    pub link_selector: String,
    pub title_selector: String,
    pub date_selectors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CombineConfig {
    /// Category whose table must exist for the combination to run
    pub primary: String,
    /// Finer-grained categories rolled up to region level before merging
    pub secondary: Vec<String>,
    pub region_columns: Vec<String>,
    pub major_columns: Vec<String>,
    pub minor_columns: Vec<String>,
    pub excluded_regions: Vec<String>,
    pub output_table: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// External TOML file with a flat `raw = "canonical"` table
    pub path: Option<PathBuf>,
    /// Inline entries; these win over file entries and defaults
    pub entries: BTreeMap<String, String>,
    /// Drop the built-in entries entirely
    pub replace_defaults: bool,
}

/// Known direct download for a category, used when the listing page cannot be read
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackResource {
    pub category: String,
    pub url: String,
    pub filename: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset_url: DATASET_URL.to_string(),
            database_path: PathBuf::from(DB_PATH),
            data_dir: PathBuf::from(DATA_DIR),
            log_dir: PathBuf::from("logs"),
            retry: RetryConfig::default(),
            renderer: RendererConfig::default(),
            download: DownloadConfig::default(),
            locator: LocatorConfig::default(),
            categories: default_categories(),
            combine: CombineConfig::default(),
            mapping: MappingConfig::default(),
            fallback_resources: default_fallbacks(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_jitter_ms: 1_000,
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            backend: RendererBackend::Chromium,
            headless: true,
            chrome_path: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            navigation_timeout_secs: 60,
            ready_selector: "div.dp-container".to_string(),
            consent_selector: "#ccc-notify-accept, #ccc-recommended-settings".to_string(),
            challenge_markers: vec![
                "Just a moment".to_string(),
                "Checking your browser".to_string(),
                "Attention Required".to_string(),
                "cf-challenge".to_string(),
            ],
            challenge_wait_secs: 20,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            timeout_secs: 120,
            min_file_bytes: 1_024,
            in_progress_suffixes: vec![
                ".crdownload".to_string(),
                ".part".to_string(),
                ".tmp".to_string(),
            ],
            keep_downloads: false,
        }
    }
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            item_selector: "div.dp-container".to_string(),
            link_selector: "a.dp-resource__format".to_string(),
            title_selector: "div.dp-resource__title".to_string(),
            date_selectors: vec![
                "div.dp-temporalcoverage".to_string(),
                "div.dp-resource__updated".to_string(),
            ],
        }
    }
}

impl Default for CombineConfig {
    fn default() -> Self {
        Self {
            primary: BOROUGH_CATEGORY.to_string(),
            secondary: vec![WARD_CATEGORY.to_string()],
            region_columns: vec!["boroughname".to_string(), "lookup_boroughname".to_string()],
            major_columns: vec!["majortext".to_string(), "major_category".to_string()],
            minor_columns: vec!["minortext".to_string(), "minor_category".to_string()],
            excluded_regions: EXCLUDED_REGIONS.iter().map(|s| s.to_string()).collect(),
            output_table: COMBINED_TABLE.to_string(),
        }
    }
}

fn default_categories() -> Vec<DatasetCategory> {
    vec![
        DatasetCategory {
            id: BOROUGH_CATEGORY.to_string(),
            name_fragment: BOROUGH_FRAGMENT.to_string(),
            table_name: BOROUGH_TABLE.to_string(),
            historical_marker: Some(HISTORICAL_MARKER.to_string()),
        },
        DatasetCategory {
            id: LSOA_CATEGORY.to_string(),
            name_fragment: LSOA_FRAGMENT.to_string(),
            table_name: LSOA_TABLE.to_string(),
            historical_marker: None,
        },
        DatasetCategory {
            id: WARD_CATEGORY.to_string(),
            name_fragment: WARD_FRAGMENT.to_string(),
            table_name: WARD_TABLE.to_string(),
            historical_marker: None,
        },
    ]
}

fn default_fallbacks() -> Vec<FallbackResource> {
    vec![
        FallbackResource {
            category: BOROUGH_CATEGORY.to_string(),
            url: "https://data.london.gov.uk/download/recorded_crime_summary/3cdda2b7-b56f-4f21-b8f1-a8cfd7da3bf5/MPS%20Borough%20Level%20Crime%20%28Historical%29.csv".to_string(),
            filename: "MPS Borough Level Crime (Historical).csv".to_string(),
        },
        FallbackResource {
            category: LSOA_CATEGORY.to_string(),
            url: "https://data.london.gov.uk/download/recorded_crime_summary/6ad2ca14-1b76-46f3-9750-d71eb391f256/MPS%20LSOA%20Level%20Crime%20%28most%20recent%2024%20months%29.csv".to_string(),
            filename: "MPS LSOA Level Crime.csv".to_string(),
        },
        FallbackResource {
            category: WARD_CATEGORY.to_string(),
            url: "https://data.london.gov.uk/download/recorded_crime_summary/2e0e8c8d-ef45-4e7a-b10a-d3faa0f1597a/MPS%20Ward%20Level%20Crime%20%28most%20recent%2024%20months%29.csv".to_string(),
            filename: "MPS Ward Level Crime.csv".to_string(),
        },
    ]
}

impl PipelineConfig {
    /// Load configuration from `path` if it exists, otherwise use defaults.
    /// Environment overrides are applied last.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                ScraperError::Config(format!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            info!("Loaded configuration from {}", path.display());
            Self::from_toml(&content)?
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env();
        config.finalize()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: PipelineConfig = toml::from_str(content)?;
        config.finalize()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("CRIME_DATASET_URL") {
            if !url.trim().is_empty() {
                self.dataset_url = url;
            }
        }
        if let Ok(db) = std::env::var("CRIME_DB_PATH") {
            if !db.trim().is_empty() {
                self.database_path = PathBuf::from(db);
            }
        }
        if let Ok(dir) = std::env::var("CRIME_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(chrome) = std::env::var("CRIME_CHROME_PATH") {
            if !chrome.trim().is_empty() {
                self.renderer.chrome_path = Some(PathBuf::from(chrome));
            }
        }
    }

    /// Fill derived fields and reject configurations the pipeline cannot run with.
    fn finalize(&mut self) -> Result<()> {
        for category in &mut self.categories {
            if category.table_name.trim().is_empty() {
                category.table_name = constants::default_table_for(&category.id);
            }
        }
        if self.categories.is_empty() {
            return Err(ScraperError::Config("at least one category is required".into()));
        }
        if self.category(&self.combine.primary).is_none() {
            return Err(ScraperError::Config(format!(
                "combine.primary '{}' is not a declared category",
                self.combine.primary
            )));
        }
        if let Some(unknown) = self
            .combine
            .secondary
            .iter()
            .find(|id| self.category(id).is_none())
        {
            return Err(ScraperError::Config(format!(
                "combine.secondary '{unknown}' is not a declared category"
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ScraperError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.download.poll_interval_ms == 0 {
            return Err(ScraperError::Config("download.poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn category(&self, id: &str) -> Option<&DatasetCategory> {
        self.categories.iter().find(|c| c.id == id)
    }

    /// Directory the browser writes transfers into.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    /// Where the completed file for a category is materialized.
    pub fn local_path_for(&self, category: &str) -> PathBuf {
        self.data_dir.join(format!("{category}_data_latest.csv"))
    }

    pub fn report_path(&self) -> PathBuf {
        self.data_dir.join("last_run.json")
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }
}

impl RendererConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn challenge_wait(&self) -> Duration {
        Duration::from_secs(self.challenge_wait_secs)
    }
}

impl DownloadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
