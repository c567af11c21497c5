// Crime data pipeline: resource discovery and retrieval, then loading and combination

pub mod ingestion;
pub mod processing;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::app::ports::{SessionFactory, TableStore};
use crate::common::error::{Result, ScraperError};
use crate::common::types::{DatasetCategory, ResourceDescriptor};
use crate::config::PipelineConfig;
use ingestion::{Backoff, DownloadManager, LocatedResources, PageRendererClient, PatternMatcher, ResourceLocator};
use processing::{CombineReport, LoadOutcome, NormalizationEngine, TableLoader};

/// Overall result of a run, as seen by whatever schedules it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// At least one category or the combination step failed
    PartialFailure,
    /// The environment is unusable (no browser, unwritable disk, bad config)
    HardFailure,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::PartialFailure => 1,
            RunOutcome::HardFailure => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum CategoryStatus {
    Loaded,
    /// Downloaded an empty file; the stored table was left alone
    Empty,
    NotFound,
    Failed { stage: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub category: String,
    pub table: String,
    pub status: CategoryStatus,
    pub source: Option<ResourceDescriptor>,
    pub used_fallback: bool,
    pub bytes: Option<u64>,
    pub sha256: Option<String>,
    pub rows: Option<usize>,
    pub columns: Option<usize>,
}

impl CategoryReport {
    fn new(category: &DatasetCategory) -> Self {
        Self {
            category: category.id.clone(),
            table: category.table_name.clone(),
            status: CategoryStatus::NotFound,
            source: None,
            used_fallback: false,
            bytes: None,
            sha256: None,
            rows: None,
            columns: None,
        }
    }

    fn fail(&mut self, stage: &str, error: &ScraperError) {
        self.status = CategoryStatus::Failed {
            stage: stage.to_string(),
            error: error.to_string(),
        };
    }

    fn succeeded(&self) -> bool {
        matches!(self.status, CategoryStatus::Loaded | CategoryStatus::Empty)
    }
}

/// Everything one run did, written to `<data_dir>/last_run.json`
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub used_fallback_resources: bool,
    pub categories: Vec<CategoryReport>,
    pub combine: Option<CombineReport>,
    pub combine_error: Option<String>,
    pub fatal_error: Option<String>,
    pub outcome: RunOutcome,
}

impl RunReport {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            used_fallback_resources: false,
            categories: Vec::new(),
            combine: None,
            combine_error: None,
            fatal_error: None,
            outcome: RunOutcome::Success,
        }
    }

    fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.outcome = if self.fatal_error.is_some() {
            RunOutcome::HardFailure
        } else if self.combine_error.is_some() || self.categories.iter().any(|c| !c.succeeded()) {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        };
    }

    /// Write the report as pretty JSON, creating the parent directory.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Locate, download, load and combine in one sequential run.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    backoff: Backoff,
    renderer: PageRendererClient,
    locator: ResourceLocator,
    downloads: DownloadManager,
    loader: TableLoader,
    engine: NormalizationEngine,
    store: Arc<dyn TableStore>,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        sessions: Arc<dyn SessionFactory>,
        store: Arc<dyn TableStore>,
    ) -> Result<Self> {
        let matcher = PatternMatcher::new(&config.categories)?;
        Ok(Self {
            backoff: Backoff::from_config(&config.retry),
            renderer: PageRendererClient::new(Arc::clone(&sessions), config.renderer.clone()),
            locator: ResourceLocator::new(matcher, &config.locator)?,
            downloads: DownloadManager::new(
                sessions,
                config.download.clone(),
                config.staging_dir(),
                config.renderer.navigation_timeout(),
            ),
            loader: TableLoader::new(Arc::clone(&store)),
            engine: NormalizationEngine::from_config(&config)?,
            store,
            config,
        })
    }

    /// Find one resource per category on the dataset page. When the page
    /// stays unavailable, fall back to the configured direct URLs.
    /// Returns the selection and whether the fallback was used.
    #[instrument(skip(self))]
    pub async fn locate(&self) -> Result<(LocatedResources, bool)> {
        match self
            .locator
            .locate(&self.renderer, &self.backoff, &self.config.dataset_url)
            .await
        {
            Ok(found) => Ok((found, false)),
            Err(e) if e.is_environment() => Err(e),
            Err(e) => {
                warn!("Dataset page unavailable ({}), using fallback resources", e);
                Ok((self.fallback_resources(), true))
            }
        }
    }

    /// Known direct downloads, dated today.
    pub fn fallback_resources(&self) -> LocatedResources {
        let today = Utc::now().date_naive();
        self.config
            .categories
            .iter()
            .map(|category| {
                let descriptor = self
                    .config
                    .fallback_resources
                    .iter()
                    .find(|f| f.category == category.id)
                    .map(|f| ResourceDescriptor {
                        category: category.id.clone(),
                        source_url: f.url.clone(),
                        observed_date: today,
                        filename: f.filename.clone(),
                        historical: category.is_historical_name(&f.filename),
                    });
                (category.id.clone(), descriptor)
            })
            .collect()
    }

    /// Run every stage and produce a report. Never panics on stage errors;
    /// they are recorded and reflected in the outcome.
    pub async fn run(&self) -> RunReport {
        let mut report = RunReport::new();
        let span = info_span!("run", run_id = %report.run_id);
        self.run_stages(&mut report).instrument(span).await;
        report.finish();

        let path = self.config.report_path();
        match report.write_to(&path) {
            Ok(()) => info!("Run report written to {}", path.display()),
            Err(e) => warn!("Failed to write run report to {}: {}", path.display(), e),
        }
        info!(
            run_id = %report.run_id,
            outcome = ?report.outcome,
            "Run finished: {}/{} categories loaded",
            report.categories.iter().filter(|c| c.succeeded()).count(),
            report.categories.len()
        );
        report
    }

    async fn run_stages(&self, report: &mut RunReport) {
        info!("Starting crime data pipeline for {}", self.config.dataset_url);

        let (located, fallback) = match self.locate().await {
            Ok(found) => found,
            Err(e) => {
                error!("Resource location failed: {}", e);
                report.fatal_error = Some(e.to_string());
                return;
            }
        };
        report.used_fallback_resources = fallback;

        for category in &self.config.categories {
            let mut entry = CategoryReport::new(category);
            entry.used_fallback = fallback;
            let descriptor = located.get(&category.id).cloned().flatten();

            let fatal = match descriptor {
                None => {
                    warn!(category = %category.id, "No resource found, skipping");
                    None
                }
                Some(descriptor) => {
                    entry.source = Some(descriptor.clone());
                    let span = info_span!("category", category = %category.id);
                    self.process_category(category, &descriptor, &mut entry)
                        .instrument(span)
                        .await
                }
            };
            report.categories.push(entry);

            if let Some(e) = fatal {
                error!("Aborting run: {}", e);
                report.fatal_error = Some(e.to_string());
                return;
            }
        }

        let primary_ok = report
            .categories
            .iter()
            .any(|c| c.category == self.config.combine.primary && c.succeeded());
        if !primary_ok {
            let reason = format!(
                "primary category '{}' was not loaded in this run",
                self.config.combine.primary
            );
            warn!("Skipping combination: {}", reason);
            report.combine_error = Some(reason);
            return;
        }

        match self.combine().await {
            Ok(combined) => report.combine = Some(combined),
            Err(e) if e.is_environment() => {
                error!("Combination failed: {}", e);
                report.fatal_error = Some(e.to_string());
            }
            Err(e) => {
                error!("Combination failed: {}", e);
                report.combine_error = Some(e.to_string());
            }
        }
    }

    /// Download and load one category. Returns an error only when it is
    /// fatal for the whole run; anything else is recorded in `entry`.
    async fn process_category(
        &self,
        category: &DatasetCategory,
        descriptor: &ResourceDescriptor,
        entry: &mut CategoryReport,
    ) -> Option<ScraperError> {
        info!("Downloading {} from {}", descriptor.filename, descriptor.source_url);
        let target = self.config.local_path_for(&category.id);

        let file = match self
            .downloads
            .download(&self.backoff, &descriptor.source_url, &target)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                error!("Download failed: {}", e);
                entry.fail("download", &e);
                return e.is_environment().then_some(e);
            }
        };
        entry.bytes = Some(file.bytes);
        entry.sha256 = Some(file.sha256.clone());

        match self.loader.load_file(&file.path, &category.table_name).await {
            Ok(LoadOutcome::Loaded { rows, columns }) => {
                entry.status = CategoryStatus::Loaded;
                entry.rows = Some(rows);
                entry.columns = Some(columns);
            }
            Ok(LoadOutcome::Empty) => entry.status = CategoryStatus::Empty,
            Err(e) => {
                error!("Load into '{}' failed: {}", category.table_name, e);
                entry.fail("load", &e);
                return e.is_environment().then_some(e);
            }
        }

        if !self.config.download.keep_downloads {
            match fs::remove_file(&file.path) {
                Ok(()) => info!("Removed temporary file {}", file.path.display()),
                Err(e) => warn!("Could not remove {}: {}", file.path.display(), e),
            }
        }
        None
    }

    /// Load a local file into a category's table.
    pub async fn load_local(&self, category: &str, path: &Path) -> Result<LoadOutcome> {
        let category = self
            .config
            .category(category)
            .ok_or_else(|| ScraperError::Config(format!("unknown category '{category}'")))?;
        self.loader.load_file(path, &category.table_name).await
    }

    /// Rebuild the combined fact table from whatever raw tables are stored.
    pub async fn combine(&self) -> Result<CombineReport> {
        self.engine.run(self.store.as_ref()).await
    }
}
