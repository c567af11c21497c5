use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crime_scraper::app::ports::{RenderSession, SessionFactory, TableStore};
use crime_scraper::common::error::{PageFailure, Result, ScraperError};
use crime_scraper::common::types::CellValue;
use crime_scraper::config::PipelineConfig;
use crime_scraper::infra::memory_store::InMemoryTableStore;
use crime_scraper::pipeline::{CategoryStatus, Pipeline, RunOutcome};

const BOROUGH_URL: &str = "https://data.london.gov.uk/download/recorded_crime_summary/a1/MPS%20Borough%20Level%20Crime%20(Historical).csv";
const WARD_URL: &str = "https://data.london.gov.uk/download/recorded_crime_summary/b2/MPS%20Ward%20Level%20Crime%20(most%20recent%2024%20months).csv";
const LSOA_URL: &str = "https://data.london.gov.uk/download/recorded_crime_summary/c3/MPS%20LSOA%20Level%20Crime%20(most%20recent%2024%20months).csv";

const BOROUGH_CSV: &str = "MajorText,MinorText,BoroughName,202401,202402\n\
Theft,Theft From The Person,Camden,5,0\n\
Burglary,Burglary In A Dwelling,Barnet,2,3\n\
Theft,Bicycle Theft,London Heathrow and London City Airports,4,4\n";

const WARD_CSV: &str = "WardCode,WardName,LookUp_BoroughName,MajorText,MinorText,202402\n\
E05000128,Belsize,Camden,Theft,Theft from the person,1\n";

const LSOA_CSV: &str = "LSOA Code,Borough,Major Category,Minor Category,202402\n\
E01000001,City of London,Theft,Bicycle Theft,2\n";

fn listing(items: &[(&str, &str)]) -> String {
    let body: String = items
        .iter()
        .map(|(url, coverage)| {
            format!(
                "<div class=\"dp-container\">\
                   <a class=\"dp-resource__format\" href=\"{url}\">CSV</a>\
                   <div class=\"dp-temporalcoverage\">{coverage}</div>\
                 </div>"
            )
        })
        .collect();
    format!("<html><head><title>Recorded Crime: Summary Data</title></head><body>{body}</body></html>")
}

/// Serves a fixed listing page and a set of downloadable files.
#[derive(Default)]
struct FakePortal {
    page: Option<String>,
    files: HashMap<String, String>,
    browser_missing: bool,
}

struct FakeSession {
    portal: Arc<FakePortal>,
    download_dir: Option<PathBuf>,
    body: String,
}

struct FakeFactory(Arc<FakePortal>);

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn open(&self, download_dir: Option<&Path>) -> Result<Box<dyn RenderSession>> {
        if self.0.browser_missing {
            return Err(ScraperError::BrowserSetup("no Chrome/Chromium binary found".into()));
        }
        Ok(Box::new(FakeSession {
            portal: Arc::clone(&self.0),
            download_dir: download_dir.map(Path::to_path_buf),
            body: String::new(),
        }))
    }
}

#[async_trait]
impl RenderSession for FakeSession {
    async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<()> {
        match &self.download_dir {
            Some(dir) => {
                let content = self.portal.files.get(url).ok_or_else(|| {
                    ScraperError::page(PageFailure::Navigation, format!("404 for {url}"))
                })?;
                let name = url.rsplit('/').next().unwrap_or("download.csv");
                let name = urlencoding::decode(name).unwrap().into_owned();
                std::fs::write(dir.join(name), content)?;
                Ok(())
            }
            None => match &self.portal.page {
                Some(page) => {
                    self.body = page.clone();
                    Ok(())
                }
                None => Err(ScraperError::page(PageFailure::Navigation, "403 Forbidden")),
            },
        }
    }

    async fn wait_for_selector(&mut self, _selector: &str, _timeout: Duration) -> Result<bool> {
        Ok(self.body.contains("dp-container"))
    }

    async fn click_if_present(&mut self, _selector: &str) -> Result<bool> {
        Ok(false)
    }

    async fn title(&mut self) -> Result<String> {
        Ok("Recorded Crime: Summary Data".to_string())
    }

    async fn content(&mut self) -> Result<String> {
        Ok(self.body.clone())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn test_config(data_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.data_dir = data_dir.to_path_buf();
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 1;
    config.retry.max_jitter_ms = 0;
    config.download.poll_interval_ms = 10;
    config.download.timeout_secs = 2;
    config.download.min_file_bytes = 1;
    config.renderer.challenge_wait_secs = 0;
    config
}

fn full_portal() -> FakePortal {
    FakePortal {
        page: Some(listing(&[
            (BOROUGH_URL, "From 01/04/2010 To 31/01/2024"),
            (WARD_URL, "From 01/03/2022 To 29/02/2024"),
            (LSOA_URL, "From 01/03/2022 To 29/02/2024"),
        ])),
        files: HashMap::from([
            (BOROUGH_URL.to_string(), BOROUGH_CSV.to_string()),
            (WARD_URL.to_string(), WARD_CSV.to_string()),
            (LSOA_URL.to_string(), LSOA_CSV.to_string()),
        ]),
        browser_missing: false,
    }
}

fn pipeline(portal: FakePortal, dir: &TempDir, store: Arc<InMemoryTableStore>) -> Pipeline {
    let sessions: Arc<dyn SessionFactory> = Arc::new(FakeFactory(Arc::new(portal)));
    Pipeline::new(Arc::new(test_config(dir.path())), sessions, store).unwrap()
}

fn month(y: i32, m: u32) -> CellValue {
    CellValue::Date(NaiveDate::from_ymd_opt(y, m, 1).unwrap())
}

fn text(s: &str) -> CellValue {
    CellValue::Text(s.to_string())
}

#[tokio::test]
async fn test_full_run_builds_combined_table() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let report = pipeline(full_portal(), &dir, store.clone()).run().await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert!(!report.used_fallback_resources);
    assert!(report
        .categories
        .iter()
        .all(|c| c.status == CategoryStatus::Loaded));

    let ward = store.read_table("crime_ward").await.unwrap().unwrap();
    assert_eq!(
        ward.column_names(),
        vec!["wardcode", "wardname", "lookup_boroughname", "majortext", "minortext", "202402"]
    );

    let combined = store.read_table("crime_borough_combined").await.unwrap().unwrap();
    assert_eq!(
        combined.rows,
        vec![
            vec![text("Barnet"), text("Burglary"), text("Domestic Burglary"), month(2024, 1), CellValue::Integer(2)],
            vec![text("Barnet"), text("Burglary"), text("Domestic Burglary"), month(2024, 2), CellValue::Integer(3)],
            vec![text("Camden"), text("Theft"), text("Theft From Person"), month(2024, 1), CellValue::Integer(5)],
            vec![text("Camden"), text("Theft"), text("Theft From Person"), month(2024, 2), CellValue::Integer(1)],
        ]
    );

    // Temporary downloads are removed once loaded; the report stays
    assert!(!dir.path().join("borough_data_latest.csv").exists());
    let saved = std::fs::read_to_string(dir.path().join("last_run.json")).unwrap();
    let saved: serde_json::Value = serde_json::from_str(&saved).unwrap();
    assert_eq!(saved["outcome"], "success");
    assert_eq!(saved["combine"]["fact_rows"], 4);
}

#[tokio::test]
async fn test_unavailable_page_falls_back_to_direct_urls() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let defaults = PipelineConfig::default();
    let borough_fallback = defaults
        .fallback_resources
        .iter()
        .find(|f| f.category == "borough")
        .unwrap()
        .url
        .clone();

    // Only the borough file is reachable
    let portal = FakePortal {
        page: None,
        files: HashMap::from([(borough_fallback, BOROUGH_CSV.to_string())]),
        browser_missing: false,
    };
    let report = pipeline(portal, &dir, store.clone()).run().await;

    assert!(report.used_fallback_resources);
    assert_eq!(report.outcome, RunOutcome::PartialFailure);
    let statuses: HashMap<_, _> = report
        .categories
        .iter()
        .map(|c| (c.category.as_str(), c.status.clone()))
        .collect();
    assert_eq!(statuses["borough"], CategoryStatus::Loaded);
    assert!(matches!(&statuses["ward"], CategoryStatus::Failed { stage, .. } if stage == "download"));

    // Combination still runs on the historical category alone
    let combine = report.combine.expect("combination should have run");
    assert_eq!(combine.missing_secondary, vec!["ward".to_string()]);
    assert!(store.table_exists("crime_borough_combined").await.unwrap());
}

#[tokio::test]
async fn test_missing_browser_is_a_hard_failure() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let portal = FakePortal {
        browser_missing: true,
        ..full_portal()
    };
    let report = pipeline(portal, &dir, store.clone()).run().await;

    assert_eq!(report.outcome, RunOutcome::HardFailure);
    assert_eq!(report.outcome.exit_code(), 2);
    assert!(report.fatal_error.is_some());
    assert!(store.table_names().await.is_empty());
}

#[tokio::test]
async fn test_missing_historical_category_skips_combination() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());

    let previous = crime_scraper::common::types::RawTable {
        columns: vec![],
        rows: vec![],
    };
    store.replace_table("crime_borough_combined", &previous).await.unwrap();

    let portal = FakePortal {
        page: Some(listing(&[(WARD_URL, "From 01/03/2022 To 29/02/2024")])),
        ..full_portal()
    };
    let report = pipeline(portal, &dir, store.clone()).run().await;

    assert_eq!(report.outcome, RunOutcome::PartialFailure);
    let borough = report.categories.iter().find(|c| c.category == "borough").unwrap();
    assert_eq!(borough.status, CategoryStatus::NotFound);
    assert!(report.combine.is_none());
    assert!(report.combine_error.is_some());
    assert_eq!(
        store.read_table("crime_borough_combined").await.unwrap().unwrap(),
        previous
    );
    assert!(store.table_exists("crime_ward").await.unwrap());
}

#[tokio::test]
async fn test_load_and_combine_from_local_files() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryTableStore::new());
    let pipeline = pipeline(FakePortal::default(), &dir, store.clone());

    let file = dir.path().join("borough.csv");
    std::fs::write(&file, BOROUGH_CSV).unwrap();
    pipeline.load_local("borough", &file).await.unwrap();

    let report = pipeline.combine().await.unwrap();
    assert_eq!(report.fact_rows, 3);
    assert_eq!(report.excluded_rows, 2);
    assert_eq!(report.zero_count_rows, 1);

    assert!(matches!(
        pipeline.load_local("county", &file).await,
        Err(ScraperError::Config(_))
    ));
}
