//! Category identifiers and defaults shared across the codebase

// Category ids (used in config, logs and the run report)
pub const BOROUGH_CATEGORY: &str = "borough";
pub const LSOA_CATEGORY: &str = "lsoa";
pub const WARD_CATEGORY: &str = "ward";

// Raw table names
pub const BOROUGH_TABLE: &str = "crime_borough_historical";
pub const LSOA_TABLE: &str = "crime_lsoa";
pub const WARD_TABLE: &str = "crime_ward";

// Derived fact table
pub const COMBINED_TABLE: &str = "crime_borough_combined";

// Published filename fragments
pub const BOROUGH_FRAGMENT: &str = "MPS Borough Level Crime";
pub const LSOA_FRAGMENT: &str = "MPS LSOA Level Crime";
pub const WARD_FRAGMENT: &str = "MPS Ward Level Crime";

pub const HISTORICAL_MARKER: &str = "historical";

pub const DATASET_URL: &str = "https://data.london.gov.uk/dataset/recorded_crime_summary";
pub const DB_PATH: &str = "data/london_crime_data.db";
pub const DATA_DIR: &str = "data";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Non-geographic units that never belong in the borough fact table
pub const EXCLUDED_REGIONS: [&str; 2] = [
    "London Heathrow and London City Airports",
    "Aviation Security (SO18)",
];

/// Get the default table name for a category id
pub fn default_table_for(category: &str) -> String {
    match category {
        BOROUGH_CATEGORY => BOROUGH_TABLE.to_string(),
        LSOA_CATEGORY => LSOA_TABLE.to_string(),
        WARD_CATEGORY => WARD_TABLE.to_string(),
        other => format!("crime_{other}"),
    }
}
