use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::common::error::{Result, ScraperError};
use crate::common::types::{CellValue, FactRecord, RawTable};

static MONTH_COLUMN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{6}$").unwrap());

/// Accepted names for the identifier columns, in priority order.
#[derive(Debug, Clone)]
pub struct ColumnAliases {
    pub region: Vec<String>,
    pub major: Vec<String>,
    pub minor: Vec<String>,
}

/// What a reshape consumed and what it had to skip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeltStats {
    pub source_rows: usize,
    pub month_columns: usize,
    /// Six-digit labels that are not a real year-month, e.g. `201913`
    pub invalid_months: Vec<String>,
    /// Rows with a blank region or category identifier
    pub skipped_rows: usize,
}

fn resolve_column(table: &RawTable, table_name: &str, aliases: &[String]) -> Result<usize> {
    aliases
        .iter()
        .find_map(|alias| table.column_index(alias))
        .ok_or_else(|| ScraperError::MissingColumn {
            table: table_name.to_string(),
            candidates: aliases.to_vec(),
        })
}

/// First day of the month named by a six-digit `YYYYMM` label.
pub fn parse_month(label: &str) -> Option<NaiveDate> {
    if !MONTH_COLUMN.is_match(label) {
        return None;
    }
    NaiveDate::parse_from_str(&format!("{label}01"), "%Y%m%d").ok()
}

/// Non-negative integer count from whatever the loader inferred.
pub fn coerce_count(value: &CellValue) -> u64 {
    match value {
        CellValue::Integer(i) => (*i).max(0) as u64,
        CellValue::Real(f) if f.is_finite() && *f > 0.0 => f.round() as u64,
        CellValue::Text(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                i.max(0) as u64
            } else {
                match s.parse::<f64>() {
                    Ok(f) if f.is_finite() && f > 0.0 => f.round() as u64,
                    _ => 0,
                }
            }
        }
        _ => 0,
    }
}

/// Reshape a wide table (one column per month) into one record per
/// `(row, month)`. Labels are taken as-is; normalization happens later.
pub fn melt(
    table: &RawTable,
    table_name: &str,
    aliases: &ColumnAliases,
) -> Result<(Vec<FactRecord>, MeltStats)> {
    let region_idx = resolve_column(table, table_name, &aliases.region)?;
    let major_idx = resolve_column(table, table_name, &aliases.major)?;
    let minor_idx = resolve_column(table, table_name, &aliases.minor)?;

    let mut stats = MeltStats {
        source_rows: table.rows.len(),
        ..MeltStats::default()
    };

    let mut months: Vec<(usize, NaiveDate)> = Vec::new();
    for (idx, column) in table.columns.iter().enumerate() {
        if !MONTH_COLUMN.is_match(&column.name) {
            continue;
        }
        match parse_month(&column.name) {
            Some(month) => months.push((idx, month)),
            None => stats.invalid_months.push(column.name.clone()),
        }
    }
    stats.month_columns = months.len();

    if !stats.invalid_months.is_empty() {
        warn!(
            "Skipping {} unparsable month column(s) in '{}': {:?}",
            stats.invalid_months.len(),
            table_name,
            stats.invalid_months
        );
    }
    if months.is_empty() {
        warn!("No month columns found in '{}'", table_name);
    }

    let mut records = Vec::with_capacity(table.rows.len() * months.len());
    for row in &table.rows {
        let region = row[region_idx].as_text();
        let major = row[major_idx].as_text();
        let minor = row[minor_idx].as_text();
        if region.trim().is_empty() || major.trim().is_empty() || minor.trim().is_empty() {
            stats.skipped_rows += 1;
            continue;
        }
        for (idx, month) in &months {
            records.push(FactRecord {
                region: region.clone(),
                major_category: major.clone(),
                minor_category: minor.clone(),
                month: *month,
                count: coerce_count(&row[*idx]),
            });
        }
    }

    debug!(
        "Melted '{}': {} rows x {} months -> {} records ({} skipped rows)",
        table_name,
        stats.source_rows,
        stats.month_columns,
        records.len(),
        stats.skipped_rows
    );
    Ok((records, stats))
}

/// Sum counts per `(region, major, minor, month)`. Output is sorted by
/// `(region, month, major, minor)`.
pub fn aggregate<I>(records: I) -> Vec<FactRecord>
where
    I: IntoIterator<Item = FactRecord>,
{
    let mut totals: BTreeMap<(String, NaiveDate, String, String), u64> = BTreeMap::new();
    for r in records {
        *totals
            .entry((r.region, r.month, r.major_category, r.minor_category))
            .or_insert(0) += r.count;
    }
    totals
        .into_iter()
        .map(|((region, month, major_category, minor_category), count)| FactRecord {
            region,
            major_category,
            minor_category,
            month,
            count,
        })
        .collect()
}
