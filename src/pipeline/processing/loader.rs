use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::app::ports::TableStore;
use crate::common::error::Result;
use crate::common::types::{CellValue, Column, ColumnType, RawTable};

static UNNAMED_COLUMN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^unnamed_?\d*$").unwrap());
static NON_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9_]").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The file had no header row; nothing was written
    Empty,
    Loaded { rows: usize, columns: usize },
}

/// Loads delimited source files into the table store.
pub struct TableLoader {
    store: Arc<dyn TableStore>,
}

impl TableLoader {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    /// Parse `path` and replace `table_name` with its contents.
    #[instrument(skip(self))]
    pub async fn load_file(&self, path: &Path, table_name: &str) -> Result<LoadOutcome> {
        let bytes = fs::read(path)?;
        let text = decode_bytes(&bytes);
        let Some(table) = parse_table(&text)? else {
            warn!("CSV file is empty: {}", path.display());
            return Ok(LoadOutcome::Empty);
        };

        let outcome = LoadOutcome::Loaded {
            rows: table.rows.len(),
            columns: table.columns.len(),
        };
        self.store.replace_table(table_name, &table).await?;
        info!(
            "Loaded {} rows x {} columns from '{}' into table '{}'",
            table.rows.len(),
            table.columns.len(),
            path.display(),
            table_name
        );
        Ok(outcome)
    }
}

/// UTF-8 first (ignoring a byte-order mark), Latin-1 otherwise.
pub fn decode_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            debug!("Input is not valid UTF-8, decoding as Latin-1");
            bytes.iter().map(|&b| b as char).collect()
        }
    }
}

/// Lower-case, spaces to underscores, everything else non-alphanumeric dropped.
pub fn clean_column_name(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase().replace(' ', "_");
    NON_IDENT.replace_all(&lowered, "").into_owned()
}

fn is_placeholder(name: &str) -> bool {
    name.is_empty() || UNNAMED_COLUMN.is_match(name)
}

/// Parse comma-separated text into a typed table. `None` when there is no header.
pub fn parse_table(text: &str) -> Result<Option<RawTable>> {
    if text.trim().is_empty() {
        return Ok(None);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Ok(None);
    }

    // Keep (source index, cleaned name) for every retained column
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept: Vec<(usize, String)> = Vec::new();
    for (idx, raw) in headers.iter().enumerate() {
        let cleaned = clean_column_name(raw);
        if is_placeholder(&cleaned) {
            debug!("Dropping placeholder column '{}'", raw);
            continue;
        }
        let mut name = cleaned.clone();
        let mut suffix = 2;
        while !seen.insert(name.clone()) {
            name = format!("{cleaned}_{suffix}");
            suffix += 1;
        }
        kept.push((idx, name));
    }

    let mut raw_rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record?;
        raw_rows.push(
            kept.iter()
                .map(|(idx, _)| record.get(*idx).unwrap_or("").to_string())
                .collect(),
        );
    }

    let kinds: Vec<ColumnType> = (0..kept.len())
        .map(|col| infer_type(raw_rows.iter().map(|row| row[col].as_str())))
        .collect();

    let rows = raw_rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .zip(&kinds)
                .map(|(value, kind)| convert(value, *kind))
                .collect()
        })
        .collect();

    let columns = kept
        .into_iter()
        .zip(kinds)
        .map(|((_, name), kind)| Column { name, kind })
        .collect();

    Ok(Some(RawTable { columns, rows }))
}

fn infer_type<'a>(values: impl Iterator<Item = &'a str>) -> ColumnType {
    let mut all_int = true;
    let mut all_real = true;
    let mut any = false;
    for v in values.filter(|v| !v.is_empty()) {
        any = true;
        if all_int && v.parse::<i64>().is_err() {
            all_int = false;
        }
        if all_real && v.parse::<f64>().is_err() {
            all_real = false;
        }
        if !all_int && !all_real {
            break;
        }
    }
    match (any, all_int, all_real) {
        (false, _, _) => ColumnType::Text,
        (true, true, _) => ColumnType::Integer,
        (true, false, true) => ColumnType::Real,
        _ => ColumnType::Text,
    }
}

fn convert(value: String, kind: ColumnType) -> CellValue {
    if value.is_empty() {
        return CellValue::Null;
    }
    match kind {
        ColumnType::Integer => value.parse().map(CellValue::Integer).unwrap_or(CellValue::Text(value)),
        ColumnType::Real => value.parse().map(CellValue::Real).unwrap_or(CellValue::Text(value)),
        _ => CellValue::Text(value),
    }
}
