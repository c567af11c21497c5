use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One of the tracked datasets on the portal page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetCategory {
    pub id: String,
    /// Fragment of the published filename that identifies this dataset
    pub name_fragment: String,
    /// Raw table the loaded file replaces; derived from the id when omitted
    #[serde(default)]
    pub table_name: String,
    /// Filename marker of the full-history release, if the category has one
    #[serde(default)]
    pub historical_marker: Option<String>,
}

impl DatasetCategory {
    pub fn is_historical_name(&self, filename: &str) -> bool {
        match &self.historical_marker {
            Some(marker) => filename.to_lowercase().contains(&marker.to_lowercase()),
            None => false,
        }
    }
}

/// The selected download for one category in one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceDescriptor {
    pub category: String,
    pub source_url: String,
    pub observed_date: NaiveDate,
    pub filename: String,
    pub historical: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Date,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Date => "DATE",
        }
    }

    pub fn from_sql_type(decl: &str) -> Self {
        let upper = decl.to_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            ColumnType::Real
        } else if upper.contains("DATE") {
            ColumnType::Date
        } else {
            ColumnType::Text
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Date(NaiveDate),
}

impl CellValue {
    /// Text rendering used when a cell acts as an identifier.
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Integer(i) => i.to_string(),
            CellValue::Real(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

/// A whole table as loaded from a source file or read back from the store
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RawTable {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<CellValue>>,
}

impl RawTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One row of the combined long-format table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactRecord {
    pub region: String,
    pub major_category: String,
    pub minor_category: String,
    pub month: NaiveDate,
    pub count: u64,
}

impl FactRecord {
    pub fn table_columns() -> Vec<Column> {
        vec![
            Column { name: "region".into(), kind: ColumnType::Text },
            Column { name: "major_category".into(), kind: ColumnType::Text },
            Column { name: "minor_category".into(), kind: ColumnType::Text },
            Column { name: "month".into(), kind: ColumnType::Date },
            Column { name: "count".into(), kind: ColumnType::Integer },
        ]
    }

    pub fn into_table(records: Vec<FactRecord>) -> RawTable {
        let rows = records
            .into_iter()
            .map(|r| {
                vec![
                    CellValue::Text(r.region),
                    CellValue::Text(r.major_category),
                    CellValue::Text(r.minor_category),
                    CellValue::Date(r.month),
                    CellValue::Integer(r.count as i64),
                ]
            })
            .collect();
        RawTable {
            columns: Self::table_columns(),
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_historical_marker_is_case_insensitive() {
        let category = DatasetCategory {
            id: "borough".into(),
            name_fragment: "MPS Borough Level Crime".into(),
            table_name: "crime_borough_historical".into(),
            historical_marker: Some("historical".into()),
        };
        assert!(category.is_historical_name("MPS Borough Level Crime (Historical).csv"));
        assert!(!category.is_historical_name("MPS Borough Level Crime (most recent 24 months).csv"));
    }

    #[test]
    fn test_sql_type_round_trip() {
        for kind in [ColumnType::Integer, ColumnType::Real, ColumnType::Text, ColumnType::Date] {
            assert_eq!(ColumnType::from_sql_type(kind.sql_type()), kind);
        }
    }
}
