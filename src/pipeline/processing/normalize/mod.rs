//! Wide-to-long reshaping, label canonicalization and aggregation of the
//! loaded category tables into the combined fact table.

pub mod labels;
pub mod mapping;
pub mod melt;

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{info, instrument, warn};

use crate::app::ports::TableStore;
use crate::common::error::{Result, ScraperError};
use crate::common::types::FactRecord;
use crate::config::PipelineConfig;

pub use labels::normalize_label;
pub use mapping::CategoryMapping;
pub use melt::{aggregate, melt, ColumnAliases, MeltStats};

/// Summary of one combination run
#[derive(Debug, Clone, Default, Serialize)]
pub struct CombineReport {
    pub primary_records: usize,
    /// Records contributed per secondary category after region roll-up
    pub secondary_records: BTreeMap<String, usize>,
    pub missing_secondary: Vec<String>,
    pub invalid_month_columns: Vec<String>,
    pub unmapped_labels: Vec<String>,
    pub zero_count_rows: usize,
    pub excluded_rows: usize,
    pub fact_rows: usize,
}

/// Builds the combined fact table from the raw category tables.
pub struct NormalizationEngine {
    primary_table: String,
    /// (category id, raw table name)
    secondary_tables: Vec<(String, String)>,
    aliases: ColumnAliases,
    excluded_regions: HashSet<String>,
    mapping: CategoryMapping,
    output_table: String,
}

impl NormalizationEngine {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let table_for = |id: &str| -> Result<String> {
            config
                .category(id)
                .map(|c| c.table_name.clone())
                .ok_or_else(|| ScraperError::Config(format!("unknown combine category '{id}'")))
        };

        let secondary_tables = config
            .combine
            .secondary
            .iter()
            .map(|id| Ok((id.clone(), table_for(id)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            primary_table: table_for(&config.combine.primary)?,
            secondary_tables,
            aliases: ColumnAliases {
                region: config.combine.region_columns.clone(),
                major: config.combine.major_columns.clone(),
                minor: config.combine.minor_columns.clone(),
            },
            excluded_regions: config
                .combine
                .excluded_regions
                .iter()
                .map(|r| normalize_label(r))
                .collect(),
            mapping: CategoryMapping::from_config(&config.mapping)?,
            output_table: config.combine.output_table.clone(),
        })
    }

    pub fn output_table(&self) -> &str {
        &self.output_table
    }

    /// Read the raw tables, combine them and replace the output table.
    /// Nothing is written unless every step succeeds.
    #[instrument(skip(self, store), fields(output = %self.output_table))]
    pub async fn run(&self, store: &dyn TableStore) -> Result<CombineReport> {
        let mut report = CombineReport::default();

        let primary = store
            .read_table(&self.primary_table)
            .await?
            .ok_or_else(|| ScraperError::MissingTable(self.primary_table.clone()))?;
        if primary.is_empty() {
            return Err(ScraperError::EmptyTable(self.primary_table.clone()));
        }

        let (mut working, stats) = melt(&primary, &self.primary_table, &self.aliases)?;
        report.primary_records = working.len();
        report.invalid_month_columns.extend(stats.invalid_months);

        for (id, table_name) in &self.secondary_tables {
            let Some(table) = store.read_table(table_name).await? else {
                warn!("Secondary table '{}' not found, combining without it", table_name);
                report.missing_secondary.push(id.clone());
                continue;
            };
            if table.is_empty() {
                warn!("Secondary table '{}' is empty, combining without it", table_name);
                report.missing_secondary.push(id.clone());
                continue;
            }
            let (records, stats) = melt(&table, table_name, &self.aliases)?;
            let rolled_up = aggregate(records);
            info!(
                "Rolled '{}' up to {} region-level records",
                table_name,
                rolled_up.len()
            );
            report.secondary_records.insert(id.clone(), rolled_up.len());
            report.invalid_month_columns.extend(stats.invalid_months);
            working.extend(rolled_up);
        }

        let mut mapping = self.mapping.clone();
        let normalized = working.into_iter().map(|r| {
            let minor = normalize_label(&r.minor_category);
            FactRecord {
                region: normalize_label(&r.region),
                major_category: normalize_label(&r.major_category),
                minor_category: mapping.apply(&minor),
                month: r.month,
                count: r.count,
            }
        });
        let aggregated = aggregate(normalized.collect::<Vec<_>>());

        report.unmapped_labels = mapping.unmapped();
        if !report.unmapped_labels.is_empty() {
            info!(
                "{} minor categories have no mapping entry: {:?}",
                report.unmapped_labels.len(),
                report.unmapped_labels
            );
        }

        let mut facts = Vec::with_capacity(aggregated.len());
        for record in aggregated {
            if record.count == 0 {
                report.zero_count_rows += 1;
            } else if self.excluded_regions.contains(&record.region) {
                report.excluded_rows += 1;
            } else {
                facts.push(record);
            }
        }

        if facts.is_empty() {
            return Err(ScraperError::EmptyResult);
        }

        report.fact_rows = facts.len();
        store
            .replace_table(&self.output_table, &FactRecord::into_table(facts))
            .await?;

        info!(
            "Wrote {} fact rows to '{}' ({} zero-count, {} excluded)",
            report.fact_rows, self.output_table, report.zero_count_rows, report.excluded_rows
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{CellValue, Column, ColumnType, RawTable};
    use crate::infra::memory_store::InMemoryTableStore;
    use chrono::NaiveDate;

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    fn table(region_col: &str, months: &[&str], rows: Vec<(&str, &str, &str, Vec<i64>)>) -> RawTable {
        let mut columns = vec![
            Column { name: region_col.into(), kind: ColumnType::Text },
            Column { name: "majortext".into(), kind: ColumnType::Text },
            Column { name: "minortext".into(), kind: ColumnType::Text },
        ];
        columns.extend(months.iter().map(|m| Column { name: m.to_string(), kind: ColumnType::Integer }));
        let rows = rows
            .into_iter()
            .map(|(region, major, minor, counts)| {
                let mut row = vec![text(region), text(major), text(minor)];
                row.extend(counts.into_iter().map(CellValue::Integer));
                row
            })
            .collect();
        RawTable { columns, rows }
    }

    fn engine(entries: &[(&str, &str)]) -> NormalizationEngine {
        let mut config = PipelineConfig::default();
        for (raw, canonical) in entries {
            config.mapping.entries.insert(raw.to_string(), canonical.to_string());
        }
        NormalizationEngine::from_config(&config).unwrap()
    }

    async fn facts(store: &InMemoryTableStore) -> Vec<Vec<CellValue>> {
        store.read_table("crime_borough_combined").await.unwrap().unwrap().rows
    }

    #[tokio::test]
    async fn test_missing_primary_is_fatal_and_writes_nothing() {
        let store = InMemoryTableStore::new();
        let err = engine(&[]).run(&store).await.unwrap_err();
        assert!(matches!(err, ScraperError::MissingTable(t) if t == "crime_borough_historical"));
        assert!(!store.table_exists("crime_borough_combined").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_primary_is_fatal() {
        let store = InMemoryTableStore::new();
        store
            .replace_table("crime_borough_historical", &table("boroughname", &["202401"], vec![]))
            .await
            .unwrap();
        let err = engine(&[]).run(&store).await.unwrap_err();
        assert!(matches!(err, ScraperError::EmptyTable(_)));
    }

    #[tokio::test]
    async fn test_mapping_entry_is_applied() {
        let store = InMemoryTableStore::new();
        store
            .replace_table(
                "crime_borough_historical",
                &table(
                    "boroughname",
                    &["202401"],
                    vec![("camden", "BURGLARY", "burglary in a  dwelling", vec![3])],
                ),
            )
            .await
            .unwrap();

        let report = engine(&[("Burglary In A Dwelling", "Burglary - Residential")])
            .run(&store)
            .await
            .unwrap();
        assert_eq!(report.fact_rows, 1);
        assert_eq!(report.missing_secondary, vec!["ward".to_string()]);
        assert_eq!(
            facts(&store).await,
            vec![vec![
                text("Camden"),
                text("Burglary"),
                text("Burglary - Residential"),
                CellValue::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
                CellValue::Integer(3),
            ]]
        );
    }

    #[tokio::test]
    async fn test_zero_rows_and_excluded_regions_are_dropped() {
        let store = InMemoryTableStore::new();
        store
            .replace_table(
                "crime_borough_historical",
                &table(
                    "boroughname",
                    &["202401", "202402"],
                    vec![
                        ("Camden", "Theft", "Bicycle Theft", vec![0, 2]),
                        ("Aviation Security (SO18)", "Theft", "Bicycle Theft", vec![5, 5]),
                        ("London Heathrow and London City Airports", "Theft", "Bicycle Theft", vec![1, 1]),
                    ],
                ),
            )
            .await
            .unwrap();

        let report = engine(&[]).run(&store).await.unwrap();
        assert_eq!(report.zero_count_rows, 1);
        assert_eq!(report.excluded_rows, 4);
        let rows = facts(&store).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], text("Camden"));
        assert_eq!(rows[0][4], CellValue::Integer(2));
    }

    #[tokio::test]
    async fn test_secondary_is_rolled_up_and_merged() {
        let store = InMemoryTableStore::new();
        store
            .replace_table(
                "crime_borough_historical",
                &table(
                    "boroughname",
                    &["202401"],
                    vec![("Barnet", "Theft", "Theft From The Person", vec![1])],
                ),
            )
            .await
            .unwrap();
        store
            .replace_table(
                "crime_ward",
                &table(
                    "lookup_boroughname",
                    &["202402"],
                    vec![
                        ("Barnet", "Theft", "Theft From The Person", vec![2]),
                        ("Barnet", "Theft", "Theft from the person", vec![3]),
                        ("Camden", "Theft", "Theft From The Person", vec![4]),
                    ],
                ),
            )
            .await
            .unwrap();

        let report = engine(&[]).run(&store).await.unwrap();
        assert_eq!(report.secondary_records.get("ward"), Some(&3));
        assert!(report.unmapped_labels.is_empty());

        let rows = facts(&store).await;
        let summary: Vec<(String, String, i64)> = rows
            .iter()
            .map(|r| match (&r[0], &r[3], &r[4]) {
                (CellValue::Text(region), CellValue::Date(month), CellValue::Integer(count)) => {
                    (region.clone(), month.format("%Y%m").to_string(), *count)
                }
                other => panic!("unexpected row shape: {other:?}"),
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("Barnet".to_string(), "202401".to_string(), 1),
                ("Barnet".to_string(), "202402".to_string(), 5),
                ("Camden".to_string(), "202402".to_string(), 4),
            ]
        );
        assert!(rows.iter().all(|r| r[2] == text("Theft From Person")));
    }

    #[tokio::test]
    async fn test_all_zero_is_empty_result_and_keeps_old_output() {
        let store = InMemoryTableStore::new();
        let previous = FactRecord::into_table(vec![FactRecord {
            region: "Camden".into(),
            major_category: "Theft".into(),
            minor_category: "Bicycle Theft".into(),
            month: NaiveDate::from_ymd_opt(2023, 12, 1).unwrap(),
            count: 1,
        }]);
        store.replace_table("crime_borough_combined", &previous).await.unwrap();
        store
            .replace_table(
                "crime_borough_historical",
                &table("boroughname", &["202401"], vec![("Camden", "Theft", "Bicycle Theft", vec![0])]),
            )
            .await
            .unwrap();

        let err = engine(&[]).run(&store).await.unwrap_err();
        assert!(matches!(err, ScraperError::EmptyResult));
        assert_eq!(facts(&store).await, previous.rows);
    }
}
