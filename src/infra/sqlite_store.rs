use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection};
use std::fs;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::app::ports::TableStore;
use crate::common::error::Result;
use crate::common::types::{CellValue, Column, ColumnType, RawTable};

/// SQLite-backed table store.
///
/// Every replace runs inside one transaction (drop, create, insert), so a
/// failure part-way leaves the previous table exactly as it was.
pub struct SqliteTableStore {
    conn: Mutex<Connection>,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_sql_value(cell: &CellValue) -> Value {
    match cell {
        CellValue::Null => Value::Null,
        CellValue::Integer(i) => Value::Integer(*i),
        CellValue::Real(f) => Value::Real(*f),
        CellValue::Text(s) => Value::Text(s.clone()),
        CellValue::Date(d) => Value::Text(d.format("%Y-%m-%d").to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>, kind: ColumnType) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Integer(i),
        ValueRef::Real(f) => CellValue::Real(f),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            if kind == ColumnType::Date {
                if let Ok(date) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
                    return CellValue::Date(date);
                }
            }
            CellValue::Text(text)
        }
    }
}

impl SqliteTableStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!("Opened table store at {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }
}

#[async_trait]
impl TableStore for SqliteTableStore {
    #[instrument(skip(self, table), fields(rows = table.rows.len()))]
    async fn replace_table(&self, name: &str, table: &RawTable) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let ident = quote_ident(name);
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {ident};"))?;

        let column_defs: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.kind.sql_type()))
            .collect();
        tx.execute_batch(&format!("CREATE TABLE {ident} ({});", column_defs.join(", ")))?;

        if !table.columns.is_empty() {
            let placeholders = vec!["?"; table.columns.len()].join(", ");
            let mut stmt = tx.prepare(&format!("INSERT INTO {ident} VALUES ({placeholders})"))?;
            for row in &table.rows {
                stmt.execute(params_from_iter(row.iter().map(to_sql_value)))?;
            }
        }

        tx.commit()?;
        debug!("Replaced table '{}' with {} rows", name, table.rows.len());
        Ok(())
    }

    async fn read_table(&self, name: &str) -> Result<Option<RawTable>> {
        let conn = self.conn.lock().await;
        if !exists(&conn, name)? {
            return Ok(None);
        }

        let mut info = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(name)))?;
        let columns = info
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let decl: String = row.get(2)?;
                Ok(Column {
                    name,
                    kind: ColumnType::from_sql_type(&decl),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote_ident(name)))?;
        let mut rows = stmt.query([])?;
        let mut data = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                values.push(from_sql_value(row.get_ref(idx)?, column.kind));
            }
            data.push(values);
        }

        Ok(Some(RawTable {
            columns,
            rows: data,
        }))
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        exists(&conn, name)
    }
}

fn exists(conn: &Connection, name: &str) -> Result<bool> {
    let mut stmt =
        conn.prepare("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
    let count: i64 = stmt.query_row(params![name], |row| row.get(0))?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> RawTable {
        RawTable {
            columns: vec![
                Column { name: "region".into(), kind: ColumnType::Text },
                Column { name: "month".into(), kind: ColumnType::Date },
                Column { name: "count".into(), kind: ColumnType::Integer },
                Column { name: "rate".into(), kind: ColumnType::Real },
            ],
            rows: vec![vec![
                CellValue::Text("Camden".into()),
                CellValue::Date(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()),
                CellValue::Integer(12),
                CellValue::Null,
            ]],
        }
    }

    #[tokio::test]
    async fn test_replace_and_read_back() {
        let store = SqliteTableStore::open_in_memory().unwrap();
        assert!(store.read_table("crime_borough_combined").await.unwrap().is_none());

        store.replace_table("crime_borough_combined", &sample()).await.unwrap();
        let table = store.read_table("crime_borough_combined").await.unwrap().unwrap();
        assert_eq!(table, sample());
    }

    #[tokio::test]
    async fn test_replace_never_appends() {
        let store = SqliteTableStore::open_in_memory().unwrap();
        store.replace_table("t", &sample()).await.unwrap();
        store.replace_table("t", &sample()).await.unwrap();
        assert_eq!(store.read_table("t").await.unwrap().unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_replace_keeps_old_table() {
        let store = SqliteTableStore::open_in_memory().unwrap();
        store.replace_table("t", &sample()).await.unwrap();

        // Duplicate column names make CREATE TABLE fail inside the transaction
        let broken = RawTable {
            columns: vec![
                Column { name: "a".into(), kind: ColumnType::Text },
                Column { name: "a".into(), kind: ColumnType::Text },
            ],
            rows: vec![],
        };
        assert!(store.replace_table("t", &broken).await.is_err());
        assert_eq!(store.read_table("t").await.unwrap().unwrap(), sample());
    }

    #[tokio::test]
    async fn test_open_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("crime.db");
        let store = SqliteTableStore::open(&path).unwrap();
        store.replace_table("t", &sample()).await.unwrap();
        assert!(path.exists());
        assert!(store.table_exists("t").await.unwrap());
    }
}
