use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::app::ports::TableStore;
use crate::common::error::Result;
use crate::common::types::RawTable;

/// In-memory table store for development and tests
#[derive(Default, Clone)]
pub struct InMemoryTableStore {
    tables: Arc<Mutex<HashMap<String, RawTable>>>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn table_names(&self) -> Vec<String> {
        let tables = self.tables.lock().await;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn replace_table(&self, name: &str, table: &RawTable) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.insert(name.to_string(), table.clone());
        debug!("Replaced table '{}' ({} rows)", name, table.rows.len());
        Ok(())
    }

    async fn read_table(&self, name: &str) -> Result<Option<RawTable>> {
        let tables = self.tables.lock().await;
        Ok(tables.get(name).cloned())
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        let tables = self.tables.lock().await;
        Ok(tables.contains_key(name))
    }
}
