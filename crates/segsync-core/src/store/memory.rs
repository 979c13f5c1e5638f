// # Memory Table Store
//
// In-memory implementation of TableStore.
//
// ## Purpose
//
// Keeps workbooks in a HashMap for the lifetime of the process. Used by
// tests, by dry runs that must not touch local files, and as the default
// when no data directory is configured.
//
// ## Crash Behavior
//
// - All sheets are lost on exit
// - The next run sees every list as having no local snapshot

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::config::TableStoreConfig;
use crate::model::Row;
use crate::traits::{TableStore, TableStoreFactory};

type Workbook = BTreeMap<String, Vec<Row>>;

/// In-memory table store implementation
///
/// Cloning shares the underlying workbooks, so a test can keep one handle
/// and hand another to the engine.
///
/// # Example
///
/// ```rust,no_run
/// use segsync_core::store::MemoryTableStore;
/// use segsync_core::{Row, TableStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryTableStore::new();
///     let row = Row::new().with("email", "ana@example.es");
///     store.write_sheet("Lista Madrid", "Datos", &[row], false).await?;
///
///     let rows = store.read_sheet("Lista Madrid", "Datos").await?;
///     assert_eq!(rows.len(), 1);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryTableStore {
    inner: Arc<RwLock<HashMap<String, Workbook>>>,
}

impl MemoryTableStore {
    /// Create a new empty memory table store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workbooks in the store
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Check if the store holds no workbooks
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Remove every workbook
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn read_sheet(&self, store_id: &str, sheet: &str) -> Result<Vec<Row>, Error> {
        let guard = self.inner.read().await;
        Ok(guard
            .get(store_id)
            .and_then(|workbook| workbook.get(sheet))
            .cloned()
            .unwrap_or_default())
    }

    async fn write_sheet(
        &self,
        store_id: &str,
        sheet: &str,
        rows: &[Row],
        append: bool,
    ) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        let existing = guard
            .entry(store_id.to_string())
            .or_default()
            .entry(sheet.to_string())
            .or_default();

        if !append {
            existing.clear();
        }
        existing.extend_from_slice(rows);
        Ok(())
    }

    async fn list_sheet_names(&self, store_id: &str) -> Result<BTreeSet<String>, Error> {
        let guard = self.inner.read().await;
        Ok(guard
            .get(store_id)
            .map(|workbook| workbook.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// Factory for [`MemoryTableStore`]
#[derive(Debug, Default)]
pub struct MemoryTableStoreFactory;

#[async_trait]
impl TableStoreFactory for MemoryTableStoreFactory {
    async fn create(&self, config: &serde_json::Value) -> Result<Box<dyn TableStore>, Error> {
        match serde_json::from_value::<TableStoreConfig>(config.clone())? {
            TableStoreConfig::Memory => Ok(Box::new(MemoryTableStore::new())),
            other => Err(Error::config(format!(
                "memory factory cannot build a '{}' table store",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(email: &str) -> Row {
        Row::new().with("email", email)
    }

    #[tokio::test]
    async fn test_missing_store_and_sheet_read_empty() {
        let store = MemoryTableStore::new();
        assert!(store.read_sheet("nope", "Datos").await.unwrap().is_empty());

        store.write_sheet("L1", "Datos", &[row("a@x.es")], false).await.unwrap();
        assert!(store.read_sheet("L1", "Cambios").await.unwrap().is_empty());
        assert!(store.list_sheet_names("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_and_append_extends() {
        let store = MemoryTableStore::new();
        store.write_sheet("L1", "Datos", &[row("a@x.es"), row("b@x.es")], false).await.unwrap();
        store.write_sheet("L1", "Datos", &[row("c@x.es")], false).await.unwrap();
        assert_eq!(store.read_sheet("L1", "Datos").await.unwrap(), vec![row("c@x.es")]);

        store.write_sheet("L1", "Cambios", &[row("a@x.es")], true).await.unwrap();
        store.write_sheet("L1", "Cambios", &[row("b@x.es")], true).await.unwrap();
        assert_eq!(store.read_sheet("L1", "Cambios").await.unwrap().len(), 2);

        let sheets = store.list_sheet_names("L1").await.unwrap();
        assert_eq!(sheets.into_iter().collect::<Vec<_>>(), vec!["Cambios", "Datos"]);
    }

    #[test]
    fn test_clones_share_workbooks() {
        let store = MemoryTableStore::new();
        let handle = store.clone();

        tokio_test::block_on(async {
            handle.write_sheet("L1", "Datos", &[row("a@x.es")], false).await.unwrap();
            assert_eq!(store.len().await, 1);
            store.clear().await;
            assert!(handle.is_empty().await);
        });
    }

    #[tokio::test]
    async fn test_factory_builds_memory_store() {
        let config = serde_json::to_value(TableStoreConfig::Memory).unwrap();
        let store = MemoryTableStoreFactory.create(&config).await.unwrap();
        assert!(store.read_sheet("L1", "Datos").await.unwrap().is_empty());
    }
}
