// # Table Store Trait
//
// Defines the interface for the spreadsheet-like tabular data store.
//
// ## Purpose
//
// Rule rows, list snapshots and change history all live in sheets of a
// tabular store. A store id names one workbook; a sheet name names one
// table inside it.
//
// ## Implementations
//
// - In-memory: `MemoryTableStore` (tests, dry runs)
// - JSON workbooks on disk: `FileTableStore`
//
// ## Usage
//
// ```rust,ignore
// use segsync_core::{Row, TableStore};
//
// let rows = store.read_sheet("Lista Madrid", "Datos").await?;
// store.write_sheet("Lista Madrid", "Cambios", &changes, true).await?;
// ```

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::model::Row;

/// Trait for tabular data store implementations
///
/// # Contract
///
/// - A missing store or a missing sheet reads as zero rows, never an error
/// - `write_sheet` with `append = false` replaces the sheet's rows
/// - `write_sheet` with `append = true` keeps existing rows and adds new ones
/// - Writing an empty slice with `append = false` leaves an empty sheet
///
/// # Trust Level: Trusted (Core Component)
///
/// Table stores perform local I/O only. They never decide what to write;
/// the reconciliation engine owns that.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Read every row of a sheet
    ///
    /// # Parameters
    ///
    /// - `store_id`: Workbook identifier (a list name, or the rule source id)
    /// - `sheet`: Sheet name inside the workbook
    ///
    /// # Returns
    ///
    /// - `Ok(Vec<Row>)`: The rows in sheet order (empty when absent)
    /// - `Err(Error)`: Storage error
    async fn read_sheet(&self, store_id: &str, sheet: &str) -> Result<Vec<Row>, crate::Error>;

    /// Write rows to a sheet
    ///
    /// # Parameters
    ///
    /// - `store_id`: Workbook identifier
    /// - `sheet`: Sheet name inside the workbook
    /// - `rows`: Rows to write
    /// - `append`: Append to (true) or overwrite (false) the sheet
    async fn write_sheet(
        &self,
        store_id: &str,
        sheet: &str,
        rows: &[Row],
        append: bool,
    ) -> Result<(), crate::Error>;

    /// List the sheets of a workbook
    ///
    /// # Returns
    ///
    /// - `Ok(BTreeSet<String>)`: Sheet names (empty when the store is absent)
    /// - `Err(Error)`: Storage error
    async fn list_sheet_names(&self, store_id: &str) -> Result<BTreeSet<String>, crate::Error>;
}

/// Helper trait for constructing table stores from configuration
#[async_trait]
pub trait TableStoreFactory: Send + Sync {
    /// Create a TableStore instance from configuration
    ///
    /// # Parameters
    ///
    /// - `config`: Serialized `TableStoreConfig`
    ///
    /// # Returns
    ///
    /// A boxed TableStore trait object
    async fn create(&self, config: &serde_json::Value) -> Result<Box<dyn TableStore>, crate::Error>;
}
