//! List state repository
//!
//! Each list owns one workbook in the table store, keyed by the list name:
//!
//! - the primary sheet (`Datos`) holds the current subscriber rows
//! - the history sheet (`Cambios`) accumulates one row per tag change
//! - the metadata sheet (`Meta`) holds `key`/`value` rows
//!
//! Loading tolerates a missing workbook (empty snapshot); saving the
//! primary sheet overwrites it; the history sheet is only ever appended.
//! Rows with a blank or repeated email are carried through a load/save
//! cycle untouched. Empty cells load as absent attributes.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ListStoreConfig;
use crate::error::{Error, Result};
use crate::model::{
    CellValue, ChangeSet, ListId, ListSnapshot, PassthroughRow, Row, SegmentRule, SnapshotMeta,
    SubscriberRecord,
};
use crate::traits::TableStore;

/// Timestamp layout of the history sheet
pub const CHANGED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const META_KEY: &str = "key";
const META_VALUE: &str = "value";
const META_REMOTE_LIST_ID: &str = "remote_list_id";
const META_KNOWN_FIELDS: &str = "known_remote_fields";

/// Reads and writes list snapshots and their change history
#[derive(Clone)]
pub struct ListRepository {
    store: Arc<dyn TableStore>,
    config: ListStoreConfig,
}

impl ListRepository {
    /// Create a repository over a table store
    pub fn new(store: Arc<dyn TableStore>, config: ListStoreConfig) -> Self {
        Self { store, config }
    }

    /// Sheet and column names in use
    pub fn config(&self) -> &ListStoreConfig {
        &self.config
    }

    /// Load the local snapshot of a list
    ///
    /// Returns an empty snapshot (email and tag columns only) when the list
    /// has no local rows yet.
    ///
    /// # Errors
    ///
    /// [`Error::TableStore`] when rows exist but none of the columns is an
    /// email column, or when the store itself fails.
    pub async fn load_snapshot(&self, list_name: &str) -> Result<ListSnapshot> {
        let rows = self.store.read_sheet(list_name, &self.config.data_sheet).await?;
        let meta = self.load_meta(list_name).await?;

        let mut snapshot = ListSnapshot::empty(list_name, &self.config.tag_field);
        snapshot.meta = meta;
        if rows.is_empty() {
            debug!("No local rows for list '{}'", list_name);
            return Ok(snapshot);
        }

        let mut columns: Vec<String> = Vec::new();
        for column in rows.iter().flat_map(|r| r.columns()) {
            if !columns.iter().any(|c| c == column) {
                columns.push(column.to_string());
            }
        }

        let email_column = columns
            .iter()
            .find(|c| c.trim().eq_ignore_ascii_case("email"))
            .cloned()
            .ok_or_else(|| {
                Error::table_store(format!("list '{}' has no email column", list_name))
            })?;

        let tag_column = self.config.tag_field.clone();
        if !columns.contains(&tag_column) {
            columns.push(tag_column.clone());
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut records = Vec::with_capacity(rows.len());
        let mut passthrough = Vec::new();
        for (position, row) in rows.iter().enumerate() {
            let email = row
                .get(&email_column)
                .filter(|v| !v.is_empty())
                .map(CellValue::as_text);
            let Some(email) = email else {
                warn!(
                    "List '{}': row {} has no email; kept as is, not synced",
                    list_name,
                    position + 1
                );
                passthrough.push(PassthroughRow { position, row: row.clone() });
                continue;
            };
            if !seen.insert(email.clone()) {
                warn!(
                    "List '{}': row {} repeats email {}; kept as is, not synced",
                    list_name,
                    position + 1,
                    email
                );
                passthrough.push(PassthroughRow { position, row: row.clone() });
                continue;
            }

            let mut record = SubscriberRecord::new(email);
            for (column, value) in row.iter() {
                if column == email_column {
                    continue;
                }
                if column == tag_column {
                    record.segments = tag_text(value);
                } else if !value.is_empty() {
                    record.attributes.insert(column.to_string(), value.clone());
                }
            }
            records.push(record);
        }

        debug!(
            "Loaded {} subscribers for list '{}' ({} columns)",
            records.len(),
            list_name,
            columns.len()
        );

        snapshot.columns = columns;
        snapshot.email_column = email_column;
        snapshot.tag_column = tag_column;
        snapshot.records = records;
        snapshot.passthrough = passthrough;
        Ok(snapshot)
    }

    /// Overwrite the primary sheet and the metadata sheet of a list
    pub async fn save_snapshot(&self, list_name: &str, snapshot: &ListSnapshot) -> Result<()> {
        let columns = snapshot_columns(snapshot);
        let mut rows: Vec<Row> = snapshot
            .records
            .iter()
            .map(|record| {
                record_row(record, &columns, &snapshot.email_column, &snapshot.tag_column)
            })
            .collect();
        for kept in &snapshot.passthrough {
            let at = kept.position.min(rows.len());
            rows.insert(at, kept.row.clone());
        }

        self.store
            .write_sheet(list_name, &self.config.data_sheet, &rows, false)
            .await?;
        self.save_meta(list_name, &snapshot.meta).await?;

        debug!(
            "Saved {} subscribers ({} unsynced rows) for list '{}'",
            snapshot.records.len(),
            snapshot.passthrough.len(),
            list_name
        );
        Ok(())
    }

    /// Append a change set to the history sheet
    ///
    /// An empty change set writes nothing.
    pub async fn save_change_set(&self, list_name: &str, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let email_column = "email".to_string();
        let tag_column = self.config.tag_field.clone();
        let rows: Vec<Row> = changes
            .entries
            .iter()
            .map(|entry| {
                let mut columns = vec![email_column.clone()];
                columns.extend(entry.record.attributes.keys().cloned());
                columns.push(tag_column.clone());

                let mut row = record_row(&entry.record, &columns, &email_column, &tag_column);
                row.set(&self.config.prior_tags_column, tag_cell(&entry.prior_segments));
                row.set(
                    &self.config.changed_at_column,
                    CellValue::Text(entry.changed_at.format(CHANGED_AT_FORMAT).to_string()),
                );
                row
            })
            .collect();

        self.store
            .write_sheet(list_name, &self.config.history_sheet, &rows, true)
            .await?;

        debug!("Appended {} history rows for list '{}'", rows.len(), list_name);
        Ok(())
    }

    async fn load_meta(&self, list_name: &str) -> Result<SnapshotMeta> {
        let rows = self.store.read_sheet(list_name, &self.config.meta_sheet).await?;
        let mut meta = SnapshotMeta::default();

        for row in &rows {
            let (Some(key), Some(value)) = (row.get(META_KEY), row.get(META_VALUE)) else {
                continue;
            };
            match key.as_text().as_str() {
                META_REMOTE_LIST_ID if !value.is_empty() => {
                    meta.remote_list_id = Some(ListId::new(value.as_text()));
                }
                META_KNOWN_FIELDS => {
                    meta.known_remote_fields = crate::tags::parse_tags(&value.as_text())
                        .into_iter()
                        .map(str::to_string)
                        .collect();
                }
                _ => {}
            }
        }

        Ok(meta)
    }

    async fn save_meta(&self, list_name: &str, meta: &SnapshotMeta) -> Result<()> {
        let list_id = meta
            .remote_list_id
            .as_ref()
            .map(|id| CellValue::Text(id.to_string()))
            .unwrap_or_default();
        let fields = meta
            .known_remote_fields
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(";");

        let rows = vec![
            Row::new()
                .with(META_KEY, CellValue::Text(META_REMOTE_LIST_ID.to_string()))
                .with(META_VALUE, list_id),
            Row::new()
                .with(META_KEY, CellValue::Text(META_KNOWN_FIELDS.to_string()))
                .with(META_VALUE, tag_cell(&fields)),
        ];

        self.store
            .write_sheet(list_name, &self.config.meta_sheet, &rows, false)
            .await
    }
}

impl std::fmt::Debug for ListRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListRepository")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Condition attributes of `rules` that the snapshot has no column for
///
/// Conditions on these attributes cannot match any subscriber of the list.
pub fn missing_condition_columns(snapshot: &ListSnapshot, rules: &[SegmentRule]) -> BTreeSet<String> {
    rules
        .iter()
        .flat_map(|rule| rule.attributes())
        .filter(|attribute| !snapshot.has_column(attribute))
        .map(str::to_string)
        .collect()
}

/// Snapshot columns plus any attribute a record carries beyond them
fn snapshot_columns(snapshot: &ListSnapshot) -> Vec<String> {
    let mut columns = snapshot.columns.clone();
    for required in [&snapshot.email_column, &snapshot.tag_column] {
        if !columns.contains(required) {
            columns.push(required.clone());
        }
    }
    for record in &snapshot.records {
        for attribute in record.attributes.keys() {
            if !columns.contains(attribute) {
                columns.push(attribute.clone());
            }
        }
    }
    columns
}

fn record_row(record: &SubscriberRecord, columns: &[String], email_column: &str, tag_column: &str) -> Row {
    columns
        .iter()
        .map(|column| {
            let value = if column == email_column {
                CellValue::Text(record.email.clone())
            } else if column == tag_column {
                tag_cell(&record.segments)
            } else {
                record.attributes.get(column).cloned().unwrap_or_default()
            };
            (column.clone(), value)
        })
        .collect()
}

/// Tag strings are stored as text, never coerced to numbers
fn tag_cell(tags: &str) -> CellValue {
    if tags.trim().is_empty() {
        CellValue::Empty
    } else {
        CellValue::Text(tags.to_string())
    }
}

fn tag_text(value: &CellValue) -> String {
    match value {
        CellValue::Text(s) => s.clone(),
        CellValue::Number(_) => value.to_string(),
        CellValue::Empty => String::new(),
    }
}
