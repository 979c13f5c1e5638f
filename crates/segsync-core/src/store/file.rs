// # File Table Store
//
// File-based implementation of TableStore with crash recovery.
//
// ## Purpose
//
// Persists each workbook (one per list, plus the rule workbook) as a JSON
// file under a root directory, so snapshots and change history survive
// between runs.
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Corruption detection: JSON parse failures on load
// - Automatic backup: Keeps .backup of last known good workbook
// - Recovery: Falls back to backup if corruption detected
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "sheets": {
//     "Datos": [
//       [["email", "ana@example.es"], ["SEDE", "Madrid"], ["Segmentos", "SegA"]]
//     ]
//   }
// }
// ```

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::Error;
use crate::config::TableStoreConfig;
use crate::model::Row;
use crate::traits::{TableStore, TableStoreFactory};

/// Workbook file format version
const WORKBOOK_FILE_VERSION: &str = "1.0";

type Workbook = BTreeMap<String, Vec<Row>>;

/// Serializable workbook file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct WorkbookFileFormat {
    version: String,
    #[serde(default)]
    sheets: Workbook,
}

/// File-based table store with crash recovery
///
/// Workbooks are loaded lazily on first access and cached; every write goes
/// straight to disk.
///
/// # Example
///
/// ```rust,no_run
/// use segsync_core::store::FileTableStore;
/// use segsync_core::{Row, TableStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileTableStore::new("/var/lib/segsync").await?;
///     let row = Row::new().with("email", "ana@example.es");
///     store.write_sheet("Lista Madrid", "Datos", &[row], false).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileTableStore {
    root: PathBuf,
    workbooks: Arc<RwLock<HashMap<String, Workbook>>>,
}

impl FileTableStore {
    /// Open a file table store rooted at `root`, creating the directory if needed
    pub async fn new<P: AsRef<Path>>(root: P) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();

        if !root.as_os_str().is_empty() && !root.exists() {
            fs::create_dir_all(&root).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create data directory {}: {}",
                    root.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            root,
            workbooks: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the workbook file for a store id
    pub fn workbook_path(&self, store_id: &str) -> Result<PathBuf, Error> {
        let file_stem = sanitize_store_id(store_id)?;
        Ok(self.root.join(format!("{}.json", file_stem)))
    }

    /// Return a cached workbook, loading it from disk on first access
    async fn workbook(&self, store_id: &str) -> Result<Workbook, Error> {
        if let Some(workbook) = self.workbooks.read().await.get(store_id) {
            return Ok(workbook.clone());
        }

        let path = self.workbook_path(store_id)?;
        let workbook = Self::load_workbook_with_recovery(&path).await?;

        let mut guard = self.workbooks.write().await;
        Ok(guard
            .entry(store_id.to_string())
            .or_insert(workbook)
            .clone())
    }

    /// Load a workbook with automatic recovery
    ///
    /// Recovery strategy:
    /// 1. Try to load main workbook file
    /// 2. If JSON parse error, try loading backup
    /// 3. If there is no readable backup, fail and leave the file untouched
    async fn load_workbook_with_recovery(path: &Path) -> Result<Workbook, Error> {
        match Self::load_workbook(path).await {
            Ok(sheets) => {
                tracing::debug!(
                    "Loaded workbook {}: {} sheets",
                    path.display(),
                    sheets.len()
                );
                Ok(sheets)
            }
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "Workbook {} appears corrupted: {}. Attempting recovery from backup.",
                    path.display(),
                    e
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::error!("No backup found for corrupted workbook {}", path.display());
                    return Err(Error::table_store(format!(
                        "workbook {} is corrupted and has no backup: {}",
                        path.display(),
                        e
                    )));
                }

                match Self::load_workbook(&backup_path).await {
                    Ok(sheets) => {
                        tracing::info!("Recovered workbook from backup: {} sheets", sheets.len());
                        if let Err(restore_err) = Self::restore_from_backup(path, &backup_path).await
                        {
                            tracing::error!(
                                "Failed to restore workbook from backup: {}",
                                restore_err
                            );
                        }
                        Ok(sheets)
                    }
                    Err(backup_err) => {
                        tracing::error!("Backup of {} also unreadable: {}", path.display(), backup_err);
                        Err(Error::table_store(format!(
                            "workbook {} and its backup are unreadable: {}",
                            path.display(),
                            backup_err
                        )))
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Load a workbook from file
    async fn load_workbook(path: &Path) -> Result<Workbook, Error> {
        if !path.exists() {
            tracing::debug!("Workbook does not exist: {}", path.display());
            return Ok(Workbook::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::table_store(format!("Failed to read workbook {}: {}", path.display(), e))
        })?;

        let file: WorkbookFileFormat = serde_json::from_str(&content)?;

        if file.version != WORKBOOK_FILE_VERSION {
            tracing::warn!(
                "Workbook version mismatch: expected {}, got {}. Attempting to load anyway.",
                WORKBOOK_FILE_VERSION,
                file.version
            );
        }

        Ok(file.sheets)
    }

    /// Write a workbook to file atomically
    async fn write_workbook(&self, path: &Path, sheets: &Workbook) -> Result<(), Error> {
        let file = WorkbookFileFormat {
            version: WORKBOOK_FILE_VERSION.to_string(),
            sheets: sheets.clone(),
        };

        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::table_store(format!("Failed to serialize workbook: {}", e)))?;

        let temp_path = Self::temp_path(path);
        {
            let mut temp = fs::File::create(&temp_path).await.map_err(|e| {
                Error::table_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            temp.write_all(json.as_bytes()).await.map_err(|e| {
                Error::table_store(format!(
                    "Failed to write to temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            temp.flush().await.map_err(|e| {
                Error::table_store(format!(
                    "Failed to flush temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if path.exists() {
            let backup_path = Self::backup_path(path);
            if let Err(e) = fs::copy(path, &backup_path).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, path).await.map_err(|e| {
            Error::table_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::trace!("Workbook written: {}", path.display());
        Ok(())
    }

    /// Restore a workbook file from its backup
    async fn restore_from_backup(path: &Path, backup_path: &Path) -> Result<(), Error> {
        fs::copy(backup_path, path).await.map_err(|e| {
            Error::table_store(format!(
                "Failed to restore from backup {} to {}: {}",
                backup_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::info!("Restored workbook {} from backup", path.display());
        Ok(())
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut temp = path.to_path_buf();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

/// Map a store id (usually a list name) to a file stem
///
/// Letters, digits, `-` and inner spaces are kept; every other byte is
/// written as `%XX`, so distinct ids never share a file.
fn sanitize_store_id(store_id: &str) -> Result<String, Error> {
    if store_id.trim().is_empty() {
        return Err(Error::invalid_input("store id must not be empty"));
    }

    let last = store_id.chars().count() - 1;
    let mut stem = String::with_capacity(store_id.len());
    for (i, c) in store_id.chars().enumerate() {
        let inner_space = c == ' ' && i != 0 && i != last;
        if c.is_alphanumeric() || c == '-' || inner_space {
            stem.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                stem.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    Ok(stem)
}

#[async_trait]
impl TableStore for FileTableStore {
    async fn read_sheet(&self, store_id: &str, sheet: &str) -> Result<Vec<Row>, Error> {
        let workbook = self.workbook(store_id).await?;
        Ok(workbook.get(sheet).cloned().unwrap_or_default())
    }

    async fn write_sheet(
        &self,
        store_id: &str,
        sheet: &str,
        rows: &[Row],
        append: bool,
    ) -> Result<(), Error> {
        let mut workbook = self.workbook(store_id).await?;
        let existing = workbook.entry(sheet.to_string()).or_default();
        if !append {
            existing.clear();
        }
        existing.extend_from_slice(rows);

        // Disk first, so a failed write leaves the cache matching the file
        let path = self.workbook_path(store_id)?;
        self.write_workbook(&path, &workbook).await?;

        self.workbooks
            .write()
            .await
            .insert(store_id.to_string(), workbook);
        Ok(())
    }

    async fn list_sheet_names(&self, store_id: &str) -> Result<BTreeSet<String>, Error> {
        let workbook = self.workbook(store_id).await?;
        Ok(workbook.keys().cloned().collect())
    }
}

/// Factory for [`FileTableStore`]
#[derive(Debug, Default)]
pub struct FileTableStoreFactory;

#[async_trait]
impl TableStoreFactory for FileTableStoreFactory {
    async fn create(&self, config: &serde_json::Value) -> Result<Box<dyn TableStore>, Error> {
        match serde_json::from_value::<TableStoreConfig>(config.clone())? {
            TableStoreConfig::File { root } => Ok(Box::new(FileTableStore::new(root).await?)),
            other => Err(Error::config(format!(
                "file factory cannot build a '{}' table store",
                other.type_name()
            ))),
        }
    }
}
