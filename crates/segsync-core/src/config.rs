//! Configuration types for segsync
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::traits::ListProfile;

/// Largest batch the directory accepts in one upsert call
pub const MAX_BATCH_SIZE: usize = 1000;

/// Main segsync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Subscriber directory configuration
    pub directory: DirectoryConfig,

    /// Table store configuration (rules, snapshots, history)
    #[serde(default)]
    pub table_store: TableStoreConfig,

    /// Where and how rule rows are read
    #[serde(default)]
    pub rules: RuleSourceConfig,

    /// Sheet and column names of list workbooks
    #[serde(default)]
    pub lists: ListStoreConfig,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl SyncConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.directory.validate()?;
        self.table_store.validate()?;
        self.rules.validate()?;
        self.lists.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}

/// Subscriber directory configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectoryConfig {
    /// Acumbamail-style REST API
    Acumbamail {
        /// API auth token
        api_token: String,
        /// API base URL (defaults to the public endpoint)
        #[serde(default)]
        base_url: Option<String>,
    },

    /// Custom directory client
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl DirectoryConfig {
    /// Validate the directory configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            DirectoryConfig::Acumbamail { api_token, base_url } => {
                if api_token.trim().is_empty() {
                    return Err(crate::Error::config("Acumbamail API token cannot be empty"));
                }
                if let Some(url) = base_url {
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        return Err(crate::Error::config(format!(
                            "Acumbamail base URL must be http(s): {}",
                            url
                        )));
                    }
                }
                Ok(())
            }
            DirectoryConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom directory factory cannot be empty",
                    ));
                }
                if config.is_null() {
                    return Err(crate::Error::config(
                        "Custom directory config cannot be null",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Get the directory type name
    pub fn type_name(&self) -> &str {
        match self {
            DirectoryConfig::Acumbamail { .. } => "acumbamail",
            DirectoryConfig::Custom { factory, .. } => factory,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig::Acumbamail {
            api_token: String::new(),
            base_url: None,
        }
    }
}

// Hand-written so the token never reaches logs
impl fmt::Debug for DirectoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryConfig::Acumbamail { base_url, .. } => f
                .debug_struct("Acumbamail")
                .field("api_token", &"<REDACTED>")
                .field("base_url", base_url)
                .finish(),
            DirectoryConfig::Custom { factory, .. } => f
                .debug_struct("Custom")
                .field("factory", factory)
                .finish_non_exhaustive(),
        }
    }
}

/// Table store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TableStoreConfig {
    /// One JSON workbook per store id under a root directory
    File {
        /// Root directory of the workbooks
        root: PathBuf,
    },

    /// In-memory table store (not persistent)
    #[default]
    Memory,

    /// Custom table store
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl TableStoreConfig {
    /// Validate the table store configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            TableStoreConfig::File { root } if root.as_os_str().is_empty() => {
                Err(crate::Error::config("File table store root cannot be empty"))
            }
            TableStoreConfig::Custom { factory, .. } if factory.is_empty() => Err(
                crate::Error::config("Custom table store factory cannot be empty"),
            ),
            _ => Ok(()),
        }
    }

    /// Get the table store type name
    pub fn type_name(&self) -> &str {
        match self {
            TableStoreConfig::File { .. } => "file",
            TableStoreConfig::Memory => "memory",
            TableStoreConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Location and layout of the rule rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSourceConfig {
    /// Store id of the rule workbook
    #[serde(default = "default_rules_store_id")]
    pub store_id: String,

    /// Sheet holding the rule rows
    #[serde(default = "default_rules_sheet")]
    pub sheet: String,

    /// Column naming the target list
    #[serde(default = "default_list_column")]
    pub list_column: String,

    /// Column naming the segment
    #[serde(default = "default_segment_column")]
    pub segment_column: String,

    /// Bookkeeping columns that are never conditions
    #[serde(default = "default_control_columns")]
    pub control_columns: Vec<String>,
}

impl RuleSourceConfig {
    /// Validate the rule source configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.store_id.trim().is_empty() || self.sheet.trim().is_empty() {
            return Err(crate::Error::config("Rule store id and sheet cannot be empty"));
        }
        if self.list_column.trim().is_empty() || self.segment_column.trim().is_empty() {
            return Err(crate::Error::config("Rule list and segment columns cannot be empty"));
        }
        if self.list_column == self.segment_column {
            return Err(crate::Error::config(
                "Rule list and segment columns must differ",
            ));
        }
        Ok(())
    }

    /// Whether a column is the list column, the segment column or a control column
    pub fn is_reserved_column(&self, column: &str) -> bool {
        column == self.list_column
            || column == self.segment_column
            || self.control_columns.iter().any(|c| c == column)
    }
}

impl Default for RuleSourceConfig {
    fn default() -> Self {
        Self {
            store_id: default_rules_store_id(),
            sheet: default_rules_sheet(),
            list_column: default_list_column(),
            segment_column: default_segment_column(),
            control_columns: default_control_columns(),
        }
    }
}

fn default_rules_store_id() -> String {
    "Segmentos".to_string()
}

fn default_rules_sheet() -> String {
    "Segmentos".to_string()
}

fn default_list_column() -> String {
    "NOMBRE LISTA".to_string()
}

fn default_segment_column() -> String {
    "NOMBRE SEGMENTO".to_string()
}

fn default_control_columns() -> Vec<String> {
    vec!["ID Lista".to_string(), "CREACION SEGMENTO".to_string()]
}

/// Sheet and column names used in each list's workbook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListStoreConfig {
    /// Primary current-state sheet
    #[serde(default = "default_data_sheet")]
    pub data_sheet: String,

    /// Append-only change history sheet
    #[serde(default = "default_history_sheet")]
    pub history_sheet: String,

    /// Key/value metadata sheet
    #[serde(default = "default_meta_sheet")]
    pub meta_sheet: String,

    /// Column (and remote field) holding the tag string
    #[serde(default = "default_tag_field")]
    pub tag_field: String,

    /// History column holding the tags before the change
    #[serde(default = "default_prior_tags_column")]
    pub prior_tags_column: String,

    /// History column holding the change timestamp
    #[serde(default = "default_changed_at_column")]
    pub changed_at_column: String,
}

impl ListStoreConfig {
    /// Validate the list store configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        let sheets = [&self.data_sheet, &self.history_sheet, &self.meta_sheet];
        if sheets.iter().any(|s| s.trim().is_empty()) {
            return Err(crate::Error::config("List sheet names cannot be empty"));
        }
        if self.data_sheet == self.history_sheet
            || self.data_sheet == self.meta_sheet
            || self.history_sheet == self.meta_sheet
        {
            return Err(crate::Error::config("List sheet names must be distinct"));
        }
        if self.tag_field.trim().is_empty() {
            return Err(crate::Error::config("Tag field cannot be empty"));
        }
        Ok(())
    }
}

impl Default for ListStoreConfig {
    fn default() -> Self {
        Self {
            data_sheet: default_data_sheet(),
            history_sheet: default_history_sheet(),
            meta_sheet: default_meta_sheet(),
            tag_field: default_tag_field(),
            prior_tags_column: default_prior_tags_column(),
            changed_at_column: default_changed_at_column(),
        }
    }
}

fn default_data_sheet() -> String {
    "Datos".to_string()
}

fn default_history_sheet() -> String {
    "Cambios".to_string()
}

fn default_meta_sheet() -> String {
    "Meta".to_string()
}

fn default_tag_field() -> String {
    "Segmentos".to_string()
}

fn default_prior_tags_column() -> String {
    "Segmentos_Anterior".to_string()
}

fn default_changed_at_column() -> String {
    "Fecha_Cambio".to_string()
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Subscribers per delete/upsert batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Restrict the run to these lists (empty means every list with rules)
    #[serde(default)]
    pub only_lists: Vec<String>,

    /// Profile used when a list has to be created remotely
    #[serde(default = "default_list_profile")]
    pub list_profile: ListProfile,

    /// Capacity of the reconcile event channel
    ///
    /// When full, new events are dropped (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(crate::Error::config(format!(
                "Batch size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }

    /// Whether a list takes part in this run
    pub fn includes_list(&self, list_name: &str) -> bool {
        self.only_lists.is_empty() || self.only_lists.iter().any(|l| l == list_name)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            only_lists: Vec::new(),
            list_profile: default_list_profile(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_list_profile() -> ListProfile {
    ListProfile {
        country: "ES".to_string(),
        ..ListProfile::default()
    }
}

fn default_event_channel_capacity() -> usize {
    1000
}
