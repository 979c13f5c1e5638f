//! Error types for segment reconciliation
//!
//! The first four variants form the reconciliation taxonomy. Each one is
//! caught at a different scope by the engine:
//!
//! | variant | scope | effect |
//! |---|---|---|
//! | [`Error::MalformedRuleData`] | run | rule loading aborts |
//! | [`Error::ListProvisioning`] | list | the list is marked failed, the run continues |
//! | [`Error::DirectoryBatch`] | batch | the batch is skipped, the list continues |
//! | [`Error::SegmentLabelProvisioning`] | label | recorded, other labels continue |
//!
//! The remaining variants describe collaborator failures and are wrapped
//! into one of the taxonomy variants by whoever catches them.

use thiserror::Error;

/// Result type alias for segsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for segsync
#[derive(Error, Debug)]
pub enum Error {
    /// Required rule columns are missing
    #[error("Malformed rule data: {0}")]
    MalformedRuleData(String),

    /// Remote list or custom field provisioning failed
    #[error("List provisioning failed for '{list}': {message}")]
    ListProvisioning {
        /// List name
        list: String,
        /// Error message
        message: String,
    },

    /// An upsert or delete batch failed
    #[error("Directory batch {batch} failed: {message}")]
    DirectoryBatch {
        /// Zero-based batch index within the list
        batch: usize,
        /// Error message
        message: String,
    },

    /// Segment label creation failed
    #[error("Segment label provisioning failed for '{label}': {message}")]
    SegmentLabelProvisioning {
        /// Segment label name
        label: String,
        /// Error message
        message: String,
    },

    /// Tabular data store errors
    #[error("Table store error: {0}")]
    TableStore(String),

    /// Subscriber directory errors
    #[error("Directory error: {0}")]
    Directory(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Rate limiting errors
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not supported by this collaborator
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Directory-client-specific error
    #[error("Provider error ({provider}): {message}")]
    Provider {
        /// Client name
        provider: String,
        /// Error message
        message: String,
    },

    /// The run was asked to stop
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a malformed rule data error
    pub fn malformed_rules(msg: impl Into<String>) -> Self {
        Self::MalformedRuleData(msg.into())
    }

    /// Create a list provisioning error
    pub fn list_provisioning(list: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ListProvisioning {
            list: list.into(),
            message: message.into(),
        }
    }

    /// Create a directory batch error
    pub fn directory_batch(batch: usize, message: impl Into<String>) -> Self {
        Self::DirectoryBatch {
            batch,
            message: message.into(),
        }
    }

    /// Create a segment label provisioning error
    pub fn label_provisioning(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SegmentLabelProvisioning {
            label: label.into(),
            message: message.into(),
        }
    }

    /// Create a table store error
    pub fn table_store(msg: impl Into<String>) -> Self {
        Self::TableStore(msg.into())
    }

    /// Create a directory error
    pub fn directory(msg: impl Into<String>) -> Self {
        Self::Directory(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a client-specific error
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Whether this error means the target did not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
