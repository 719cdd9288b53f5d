//! Error types for the store module.

use thiserror::Error;

use peersync_core::CoreError;

/// Errors that can occur during data source operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object encoding or manifest error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The data source refused to merge an object.
    #[error("merge failed for {key}: {reason}")]
    MergeFailed { key: String, reason: String },

    /// Another transaction committed first.
    #[error("transaction conflict: store changed since version {base_version}")]
    Conflict { base_version: u64 },

    /// The transaction body or a phase hook asked to abort.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// Object not found.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
