//! Error types for peersync.

use thiserror::Error;

use peersync_core::CoreError;
use peersync_engine::EngineError;
use peersync_store::StoreError;

/// Errors that can occur during peersync operations.
#[derive(Debug, Error)]
pub enum PeersyncError {
    /// Digest, manifest or object error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Data source error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Engine error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Result type for peersync operations.
pub type Result<T> = std::result::Result<T, PeersyncError>;
