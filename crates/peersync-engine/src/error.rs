//! Error types for the engine module.

use thiserror::Error;

use peersync_core::CoreError;
use peersync_store::StoreError;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Manifest or object error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Data source operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A message or persisted state could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A message or persisted state could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Wire version we do not speak.
    #[error("unsupported message version: {version}")]
    UnsupportedVersion { version: u64 },

    /// The message carries a critical extension we do not understand.
    #[error("unknown critical extension: {oid}")]
    CriticalExtension { oid: String },

    /// The engine is not currently a circle member.
    #[error("engine is not in the circle")]
    NotInCircle,

    /// The peer is not in the trusted set.
    #[error("peer is not trusted: {0}")]
    UntrustedPeer(String),

    /// The commit hook fired on the engine's own worker thread.
    #[error("commit hook re-entered the engine worker")]
    Reentrant,

    /// The worker thread has stopped.
    #[error("engine worker is gone")]
    WorkerGone,

    /// The worker thread could not be started.
    #[error("failed to start engine worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
