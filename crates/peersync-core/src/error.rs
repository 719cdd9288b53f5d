//! Error types for peersync core.

use thiserror::Error;

/// Core errors that can occur while building, decoding or patching manifests.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A patch tried to remove digests that are not in the base manifest.
    #[error("patch removes {missing} digest(s) not present in the base manifest")]
    Patch { missing: usize },

    #[error("malformed digest vector: length {len} is not a multiple of 32")]
    MalformedVector { len: usize },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
