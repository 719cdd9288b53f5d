//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Default cap on the serialized objects packed into one message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Default number of sent messages remembered per peer.
pub const DEFAULT_HISTORY_DEPTH: usize = 4;

/// Default data source key for the persisted engine state.
pub const DEFAULT_STATE_KEY: &str = "peersync.engine-state";

/// Configuration for engine behavior.
///
/// Every field has a default, so a partial document deserializes:
///
/// ```rust
/// use peersync_engine::EngineConfig;
///
/// let config: EngineConfig = serde_json::from_str(r#"{ "history_depth": 8 }"#).unwrap();
/// assert_eq!(config.history_depth, 8);
/// assert_eq!(config.max_message_bytes, 65_536);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stop packing objects once a message would exceed this many payload
    /// bytes. At least one object is always packed.
    pub max_message_bytes: usize,
    /// Sent messages remembered per peer. Their manifests stay cached so a
    /// peer's reply can be matched by digest.
    pub history_depth: usize,
    /// Key under which the engine state is stored in the data source.
    pub state_key: String,
    /// Extension OIDs this engine understands.
    pub known_extensions: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            history_depth: DEFAULT_HISTORY_DEPTH,
            state_key: DEFAULT_STATE_KEY.to_string(),
            known_extensions: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Builder-style setter for the message size cap.
    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    /// Builder-style setter for a known extension.
    pub fn with_extension(mut self, oid: impl Into<String>) -> Self {
        self.known_extensions.push(oid.into());
        self
    }

    /// True if `oid` is understood by this engine.
    pub fn knows_extension(&self, oid: &str) -> bool {
        self.known_extensions.iter().any(|known| known == oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_message_bytes, 65_536);
        assert_eq!(config.history_depth, 4);
        assert_eq!(config.state_key, "peersync.engine-state");
        assert!(config.known_extensions.is_empty());
    }

    #[test]
    fn test_empty_document_is_default() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_known_extensions() {
        let config = EngineConfig::default().with_extension("1.2.3");
        assert!(config.knows_extension("1.2.3"));
        assert!(!config.knows_extension("1.2.4"));
    }
}
