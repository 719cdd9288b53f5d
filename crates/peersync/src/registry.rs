//! The engine registry: one engine per data source.
//!
//! The registry is an ordinary value owned by whatever owns the data
//! sources. Engines are keyed by [`DataSource::name`]; opening a name twice
//! returns the running engine.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use peersync_engine::{EngineConfig, EngineHandle};
use peersync_store::DataSource;

use crate::error::Result;

/// Configuration for the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Configuration for every engine the registry opens.
    pub engine: EngineConfig,
}

/// Owns the engines of a process.
pub struct EngineRegistry {
    config: RegistryConfig,
    engines: RwLock<HashMap<String, EngineHandle>>,
}

impl EngineRegistry {
    /// Create an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            engines: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The engine for `data_source`, starting it if needed.
    pub async fn open(&self, data_source: Arc<dyn DataSource>) -> Result<EngineHandle> {
        let name = data_source.name().to_string();
        if let Some(handle) = self.engines.read().await.get(&name) {
            return Ok(handle.clone());
        }

        let mut engines = self.engines.write().await;
        // Another caller may have opened it while we waited for the lock.
        if let Some(handle) = engines.get(&name) {
            return Ok(handle.clone());
        }

        let handle = EngineHandle::spawn(data_source, self.config.engine.clone())?;
        engines.insert(name.clone(), handle.clone());
        debug!(store = %name, engines = engines.len(), "engine opened");
        Ok(handle)
    }

    /// The running engine for the data source called `name`.
    pub async fn get(&self, name: &str) -> Option<EngineHandle> {
        self.engines.read().await.get(name).cloned()
    }

    /// Names of every open engine, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.engines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.engines.read().await.is_empty()
    }

    /// Stop and forget the engine for `name`. Returns false if none was open.
    pub async fn close(&self, name: &str) -> Result<bool> {
        let handle = self.engines.write().await.remove(name);
        match handle {
            Some(handle) => {
                handle.shutdown().await?;
                debug!(store = %name, "engine closed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop every engine. All are attempted; the first failure is returned.
    pub async fn shutdown_all(&self) -> Result<()> {
        let engines: Vec<(String, EngineHandle)> =
            self.engines.write().await.drain().collect();

        let mut first_error = None;
        for (name, handle) in engines {
            if let Err(e) = handle.shutdown().await {
                warn!(store = %name, "engine shutdown failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersync_engine::PeerId;
    use peersync_store::MemoryDataSource;

    #[tokio::test]
    async fn test_open_is_get_or_create() {
        let registry = EngineRegistry::default();
        let store = Arc::new(MemoryDataSource::new("notes"));

        let first = registry.open(store.clone()).await.unwrap();
        first
            .circle_changed(Some(PeerId::from("me")), vec![PeerId::from("me")], Vec::new())
            .await
            .unwrap();

        // Same worker: the second handle sees the membership.
        let second = registry.open(store).await.unwrap();
        assert!(second.local_manifest().await.unwrap().is_some());
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("notes").await.unwrap().name(), "notes");
    }

    #[tokio::test]
    async fn test_close_and_shutdown_all() {
        let registry = EngineRegistry::default();
        for name in ["a", "b", "c"] {
            registry
                .open(Arc::new(MemoryDataSource::new(name)))
                .await
                .unwrap();
        }
        assert_eq!(registry.names().await, vec!["a", "b", "c"]);

        let b = registry.get("b").await.unwrap();
        assert!(registry.close("b").await.unwrap());
        assert!(!registry.close("b").await.unwrap());
        assert!(b.local_manifest().await.is_err());

        registry.shutdown_all().await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[test]
    fn test_config_from_json() {
        let config: RegistryConfig =
            serde_json::from_str(r#"{ "engine": { "max_message_bytes": 1024 } }"#).unwrap();
        assert_eq!(config.engine.max_message_bytes, 1024);
        assert_eq!(config.engine.history_depth, 4);
    }
}
