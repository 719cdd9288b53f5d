//! # Peersync
//!
//! Reconciles the object sets of devices in a trusted circle.
//!
//! ## Overview
//!
//! Peersync keeps a content-addressed manifest of every object in a data
//! source and exchanges manifest diffs with each trusted peer until all
//! members hold the same set:
//!
//! - **Data source**: the application's transactional object store
//! - **Engine**: per-data-source reconciliation state, run on its own worker
//! - **Registry**: the process-wide owner of engines, passed around explicitly
//! - **Transport**: whatever carries opaque message bytes between peers
//!
//! ## Key Concepts
//!
//! - **Manifest**: an immutable, sorted set of object digests with its own digest.
//! - **Confirmed manifest**: what both sides agree a peer holds.
//! - **Pending objects**: objects we still owe a peer.
//! - **Reset**: a message with no base, asking the receiver to resend everything.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use peersync::{EngineRegistry, MemoryDataSource, MemoryNetwork, PeerId, RegistryConfig};
//!
//! async fn example() -> peersync::Result<()> {
//!     let registry = EngineRegistry::new(RegistryConfig::default());
//!     let engine = registry.open(Arc::new(MemoryDataSource::new("notes"))).await?;
//!
//!     let me = PeerId::from("laptop");
//!     let phone = PeerId::from("phone");
//!     engine
//!         .circle_changed(Some(me.clone()), vec![me.clone(), phone.clone()], Vec::new())
//!         .await?;
//!
//!     let network = MemoryNetwork::new();
//!     let transport = network.create_transport(me).await;
//!     engine.sync_with(&transport, &phone).await?;
//!     engine.receive_from(&transport, Duration::from_secs(5)).await?;
//!
//!     registry.shutdown_all().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `peersync::core` - Digests, manifests and objects
//! - `peersync::store` - The data source seam and an in-memory data source
//! - `peersync::engine` - The reconciliation engine, its handle and transports

pub mod error;
pub mod registry;

// Re-export component crates
pub use peersync_core as core;
pub use peersync_engine as engine;
pub use peersync_store as store;

// Re-export main types for convenience
pub use error::{PeersyncError, Result};
pub use registry::{EngineRegistry, RegistryConfig};

// Re-export commonly used types
pub use peersync_core::{Digest, DigestVector, Manifest, SyncObject};
pub use peersync_engine::{
    ConvergenceResult, EngineConfig, EngineHandle, MemoryNetwork, MemoryTransport, Membership,
    PeerId, Transport,
};
pub use peersync_store::{ChangeSource, DataSource, MemoryDataSource, MergeResult};
