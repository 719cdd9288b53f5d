//! # Peersync Engine
//!
//! Manifest reconciliation between the peers of a trusted circle.
//!
//! ## Overview
//!
//! Each device keeps a [`Manifest`](peersync_core::Manifest) of the objects
//! in its data source. For every peer the engine remembers the manifest that
//! peer is confirmed to hold, diffs it against the local one, and ships the
//! objects the peer lacks. Incoming messages are merged inside a single data
//! source transaction; the sender's new manifest is rebuilt by patching the
//! base the message names.
//!
//! ## Key Properties
//!
//! - **Copy-then-swap**: a failed operation leaves the engine untouched
//! - **Resumable**: state is persisted with each commit and reloaded after a rollback
//! - **Self-healing**: corrupt or missing objects are dropped from the manifests
//! - **Bandwidth-bounded**: objects are batched up to a configured payload size
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use peersync_engine::{EngineConfig, EngineHandle, MemoryNetwork, PeerId};
//! use peersync_store::MemoryDataSource;
//!
//! async fn example() -> peersync_engine::Result<()> {
//!     let store = Arc::new(MemoryDataSource::new("notes"));
//!     let engine = EngineHandle::spawn(store, EngineConfig::default())?;
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
//!     Ok(())
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! A (confirmed B = ?)                        B
//!   |--- reset: sender=La, additions=La ----->|  B: confirmed A = La, resend all
//!   |<-- base=La, removals, objects(Lb) ------|
//!   |--- base=Lb, objects(La - Lb) ---------->|
//!   |<-- sender=La+Lb (no objects) -----------|
//!   |        (both sides now send nothing)    |
//! ```

pub mod cache;
pub mod config;
pub mod convergence;
pub mod engine;
pub mod error;
pub mod handle;
pub mod message;
pub mod peer;
pub mod state;
pub mod transport;

pub use cache::ManifestCache;
pub use config::EngineConfig;
pub use convergence::ConvergenceResult;
pub use engine::{Engine, Membership, Outgoing, SendToken};
pub use error::{EngineError, Result};
pub use handle::EngineHandle;
pub use message::{Extension, Message, WIRE_VERSION};
pub use peer::{PeerEntry, PeerId, PeerState, Sent};
pub use state::{EngineState, STATE_VERSION};
pub use transport::{memory::MemoryNetwork, memory::MemoryTransport, Transport};
