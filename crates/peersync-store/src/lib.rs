//! # peersync Store
//!
//! The data source abstraction the sync engine works against, plus an
//! in-memory transactional implementation.
//!
//! ## Overview
//!
//! The engine never owns object storage. It asks a [`DataSource`] for the
//! current manifest, reads serialized objects by digest, merges incoming
//! objects inside a [`Transaction`], and persists its own state blob under a
//! fixed key. In return the data source tells the engine about every
//! transaction through a phase hook ([`NotifyPhase`]).
//!
//! ## Key Types
//!
//! - [`DataSource`] - The trait for all store operations the engine needs
//! - [`Transaction`] - Mutations staged inside one transaction
//! - [`MergeResult`] - Outcome of merging a peer's object
//! - [`Phase`] / [`ChangeSource`] - Arguments to the phase hook
//! - [`MemoryDataSource`] - In-memory store for tests and demos
//!
//! ## Usage
//!
//! ```rust
//! use peersync_core::SyncObject;
//! use peersync_store::{DataSource, MemoryDataSource};
//!
//! let store = MemoryDataSource::new("keychain");
//! let digest = store.insert(SyncObject::new("item/1", 1, &b"hello"[..])).unwrap();
//! assert!(store.current_manifest().unwrap().contains(&digest));
//! ```
//!
//! ## Design Notes
//!
//! - **Optimistic commits**: the memory store runs the will-commit hook with no
//!   lock held; a concurrent commit makes the later one fail with `Conflict`
//! - **Deterministic merges**: conflicting versions of a key resolve the same
//!   way on every peer (newest wins, then largest digest)

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryDataSource;
pub use traits::{
    ChangeSource, DataSource, DataSourceExt, MergeResult, NotifyPhase, Phase, Transaction,
};
