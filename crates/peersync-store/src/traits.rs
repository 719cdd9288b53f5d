//! DataSource trait: the interface the sync engine needs from an object store.
//!
//! The store itself (its storage engine, indexing, durability) is not the
//! engine's concern. Implementations only have to provide transactional
//! merges, lookup by digest, a state blob, and a phase hook.

use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use peersync_core::{Digest, DigestVector, Manifest, SyncObject};

use crate::error::{Result, StoreError};

/// Transaction phase reported to the hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// About to commit. The hook may still write state or abort.
    WillCommit,
    /// Committed.
    DidCommit,
    /// Rolled back; nothing was applied.
    DidRollback,
}

/// Who opened the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// A local writer (application code).
    Local,
    /// The sync engine applying a peer's message.
    Peer,
}

/// Outcome of merging an object received from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    /// The key was new; the object was stored.
    Created,
    /// A conflicting local version existed and the incoming one replaced it.
    PeerWins,
    /// The local version was kept. `local` is its digest.
    LocalWins { local: Digest },
}

/// Hook invoked for every phase of every transaction.
///
/// Arguments: the transaction (so will-commit can write state into it), the
/// phase, the change source, and the removed / added object digests.
pub type NotifyPhase = Arc<
    dyn Fn(&mut dyn Transaction, Phase, ChangeSource, &DigestVector, &DigestVector) -> Result<()>
        + Send
        + Sync,
>;

/// Mutations staged inside one data source transaction.
pub trait Transaction {
    /// Read an object, including writes staged in this transaction.
    fn get_object(&self, key: &str) -> Result<Option<SyncObject>>;

    /// Store an object, replacing any version under the same key.
    ///
    /// Returns the object's digest.
    fn put_object(&mut self, object: SyncObject) -> Result<Digest>;

    /// Delete the object stored under `key`. Returns false if there was none.
    fn delete_object(&mut self, key: &str) -> Result<bool>;

    /// Merge an object received from a peer.
    ///
    /// `hint` is the sender's manifest as far as the engine knows it.
    /// A refusal is reported as `Err(StoreError::MergeFailed)`.
    fn merge_object(&mut self, object: SyncObject, hint: Option<&Manifest>) -> Result<MergeResult>;

    /// Write a named state blob as part of this transaction.
    fn set_state(&mut self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Net `(removed, added)` object digests staged so far.
    fn changes(&self) -> Result<(DigestVector, DigestVector)>;
}

/// The data source trait: everything the engine needs from an object store.
///
/// Implementations must be thread-safe. Transactions may run on any thread.
pub trait DataSource: Send + Sync {
    /// Stable name, used to key engines in a registry.
    fn name(&self) -> &str;

    /// Digests of every object currently committed.
    fn current_manifest(&self) -> Result<Manifest>;

    /// Visit the serialized form of each listed object.
    ///
    /// `None` means the store has no object with that digest. Iteration stops
    /// early when `f` returns `ControlFlow::Break`.
    fn for_each_object(
        &self,
        digests: &DigestVector,
        f: &mut dyn FnMut(&Digest, Option<Bytes>) -> ControlFlow<()>,
    ) -> Result<()>;

    /// Read a committed state blob.
    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Install or remove the phase hook.
    fn set_notify_phase(&self, hook: Option<NotifyPhase>);

    /// Run `f` inside a transaction and commit it if `f` succeeds.
    ///
    /// The phase hook sees `WillCommit` before the commit, then `DidCommit`;
    /// any failure (from `f`, the hook, or the commit itself) reports
    /// `DidRollback` and nothing is applied.
    fn transact(
        &self,
        source: ChangeSource,
        f: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>,
    ) -> Result<()>;

    /// Per-peer policy: a local commit is about to change the manifest.
    fn peer_will_commit(&self, _peer_id: &str, _removed: &DigestVector, _added: &DigestVector) {}

    /// Per-peer policy: a peer's confirmed manifest changed.
    fn peer_did_receive(
        &self,
        _peer_id: &str,
        _removals: &DigestVector,
        _additions: &DigestVector,
        _confirmed: &Manifest,
        _local: &Manifest,
    ) {
    }
}

/// Extension trait for common data source patterns.
pub trait DataSourceExt: DataSource {
    /// Run a transaction whose body produces a value.
    fn transaction<T, F>(&self, source: ChangeSource, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T>;
}

impl<D: DataSource + ?Sized> DataSourceExt for D {
    fn transaction<T, F>(&self, source: ChangeSource, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T>,
    {
        let mut body = Some(f);
        let mut output = None;

        self.transact(source, &mut |tx| {
            let body = body
                .take()
                .ok_or_else(|| StoreError::Aborted("transaction body ran twice".into()))?;
            output = Some(body(tx)?);
            Ok(())
        })?;

        output.ok_or_else(|| StoreError::Aborted("transaction produced no output".into()))
    }
}
