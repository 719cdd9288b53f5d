//! In-memory implementation of the DataSource trait.
//!
//! This is primarily for testing. It has real transaction semantics (staged
//! writes, phase hooks, rollback) but keeps everything in memory with no
//! persistence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use bytes::Bytes;
use peersync_core::{Digest, DigestVector, Manifest, SyncObject};

use crate::error::{Result, StoreError};
use crate::traits::{
    ChangeSource, DataSource, DataSourceExt, MergeResult, NotifyPhase, Phase, Transaction,
};

/// In-memory data source.
///
/// Thread-safe. Commits are optimistic: a transaction records the store
/// version it started from and fails with [`StoreError::Conflict`] if another
/// commit landed first.
pub struct MemoryDataSource {
    name: String,
    inner: Mutex<MemoryInner>,
    hook: RwLock<Option<NotifyPhase>>,
    /// Keys whose merges are refused (failure injection).
    rejected: RwLock<HashSet<String>>,
}

struct MemoryInner {
    /// Bumped on every commit.
    version: u64,

    /// Objects indexed by key.
    objects: BTreeMap<String, StoredObject>,

    /// Digest index: digest -> key.
    by_digest: HashMap<Digest, String>,

    /// Named state blobs.
    state: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    digest: Digest,
    bytes: Bytes,
}

impl MemoryDataSource {
    /// Create a new empty data source.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(MemoryInner {
                version: 0,
                objects: BTreeMap::new(),
                by_digest: HashMap::new(),
                state: HashMap::new(),
            }),
            hook: RwLock::new(None),
            rejected: RwLock::new(HashSet::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hook(&self) -> Option<NotifyPhase> {
        self.hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify(
        &self,
        tx: &mut dyn Transaction,
        phase: Phase,
        source: ChangeSource,
        removed: &DigestVector,
        added: &DigestVector,
    ) -> Result<()> {
        match self.hook() {
            Some(hook) => hook(tx, phase, source, removed, added),
            None => Ok(()),
        }
    }

    fn rollback(&self, tx: &mut MemoryTransaction<'_>, source: ChangeSource) {
        let empty = DigestVector::new();
        if let Err(e) = self.notify(tx, Phase::DidRollback, source, &empty, &empty) {
            tracing::warn!(store = %self.name, "rollback hook failed: {}", e);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience operations (each runs as its own local transaction)
    // ─────────────────────────────────────────────────────────────────────────

    /// Store an object in a local transaction. Returns its digest.
    pub fn insert(&self, object: SyncObject) -> Result<Digest> {
        self.transaction(ChangeSource::Local, |tx| tx.put_object(object))
    }

    /// Delete an object in a local transaction.
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.transaction(ChangeSource::Local, |tx| tx.delete_object(key))
    }

    /// Read a committed object by key.
    pub fn get(&self, key: &str) -> Result<Option<SyncObject>> {
        let stored = self.lock().objects.get(key).cloned();
        stored
            .map(|s| SyncObject::decode(&s.bytes).map_err(StoreError::from))
            .transpose()
    }

    /// Number of committed objects.
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    /// True if no objects are committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if a phase hook is installed.
    pub fn has_hook(&self) -> bool {
        self.hook().is_some()
    }

    /// Overwrite the stored bytes of an object without going through a
    /// transaction, simulating on-disk corruption.
    pub fn corrupt_object(&self, digest: &Digest, bytes: impl Into<Bytes>) -> bool {
        let mut inner = self.lock();
        let key = match inner.by_digest.get(digest) {
            Some(key) => key.clone(),
            None => return false,
        };
        match inner.objects.get_mut(&key) {
            Some(stored) => {
                stored.bytes = bytes.into();
                true
            }
            None => false,
        }
    }

    /// Refuse every future merge of `key`.
    pub fn reject_merges_for(&self, key: impl Into<String>) {
        self.rejected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into());
    }

    fn is_rejected(&self, key: &str) -> bool {
        self.rejected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

impl DataSource for MemoryDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_manifest(&self) -> Result<Manifest> {
        let inner = self.lock();
        Ok(inner.objects.values().map(|s| s.digest).collect())
    }

    fn for_each_object(
        &self,
        digests: &DigestVector,
        f: &mut dyn FnMut(&Digest, Option<Bytes>) -> ControlFlow<()>,
    ) -> Result<()> {
        for digest in digests.iter() {
            // Copy out under the lock; never call back while holding it.
            let bytes = {
                let inner = self.lock();
                inner
                    .by_digest
                    .get(&digest)
                    .and_then(|key| inner.objects.get(key))
                    .map(|s| s.bytes.clone())
            };
            if f(&digest, bytes).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().state.get(key).cloned())
    }

    fn set_notify_phase(&self, hook: Option<NotifyPhase>) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    fn transact(
        &self,
        source: ChangeSource,
        f: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>,
    ) -> Result<()> {
        let base_version = self.lock().version;
        let mut tx = MemoryTransaction {
            store: self,
            writes: BTreeMap::new(),
            state_writes: BTreeMap::new(),
        };

        if let Err(e) = f(&mut tx) {
            self.rollback(&mut tx, source);
            return Err(e);
        }

        let (removed, added) = tx.changes()?;
        if let Err(e) = self.notify(&mut tx, Phase::WillCommit, source, &removed, &added) {
            self.rollback(&mut tx, source);
            return Err(e);
        }

        {
            let mut inner = self.lock();
            if inner.version != base_version {
                drop(inner);
                self.rollback(&mut tx, source);
                return Err(StoreError::Conflict { base_version });
            }

            for (key, write) in std::mem::take(&mut tx.writes) {
                if let Some(old) = inner.objects.remove(&key) {
                    inner.by_digest.remove(&old.digest);
                }
                if let Some(new) = write {
                    inner.by_digest.insert(new.digest, key.clone());
                    inner.objects.insert(key, new);
                }
            }
            for (key, bytes) in std::mem::take(&mut tx.state_writes) {
                inner.state.insert(key, bytes);
            }
            inner.version += 1;
        }

        if let Err(e) = self.notify(&mut tx, Phase::DidCommit, source, &removed, &added) {
            tracing::warn!(store = %self.name, "did-commit hook failed: {}", e);
        }
        Ok(())
    }
}

/// A transaction against a [`MemoryDataSource`].
///
/// Writes are staged and only become visible on commit.
struct MemoryTransaction<'a> {
    store: &'a MemoryDataSource,
    /// Staged object writes; `None` is a delete.
    writes: BTreeMap<String, Option<StoredObject>>,
    state_writes: BTreeMap<String, Vec<u8>>,
}

impl MemoryTransaction<'_> {
    fn stored(&self, key: &str) -> Option<StoredObject> {
        match self.writes.get(key) {
            Some(staged) => staged.clone(),
            None => self.store.lock().objects.get(key).cloned(),
        }
    }

    fn stage(&mut self, object: &SyncObject) -> Result<StoredObject> {
        let bytes = Bytes::from(object.encode()?);
        let stored = StoredObject {
            digest: Digest::hash(&bytes),
            bytes,
        };
        self.writes.insert(object.key.clone(), Some(stored.clone()));
        Ok(stored)
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn get_object(&self, key: &str) -> Result<Option<SyncObject>> {
        self.stored(key)
            .map(|s| SyncObject::decode(&s.bytes).map_err(StoreError::from))
            .transpose()
    }

    fn put_object(&mut self, object: SyncObject) -> Result<Digest> {
        Ok(self.stage(&object)?.digest)
    }

    fn delete_object(&mut self, key: &str) -> Result<bool> {
        let existed = self.stored(key).is_some();
        if existed {
            self.writes.insert(key.to_string(), None);
        }
        Ok(existed)
    }

    fn merge_object(&mut self, object: SyncObject, _hint: Option<&Manifest>) -> Result<MergeResult> {
        if self.store.is_rejected(&object.key) {
            return Err(StoreError::MergeFailed {
                key: object.key,
                reason: "merges refused for this key".into(),
            });
        }

        let incoming = object.digest()?;
        let existing = match self.stored(&object.key) {
            None => {
                self.stage(&object)?;
                return Ok(MergeResult::Created);
            }
            Some(existing) => existing,
        };

        if existing.digest == incoming {
            return Ok(MergeResult::LocalWins {
                local: existing.digest,
            });
        }

        let peer_wins = match SyncObject::decode(&existing.bytes) {
            Ok(local) => object.supersedes(&incoming, &local, &existing.digest),
            // An unreadable local copy never wins.
            Err(_) => true,
        };

        if peer_wins {
            self.stage(&object)?;
            Ok(MergeResult::PeerWins)
        } else {
            Ok(MergeResult::LocalWins {
                local: existing.digest,
            })
        }
    }

    fn set_state(&mut self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.state_writes.insert(key.to_string(), bytes);
        Ok(())
    }

    fn changes(&self) -> Result<(DigestVector, DigestVector)> {
        let inner = self.store.lock();
        let mut removed = DigestVector::new();
        let mut added = DigestVector::new();

        for (key, write) in &self.writes {
            let before = inner.objects.get(key).map(|s| s.digest);
            let after = write.as_ref().map(|s| s.digest);
            if before == after {
                continue;
            }
            if let Some(digest) = before {
                removed.append(digest);
            }
            if let Some(digest) = after {
                added.append(digest);
            }
        }

        removed.sort();
        added.sort();
        Ok((removed, added))
    }
}
