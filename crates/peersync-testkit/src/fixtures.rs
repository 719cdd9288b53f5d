//! Test fixtures and helpers.
//!
//! Common setup code for engine and integration tests. Engines here are
//! driven directly, without a worker thread or commit hook, so every local
//! commit goes through [`TestPeer::commit`].

use std::sync::Arc;

use rand::Rng;

use peersync_core::{Digest, DigestVector, Manifest, SyncObject};
use peersync_engine::{Engine, EngineConfig, Outgoing, PeerId, Result};
use peersync_store::{DataSource, MemoryDataSource};

/// An object with a fixed modification time.
pub fn object(key: &str, data: &[u8]) -> SyncObject {
    object_at(key, 1, data)
}

/// An object modified at `modified` (Unix ms).
pub fn object_at(key: &str, modified: i64, data: &[u8]) -> SyncObject {
    SyncObject::new(key, modified, data.to_vec())
}

/// An object with a random key and payload.
pub fn random_object<R: Rng>(rng: &mut R) -> SyncObject {
    let key: [u8; 8] = rng.gen();
    let mut data = vec![0u8; rng.gen_range(1..64)];
    rng.fill(&mut data[..]);
    object(&hex::encode(key), &data)
}

/// Store `count` objects named `{prefix}-{n}` in `store`.
pub fn populate(
    store: &MemoryDataSource,
    prefix: &str,
    count: usize,
) -> peersync_store::Result<Vec<Digest>> {
    (0..count)
        .map(|n| store.insert(object(&format!("{prefix}-{n}"), format!("{prefix}:{n}").as_bytes())))
        .collect()
}

/// One circle member: a memory store and the engine syncing it.
pub struct TestPeer {
    pub id: PeerId,
    pub store: Arc<MemoryDataSource>,
    pub engine: Engine,
}

impl TestPeer {
    /// A peer with an empty store that has not joined a circle yet.
    pub fn new(id: &str, config: EngineConfig) -> Result<Self> {
        let store = Arc::new(MemoryDataSource::new(id));
        let data_source: Arc<dyn DataSource> = store.clone();
        Ok(Self {
            id: PeerId::from(id),
            engine: Engine::open(data_source, config)?,
            store,
        })
    }

    /// Commit `object` and tell the engine about it.
    pub fn commit(&mut self, object: SyncObject) -> Result<Digest> {
        let digest = self.store.insert(object)?;
        self.engine
            .update_local_manifest(&DigestVector::new(), &DigestVector::from(vec![digest]))?;
        Ok(digest)
    }

    /// Delete the object under `key` and tell the engine about it.
    pub fn delete(&mut self, key: &str) -> Result<bool> {
        let before = self.store.current_manifest()?;
        if !self.store.remove(key)? {
            return Ok(false);
        }
        let after = self.store.current_manifest()?;
        let (removed, added) = Manifest::diff(Some(&before), Some(&after));
        self.engine.update_local_manifest(&removed, &added)?;
        Ok(true)
    }

    /// The engine's local manifest, empty when not a member.
    pub fn local(&self) -> Manifest {
        self.engine.local_manifest().cloned().unwrap_or_default()
    }
}

/// A set of peers that all trust each other.
pub struct TestCircle {
    pub peers: Vec<TestPeer>,
}

impl TestCircle {
    /// `count` peers named `peer-0`, `peer-1`, ...
    pub fn new(count: usize) -> Result<Self> {
        Self::with_config(count, EngineConfig::default())
    }

    pub fn with_config(count: usize, config: EngineConfig) -> Result<Self> {
        let mut peers = (0..count)
            .map(|n| TestPeer::new(&format!("peer-{n}"), config.clone()))
            .collect::<Result<Vec<_>>>()?;

        let trusted: Vec<PeerId> = peers.iter().map(|p| p.id.clone()).collect();
        for peer in &mut peers {
            peer.engine
                .circle_changed(Some(peer.id.clone()), trusted.clone(), &[])?;
        }
        Ok(Self { peers })
    }

    /// Two peers.
    pub fn pair() -> Result<Self> {
        Self::new(2)
    }

    pub fn peer(&self, index: usize) -> &TestPeer {
        &self.peers[index]
    }

    pub fn peer_mut(&mut self, index: usize) -> &mut TestPeer {
        &mut self.peers[index]
    }

    /// Build `from`'s next message for `to` and, if `deliver`, hand it over
    /// and confirm the send.
    ///
    /// Returns `Ok(false)` if there was nothing to send. An undelivered
    /// message leaves the sender's bookkeeping untouched, like a failed send.
    pub fn exchange(&mut self, from: usize, to: usize, deliver: bool) -> Result<bool> {
        let (sender, receiver) = pair_mut(&mut self.peers, from, to);
        match sender.engine.create_message(&receiver.id)? {
            Outgoing::Empty => Ok(false),
            Outgoing::Message { bytes, token } => {
                if deliver {
                    receiver.engine.handle_message(&sender.id, &bytes)?;
                    sender.engine.message_sent(token)?;
                } else {
                    tracing::debug!(from = %sender.id, to = %receiver.id, "dropping message");
                }
                Ok(true)
            }
        }
    }

    /// Union of every peer's local manifest.
    pub fn union(&self) -> Manifest {
        self.peers
            .iter()
            .fold(Manifest::empty(), |acc, peer| Manifest::union(&acc, &peer.local()))
    }

    /// True if every peer holds the same manifest.
    pub fn agrees(&self) -> bool {
        match self.peers.split_first() {
            Some((first, rest)) => rest.iter().all(|peer| peer.local() == first.local()),
            None => true,
        }
    }
}

/// Two distinct mutable elements of `peers`.
fn pair_mut(peers: &mut [TestPeer], a: usize, b: usize) -> (&mut TestPeer, &mut TestPeer) {
    assert_ne!(a, b, "a peer cannot message itself");
    if a < b {
        let (left, right) = peers.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = peers.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_circle_members_trust_each_other() {
        let circle = TestCircle::new(3).unwrap();
        for peer in &circle.peers {
            assert!(peer.engine.is_member());
            assert_eq!(peer.engine.trusted_peers().len(), 3);
        }
    }

    #[test]
    fn test_commit_and_delete() {
        let mut circle = TestCircle::pair().unwrap();
        let peer = circle.peer_mut(0);

        let digest = peer.commit(object("a", b"1")).unwrap();
        assert!(peer.local().contains(&digest));

        assert!(peer.delete("a").unwrap());
        assert!(peer.local().is_empty());
        assert!(!peer.delete("a").unwrap());
    }

    #[test]
    fn test_populate() {
        let store = MemoryDataSource::new("s");
        let digests = populate(&store, "note", 4).unwrap();
        assert_eq!(digests.len(), 4);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_random_objects_differ() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = random_object(&mut rng);
        let b = random_object(&mut rng);
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn test_exchange_without_delivery_is_retried() {
        let mut circle = TestCircle::pair().unwrap();
        circle.peer_mut(0).commit(object("a", b"1")).unwrap();

        assert!(circle.exchange(0, 1, false).unwrap());
        assert!(circle.peer(1).local().is_empty());
        // Nothing was recorded, so the same message is produced again.
        assert!(circle.exchange(0, 1, true).unwrap());
    }
}
