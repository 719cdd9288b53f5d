//! Engine state and its persisted form.
//!
//! The persisted blob is CBOR (ciborium) written under the configured state
//! key inside the committing transaction. Manifests are stored once, in the
//! `manifests` table as raw digest-vector bytes, and referenced from peer
//! records by digest; pending sets are stored inline as raw digest vectors.
//!
//! Loading is forgiving: a missing, undecodable, or wrong-version blob
//! yields empty state, and individual entries that fail validation are
//! dropped with a warning.

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use peersync_core::{Digest, DigestVector, Manifest};
use peersync_store::DataSource;

use crate::cache::ManifestCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::peer::{PeerEntry, PeerId, PeerState, Sent};

/// Version of the persisted layout.
pub const STATE_VERSION: u32 = 1;

/// Everything the engine knows. Cloned for copy-then-swap updates.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    /// `None` when this device is not a circle member.
    pub(crate) my_id: Option<PeerId>,
    /// Trusted peers, in the order the circle reported them.
    pub(crate) trusted: Vec<PeerId>,
    /// Present only while a member.
    pub(crate) local: Option<Manifest>,
    pub(crate) cache: ManifestCache,
    pub(crate) peers: BTreeMap<PeerId, PeerEntry>,
    /// Digests dropped from the local manifest because the store could not
    /// produce valid bytes for them. The store still lists them until the
    /// broken object is rewritten or deleted.
    pub(crate) healed: DigestVector,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    #[serde(default)]
    my_peer_id: Option<PeerId>,
    #[serde(default)]
    trusted: Vec<PeerId>,
    #[serde(default)]
    peers: BTreeMap<PeerId, PersistedPeer>,
    #[serde(default)]
    manifests: Vec<PersistedManifest>,
    #[serde(default)]
    healed: Option<DigestVector>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedPeer {
    #[serde(default)]
    confirmed: Option<Bytes>,
    #[serde(default)]
    pending_objects: Option<DigestVector>,
    #[serde(default)]
    pending_deletes: Option<DigestVector>,
    #[serde(default)]
    history: Vec<PersistedSent>,
    #[serde(default)]
    sequence_number: u64,
    #[serde(default)]
    send_objects: bool,
    #[serde(default)]
    session: Option<Bytes>,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSent {
    local: Bytes,
    #[serde(default)]
    proposed: Option<Bytes>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedManifest {
    digest: Bytes,
    vector: Bytes,
}

impl EngineState {
    /// True while this device is a circle member.
    pub fn is_member(&self) -> bool {
        self.my_id.is_some()
    }

    /// True if `peer` is in the trusted set and is not this device.
    pub fn is_trusted(&self, peer: &PeerId) -> bool {
        self.my_id.as_ref() != Some(peer) && self.trusted.contains(peer)
    }

    /// Trusted peers other than this device.
    pub fn trusted_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.trusted
            .iter()
            .filter(move |id| self.my_id.as_ref() != Some(*id))
    }

    /// Resolve a manifest digest through the local manifest and the cache.
    pub fn find_manifest(&self, digest: &Digest) -> Option<Manifest> {
        match &self.local {
            Some(local) if local.digest() == *digest => Some(local.clone()),
            _ => self.cache.lookup(digest),
        }
    }

    /// Make the store's manifest the local one, minus healed digests.
    pub(crate) fn adopt_store_manifest(&mut self, current: Manifest) {
        self.healed = self.healed.intersection(current.vector());
        let local = if self.healed.is_empty() {
            current
        } else {
            Manifest::new(current.vector().subtract(&self.healed))
        };
        self.local = Some(self.cache.get_or_insert(local));
    }

    /// The peer's active state, creating it (or reviving a disabled entry)
    /// on first reference.
    pub(crate) fn peer_state_mut(&mut self, peer: &PeerId) -> &mut PeerState {
        let state = self
            .peers
            .remove(peer)
            .map(PeerEntry::activate)
            .unwrap_or_default();
        match self.peers.entry(peer.clone()).or_insert(PeerEntry::Active(state)) {
            PeerEntry::Active(state) => state,
            PeerEntry::Disabled { .. } => unreachable!("vacant entry filled with an active peer"),
        }
    }

    /// Evict cached manifests that neither the local manifest nor any
    /// trusted peer references. Returns the number evicted.
    pub(crate) fn collect_garbage(&mut self) -> usize {
        let mut referenced = HashSet::new();
        if let Some(local) = &self.local {
            referenced.insert(local.digest());
        }
        for (id, entry) in &self.peers {
            if !self.is_trusted(id) {
                continue;
            }
            if let PeerEntry::Active(peer) = entry {
                referenced.extend(peer.manifests().map(Manifest::digest));
            }
        }

        let evicted = self.cache.retain(&referenced);
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.cache.len(), "manifest cache collected");
        }
        evicted
    }

    /// Disable active entries for peers that are no longer trusted.
    pub(crate) fn restrict_to_trusted(&mut self) {
        let peers = std::mem::take(&mut self.peers);
        for (id, entry) in peers {
            if self.is_trusted(&id) || entry.is_disabled() {
                self.peers.insert(id, entry);
            } else if let Some(disabled) = entry.disable() {
                self.peers.insert(id, disabled);
            }
        }
    }
}

/// Serialize `state` for storage.
pub(crate) fn encode(state: &EngineState) -> Result<Vec<u8>> {
    let mut manifests: HashMap<Digest, &Manifest> = HashMap::new();
    for manifest in state.cache.iter() {
        manifests.insert(manifest.digest(), manifest);
    }

    let mut peers = BTreeMap::new();
    for (id, entry) in &state.peers {
        let persisted = match entry {
            PeerEntry::Active(peer) => {
                for manifest in peer.confirmed.iter().chain(
                    peer.history
                        .iter()
                        .flat_map(|sent| std::iter::once(&sent.local).chain(sent.proposed.iter())),
                ) {
                    manifests.insert(manifest.digest(), manifest);
                }
                PersistedPeer {
                    confirmed: peer.confirmed.as_ref().map(digest_bytes),
                    pending_objects: non_empty(&peer.pending_objects),
                    pending_deletes: non_empty(&peer.pending_deletes),
                    history: peer
                        .history
                        .iter()
                        .map(|sent| PersistedSent {
                            local: digest_bytes(&sent.local),
                            proposed: sent.proposed.as_ref().map(digest_bytes),
                        })
                        .collect(),
                    sequence_number: peer.sequence_number,
                    send_objects: peer.send_objects,
                    session: peer.session.clone(),
                    disabled: false,
                }
            }
            PeerEntry::Disabled { session } => PersistedPeer {
                session: Some(session.clone()),
                disabled: true,
                ..PersistedPeer::default()
            },
        };
        peers.insert(id.clone(), persisted);
    }

    let mut manifests: Vec<PersistedManifest> = manifests
        .into_iter()
        .map(|(digest, manifest)| PersistedManifest {
            digest: Bytes::copy_from_slice(digest.as_bytes()),
            vector: Bytes::from(manifest.to_bytes()),
        })
        .collect();
    manifests.sort_by(|a, b| a.digest.cmp(&b.digest));

    let persisted = PersistedState {
        version: STATE_VERSION,
        my_peer_id: state.my_id.clone(),
        trusted: state.trusted.clone(),
        peers,
        manifests,
        healed: non_empty_vector(&state.healed),
    };

    let mut buf = Vec::new();
    ciborium::ser::into_writer(&persisted, &mut buf)
        .map_err(|e| EngineError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Load engine state from the data source.
///
/// Only a failure to read the data source itself is an error. When the
/// loaded state says we are a member, the local manifest is re-read from
/// the data source.
pub(crate) fn load(data_source: &dyn DataSource, config: &EngineConfig) -> Result<EngineState> {
    let mut state = match data_source.get_state(&config.state_key)? {
        Some(bytes) => decode(&bytes),
        None => EngineState::default(),
    };

    if state.is_member() {
        state.adopt_store_manifest(data_source.current_manifest()?);
    }
    Ok(state)
}

/// Decode persisted state, dropping whatever does not validate.
pub(crate) fn decode(bytes: &[u8]) -> EngineState {
    let persisted: PersistedState = match ciborium::de::from_reader(bytes) {
        Ok(persisted) => persisted,
        Err(e) => {
            tracing::warn!("discarding undecodable engine state: {}", e);
            return EngineState::default();
        }
    };

    if persisted.version != STATE_VERSION {
        tracing::warn!(
            version = persisted.version,
            "discarding engine state with unsupported version"
        );
        return EngineState::default();
    }

    let mut cache = ManifestCache::new();
    for entry in persisted.manifests {
        let digest = match Digest::try_from(&entry.digest[..]) {
            Ok(digest) => digest,
            Err(_) => {
                tracing::warn!("dropping cached manifest with malformed digest");
                continue;
            }
        };
        match Manifest::from_bytes_checked(&entry.vector, &digest) {
            Ok(manifest) => {
                cache.get_or_insert(manifest);
            }
            Err(e) => tracing::warn!(%digest, "dropping cached manifest: {}", e),
        }
    }

    let resolve = |bytes: &Bytes| -> Option<Manifest> {
        let digest = Digest::try_from(&bytes[..]).ok()?;
        let found = cache.lookup(&digest);
        if found.is_none() {
            tracing::warn!(%digest, "persisted peer state references an unknown manifest");
        }
        found
    };

    let mut peers = BTreeMap::new();
    for (id, peer) in persisted.peers {
        if peer.disabled {
            if let Some(session) = peer.session {
                peers.insert(id, PeerEntry::Disabled { session });
            }
            continue;
        }

        let history = peer
            .history
            .iter()
            .filter_map(|sent| {
                Some(Sent {
                    local: resolve(&sent.local)?,
                    proposed: sent.proposed.as_ref().and_then(|p| resolve(p)),
                })
            })
            .collect();

        let state = PeerState {
            confirmed: peer.confirmed.as_ref().and_then(|c| resolve(c)),
            pending_objects: peer.pending_objects.map(Manifest::new).unwrap_or_default(),
            pending_deletes: peer.pending_deletes.map(Manifest::new).unwrap_or_default(),
            history,
            sequence_number: peer.sequence_number,
            send_objects: peer.send_objects,
            session: peer.session,
        };
        peers.insert(id, PeerEntry::Active(state));
    }

    EngineState {
        my_id: persisted.my_peer_id,
        trusted: persisted.trusted,
        local: None,
        cache,
        peers,
        healed: persisted.healed.unwrap_or_default(),
    }
}

fn digest_bytes(manifest: &Manifest) -> Bytes {
    Bytes::copy_from_slice(manifest.digest().as_bytes())
}

fn non_empty(manifest: &Manifest) -> Option<DigestVector> {
    non_empty_vector(manifest.vector())
}

fn non_empty_vector(vector: &DigestVector) -> Option<DigestVector> {
    if vector.is_empty() {
        None
    } else {
        Some(vector.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersync_core::SyncObject;
    use peersync_store::MemoryDataSource;

    fn manifest(ns: &[u8]) -> Manifest {
        ns.iter().map(|n| Digest::from_bytes([*n; 32])).collect()
    }

    fn sample() -> EngineState {
        let mut state = EngineState {
            my_id: Some(PeerId::from("me")),
            trusted: vec![PeerId::from("me"), PeerId::from("alice")],
            ..EngineState::default()
        };

        let confirmed = state.cache.get_or_insert(manifest(&[1]));
        let alice = state.peer_state_mut(&PeerId::from("alice"));
        alice.confirmed = Some(confirmed);
        alice.pending_objects = manifest(&[2]);
        alice.history.push_back(Sent {
            local: manifest(&[1, 2]),
            proposed: Some(manifest(&[1, 2])),
        });
        alice.sequence_number = 3;
        alice.session = Some(Bytes::from_static(b"alice-coder"));

        state.peers.insert(
            PeerId::from("bob"),
            PeerEntry::Disabled {
                session: Bytes::from_static(b"bob-coder"),
            },
        );
        state
    }

    #[test]
    fn test_encode_decode() {
        let state = sample();
        let decoded = decode(&encode(&state).unwrap());

        assert_eq!(decoded.my_id, state.my_id);
        assert_eq!(decoded.trusted, state.trusted);
        assert_eq!(decoded.peers, state.peers);
        assert!(decoded.cache.lookup(&manifest(&[1, 2]).digest()).is_some());
    }

    #[test]
    fn test_garbage_yields_empty_state() {
        let state = decode(b"not cbor at all");
        assert!(!state.is_member());
        assert!(state.peers.is_empty());
    }

    #[test]
    fn test_wrong_version_yields_empty_state() {
        let persisted = PersistedState {
            version: STATE_VERSION + 1,
            my_peer_id: Some(PeerId::from("me")),
            trusted: Vec::new(),
            peers: BTreeMap::new(),
            manifests: Vec::new(),
            healed: None,
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&persisted, &mut bytes).unwrap();

        assert!(!decode(&bytes).is_member());
    }

    #[test]
    fn test_mismatched_manifest_dropped() {
        let persisted = PersistedState {
            version: STATE_VERSION,
            my_peer_id: None,
            trusted: Vec::new(),
            peers: BTreeMap::from([(
                PeerId::from("alice"),
                PersistedPeer {
                    confirmed: Some(digest_bytes(&manifest(&[1]))),
                    ..PersistedPeer::default()
                },
            )]),
            manifests: vec![PersistedManifest {
                // Claims to be {1} but holds {2}.
                digest: digest_bytes(&manifest(&[1])),
                vector: Bytes::from(manifest(&[2]).to_bytes()),
            }],
            healed: None,
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&persisted, &mut bytes).unwrap();

        let state = decode(&bytes);
        assert!(state.cache.is_empty());
        let alice = state.peers[&PeerId::from("alice")].as_active().unwrap();
        assert!(alice.confirmed().is_none());
    }

    #[test]
    fn test_load_rereads_local_manifest() {
        let store = MemoryDataSource::new("test");
        let digest = store.insert(SyncObject::new("a", 1, &b"x"[..])).unwrap();

        let mut state = EngineState {
            my_id: Some(PeerId::from("me")),
            ..EngineState::default()
        };
        state.local = Some(Manifest::empty());

        let config = EngineConfig::default();
        store
            .transact(peersync_store::ChangeSource::Local, &mut |tx| {
                tx.set_state(&config.state_key, encode(&state).map_err(|e| {
                    peersync_store::StoreError::Aborted(e.to_string())
                })?)
            })
            .unwrap();

        let loaded = load(&store, &config).unwrap();
        assert!(loaded.local.unwrap().contains(&digest));
    }

    #[test]
    fn test_collect_garbage_keeps_referenced() {
        let mut state = sample();
        state.local = Some(state.cache.get_or_insert(manifest(&[1, 2, 3])));
        state.cache.get_or_insert(manifest(&[9]));
        // Referenced only by the history of a peer that is no longer trusted.
        state.trusted.retain(|id| id.as_str() != "alice");

        state.collect_garbage();
        assert!(state.cache.lookup(&manifest(&[1, 2, 3]).digest()).is_some());
        assert!(state.cache.lookup(&manifest(&[9]).digest()).is_none());
        assert!(state.cache.lookup(&manifest(&[1, 2]).digest()).is_none());
    }

    #[test]
    fn test_restrict_to_trusted_keeps_sessions() {
        let mut state = sample();
        state.trusted.retain(|id| id.as_str() != "alice");
        state.restrict_to_trusted();

        assert_eq!(
            state.peers[&PeerId::from("alice")],
            PeerEntry::Disabled {
                session: Bytes::from_static(b"alice-coder")
            }
        );
        assert!(state.peers[&PeerId::from("bob")].is_disabled());
    }

    #[test]
    fn test_healed_digests_stay_out_of_local() {
        let store = MemoryDataSource::new("test");
        let good = store.insert(SyncObject::new("a", 1, &b"x"[..])).unwrap();
        let broken = store.insert(SyncObject::new("b", 1, &b"y"[..])).unwrap();
        let gone = Digest::hash(b"no longer stored");

        let state = EngineState {
            my_id: Some(PeerId::from("me")),
            healed: DigestVector::from(vec![broken, gone]),
            ..EngineState::default()
        };
        let config = EngineConfig::default();
        store
            .transact(peersync_store::ChangeSource::Local, &mut |tx| {
                tx.set_state(&config.state_key, encode(&state).map_err(|e| {
                    peersync_store::StoreError::Aborted(e.to_string())
                })?)
            })
            .unwrap();

        let loaded = load(&store, &config).unwrap();
        assert_eq!(loaded.local.unwrap(), manifest_of(&[good]));
        // Digests the store no longer lists are forgotten.
        assert_eq!(loaded.healed, DigestVector::from(vec![broken]));
    }

    fn manifest_of(digests: &[Digest]) -> Manifest {
        digests.iter().copied().collect()
    }

    #[test]
    fn test_load_without_state_is_empty() {
        let store = MemoryDataSource::new("test");
        let loaded = load(&store, &EngineConfig::default()).unwrap();
        assert!(!loaded.is_member());
        assert!(loaded.local.is_none());
    }
}
