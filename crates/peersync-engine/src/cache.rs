//! Manifest cache: digest -> manifest, shared by every peer record.

use std::collections::{HashMap, HashSet};

use peersync_core::{Digest, Manifest};

/// Engine-owned cache of manifests, keyed by manifest digest.
///
/// Lets the engine resolve a digest named in a message (a peer's manifest,
/// a base, a proposal) back to its content. Entries are plain [`Manifest`]
/// handles; eviction only drops the cache's handle, never one a peer record
/// still holds.
#[derive(Debug, Clone, Default)]
pub struct ManifestCache {
    entries: HashMap<Digest, Manifest>,
}

impl ManifestCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `manifest` unless an equal one is cached; return the cached one.
    pub fn get_or_insert(&mut self, manifest: Manifest) -> Manifest {
        self.entries
            .entry(manifest.digest())
            .or_insert(manifest)
            .clone()
    }

    /// Look up a manifest by digest.
    pub fn lookup(&self, digest: &Digest) -> Option<Manifest> {
        self.entries.get(digest).cloned()
    }

    /// Keep only the manifests whose digest is in `referenced`.
    ///
    /// Returns the number of evicted entries.
    pub fn retain(&mut self, referenced: &HashSet<Digest>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|digest, _| referenced.contains(digest));
        before - self.entries.len()
    }

    /// Number of cached manifests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over cached manifests.
    pub fn iter(&self) -> impl Iterator<Item = &Manifest> {
        self.entries.values()
    }
}
