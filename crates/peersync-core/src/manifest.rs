//! Manifests: immutable, self-identifying sets of object digests.
//!
//! A [`Manifest`] is the complete set of object identities present in one
//! snapshot of a store. It is cheap to clone (shared via `Arc`) and never
//! changes after construction: every "update" is a [`Manifest::diff`] followed
//! by a [`Manifest::patch`] that yields a new manifest.
//!
//! Two manifests with the same content have the same digest and compare
//! equal, regardless of whether they share an allocation.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use crate::digest::Digest;
use crate::error::{CoreError, Result};
use crate::vector::DigestVector;

/// Domain prefix for manifest digests, so a manifest digest can never collide
/// with the digest of an object whose bytes happen to be a digest list.
const MANIFEST_DOMAIN: &[u8] = b"peersync-manifest-v0:";

/// An immutable, reference-counted set of object digests.
#[derive(Clone)]
pub struct Manifest {
    inner: Arc<ManifestInner>,
}

struct ManifestInner {
    vector: DigestVector,
    /// Computed on first access.
    digest: OnceLock<Digest>,
}

impl Manifest {
    /// Create a manifest, taking ownership of the vector.
    pub fn new(mut vector: DigestVector) -> Self {
        vector.sort();
        Self {
            inner: Arc::new(ManifestInner {
                vector,
                digest: OnceLock::new(),
            }),
        }
    }

    /// The manifest with no objects.
    pub fn empty() -> Self {
        Self::new(DigestVector::new())
    }

    /// The digest identifying this manifest's content.
    pub fn digest(&self) -> Digest {
        *self.inner.digest.get_or_init(|| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(MANIFEST_DOMAIN);
            for digest in self.inner.vector.iter() {
                hasher.update(digest.as_bytes());
            }
            Digest(*hasher.finalize().as_bytes())
        })
    }

    /// The underlying digest vector.
    pub fn vector(&self) -> &DigestVector {
        &self.inner.vector
    }

    /// Number of objects in the manifest.
    pub fn len(&self) -> usize {
        self.inner.vector.len()
    }

    /// True if the manifest lists no objects.
    pub fn is_empty(&self) -> bool {
        self.inner.vector.is_empty()
    }

    /// Check whether an object digest is listed.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.inner.vector.contains(digest)
    }

    /// Iterate over object digests in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Digest> + '_ {
        self.inner.vector.iter()
    }

    /// Raw encoding (see [`DigestVector::to_bytes`]).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.vector.to_bytes()
    }

    /// Decode a manifest from its raw encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(DigestVector::from_bytes(bytes)?))
    }

    /// Decode a manifest and check it against the digest it was stored under.
    pub fn from_bytes_checked(bytes: &[u8], expected: &Digest) -> Result<Self> {
        let manifest = Self::from_bytes(bytes)?;
        let actual = manifest.digest();
        if actual != *expected {
            return Err(CoreError::DigestMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(manifest)
    }

    /// Compute `(removed, added)` going from `a` to `b`.
    ///
    /// An absent manifest is treated as empty.
    pub fn diff(a: Option<&Manifest>, b: Option<&Manifest>) -> (DigestVector, DigestVector) {
        let empty = DigestVector::new();
        let a = a.map(Manifest::vector).unwrap_or(&empty);
        let b = b.map(Manifest::vector).unwrap_or(&empty);
        a.diff(b)
    }

    /// Apply `removed` and `added` to `base`.
    ///
    /// Fails if `removed` is not a subset of `base`: the caller's view of the
    /// base has diverged from whoever computed the diff.
    pub fn patch(
        base: Option<&Manifest>,
        removed: &DigestVector,
        added: &DigestVector,
    ) -> Result<Manifest> {
        let empty = DigestVector::new();
        let base = base.map(Manifest::vector).unwrap_or(&empty);

        let (kept, unknown) = base.diff(removed);
        if !unknown.is_empty() {
            return Err(CoreError::Patch {
                missing: unknown.len(),
            });
        }

        Ok(Manifest::new(kept.union(added)))
    }

    /// Every object listed in `a` or `b`.
    pub fn union(a: &Manifest, b: &Manifest) -> Manifest {
        Manifest::new(a.vector().union(b.vector()))
    }

    /// True if both handles share one allocation.
    pub fn ptr_eq(a: &Manifest, b: &Manifest) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Manifest {
    fn eq(&self, other: &Self) -> bool {
        Manifest::ptr_eq(self, other) || self.digest() == other.digest()
    }
}

impl Eq for Manifest {}

impl Hash for Manifest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest().hash(state);
    }
}

impl fmt::Debug for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Manifest({}, {} objects)", self.digest(), self.len())
    }
}

impl From<DigestVector> for Manifest {
    fn from(vector: DigestVector) -> Self {
        Manifest::new(vector)
    }
}

impl FromIterator<Digest> for Manifest {
    fn from_iter<I: IntoIterator<Item = Digest>>(iter: I) -> Self {
        Manifest::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(n: u8) -> Digest {
        Digest::from_bytes([n; 32])
    }

    fn m(ns: &[u8]) -> Manifest {
        ns.iter().copied().map(d).collect()
    }

    fn v(ns: &[u8]) -> DigestVector {
        ns.iter().copied().map(d).collect()
    }

    #[test]
    fn test_equality_is_by_content() {
        let a = m(&[1, 2]);
        let b = m(&[2, 1]);
        assert!(!Manifest::ptr_eq(&a, &b));
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a, m(&[1]));
    }

    #[test]
    fn test_empty_manifest_digest_is_stable() {
        assert_eq!(Manifest::empty().digest(), Manifest::default().digest());
        assert_ne!(Manifest::empty().digest(), m(&[0]).digest());
    }

    #[test]
    fn test_diff_against_absent() {
        let b = m(&[1, 2]);
        let (removed, added) = Manifest::diff(None, Some(&b));
        assert!(removed.is_empty());
        assert_eq!(added, v(&[1, 2]));

        let (removed, added) = Manifest::diff(Some(&b), None);
        assert_eq!(removed, v(&[1, 2]));
        assert!(added.is_empty());
    }

    #[test]
    fn test_patch() {
        let base = m(&[1, 2, 3]);
        let patched = Manifest::patch(Some(&base), &v(&[2]), &v(&[4])).unwrap();
        assert_eq!(patched, m(&[1, 3, 4]));
    }

    #[test]
    fn test_patch_rejects_removal_outside_base() {
        let base = m(&[1, 2]);
        let err = Manifest::patch(Some(&base), &v(&[2, 9]), &v(&[])).unwrap_err();
        assert!(matches!(err, CoreError::Patch { missing: 1 }));
    }

    #[test]
    fn test_patch_absent_base() {
        let patched = Manifest::patch(None, &v(&[]), &v(&[5, 6])).unwrap();
        assert_eq!(patched, m(&[5, 6]));
        assert!(Manifest::patch(None, &v(&[5]), &v(&[])).is_err());
    }

    #[test]
    fn test_checked_decode() {
        let manifest = m(&[7, 8]);
        let bytes = manifest.to_bytes();
        assert_eq!(Manifest::from_bytes_checked(&bytes, &manifest.digest()).unwrap(), manifest);

        let err = Manifest::from_bytes_checked(&bytes, &Digest::ZERO).unwrap_err();
        assert!(matches!(err, CoreError::DigestMismatch { .. }));
    }

    proptest! {
        #[test]
        fn prop_diff_patch_inverse(a in proptest::collection::vec(any::<u8>(), 0..24),
                                   b in proptest::collection::vec(any::<u8>(), 0..24)) {
            let (a, b) = (m(&a), m(&b));
            let (removed, added) = Manifest::diff(Some(&a), Some(&b));
            let patched = Manifest::patch(Some(&a), &removed, &added).unwrap();
            prop_assert_eq!(patched, b);
        }

        #[test]
        fn prop_union_laws(a in proptest::collection::vec(any::<u8>(), 0..24),
                           b in proptest::collection::vec(any::<u8>(), 0..24)) {
            let (a, b) = (m(&a), m(&b));
            prop_assert_eq!(Manifest::union(&a, &a), a.clone());
            prop_assert_eq!(Manifest::union(&a, &b), Manifest::union(&b, &a));
        }
    }
}
