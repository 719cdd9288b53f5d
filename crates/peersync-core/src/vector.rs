//! Sorted, deduplicated digest vectors.
//!
//! All set algebra runs as a single linear merge over two sorted inputs, so
//! `union` and `diff` are O(n + m). Vectors built from unsorted sources (a
//! transaction log, a store scan) are filled with [`DigestVector::append`] and
//! then normalized with [`DigestVector::sort`]. Queries on a vector that was
//! appended to out of order and not sorted since are a bug: debug builds
//! panic, release builds pay for a sorted copy on every call.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::digest::{Digest, DIGEST_LEN};
use crate::error::{CoreError, Result};

/// A growable set of digests kept in ascending order without duplicates.
#[derive(Clone)]
pub struct DigestVector {
    digests: Vec<Digest>,
    /// False after an out-of-order `append` until the next `sort`.
    sorted: bool,
}

impl DigestVector {
    /// Create an empty vector.
    pub fn new() -> Self {
        Self {
            digests: Vec::new(),
            sorted: true,
        }
    }

    /// Create an empty vector with room for `capacity` digests.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            digests: Vec::with_capacity(capacity),
            sorted: true,
        }
    }

    /// Build a normalized vector from digests in any order.
    pub fn from_unsorted(digests: Vec<Digest>) -> Self {
        let mut vector = Self {
            digests,
            sorted: false,
        };
        vector.sort();
        vector
    }

    /// Wrap digests the caller guarantees are strictly ascending.
    fn from_sorted(digests: Vec<Digest>) -> Self {
        debug_assert!(digests.windows(2).all(|w| w[0] < w[1]));
        Self {
            digests,
            sorted: true,
        }
    }

    /// Append a digest. Order is restored lazily by [`sort`](Self::sort).
    pub fn append(&mut self, digest: Digest) {
        if let Some(last) = self.digests.last() {
            if *last >= digest {
                self.sorted = false;
            }
        }
        self.digests.push(digest);
    }

    /// Sort and deduplicate in place.
    pub fn sort(&mut self) {
        if !self.sorted {
            self.digests.sort_unstable();
            self.digests.dedup();
            self.sorted = true;
        }
    }

    /// True once every appended digest is in order.
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Number of digests.
    pub fn len(&self) -> usize {
        self.sorted_view().len()
    }

    /// True if the vector holds no digests.
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// The digests in ascending order.
    pub fn as_slice(&self) -> Cow<'_, [Digest]> {
        self.sorted_view()
    }

    /// Iterate over the digests in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Digest> + '_ {
        let view = self.sorted_view();
        (0..view.len()).map(move |i| view[i])
    }

    /// Check membership.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.sorted_view().binary_search(digest).is_ok()
    }

    /// Set union: every digest in `self` or `other`.
    pub fn union(&self, other: &DigestVector) -> DigestVector {
        let a = self.sorted_view();
        let b = other.sorted_view();
        let mut out = Vec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);

        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                Ordering::Less => {
                    out.push(a[i]);
                    i += 1;
                }
                Ordering::Greater => {
                    out.push(b[j]);
                    j += 1;
                }
                Ordering::Equal => {
                    out.push(a[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&a[i..]);
        out.extend_from_slice(&b[j..]);

        DigestVector::from_sorted(out)
    }

    /// Set difference in both directions.
    ///
    /// Returns `(only_in_self, only_in_other)`.
    pub fn diff(&self, other: &DigestVector) -> (DigestVector, DigestVector) {
        let a = self.sorted_view();
        let b = other.sorted_view();
        let mut only_a = Vec::new();
        let mut only_b = Vec::new();
        let (mut i, mut j) = (0, 0);

        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                Ordering::Less => {
                    only_a.push(a[i]);
                    i += 1;
                }
                Ordering::Greater => {
                    only_b.push(b[j]);
                    j += 1;
                }
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            }
        }
        only_a.extend_from_slice(&a[i..]);
        only_b.extend_from_slice(&b[j..]);

        (
            DigestVector::from_sorted(only_a),
            DigestVector::from_sorted(only_b),
        )
    }

    /// Digests present in both `self` and `other`.
    pub fn intersection(&self, other: &DigestVector) -> DigestVector {
        let a = self.sorted_view();
        let b = other.sorted_view();
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);

        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                Ordering::Less => i += 1,
                Ordering::Greater => j += 1,
                Ordering::Equal => {
                    out.push(a[i]);
                    i += 1;
                    j += 1;
                }
            }
        }

        DigestVector::from_sorted(out)
    }

    /// `self` minus `other`.
    pub fn subtract(&self, other: &DigestVector) -> DigestVector {
        self.diff(other).0
    }

    /// True if every digest in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &DigestVector) -> bool {
        self.subtract(other).is_empty()
    }

    /// Raw encoding: the concatenation of the sorted digests.
    pub fn to_bytes(&self) -> Vec<u8> {
        let view = self.sorted_view();
        let mut buf = Vec::with_capacity(view.len() * DIGEST_LEN);
        for digest in view.iter() {
            buf.extend_from_slice(digest.as_bytes());
        }
        buf
    }

    /// Decode the raw encoding produced by [`to_bytes`](Self::to_bytes).
    ///
    /// Input that is not sorted is normalized; input whose length is not a
    /// whole number of digests is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % DIGEST_LEN != 0 {
            return Err(CoreError::MalformedVector { len: bytes.len() });
        }

        let mut vector = DigestVector::with_capacity(bytes.len() / DIGEST_LEN);
        for chunk in bytes.chunks_exact(DIGEST_LEN) {
            let mut arr = [0u8; DIGEST_LEN];
            arr.copy_from_slice(chunk);
            vector.append(Digest(arr));
        }
        vector.sort();
        Ok(vector)
    }

    fn sorted_view(&self) -> Cow<'_, [Digest]> {
        debug_assert!(self.sorted, "DigestVector queried before sort()");
        self.normalized()
    }

    fn normalized(&self) -> Cow<'_, [Digest]> {
        if self.sorted {
            Cow::Borrowed(&self.digests)
        } else {
            let mut digests = self.digests.clone();
            digests.sort_unstable();
            digests.dedup();
            Cow::Owned(digests)
        }
    }
}

impl Default for DigestVector {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for DigestVector {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for DigestVector {}

impl fmt::Debug for DigestVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.normalized().iter()).finish()
    }
}

impl FromIterator<Digest> for DigestVector {
    fn from_iter<I: IntoIterator<Item = Digest>>(iter: I) -> Self {
        DigestVector::from_unsorted(iter.into_iter().collect())
    }
}

impl Extend<Digest> for DigestVector {
    fn extend<I: IntoIterator<Item = Digest>>(&mut self, iter: I) {
        for digest in iter {
            self.append(digest);
        }
    }
}

impl From<Vec<Digest>> for DigestVector {
    fn from(digests: Vec<Digest>) -> Self {
        DigestVector::from_unsorted(digests)
    }
}

// On the wire a vector is a single byte string, not an array of arrays.
impl Serialize for DigestVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for DigestVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct VectorVisitor;

        impl<'de> Visitor<'de> for VectorVisitor {
            type Value = DigestVector;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a byte string whose length is a multiple of {}", DIGEST_LEN)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Self::Value, E> {
                DigestVector::from_bytes(v).map_err(E::custom)
            }

            fn visit_byte_buf<E: de::Error>(
                self,
                v: Vec<u8>,
            ) -> std::result::Result<Self::Value, E> {
                self.visit_bytes(&v)
            }
        }

        deserializer.deserialize_bytes(VectorVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(n: u8) -> Digest {
        Digest::from_bytes([n; 32])
    }

    fn v(ns: &[u8]) -> DigestVector {
        ns.iter().copied().map(d).collect()
    }

    #[test]
    fn test_append_then_sort() {
        let mut vector = DigestVector::new();
        vector.append(d(3));
        vector.append(d(1));
        vector.append(d(3));
        vector.append(d(2));
        vector.sort();

        assert_eq!(&*vector.as_slice(), &[d(1), d(2), d(3)][..]);
        assert_eq!(vector.len(), 3);
    }

    #[test]
    fn test_out_of_order_append_needs_sort() {
        let mut vector = DigestVector::new();
        vector.append(d(1));
        vector.append(d(4));
        assert!(vector.is_sorted());

        vector.append(d(2));
        assert!(!vector.is_sorted());
        assert_eq!(vector, v(&[1, 2, 4]));

        vector.sort();
        assert!(vector.is_sorted());
        assert!(vector.contains(&d(2)));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "queried before sort")]
    fn test_query_before_sort_panics_in_debug() {
        let mut vector = DigestVector::new();
        vector.append(d(9));
        vector.append(d(4));
        vector.contains(&d(4));
    }

    #[test]
    fn test_union() {
        assert_eq!(v(&[1, 3, 5]).union(&v(&[2, 3, 6])), v(&[1, 2, 3, 5, 6]));
        assert_eq!(v(&[]).union(&v(&[7])), v(&[7]));
    }

    #[test]
    fn test_diff() {
        let (only_a, only_b) = v(&[1, 2, 3]).diff(&v(&[2, 3, 4]));
        assert_eq!(only_a, v(&[1]));
        assert_eq!(only_b, v(&[4]));
    }

    #[test]
    fn test_diff_with_empty() {
        let (only_a, only_b) = v(&[]).diff(&v(&[1, 2]));
        assert!(only_a.is_empty());
        assert_eq!(only_b, v(&[1, 2]));
    }

    #[test]
    fn test_intersection_and_subset() {
        assert_eq!(v(&[1, 2, 3]).intersection(&v(&[2, 3, 4])), v(&[2, 3]));
        assert!(v(&[2, 3]).is_subset_of(&v(&[1, 2, 3])));
        assert!(!v(&[2, 5]).is_subset_of(&v(&[1, 2, 3])));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let vector = v(&[5, 1, 9]);
        let bytes = vector.to_bytes();
        assert_eq!(bytes.len(), 3 * DIGEST_LEN);
        assert_eq!(DigestVector::from_bytes(&bytes).unwrap(), vector);
    }

    #[test]
    fn test_from_bytes_rejects_partial_digest() {
        let err = DigestVector::from_bytes(&[0u8; 33]).unwrap_err();
        assert!(matches!(err, CoreError::MalformedVector { len: 33 }));
    }

    #[test]
    fn test_cbor_encodes_as_byte_string() {
        let vector = v(&[1, 2]);
        let mut buf = Vec::new();
        ciborium::into_writer(&vector, &mut buf).unwrap();

        // Major type 2 (byte string), 1-byte length follows: 0x58 0x40.
        assert_eq!(&buf[..2], &[0x58, 0x40]);

        let decoded: DigestVector = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(decoded, vector);
    }

    proptest! {
        #[test]
        fn prop_union_commutative(a in proptest::collection::vec(any::<u8>(), 0..20),
                                  b in proptest::collection::vec(any::<u8>(), 0..20)) {
            let (a, b) = (v(&a), v(&b));
            prop_assert_eq!(a.union(&b), b.union(&a));
        }

        #[test]
        fn prop_union_idempotent(a in proptest::collection::vec(any::<u8>(), 0..20)) {
            let a = v(&a);
            prop_assert_eq!(a.union(&a), a);
        }

        #[test]
        fn prop_diff_partitions(a in proptest::collection::vec(any::<u8>(), 0..20),
                                b in proptest::collection::vec(any::<u8>(), 0..20)) {
            let (a, b) = (v(&a), v(&b));
            let (only_a, only_b) = a.diff(&b);
            let common = a.intersection(&b);
            prop_assert_eq!(only_a.union(&common), a.clone());
            prop_assert_eq!(only_b.union(&common), b.clone());
            prop_assert!(only_a.intersection(&b).is_empty());
        }
    }
}
