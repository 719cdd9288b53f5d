//! Proptest generators for property-based testing.

use proptest::prelude::*;

use peersync_core::{Digest, DigestVector, Manifest, SyncObject};

/// Generate a random Digest.
pub fn digest() -> impl Strategy<Value = Digest> {
    any::<[u8; 32]>().prop_map(Digest::from_bytes)
}

/// Generate a digest from a small pool, so independent vectors overlap.
pub fn pooled_digest(pool: u8) -> impl Strategy<Value = Digest> {
    (0..pool).prop_map(|n| Digest::from_bytes([n; 32]))
}

/// Generate a DigestVector of up to `max_len` pooled digests.
pub fn digest_vector(max_len: usize) -> impl Strategy<Value = DigestVector> {
    prop::collection::vec(pooled_digest(64), 0..=max_len).prop_map(DigestVector::from)
}

/// Generate a Manifest of up to `max_len` pooled digests.
pub fn manifest(max_len: usize) -> impl Strategy<Value = Manifest> {
    digest_vector(max_len).prop_map(Manifest::new)
}

/// Generate an object key.
pub fn object_key() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,15}".prop_map(String::from)
}

/// Generate a SyncObject with a payload of up to `max_len` bytes.
pub fn sync_object(max_len: usize) -> impl Strategy<Value = SyncObject> {
    (
        object_key(),
        0i64..=1_700_000_000_000i64,
        prop::collection::vec(any::<u8>(), 0..=max_len),
    )
        .prop_map(|(key, modified, data)| SyncObject::new(key, modified, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn test_diff_then_patch_reaches_target(a in manifest(32), b in manifest(32)) {
            let (removed, added) = Manifest::diff(Some(&a), Some(&b));
            let patched = Manifest::patch(Some(&a), &removed, &added).unwrap();
            prop_assert_eq!(patched.digest(), b.digest());
        }

        #[test]
        fn test_manifest_digest_ignores_insert_order(v in prop::collection::vec(pooled_digest(64), 0..32)) {
            let mut reversed = v.clone();
            reversed.reverse();
            prop_assert_eq!(
                Manifest::new(DigestVector::from(v)).digest(),
                Manifest::new(DigestVector::from(reversed)).digest()
            );
        }

        #[test]
        fn test_object_digest_deterministic(object in sync_object(256)) {
            let bytes = object.encode().unwrap();
            prop_assert_eq!(SyncObject::decode(&bytes).unwrap(), object.clone());
            prop_assert_eq!(object.digest().unwrap(), Digest::hash(&bytes));
        }

        #[test]
        fn test_supersedes_is_antisymmetric(a in sync_object(16), b in sync_object(16)) {
            let (da, db) = (a.digest().unwrap(), b.digest().unwrap());
            prop_assume!(da != db);
            prop_assert_ne!(a.supersedes(&da, &b, &db), b.supersedes(&db, &a, &da));
        }
    }
}
