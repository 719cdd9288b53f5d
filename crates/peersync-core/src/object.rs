//! Sync objects and their deterministic encoding.
//!
//! An object is a keyed, timestamped blob. Its identity is the digest of its
//! encoding, so the encoding must be byte-for-byte deterministic:
//! - a CBOR map with small integer keys written in ascending order
//! - definite lengths only
//! - integers in their shortest form (ciborium's default)

use bytes::Bytes;
use ciborium::value::{Integer, Value};

use crate::digest::Digest;
use crate::error::{CoreError, Result};

/// Field keys. Keys 0-23 encode as single bytes in CBOR.
mod keys {
    pub const KEY: u64 = 0;
    pub const MODIFIED: u64 = 1;
    pub const DATA: u64 = 2;
}

/// A keyed object replicated between peers.
///
/// Two objects with the same `key` but different content are conflicting
/// versions of one logical record; see [`SyncObject::supersedes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncObject {
    /// Primary key within the store.
    pub key: String,
    /// Last modification time (Unix ms).
    pub modified: i64,
    /// Opaque payload.
    pub data: Bytes,
}

impl SyncObject {
    pub fn new(key: impl Into<String>, modified: i64, data: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            modified,
            data: data.into(),
        }
    }

    /// Encode to deterministic CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let value = Value::Map(vec![
            (Value::Integer(keys::KEY.into()), Value::Text(self.key.clone())),
            (
                Value::Integer(keys::MODIFIED.into()),
                Value::Integer(self.modified.into()),
            ),
            (
                Value::Integer(keys::DATA.into()),
                Value::Bytes(self.data.to_vec()),
            ),
        ]);

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).map_err(|e| CoreError::Encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR bytes produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value =
            ciborium::from_reader(bytes).map_err(|e| CoreError::Decoding(e.to_string()))?;

        let entries = match value {
            Value::Map(entries) => entries,
            _ => return Err(CoreError::Decoding("object is not a map".into())),
        };

        let mut key = None;
        let mut modified = None;
        let mut data = None;

        for (k, v) in entries {
            let k = match k {
                Value::Integer(i) => u64::try_from(i)
                    .map_err(|_| CoreError::Decoding("negative field key".into()))?,
                _ => return Err(CoreError::Decoding("non-integer field key".into())),
            };
            match (k, v) {
                (keys::KEY, Value::Text(s)) => key = Some(s),
                (keys::MODIFIED, Value::Integer(i)) => {
                    modified = Some(integer_to_i64(i)?);
                }
                (keys::DATA, Value::Bytes(b)) => data = Some(Bytes::from(b)),
                (k, _) => {
                    return Err(CoreError::Decoding(format!("unexpected field {}", k)));
                }
            }
        }

        Ok(Self {
            key: key.ok_or_else(|| CoreError::Decoding("missing key".into()))?,
            modified: modified.ok_or_else(|| CoreError::Decoding("missing modified".into()))?,
            data: data.ok_or_else(|| CoreError::Decoding("missing data".into()))?,
        })
    }

    /// Digest of the encoded object.
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::hash(&self.encode()?))
    }

    /// Decide whether `self` should replace `other` when both share a key.
    ///
    /// The newer modification time wins; ties go to the larger digest so
    /// every peer picks the same winner.
    pub fn supersedes(&self, self_digest: &Digest, other: &SyncObject, other_digest: &Digest) -> bool {
        match self.modified.cmp(&other.modified) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self_digest > other_digest,
        }
    }
}

fn integer_to_i64(i: Integer) -> Result<i64> {
    i64::try_from(i).map_err(|_| CoreError::Decoding("modified out of range".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_is_deterministic() {
        let a = SyncObject::new("item/1", 1_700_000_000_000, &b"secret"[..]);
        let b = SyncObject::new("item/1", 1_700_000_000_000, &b"secret"[..]);
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn test_encoding_starts_with_three_entry_map() {
        let object = SyncObject::new("k", 0, Bytes::new());
        let bytes = object.encode().unwrap();
        assert_eq!(bytes[0], 0xa3);
        assert_eq!(bytes[1], 0x00);
    }

    #[test]
    fn test_decode_roundtrip() {
        let object = SyncObject::new("item/2", -5, vec![1u8, 2, 3]);
        let decoded = SyncObject::decode(&object.encode().unwrap()).unwrap();
        assert_eq!(decoded, object);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(SyncObject::decode(b"\xff\x00").is_err());
        assert!(SyncObject::decode(&[0xa0]).is_err()); // empty map
    }

    #[test]
    fn test_digest_changes_with_content() {
        let a = SyncObject::new("item", 1, &b"a"[..]);
        let b = SyncObject::new("item", 1, &b"b"[..]);
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn test_supersedes() {
        let old = SyncObject::new("item", 1, &b"old"[..]);
        let new = SyncObject::new("item", 2, &b"new"[..]);
        let (od, nd) = (old.digest().unwrap(), new.digest().unwrap());
        assert!(new.supersedes(&nd, &old, &od));
        assert!(!old.supersedes(&od, &new, &nd));

        let twin = SyncObject::new("item", 2, &b"twin"[..]);
        let td = twin.digest().unwrap();
        assert_ne!(new.supersedes(&nd, &twin, &td), twin.supersedes(&td, &new, &nd));
    }
}
