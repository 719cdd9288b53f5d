//! Content digests.
//!
//! A [`Digest`] identifies one object (the Blake3 hash of its encoded bytes) or
//! one manifest (the Blake3 hash of its sorted digest list).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length in bytes of every digest.
pub const DIGEST_LEN: usize = 32;

/// A 32-byte Blake3 content digest.
///
/// Ordering is lexicographic over the raw bytes, which is what the sorted
/// set algebra in [`DigestVector`](crate::DigestVector) relies on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Compute the Blake3 digest of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != DIGEST_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; DIGEST_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// The zero digest (sentinel value).
    pub const ZERO: Self = Self([0u8; DIGEST_LEN]);
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; DIGEST_LEN] = slice.try_into()?;
        Ok(Self(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex_roundtrip() {
        let digest = Digest::from_bytes([0x42; 32]);
        let hex = digest.to_hex();
        assert_eq!(Digest::from_hex(&hex).unwrap(), digest);
    }

    #[test]
    fn test_digest_from_hex_wrong_length() {
        assert!(Digest::from_hex("abcd").is_err());
    }

    #[test]
    fn test_digest_display() {
        let digest = Digest::from_bytes([0xab; 32]);
        assert_eq!(format!("{}", digest), "abababababababab");
    }

    #[test]
    fn test_digest_ordering_is_lexicographic() {
        let mut low = [0u8; 32];
        low[31] = 0xff;
        let mut high = [0u8; 32];
        high[0] = 0x01;
        assert!(Digest(low) < Digest(high));
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(Digest::hash(b"object"), Digest::hash(b"object"));
        assert_ne!(Digest::hash(b"object"), Digest::hash(b"other"));
    }
}
