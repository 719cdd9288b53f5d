//! Sync protocol messages.
//!
//! One message type carries everything: the sender's manifest digest, the
//! manifest it assumes the receiver holds (`base`), the manifest the receiver
//! will hold once it merges the batch (`proposed`), the diff from base to the
//! sender's manifest, and a batch of serialized objects.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use peersync_core::{Digest, DigestVector};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Current wire version.
pub const WIRE_VERSION: u64 = 0;

/// An optional annotation on a message.
///
/// Receivers ignore unknown non-critical extensions and reject messages that
/// carry an unknown critical one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    /// Identifies the extension.
    pub oid: String,
    /// Must the receiver understand it?
    pub critical: bool,
    /// Extension payload.
    pub data: Bytes,
}

/// A decoded sync message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Per-peer counter assigned by the sender.
    pub sequence_number: u64,
    /// Digest of the sender's local manifest.
    pub sender_digest: Option<Digest>,
    /// Manifest the sender believes the receiver holds. `None` if unknown.
    pub base_digest: Option<Digest>,
    /// Manifest the receiver holds after merging `objects`.
    pub proposed_digest: Option<Digest>,
    /// In base but not in the sender's manifest.
    pub removals: DigestVector,
    /// In the sender's manifest but not in base.
    pub additions: DigestVector,
    /// Serialized objects.
    pub objects: Vec<Bytes>,
    /// Annotations.
    pub extensions: Vec<Extension>,
}

/// Wire layout. Digests travel as byte strings.
#[derive(Serialize, Deserialize)]
struct WireMessage {
    version: u64,
    sequence_number: u64,
    #[serde(default)]
    sender_digest: Option<Bytes>,
    #[serde(default)]
    base_digest: Option<Bytes>,
    #[serde(default)]
    proposed_digest: Option<Bytes>,
    #[serde(default)]
    removals: DigestVector,
    #[serde(default)]
    additions: DigestVector,
    #[serde(default)]
    objects: Vec<Bytes>,
    #[serde(default)]
    extensions: Vec<Extension>,
}

impl Message {
    /// A message that announces the sender's manifest without a base.
    ///
    /// The receiver treats it as a full reset.
    pub fn is_reset(&self) -> bool {
        self.base_digest.is_none() && self.proposed_digest.is_none()
    }

    /// Serialize to CBOR.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = WireMessage {
            version: WIRE_VERSION,
            sequence_number: self.sequence_number,
            sender_digest: self.sender_digest.map(digest_bytes),
            base_digest: self.base_digest.map(digest_bytes),
            proposed_digest: self.proposed_digest.map(digest_bytes),
            removals: self.removals.clone(),
            additions: self.additions.clone(),
            objects: self.objects.clone(),
            extensions: self.extensions.clone(),
        };

        let mut buf = Vec::new();
        ciborium::ser::into_writer(&wire, &mut buf)
            .map_err(|e| EngineError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Parse from CBOR, rejecting versions other than [`WIRE_VERSION`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: WireMessage =
            ciborium::de::from_reader(bytes).map_err(|e| EngineError::Decode(e.to_string()))?;

        if wire.version != WIRE_VERSION {
            return Err(EngineError::UnsupportedVersion {
                version: wire.version,
            });
        }

        Ok(Self {
            sequence_number: wire.sequence_number,
            sender_digest: wire.sender_digest.as_deref().map(parse_digest).transpose()?,
            base_digest: wire.base_digest.as_deref().map(parse_digest).transpose()?,
            proposed_digest: wire.proposed_digest.as_deref().map(parse_digest).transpose()?,
            removals: wire.removals,
            additions: wire.additions,
            objects: wire.objects,
            extensions: wire.extensions,
        })
    }

    /// Fail on the first critical extension `config` does not know.
    pub fn check_extensions(&self, config: &EngineConfig) -> Result<()> {
        for extension in &self.extensions {
            if config.knows_extension(&extension.oid) {
                continue;
            }
            if extension.critical {
                return Err(EngineError::CriticalExtension {
                    oid: extension.oid.clone(),
                });
            }
            tracing::debug!(oid = %extension.oid, "ignoring unknown extension");
        }
        Ok(())
    }

    /// Total size of the object payloads.
    pub fn payload_len(&self) -> usize {
        self.objects.iter().map(Bytes::len).sum()
    }
}

fn digest_bytes(digest: Digest) -> Bytes {
    Bytes::copy_from_slice(digest.as_bytes())
}

fn parse_digest(bytes: &[u8]) -> Result<Digest> {
    Digest::try_from(bytes)
        .map_err(|_| EngineError::Decode(format!("digest has {} bytes", bytes.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(n: u8) -> Digest {
        Digest::from_bytes([n; 32])
    }

    fn sample() -> Message {
        Message {
            sequence_number: 7,
            sender_digest: Some(d(1)),
            base_digest: Some(d(2)),
            proposed_digest: None,
            removals: DigestVector::from(vec![d(3)]),
            additions: DigestVector::from(vec![d(5), d(4)]),
            objects: vec![Bytes::from_static(b"object")],
            extensions: vec![Extension {
                oid: "1.2.3".into(),
                critical: false,
                data: Bytes::new(),
            }],
        }
    }

    #[test]
    fn test_encode_decode() {
        let message = sample();
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert!(!decoded.is_reset());
        assert_eq!(decoded.payload_len(), 6);
    }

    #[test]
    fn test_reset_message() {
        let message = Message {
            base_digest: None,
            proposed_digest: None,
            ..sample()
        };
        assert!(message.is_reset());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            Message::decode(b"\xff\x00garbage"),
            Err(EngineError::Decode(_))
        ));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut wire = ciborium::Value::serialized(&WireMessage {
            version: WIRE_VERSION,
            sequence_number: 0,
            sender_digest: None,
            base_digest: None,
            proposed_digest: None,
            removals: DigestVector::new(),
            additions: DigestVector::new(),
            objects: Vec::new(),
            extensions: Vec::new(),
        })
        .unwrap();
        if let ciborium::Value::Map(entries) = &mut wire {
            for (key, value) in entries.iter_mut() {
                if key.as_text() == Some("version") {
                    *value = ciborium::Value::Integer(ciborium::value::Integer::from(9u64));
                }
            }
        }
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&wire, &mut bytes).unwrap();

        assert!(matches!(
            Message::decode(&bytes),
            Err(EngineError::UnsupportedVersion { version: 9 })
        ));
    }

    #[test]
    fn test_short_digest_rejected() {
        let wire = WireMessage {
            version: WIRE_VERSION,
            sequence_number: 0,
            sender_digest: Some(Bytes::from_static(b"short")),
            base_digest: None,
            proposed_digest: None,
            removals: DigestVector::new(),
            additions: DigestVector::new(),
            objects: Vec::new(),
            extensions: Vec::new(),
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&wire, &mut bytes).unwrap();
        assert!(matches!(Message::decode(&bytes), Err(EngineError::Decode(_))));
    }

    #[test]
    fn test_critical_extension() {
        let mut message = sample();
        let config = EngineConfig::default();
        assert!(message.check_extensions(&config).is_ok());

        message.extensions.push(Extension {
            oid: "9.9".into(),
            critical: true,
            data: Bytes::new(),
        });
        assert!(matches!(
            message.check_extensions(&config),
            Err(EngineError::CriticalExtension { .. })
        ));
        assert!(message
            .check_extensions(&config.with_extension("9.9"))
            .is_ok());
    }
}
