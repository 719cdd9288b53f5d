//! # peersync Core
//!
//! Pure primitives for peersync: content digests, sorted digest vectors,
//! manifests and the objects they identify.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over content-addressed sets.
//!
//! ## Key Types
//!
//! - [`Digest`] - 32-byte Blake3 content hash, the atomic identity unit
//! - [`DigestVector`] - Sorted, deduplicated digests with set algebra
//! - [`Manifest`] - Immutable, shared, self-identifying set of object digests
//! - [`SyncObject`] - A keyed object whose digest is the hash of its encoding
//!
//! ## Diff and Patch
//!
//! Manifests are never mutated. Moving from one manifest to another is always
//! expressed as a diff (what was removed, what was added) and a patch that
//! applies it:
//!
//! ```rust
//! use peersync_core::{Digest, DigestVector, Manifest};
//!
//! let a = Manifest::new(DigestVector::from_unsorted(vec![Digest::hash(b"1"), Digest::hash(b"2")]));
//! let b = Manifest::new(DigestVector::from_unsorted(vec![Digest::hash(b"2"), Digest::hash(b"3")]));
//!
//! let (removed, added) = Manifest::diff(Some(&a), Some(&b));
//! let patched = Manifest::patch(Some(&a), &removed, &added).unwrap();
//! assert_eq!(patched, b);
//! ```

pub mod digest;
pub mod error;
pub mod manifest;
pub mod object;
pub mod vector;

pub use digest::{Digest, DIGEST_LEN};
pub use error::{CoreError, Result};
pub use manifest::Manifest;
pub use object::SyncObject;
pub use vector::DigestVector;
