//! # Peersync Testkit
//!
//! Testing utilities for peersync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: objects, populated stores, and circles of directly driven engines
//! - **Convergence drivers**: run a circle until it goes quiet, optionally losing messages
//! - **Generators**: Proptest strategies for digests, manifests and objects
//!
//! ## Test Fixtures
//!
//! ```rust
//! use peersync_testkit::{converge, object, TestCircle};
//!
//! let mut circle = TestCircle::pair().unwrap();
//! circle.peer_mut(0).commit(object("a", b"from peer 0")).unwrap();
//! circle.peer_mut(1).commit(object("b", b"from peer 1")).unwrap();
//!
//! let report = converge(&mut circle, 20).unwrap();
//! assert!(report.settled);
//! assert!(circle.agrees());
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use peersync_core::Manifest;
//! use peersync_testkit::generators::manifest;
//!
//! proptest! {
//!     #[test]
//!     fn union_is_commutative(a in manifest(16), b in manifest(16)) {
//!         prop_assert_eq!(Manifest::union(&a, &b), Manifest::union(&b, &a));
//!     }
//! }
//! ```

pub mod converge;
pub mod fixtures;
pub mod generators;

pub use converge::{converge, converge_lossy, ConvergeReport};
pub use fixtures::{object, object_at, populate, random_object, TestCircle, TestPeer};
