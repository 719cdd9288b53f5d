//! Convergence reporting.
//!
//! Compares what we know a peer holds with our own manifest, for health
//! tooling that wants to know whether a circle has settled.

use peersync_core::{DigestVector, Manifest};

/// Result of comparing a peer's confirmed manifest with ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceResult {
    /// Both sides hold the same object set.
    Converged,
    /// Sets differ (more sync rounds needed).
    NotConverged {
        /// Objects the peer has that we do not.
        missing: DigestVector,
        /// Objects we have that the peer does not.
        extra: DigestVector,
    },
    /// We do not know what the peer holds yet.
    Unknown,
}

impl ConvergenceResult {
    /// Compare `confirmed` (the peer's manifest, if known) with `local`.
    pub fn compare(confirmed: Option<&Manifest>, local: &Manifest) -> Self {
        let confirmed = match confirmed {
            Some(confirmed) => confirmed,
            None => return ConvergenceResult::Unknown,
        };

        if confirmed.digest() == local.digest() {
            return ConvergenceResult::Converged;
        }

        let (missing, extra) = Manifest::diff(Some(confirmed), Some(local));
        ConvergenceResult::NotConverged { missing, extra }
    }

    /// Check if the peer has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged)
    }
}
