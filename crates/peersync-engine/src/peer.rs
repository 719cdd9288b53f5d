//! Per-peer sync state.

use std::borrow::Borrow;
use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use peersync_core::{DigestVector, Manifest};
use peersync_store::DataSource;

/// Opaque identifier of a peer in the circle.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One message we sent to a peer: our manifest at the time and the manifest
/// we proposed the peer would end up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub local: Manifest,
    pub proposed: Option<Manifest>,
}

/// Sync state for a trusted peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerState {
    /// The last manifest both sides agree the peer holds.
    pub(crate) confirmed: Option<Manifest>,
    /// Objects we still have to send. Subset of local minus confirmed.
    pub(crate) pending_objects: Manifest,
    /// Objects we deleted that the peer still has. Subset of confirmed minus local.
    pub(crate) pending_deletes: Manifest,
    /// Recently sent messages, oldest first.
    pub(crate) history: VecDeque<Sent>,
    /// Sequence number for the next message.
    pub(crate) sequence_number: u64,
    /// Push objects even though the peer's manifest is unknown.
    pub(crate) send_objects: bool,
    /// Opaque session blob (e.g. a negotiated coder), never interpreted.
    pub(crate) session: Option<Bytes>,
}

impl PeerState {
    /// Fresh state that keeps a previously negotiated session.
    pub fn with_session(session: Option<Bytes>) -> Self {
        Self {
            session,
            ..Self::default()
        }
    }

    pub fn confirmed(&self) -> Option<&Manifest> {
        self.confirmed.as_ref()
    }

    pub fn pending_objects(&self) -> &Manifest {
        &self.pending_objects
    }

    pub fn pending_deletes(&self) -> &Manifest {
        &self.pending_deletes
    }

    pub fn history(&self) -> impl Iterator<Item = &Sent> {
        self.history.iter()
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn send_objects(&self) -> bool {
        self.send_objects
    }

    pub fn session(&self) -> Option<&Bytes> {
        self.session.as_ref()
    }

    /// The manifest we reported as ours in the last message sent.
    pub fn last_local_sent(&self) -> Option<&Manifest> {
        self.history.back().map(|sent| &sent.local)
    }

    /// Every manifest this record keeps alive.
    pub fn manifests(&self) -> impl Iterator<Item = &Manifest> {
        self.confirmed
            .iter()
            .chain([&self.pending_objects, &self.pending_deletes])
            .chain(
                self.history
                    .iter()
                    .flat_map(|sent| std::iter::once(&sent.local).chain(sent.proposed.iter())),
            )
    }
}

/// Peer map entry.
///
/// A peer that left the trusted set keeps nothing but its session blob, so a
/// later re-admission can reuse it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEntry {
    Active(PeerState),
    Disabled { session: Bytes },
}

impl PeerEntry {
    pub fn session(&self) -> Option<&Bytes> {
        match self {
            PeerEntry::Active(state) => state.session(),
            PeerEntry::Disabled { session } => Some(session),
        }
    }

    pub fn as_active(&self) -> Option<&PeerState> {
        match self {
            PeerEntry::Active(state) => Some(state),
            PeerEntry::Disabled { .. } => None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, PeerEntry::Disabled { .. })
    }

    /// Disable this entry, keeping only the session. `None` if there is no
    /// session worth keeping.
    pub fn disable(self) -> Option<PeerEntry> {
        match self {
            PeerEntry::Active(state) => state.session.map(|session| PeerEntry::Disabled { session }),
            disabled @ PeerEntry::Disabled { .. } => Some(disabled),
        }
    }

    /// Re-activate, restoring the session if one was kept.
    pub fn activate(self) -> PeerState {
        match self {
            PeerEntry::Active(state) => state,
            PeerEntry::Disabled { session } => PeerState::with_session(Some(session)),
        }
    }
}

/// A short-lived view of one peer's state during message handling.
pub struct Peer<'a> {
    id: &'a PeerId,
    state: &'a mut PeerState,
    history_depth: usize,
}

impl<'a> Peer<'a> {
    pub(crate) fn new(id: &'a PeerId, state: &'a mut PeerState, history_depth: usize) -> Self {
        Self {
            id,
            state,
            history_depth,
        }
    }

    pub fn id(&self) -> &PeerId {
        self.id
    }

    pub fn confirmed(&self) -> Option<&Manifest> {
        self.state.confirmed.as_ref()
    }

    pub fn set_confirmed(&mut self, confirmed: Option<Manifest>) {
        self.state.confirmed = confirmed;
    }

    pub fn pending_objects(&self) -> &Manifest {
        &self.state.pending_objects
    }

    pub fn set_pending_objects(&mut self, pending: Manifest) {
        self.state.pending_objects = pending;
    }

    pub fn pending_deletes(&self) -> &Manifest {
        &self.state.pending_deletes
    }

    pub fn set_pending_deletes(&mut self, pending: Manifest) {
        self.state.pending_deletes = pending;
    }

    pub fn sequence_number(&self) -> u64 {
        self.state.sequence_number
    }

    /// Advance past a sent sequence number. Never moves backwards.
    pub fn advance_sequence_number(&mut self, sent: u64) {
        self.state.sequence_number = self.state.sequence_number.max(sent.saturating_add(1));
    }

    pub fn send_objects(&self) -> bool {
        self.state.send_objects
    }

    pub fn set_send_objects(&mut self, send: bool) {
        self.state.send_objects = send;
    }

    pub fn session(&self) -> Option<&Bytes> {
        self.state.session.as_ref()
    }

    pub fn set_session(&mut self, session: Option<Bytes>) {
        self.state.session = session;
    }

    pub fn last_local_sent(&self) -> Option<&Manifest> {
        self.state.last_local_sent()
    }

    /// Remember a sent message, forgetting the oldest beyond the history depth.
    pub fn record_sent(&mut self, local: Manifest, proposed: Option<Manifest>) {
        self.state.history.push_back(Sent { local, proposed });
        while self.state.history.len() > self.history_depth.max(1) {
            self.state.history.pop_front();
        }
    }

    /// Tell the data source how this peer's confirmed manifest moved.
    pub fn did_receive_removals_and_additions(
        &self,
        data_source: &dyn DataSource,
        removals: &DigestVector,
        additions: &DigestVector,
        local: &Manifest,
    ) {
        if let Some(confirmed) = &self.state.confirmed {
            data_source.peer_did_receive(self.id.as_str(), removals, additions, confirmed, local);
        }
    }
}
