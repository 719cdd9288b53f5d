//! The sync engine.
//!
//! [`Engine`] owns the local manifest, the manifest cache and every peer
//! record for one data source. It is synchronous and single-threaded; the
//! worker in [`handle`](crate::handle) serializes access to it.
//!
//! Every mutating operation works on a copy of the state and swaps it in
//! only on success, so a failed operation leaves the engine untouched.

use std::borrow::Cow;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use peersync_core::{Digest, DigestVector, Manifest, SyncObject};
use peersync_store::{ChangeSource, DataSource, MergeResult, StoreError, Transaction};

use crate::config::EngineConfig;
use crate::convergence::ConvergenceResult;
use crate::error::{EngineError, Result};
use crate::message::Message;
use crate::peer::{Peer, PeerEntry, PeerId, PeerState};
use crate::state::{self, EngineState};

/// How circle membership moved in one [`Engine::circle_changed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// This device became a member.
    Joined,
    /// This device stopped being a member.
    Left,
    /// Membership did not change (the peer set may have).
    Unchanged,
}

/// What [`Engine::create_message`] produced.
#[derive(Debug)]
pub enum Outgoing {
    /// Nothing to say. On the wire this is a zero-length message.
    Empty,
    /// A message to send, and the bookkeeping to commit once it is sent.
    Message { bytes: Bytes, token: SendToken },
}

impl Outgoing {
    /// The bytes to put on the wire.
    pub fn bytes(&self) -> Bytes {
        match self {
            Outgoing::Empty => Bytes::new(),
            Outgoing::Message { bytes, .. } => bytes.clone(),
        }
    }

    /// True for [`Outgoing::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, Outgoing::Empty)
    }
}

/// Bookkeeping for a created message.
///
/// Hand it to [`Engine::message_sent`] once the transport accepted the
/// message. Dropping it instead leaves the peer's state as if the message
/// had never been created, so the next call recomputes the same diff.
#[derive(Debug, Clone)]
#[must_use = "pass the token to message_sent once the message is sent"]
pub struct SendToken {
    peer: PeerId,
    sequence_number: u64,
    local: Manifest,
    proposed: Option<Manifest>,
}

impl SendToken {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}

/// Sync engine for one data source.
pub struct Engine {
    data_source: Arc<dyn DataSource>,
    config: EngineConfig,
    state: EngineState,
    /// In-memory state differs from what was last persisted.
    dirty: bool,
}

impl Engine {
    /// Open an engine, loading persisted state from the data source.
    pub fn open(data_source: Arc<dyn DataSource>, config: EngineConfig) -> Result<Self> {
        let state = state::load(data_source.as_ref(), &config)?;
        debug!(
            store = data_source.name(),
            member = state.is_member(),
            peers = state.peers.len(),
            "engine opened"
        );
        Ok(Self {
            data_source,
            config,
            state,
            dirty: false,
        })
    }

    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.data_source
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn my_peer_id(&self) -> Option<&PeerId> {
        self.state.my_id.as_ref()
    }

    pub fn is_member(&self) -> bool {
        self.state.is_member()
    }

    pub fn trusted_peers(&self) -> &[PeerId] {
        &self.state.trusted
    }

    pub fn local_manifest(&self) -> Option<&Manifest> {
        self.state.local.as_ref()
    }

    pub fn peer(&self, peer: &PeerId) -> Option<&PeerEntry> {
        self.state.peers.get(peer)
    }

    pub fn cached_manifests(&self) -> usize {
        self.state.cache.len()
    }

    /// True if the engine changed since its state was last persisted.
    ///
    /// Send bookkeeping and local updates outside a commit hook only reach
    /// storage on the next commit or [`flush`](Self::flush).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Persist the state if it is dirty. Returns false if saving failed.
    pub fn flush(&mut self) -> bool {
        if self.dirty {
            self.dirty = !self.persist(&self.state);
        }
        !self.dirty
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Circle membership
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply a new circle view.
    ///
    /// `untrusted` lists peers being actively evicted: if they drop out of
    /// the trusted set they keep their session blob. Other peers that drop
    /// out are forgotten entirely.
    pub fn circle_changed(
        &mut self,
        my_id: Option<PeerId>,
        trusted: Vec<PeerId>,
        untrusted: &[PeerId],
    ) -> Result<Membership> {
        let mut next = self.state.clone();
        let was_member = next.is_member();

        let new_set: HashSet<&PeerId> = trusted.iter().collect();
        let old_set: HashSet<&PeerId> = self.state.trusted.iter().collect();
        let removed: Vec<&PeerId> = self
            .state
            .trusted
            .iter()
            .filter(|id| !new_set.contains(id))
            .collect();
        let added: Vec<&PeerId> = trusted.iter().filter(|id| !old_set.contains(id)).collect();

        for id in &removed {
            let Some(entry) = next.peers.remove(*id) else {
                continue;
            };
            if untrusted.contains(*id) {
                if let Some(disabled) = entry.disable() {
                    next.peers.insert((*id).clone(), disabled);
                }
            }
        }
        for id in &added {
            if let Some(entry) = next.peers.remove(*id) {
                next.peers.insert((*id).clone(), PeerEntry::Active(entry.activate()));
            }
        }
        debug!(added = added.len(), removed = removed.len(), "circle changed");

        next.my_id = my_id;
        next.trusted = trusted;

        let membership = match (was_member, next.is_member()) {
            (false, true) => {
                next.adopt_store_manifest(self.data_source.current_manifest()?);
                Membership::Joined
            }
            (true, false) => {
                next.local = None;
                Membership::Left
            }
            _ => Membership::Unchanged,
        };

        next.collect_garbage();
        self.dirty = !self.persist(&next);
        self.state = next;
        Ok(membership)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local changes
    // ─────────────────────────────────────────────────────────────────────────

    /// Fold a committed change of the data source into the local manifest.
    ///
    /// A no-op while not a member.
    pub fn update_local_manifest(
        &mut self,
        removed: &DigestVector,
        added: &DigestVector,
    ) -> Result<()> {
        let mut next = self.state.clone();
        if apply_local_changes(self.data_source.as_ref(), &mut next, removed, added)? {
            self.state = next;
            self.dirty = true;
        }
        Ok(())
    }

    /// Will-commit hook body for a local transaction: apply the change and
    /// return the state to persist in the same transaction.
    pub fn will_commit(&mut self, removed: &DigestVector, added: &DigestVector) -> Result<Vec<u8>> {
        let mut next = self.state.clone();
        apply_local_changes(self.data_source.as_ref(), &mut next, removed, added)?;
        let bytes = state::encode(&next)?;
        self.state = next;
        self.dirty = false;
        Ok(bytes)
    }

    /// Discard in-memory state and reload what was last persisted.
    pub fn reload(&mut self) -> Result<()> {
        self.state = state::load(self.data_source.as_ref(), &self.config)?;
        self.dirty = false;
        debug!(store = self.data_source.name(), "engine state reloaded");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Receiving
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle a message from `peer`.
    ///
    /// Runs inside one data source transaction. If anything fails, no object
    /// is merged and the engine state is unchanged.
    pub fn handle_message(&mut self, peer: &PeerId, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            debug!(%peer, "received empty message");
            return Ok(());
        }
        self.check_peer(peer)?;

        let message = Message::decode(bytes)?;
        message.check_extensions(&self.config)?;
        debug!(
            %peer,
            sequence_number = message.sequence_number,
            payload = message.payload_len(),
            "received message"
        );

        let data_source = Arc::clone(&self.data_source);
        let mut failure = None;
        let mut received = None;
        let mut saved = false;

        let result = data_source.transact(ChangeSource::Peer, &mut |tx| {
            let mut next = self.state.clone();
            match receive(data_source.as_ref(), &self.config, &mut next, peer, &message, tx) {
                Ok(()) => {
                    match state::encode(&next) {
                        Ok(bytes) => {
                            tx.set_state(&self.config.state_key, bytes)?;
                            saved = true;
                        }
                        Err(e) => warn!("engine state not saved: {}", e),
                    }
                    received = Some(next);
                    Ok(())
                }
                Err(e) => {
                    let reason = e.to_string();
                    failure = Some(e);
                    Err(StoreError::Aborted(reason))
                }
            }
        });

        match result {
            Ok(()) => {
                if let Some(next) = received {
                    self.state = next;
                    self.dirty = !saved;
                }
                Ok(())
            }
            Err(e) => {
                let error = failure.take().unwrap_or_else(|| EngineError::Store(e));
                warn!(%peer, "message rejected: {}", error);
                Err(error)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────────

    /// Build the next message for `peer`.
    pub fn create_message(&mut self, peer: &PeerId) -> Result<Outgoing> {
        self.check_peer(peer)?;

        let mut next = self.state.clone();
        let local = next.local.clone().ok_or(EngineError::NotInCircle)?;
        let max_bytes = self.config.max_message_bytes;

        let mut view = Peer::new(peer, next.peer_state_mut(peer), self.config.history_depth);
        let confirmed = view.confirmed().cloned();
        let (missing, extra) = Manifest::diff(confirmed.as_ref(), Some(&local));

        let (newly_pending, excess_pending) = extra.diff(view.pending_objects().vector());
        if !excess_pending.is_empty() {
            warn!(%peer, count = excess_pending.len(), "dropping pending objects we no longer have to send");
        }
        let (still_missing, excess_deleted) = missing.diff(view.pending_deletes().vector());
        if !excess_deleted.is_empty() {
            warn!(%peer, count = excess_deleted.len(), "dropping pending deletes the peer no longer has");
            let narrowed = view.pending_deletes().vector().intersection(&missing);
            view.set_pending_deletes(Manifest::new(narrowed));
        }
        view.set_pending_objects(Manifest::new(extra.clone()));
        debug!(
            %peer,
            missing = missing.len(),
            still_missing = still_missing.len(),
            extra = extra.len(),
            newly_pending = newly_pending.len(),
            "computed peer diff"
        );

        // Pending deletes do not count as missing here: once the peer has
        // seen our manifest, repeating it would not change anything.
        let unchanged = view
            .last_local_sent()
            .is_some_and(|sent| sent.digest() == local.digest());
        if confirmed.is_some()
            && unchanged
            && !view.send_objects()
            && extra.is_empty()
            && still_missing.is_empty()
        {
            debug!(%peer, "nothing to send");
            self.state = next;
            self.dirty = true;
            return Ok(Outgoing::Empty);
        }

        let mut objects = Vec::new();
        let mut sent = DigestVector::new();
        let mut dropped = DigestVector::new();
        if confirmed.is_some() || view.send_objects() {
            let mut total = 0usize;
            self.data_source.for_each_object(&extra, &mut |digest, bytes| {
                let Some(bytes) = bytes else {
                    warn!(%peer, %digest, "pending object is missing from the store");
                    dropped.append(*digest);
                    return ControlFlow::Continue(());
                };
                if Digest::hash(&bytes) != *digest || SyncObject::decode(&bytes).is_err() {
                    warn!(%peer, %digest, "pending object is corrupt");
                    dropped.append(*digest);
                    return ControlFlow::Continue(());
                }
                if !objects.is_empty() && total + bytes.len() > max_bytes {
                    return ControlFlow::Break(());
                }
                total += bytes.len();
                sent.append(*digest);
                objects.push(bytes);
                ControlFlow::Continue(())
            })?;
            sent.sort();
            dropped.sort();
        }

        let (local, extra) = if dropped.is_empty() {
            (local, extra)
        } else {
            let healed = Manifest::patch(Some(&local), &dropped, &DigestVector::new())?;
            let extra = extra.subtract(&dropped);
            view.set_pending_objects(Manifest::new(extra.clone()));
            (healed, extra)
        };

        let proposed = match &confirmed {
            Some(confirmed) => Some(Manifest::patch(
                Some(confirmed),
                &still_missing,
                &extra.union(&sent),
            )?),
            None => None,
        };

        let sequence_number = view.sequence_number();
        let message = Message {
            sequence_number,
            sender_digest: Some(local.digest()),
            base_digest: confirmed.as_ref().map(Manifest::digest),
            proposed_digest: proposed.as_ref().map(Manifest::digest),
            removals: still_missing,
            additions: extra,
            objects,
            extensions: Vec::new(),
        };
        let bytes = Bytes::from(message.encode()?);
        debug!(
            %peer,
            sequence_number,
            objects = message.objects.len(),
            bytes = bytes.len(),
            reset = message.is_reset(),
            "created message"
        );

        if !dropped.is_empty() {
            apply_local_changes(
                self.data_source.as_ref(),
                &mut next,
                &dropped,
                &DigestVector::new(),
            )?;
            next.healed = next.healed.union(&dropped);
        }

        let token = SendToken {
            peer: peer.clone(),
            sequence_number,
            local: next.cache.get_or_insert(local),
            proposed: proposed.map(|p| next.cache.get_or_insert(p)),
        };
        self.state = next;
        self.dirty = true;
        Ok(Outgoing::Message { bytes, token })
    }

    /// Commit the bookkeeping of a message the transport accepted.
    pub fn message_sent(&mut self, token: SendToken) -> Result<()> {
        if !self.state.is_trusted(&token.peer) {
            debug!(peer = %token.peer, "peer left the circle before the send completed");
            return Ok(());
        }

        let local = self.state.cache.get_or_insert(token.local);
        let proposed = token.proposed.map(|p| self.state.cache.get_or_insert(p));

        let depth = self.config.history_depth;
        let mut view = Peer::new(&token.peer, self.state.peer_state_mut(&token.peer), depth);
        view.set_send_objects(false);
        view.record_sent(local, proposed);
        view.advance_sequence_number(token.sequence_number);
        // A rollback of some unrelated transaction reloads persisted state,
        // so the advanced sequence number must already be on disk.
        self.dirty = !self.persist(&self.state);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection and sessions
    // ─────────────────────────────────────────────────────────────────────────

    /// Compare what we know `peer` holds with our manifest.
    pub fn peer_convergence(&self, peer: &PeerId) -> Result<ConvergenceResult> {
        let local = self.state.local.as_ref().ok_or(EngineError::NotInCircle)?;
        let confirmed = self
            .state
            .peers
            .get(peer)
            .and_then(PeerEntry::as_active)
            .and_then(PeerState::confirmed);
        Ok(ConvergenceResult::compare(confirmed, local))
    }

    /// The session blob stored for `peer`, trusted or not.
    pub fn session(&self, peer: &PeerId) -> Option<Bytes> {
        self.state.peers.get(peer).and_then(PeerEntry::session).cloned()
    }

    /// Store (or clear) the session blob for `peer`.
    pub fn set_session(&mut self, peer: &PeerId, session: Option<Bytes>) {
        let mut next = self.state.clone();
        if next.is_trusted(peer) {
            next.peer_state_mut(peer).session = session;
        } else {
            match session {
                Some(session) => {
                    next.peers.insert(peer.clone(), PeerEntry::Disabled { session });
                }
                None => {
                    next.peers.remove(peer);
                }
            }
        }
        self.dirty = !self.persist(&next);
        self.state = next;
    }

    /// Forget the session blob for `peer`.
    pub fn purge_session(&mut self, peer: &PeerId) {
        self.set_session(peer, None);
    }

    fn check_peer(&self, peer: &PeerId) -> Result<()> {
        if !self.state.is_member() {
            return Err(EngineError::NotInCircle);
        }
        if !self.state.is_trusted(peer) {
            return Err(EngineError::UntrustedPeer(peer.to_string()));
        }
        Ok(())
    }

    /// Write `state` in a transaction of its own. Failures are logged; the
    /// next commit saves again.
    fn persist(&self, state: &EngineState) -> bool {
        let key = &self.config.state_key;
        let result = state::encode(state).and_then(|bytes| {
            self.data_source
                .transact(ChangeSource::Peer, &mut |tx| tx.set_state(key, bytes.clone()))
                .map_err(EngineError::from)
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(store = self.data_source.name(), "failed to persist engine state: {}", e);
                false
            }
        }
    }
}

/// Patch the local manifest and update every trusted peer's pending sets.
///
/// Returns false if there was nothing to apply.
fn apply_local_changes(
    data_source: &dyn DataSource,
    state: &mut EngineState,
    removed: &DigestVector,
    added: &DigestVector,
) -> Result<bool> {
    let Some(local) = state.local.clone() else {
        return Ok(false);
    };
    if removed.is_empty() && added.is_empty() {
        return Ok(false);
    }

    // Healed digests left the local manifest already; the store catches up
    // when the broken object is rewritten or deleted.
    let mut removed = Cow::Borrowed(removed);
    if !state.healed.is_empty() {
        let forgotten = removed.intersection(&state.healed).subtract(local.vector());
        if !forgotten.is_empty() {
            debug!(count = forgotten.len(), "store dropped healed objects");
            removed = Cow::Owned(removed.subtract(&forgotten));
            state.healed = state.healed.subtract(&forgotten);
        }
        state.healed = state.healed.subtract(added);
    }
    let removed: &DigestVector = &removed;
    if removed.is_empty() && added.is_empty() {
        return Ok(true);
    }

    let updated = Manifest::patch(Some(&local), removed, added)?;
    state.local = Some(state.cache.get_or_insert(updated));

    let trusted: Vec<PeerId> = state.trusted_peers().cloned().collect();
    for id in &trusted {
        data_source.peer_will_commit(id.as_str(), removed, added);

        let Some(PeerEntry::Active(peer)) = state.peers.get_mut(id) else {
            continue;
        };
        let deleted = peer
            .confirmed
            .as_ref()
            .map(|confirmed| confirmed.vector().intersection(removed))
            .unwrap_or_default();
        if !deleted.is_empty() || !peer.pending_deletes.is_empty() {
            let deletes = peer.pending_deletes.vector().union(&deleted).subtract(added);
            peer.pending_deletes = Manifest::new(deletes);
        }
        if !peer.pending_objects.is_empty() {
            peer.pending_objects = Manifest::new(peer.pending_objects.vector().subtract(removed));
        }
    }

    state.collect_garbage();
    state.restrict_to_trusted();
    Ok(true)
}

/// Merge a message's objects and update the sender's record.
fn receive(
    data_source: &dyn DataSource,
    config: &EngineConfig,
    state: &mut EngineState,
    peer: &PeerId,
    message: &Message,
    tx: &mut dyn Transaction,
) -> Result<()> {
    let hint = message
        .sender_digest
        .and_then(|digest| state.find_manifest(&digest));

    let mut observed = DigestVector::new();
    let mut kept = DigestVector::new();
    for bytes in &message.objects {
        let digest = Digest::hash(bytes);
        let object = SyncObject::decode(bytes)?;
        match tx.merge_object(object, hint.as_ref())? {
            MergeResult::Created | MergeResult::PeerWins => observed.append(digest),
            MergeResult::LocalWins { local } => kept.append(local),
        }
    }
    observed.sort();
    kept.sort();
    debug!(
        %peer,
        sequence_number = message.sequence_number,
        objects = message.objects.len(),
        merged = observed.len(),
        kept = kept.len(),
        "merged message objects"
    );

    let additions = message.additions.union(&observed);

    // The local manifest must list everything the store now holds,
    // including kept local versions it somehow lost track of.
    let (removed, added) = tx.changes()?;
    let current = state.local.clone().ok_or(EngineError::NotInCircle)?;
    let repaired = kept.subtract(current.vector());
    if !repaired.is_empty() {
        warn!(%peer, count = repaired.len(), "local manifest was missing objects the store holds");
    }
    apply_local_changes(data_source, state, &removed, &added.union(&repaired))?;
    let local = state.local.clone().ok_or(EngineError::NotInCircle)?;

    let confirmed =
        resolve_confirmed(state, peer, message, &additions).map(|m| state.cache.get_or_insert(m));

    let mut view = Peer::new(peer, state.peer_state_mut(peer), config.history_depth);
    let previous = view.confirmed().cloned();
    view.set_confirmed(confirmed.clone());

    if let Some(confirmed) = &confirmed {
        let (removals, additions) = Manifest::diff(previous.as_ref(), Some(confirmed));
        view.did_receive_removals_and_additions(data_source, &removals, &additions, &local);
    }

    if message.is_reset() {
        debug!(%peer, "peer announced a reset, resending objects");
        view.set_send_objects(true);
    }
    if let Some(confirmed) = &confirmed {
        let (missing, extra) = Manifest::diff(Some(confirmed), Some(&local));
        view.set_pending_objects(Manifest::new(extra));
        let deletes = view.pending_deletes().vector().intersection(&missing);
        view.set_pending_deletes(Manifest::new(deletes));
    }

    state.collect_garbage();
    Ok(())
}

/// Work out what the sender holds.
///
/// Prefers a known manifest with the sender's digest, then patches the
/// message's base. `None` when neither is possible: the peer's manifest is
/// unknown until it sends a fresh baseline, and our next message to it will
/// be a reset.
fn resolve_confirmed(
    state: &EngineState,
    peer: &PeerId,
    message: &Message,
    additions: &DigestVector,
) -> Option<Manifest> {
    if let Some(known) = message
        .sender_digest
        .and_then(|digest| state.find_manifest(&digest))
    {
        return Some(known);
    }

    let base = match message.base_digest {
        None => Manifest::empty(),
        Some(digest) => match state.find_manifest(&digest) {
            Some(base) => base,
            None => {
                debug!(%peer, base = %digest, "base manifest unknown, peer manifest reset");
                return None;
            }
        },
    };

    match Manifest::patch(Some(&base), &message.removals, additions) {
        Ok(patched) => {
            if message
                .sender_digest
                .is_some_and(|digest| digest != patched.digest())
            {
                // Expected while the sender still has deletes pending for us.
                debug!(%peer, "patched manifest does not match the sender's digest");
            }
            Some(patched)
        }
        Err(e) => {
            warn!(%peer, "cannot rebuild peer manifest: {}", e);
            None
        }
    }
}
