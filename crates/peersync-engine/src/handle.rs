//! Engine worker and its async handle.
//!
//! Each [`Engine`] lives on a dedicated thread fed by an unbounded command
//! channel; all state changes happen there. [`EngineHandle`] submits jobs and
//! awaits their replies.
//!
//! While the engine is a circle member, the worker installs a commit hook on
//! its data source. The hook runs on whatever thread commits, submits a job
//! and blocks until the worker answers. Engine-originated transactions
//! (`ChangeSource::Peer`) are skipped by the hook: the worker applies their
//! changes inline. A hook call on the worker thread itself would wait on
//! itself forever, so it is refused with [`EngineError::Reentrant`].

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use peersync_core::{DigestVector, Manifest};
use peersync_store::{
    ChangeSource, DataSource, NotifyPhase, Phase, StoreError, Transaction,
};

use crate::config::EngineConfig;
use crate::convergence::ConvergenceResult;
use crate::engine::{Engine, Membership, Outgoing, SendToken};
use crate::error::{EngineError, Result};
use crate::peer::PeerId;
use crate::transport::Transport;

type Job = Box<dyn FnOnce(&mut Worker) + Send>;

enum Command {
    Run(Job),
    Shutdown(oneshot::Sender<()>),
}

struct Worker {
    engine: Engine,
    commands: mpsc::WeakUnboundedSender<Command>,
    hook_installed: bool,
}

impl Worker {
    fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.sync_hook();

        let mut done = None;
        while let Some(command) = commands.blocking_recv() {
            match command {
                Command::Run(job) => {
                    job(&mut self);
                    self.sync_hook();
                }
                Command::Shutdown(ack) => {
                    done = Some(ack);
                    break;
                }
            }
        }

        if !self.engine.flush() {
            warn!(store = self.engine.data_source().name(), "engine state not saved at shutdown");
        }
        if self.hook_installed {
            self.engine.data_source().set_notify_phase(None);
        }
        debug!(store = self.engine.data_source().name(), "engine worker stopped");
        if let Some(ack) = done {
            let _ = ack.send(());
        }
    }

    /// Install the commit hook while a member, remove it otherwise.
    fn sync_hook(&mut self) {
        let member = self.engine.is_member();
        if member == self.hook_installed {
            return;
        }

        let data_source = self.engine.data_source();
        if member {
            let hook = commit_hook(
                self.commands.clone(),
                thread::current().id(),
                data_source.name().to_string(),
            );
            data_source.set_notify_phase(Some(hook));
        } else {
            data_source.set_notify_phase(None);
        }
        debug!(store = data_source.name(), installed = member, "commit hook updated");
        self.hook_installed = member;
    }
}

fn commit_hook(
    commands: mpsc::WeakUnboundedSender<Command>,
    worker: ThreadId,
    store: String,
) -> NotifyPhase {
    Arc::new(
        move |tx: &mut dyn Transaction,
              phase: Phase,
              source: ChangeSource,
              removed: &DigestVector,
              added: &DigestVector|
              -> peersync_store::Result<()> {
            if source == ChangeSource::Peer || phase == Phase::DidCommit {
                return Ok(());
            }
            if thread::current().id() == worker {
                error!(%store, ?phase, "commit hook invoked on the engine worker");
                return Err(StoreError::Aborted(EngineError::Reentrant.to_string()));
            }
            let Some(commands) = commands.upgrade() else {
                return Ok(());
            };

            match phase {
                Phase::WillCommit => {
                    let removed = removed.clone();
                    let added = added.clone();
                    let reply = submit(&commands, move |worker| {
                        let key = worker.engine.config().state_key.clone();
                        worker
                            .engine
                            .will_commit(&removed, &added)
                            .map(|bytes| (key, bytes))
                    })?;
                    let (key, bytes) = reply.map_err(|e| StoreError::Aborted(e.to_string()))?;
                    if let Err(e) = tx.set_state(&key, bytes) {
                        warn!(%store, "engine state not saved with commit: {}", e);
                    }
                    Ok(())
                }
                Phase::DidRollback => {
                    if let Err(e) = submit(&commands, |worker| worker.engine.reload())? {
                        warn!(%store, "engine state reload failed: {}", e);
                    }
                    Ok(())
                }
                Phase::DidCommit => Ok(()),
            }
        },
    )
}

/// Run `f` on the worker and block the calling thread for its result.
fn submit<R, F>(commands: &mpsc::UnboundedSender<Command>, f: F) -> peersync_store::Result<R>
where
    R: Send + 'static,
    F: FnOnce(&mut Worker) -> R + Send + 'static,
{
    let (reply, wait) = std_mpsc::sync_channel(1);
    let job: Job = Box::new(move |worker| {
        let _ = reply.send(f(worker));
    });
    commands
        .send(Command::Run(job))
        .map_err(|_| StoreError::Aborted(EngineError::WorkerGone.to_string()))?;
    wait.recv()
        .map_err(|_| StoreError::Aborted(EngineError::WorkerGone.to_string()))
}

/// Async handle to an engine running on its own worker thread.
///
/// Cloning is cheap; every clone talks to the same worker. The worker stops
/// on [`shutdown`](Self::shutdown) or once every handle is dropped.
#[derive(Clone)]
pub struct EngineHandle {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    /// Open an engine for `data_source` and start its worker.
    pub fn spawn(data_source: Arc<dyn DataSource>, config: EngineConfig) -> Result<Self> {
        let name = data_source.name().to_string();
        let engine = Engine::open(data_source, config)?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = Worker {
            engine,
            commands: commands.downgrade(),
            hook_installed: false,
        };
        thread::Builder::new()
            .name(format!("peersync-{name}"))
            .spawn(move || worker.run(receiver))?;

        debug!(store = %name, "engine worker started");
        Ok(Self { name, commands })
    }

    /// Name of the data source this engine syncs.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Worker) -> R + Send + 'static,
    {
        let (reply, wait) = oneshot::channel();
        let job: Job = Box::new(move |worker| {
            let _ = reply.send(f(worker));
        });
        self.commands
            .send(Command::Run(job))
            .map_err(|_| EngineError::WorkerGone)?;
        wait.await.map_err(|_| EngineError::WorkerGone)
    }

    /// Run `f` against the engine on its worker.
    pub async fn with_engine<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Engine) -> R + Send + 'static,
    {
        self.call(move |worker| f(&mut worker.engine)).await
    }

    pub async fn circle_changed(
        &self,
        my_id: Option<PeerId>,
        trusted: Vec<PeerId>,
        untrusted: Vec<PeerId>,
    ) -> Result<Membership> {
        self.with_engine(move |engine| engine.circle_changed(my_id, trusted, &untrusted))
            .await?
    }

    pub async fn update_local_manifest(
        &self,
        removed: DigestVector,
        added: DigestVector,
    ) -> Result<()> {
        self.with_engine(move |engine| engine.update_local_manifest(&removed, &added))
            .await?
    }

    pub async fn handle_message(&self, peer: PeerId, message: Bytes) -> Result<()> {
        self.with_engine(move |engine| engine.handle_message(&peer, &message))
            .await?
    }

    pub async fn create_message(&self, peer: PeerId) -> Result<Outgoing> {
        self.with_engine(move |engine| engine.create_message(&peer))
            .await?
    }

    pub async fn message_sent(&self, token: SendToken) -> Result<()> {
        self.with_engine(move |engine| engine.message_sent(token))
            .await?
    }

    pub async fn local_manifest(&self) -> Result<Option<Manifest>> {
        self.with_engine(|engine| engine.local_manifest().cloned())
            .await
    }

    pub async fn peer_convergence(&self, peer: PeerId) -> Result<ConvergenceResult> {
        self.with_engine(move |engine| engine.peer_convergence(&peer))
            .await?
    }

    pub async fn session(&self, peer: PeerId) -> Result<Option<Bytes>> {
        self.with_engine(move |engine| engine.session(&peer)).await
    }

    pub async fn set_session(&self, peer: PeerId, session: Option<Bytes>) -> Result<()> {
        self.with_engine(move |engine| engine.set_session(&peer, session))
            .await
    }

    /// Persist the engine state if it changed since the last save.
    pub async fn flush(&self) -> Result<bool> {
        self.with_engine(Engine::flush).await
    }

    /// Send `peer` our next message over `transport`.
    ///
    /// Returns false when there was nothing to say. Send bookkeeping is
    /// committed only after the transport accepted the message.
    pub async fn sync_with<T>(&self, transport: &T, peer: &PeerId) -> Result<bool>
    where
        T: Transport + ?Sized,
    {
        match self.create_message(peer.clone()).await? {
            Outgoing::Empty => Ok(false),
            Outgoing::Message { bytes, token } => {
                transport.send(peer, bytes).await?;
                self.message_sent(token).await?;
                Ok(true)
            }
        }
    }

    /// Receive one message from `transport` and handle it.
    ///
    /// Returns the sender, or `None` if nothing arrived within `timeout`.
    pub async fn receive_from<T>(&self, transport: &T, timeout: Duration) -> Result<Option<PeerId>>
    where
        T: Transport + ?Sized,
    {
        let Some((peer, message)) = transport.recv_timeout(timeout).await? else {
            return Ok(None);
        };
        self.handle_message(peer.clone(), message).await?;
        Ok(Some(peer))
    }

    /// Stop the worker, saving dirty state and removing the commit hook.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(ack))
            .map_err(|_| EngineError::WorkerGone)?;
        done.await.map_err(|_| EngineError::WorkerGone)
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use peersync_core::SyncObject;
    use peersync_store::MemoryDataSource;

    fn object(key: &str, data: &str) -> SyncObject {
        SyncObject::new(key, 1, data.as_bytes().to_vec())
    }

    async fn member(name: &str, me: &str, peers: &[&str]) -> (Arc<MemoryDataSource>, EngineHandle) {
        let store = Arc::new(MemoryDataSource::new(name));
        let handle = EngineHandle::spawn(store.clone(), EngineConfig::default()).unwrap();
        let trusted = peers.iter().map(|p| PeerId::from(*p)).collect();
        handle
            .circle_changed(Some(PeerId::from(me)), trusted, Vec::new())
            .await
            .unwrap();
        (store, handle)
    }

    async fn sequence_number(handle: &EngineHandle, peer: &str) -> Option<u64> {
        let peer = PeerId::from(peer);
        handle
            .with_engine(move |engine| {
                engine
                    .peer(&peer)
                    .and_then(|entry| entry.as_active())
                    .map(|state| state.sequence_number())
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_local_commit_updates_manifest() {
        let (store, handle) = member("s", "me", &["me", "alice"]).await;
        assert!(store.has_hook());

        let digest = store.insert(object("a", "1")).unwrap();

        let local = handle.local_manifest().await.unwrap().unwrap();
        assert!(local.contains(&digest));
        // The state was written with the commit.
        assert!(store
            .get_state(&EngineConfig::default().state_key)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_leaving_removes_hook() {
        let (store, handle) = member("s", "me", &["me"]).await;
        assert!(store.has_hook());

        let membership = handle
            .circle_changed(None, Vec::new(), Vec::new())
            .await
            .unwrap();
        assert_eq!(membership, Membership::Left);
        assert!(!store.has_hook());
    }

    #[tokio::test]
    async fn test_reentrant_commit_is_refused() {
        let (store, handle) = member("s", "me", &["me"]).await;

        let result = handle
            .with_engine(|engine| {
                engine
                    .data_source()
                    .transact(ChangeSource::Local, &mut |tx| {
                        tx.put_object(object("a", "1")).map(|_| ())
                    })
            })
            .await
            .unwrap();

        assert!(matches!(result, Err(StoreError::Aborted(_))));
        assert!(store.is_empty());
        assert!(handle.local_manifest().await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conflicting_commit_reloads_state() {
        let (store, handle) = member("s", "me", &["me"]).await;

        let mut inner = None;
        let result = store.transact(ChangeSource::Local, &mut |tx| {
            tx.put_object(object("outer", "o"))?;
            // Another writer commits first.
            inner = Some(store.insert(object("inner", "i"))?);
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::Conflict { .. })));

        let inner = inner.unwrap();
        let local = handle.local_manifest().await.unwrap().unwrap();
        assert_eq!(local.vector(), &DigestVector::from(vec![inner]));
    }

    #[tokio::test]
    async fn test_sync_over_memory_transport() {
        let (store_a, a) = member("a", "a", &["a", "b"]).await;
        let (store_b, b) = member("b", "b", &["a", "b"]).await;
        store_a.insert(object("x", "from a")).unwrap();
        store_b.insert(object("y", "from b")).unwrap();

        let network = MemoryNetwork::new();
        let ta = network.create_transport(PeerId::from("a")).await;
        let tb = network.create_transport(PeerId::from("b")).await;
        let timeout = Duration::from_millis(50);

        for _ in 0..8 {
            if a.sync_with(&ta, &PeerId::from("b")).await.unwrap() {
                b.receive_from(&tb, timeout).await.unwrap();
            }
            if b.sync_with(&tb, &PeerId::from("a")).await.unwrap() {
                a.receive_from(&ta, timeout).await.unwrap();
            }
        }

        assert_eq!(store_a.len(), 2);
        assert_eq!(store_b.len(), 2);
        assert_eq!(
            a.local_manifest().await.unwrap(),
            b.local_manifest().await.unwrap()
        );
        assert!(a
            .peer_convergence(PeerId::from("b"))
            .await
            .unwrap()
            .is_converged());
    }

    #[tokio::test]
    async fn test_failed_send_leaves_bookkeeping() {
        let (store, a) = member("a", "a", &["a", "b"]).await;
        store.insert(object("x", "1")).unwrap();

        let network = MemoryNetwork::new();
        let ta = network.create_transport(PeerId::from("a")).await;

        let result = a.sync_with(&ta, &PeerId::from("b")).await;
        assert!(matches!(result, Err(EngineError::Transport(_))));

        assert_eq!(sequence_number(&a, "b").await, Some(0));
    }

    #[tokio::test]
    async fn test_sent_sequence_survives_unrelated_rollback() {
        let (store, a) = member("a", "a", &["a", "b"]).await;
        store.insert(object("x", "1")).unwrap();

        let network = MemoryNetwork::new();
        let ta = network.create_transport(PeerId::from("a")).await;
        let _tb = network.create_transport(PeerId::from("b")).await;
        assert!(a.sync_with(&ta, &PeerId::from("b")).await.unwrap());

        assert_eq!(sequence_number(&a, "b").await, Some(1));

        // A local writer gives up; the rollback reloads persisted state.
        let result = store.transact(ChangeSource::Local, &mut |tx| {
            tx.put_object(object("y", "2"))?;
            Err(StoreError::Aborted("writer gave up".into()))
        });
        assert!(matches!(result, Err(StoreError::Aborted(_))));

        assert_eq!(sequence_number(&a, "b").await, Some(1));
        store.insert(object("z", "3")).unwrap();
        let Outgoing::Message { token, .. } = a.create_message(PeerId::from("b")).await.unwrap()
        else {
            panic!("expected a message");
        };
        assert_eq!(token.sequence_number(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let (store, handle) = member("s", "me", &["me"]).await;
        handle.shutdown().await.unwrap();

        assert!(!store.has_hook());
        assert!(matches!(
            handle.local_manifest().await,
            Err(EngineError::WorkerGone)
        ));
        // Commits after shutdown are no longer tracked, and do not fail.
        store.insert(object("a", "1")).unwrap();
    }
}
