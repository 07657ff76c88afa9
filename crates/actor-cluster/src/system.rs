//! # Actor System
//!
//! One [`ActorSystem`] per process (or per node in tests). It owns:
//!
//! - the path index of everything addressable on this node (actors, adapters, ask promises),
//! - the incarnation counter, which starts at 1 and only grows,
//! - the dead letter office,
//! - the user guardian, virtual parent of top-level actors,
//! - when clustering is enabled, the cluster shell and the receptionist.
//!
//! `ActorSystem` is a cheap `Clone` handle.
//!
//! ```rust,no_run
//! use actor_cluster::{ActorSystem, ActorSystemSettings};
//!
//! # async fn demo() -> Result<(), actor_cluster::FrameworkError> {
//! let system = ActorSystem::start(ActorSystemSettings::new("demo")).await?;
//! // system.spawn("greeter", Props::new(|| Greeter))?;
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::actor_ref::{ActorRef, MessageSink, RemoteSink, Unreachable};
use crate::behavior::{ActorFailure, Props};
use crate::cell::{ActorCell, ErasedCell, MailboxHandle, ParentLink};
use crate::cluster::shell::ClusterShell;
use crate::cluster::transport::{TcpTransport, Transport};
use crate::cluster::wire::{Envelope, Frame, ProtocolVersion, SystemEnvelope};
use crate::cluster::ClusterControl;
use crate::config::ActorSystemSettings;
use crate::context::ActorContext;
use crate::dead_letters::{DeadLetterReason, DeadLetters, Undelivered};
use crate::error::FrameworkError;
use crate::identity::{ActorId, ActorPath, Node, UniqueNode};
use crate::message::{Message, SystemMessage};
use crate::receptionist::shell::ReceptionistShell;
use crate::receptionist::{ReceptionistClient, ReceptionistHandle};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

type PathIndex = HashMap<ActorPath, Arc<dyn ErasedCell>>;

pub(crate) struct Spawned<M: Message> {
    pub actor: ActorRef<M>,
    pub cell: Arc<dyn ErasedCell>,
    pub join: JoinHandle<()>,
}

struct GuardianChild {
    cell: Arc<dyn ErasedCell>,
    join: JoinHandle<()>,
}

struct SystemInner {
    settings: ActorSystemSettings,
    node: UniqueNode,
    index: RwLock<PathIndex>,
    live_actors: AtomicUsize,
    incarnations: AtomicU32,
    names: AtomicU64,
    dead_letters: DeadLetters,
    guardian: Mutex<HashMap<ActorPath, GuardianChild>>,
    /// Watches this node placed on remote actors, by remote node: `(watchee, watcher)`.
    remote_watches: Mutex<HashMap<UniqueNode, HashSet<(ActorId, ActorId)>>>,
    cluster: OnceLock<ClusterControl>,
    receptionist: OnceLock<ReceptionistHandle>,
    retired: OnceLock<mpsc::UnboundedSender<ActorId>>,
    terminating: AtomicBool,
    terminated: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

impl ActorSystem {
    /// Starts a system. With clustering enabled it binds a TCP listener on the configured node.
    pub async fn start(settings: ActorSystemSettings) -> Result<Self, FrameworkError> {
        Self::start_with_transport(settings, Arc::new(TcpTransport)).await
    }

    pub async fn start_with_transport(
        settings: ActorSystemSettings,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, FrameworkError> {
        settings.validate()?;
        let node = UniqueNode::generate(settings.node());
        let (terminated, _) = watch::channel(false);
        let system = Self {
            inner: Arc::new(SystemInner {
                settings,
                node,
                index: RwLock::new(HashMap::new()),
                live_actors: AtomicUsize::new(0),
                incarnations: AtomicU32::new(1),
                names: AtomicU64::new(1),
                dead_letters: DeadLetters::new(),
                guardian: Mutex::new(HashMap::new()),
                remote_watches: Mutex::new(HashMap::new()),
                cluster: OnceLock::new(),
                receptionist: OnceLock::new(),
                retired: OnceLock::new(),
                terminating: AtomicBool::new(false),
                terminated,
            }),
        };

        let (receptionist, requests) = ReceptionistHandle::channel();
        let _ = system.inner.receptionist.set(receptionist);
        let (retired_tx, retired_rx) = mpsc::unbounded_channel();
        let _ = system.inner.retired.set(retired_tx);

        if system.settings().cluster.enabled {
            let (control, shell) = ClusterShell::bind(system.clone(), transport).await?;
            let _ = system.inner.cluster.set(control);
            tokio::spawn(shell.run());
        }
        tokio::spawn(ReceptionistShell::new(system.clone(), requests, retired_rx).run());

        info!(node = %system.node(), "Actor system started");
        Ok(system)
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.system_name
    }

    pub fn node(&self) -> &UniqueNode {
        &self.inner.node
    }

    pub fn settings(&self) -> &ActorSystemSettings {
        &self.inner.settings
    }

    pub fn dead_letters(&self) -> &DeadLetters {
        &self.inner.dead_letters
    }

    pub fn cluster(&self) -> Result<ClusterControl, FrameworkError> {
        self.inner
            .cluster
            .get()
            .cloned()
            .ok_or(FrameworkError::ClusterDisabled)
    }

    pub fn receptionist(&self) -> ReceptionistClient {
        let handle = self
            .inner
            .receptionist
            .get()
            .cloned()
            .unwrap_or_else(ReceptionistHandle::closed);
        ReceptionistClient::new(self.clone(), handle)
    }

    /// Spawns a top-level actor under `/user`.
    pub fn spawn<M: Message>(
        &self,
        name: &str,
        props: Props<M>,
    ) -> Result<ActorRef<M>, FrameworkError> {
        let path = ActorPath::user().child(name)?;
        let spawned = self.spawn_cell(path.clone(), props, ParentLink::Guardian)?;
        let mut guardian = self.guardian();
        guardian.retain(|_, child| !child.join.is_finished());
        guardian.insert(
            path,
            GuardianChild {
                cell: spawned.cell,
                join: spawned.join,
            },
        );
        Ok(spawned.actor)
    }

    pub fn spawn_anonymous<M: Message>(
        &self,
        props: Props<M>,
    ) -> Result<ActorRef<M>, FrameworkError> {
        self.spawn(&self.anonymous_name(), props)
    }

    /// Asks a local actor to stop. Stopping is asynchronous; watch the actor to observe it.
    pub fn stop<M: Message>(&self, actor: &ActorRef<M>) {
        if actor.is_local() {
            self.deliver_system(actor.id(), SystemMessage::Stop);
        } else {
            debug!(actor = %actor.id(), "Ignoring stop for a remote actor");
        }
    }

    /// Builds a typed reference from an id. Local ids bind to the live cell at that path (stale
    /// incarnations turn into dead letters on send), remote ids go through the cluster.
    pub fn resolve<M: Message>(&self, id: &ActorId) -> ActorRef<M> {
        let sink: Arc<dyn MessageSink<M>> = if id.is_on(self.node()) {
            match self.find_cell(id.path()) {
                Some(cell) => match cell.sink_any().downcast::<Arc<dyn MessageSink<M>>>() {
                    Ok(sink) => *sink,
                    Err(_) => Arc::new(Unreachable(DeadLetterReason::WrongMessageType)),
                },
                None => Arc::new(Unreachable(DeadLetterReason::Terminated)),
            }
        } else {
            match self.inner.cluster.get() {
                Some(cluster) => Arc::new(RemoteSink::new(cluster.clone())),
                None => Arc::new(Unreachable(DeadLetterReason::NoAssociation)),
            }
        };
        ActorRef::new(id.clone(), sink, self.clone())
    }

    /// The live incarnation at `path`, if any.
    pub fn lookup_path<M: Message>(&self, path: &ActorPath) -> Option<ActorRef<M>> {
        let id = self.find_cell(path)?.id();
        Some(self.resolve(&id))
    }

    pub fn is_alive(&self, id: &ActorId) -> bool {
        id.is_on(self.node())
            && self
                .find_cell(id.path())
                .is_some_and(|cell| &cell.id() == id)
    }

    pub fn live_actors(&self) -> usize {
        self.inner.live_actors.load(Ordering::Acquire)
    }

    /// Stops all top-level actors (children first), then the receptionist and the cluster.
    pub async fn shutdown(&self) {
        if self.inner.terminating.swap(true, Ordering::AcqRel) {
            self.when_terminated().await;
            return;
        }
        info!(node = %self.node(), "Shutting down actor system");
        let children: Vec<GuardianChild> = self.guardian().drain().map(|(_, c)| c).collect();
        for child in &children {
            let _ = child.cell.send_system(SystemMessage::Stop);
        }
        for child in children {
            let _ = child.join.await;
        }
        if let Some(receptionist) = self.inner.receptionist.get() {
            receptionist.shutdown().await;
        }
        if let Some(cluster) = self.inner.cluster.get() {
            if let Err(e) = cluster.shutdown().await {
                debug!(error = %e, "Cluster already stopped");
            }
        }
        let _ = self.inner.terminated.send(true);
        info!(node = %self.node(), "Actor system terminated");
    }

    pub async fn when_terminated(&self) {
        let mut terminated = self.inner.terminated.subscribe();
        let _ = terminated.wait_for(|done| *done).await;
    }

    pub fn is_terminated(&self) -> bool {
        *self.inner.terminated.borrow()
    }

    // -------------------------------------------------------------------------
    // Crate-internal plumbing
    // -------------------------------------------------------------------------

    pub(crate) fn next_incarnation(&self) -> u32 {
        self.inner.incarnations.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn anonymous_name(&self) -> String {
        format!("$anon-{}", self.inner.names.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn ask_name(&self) -> String {
        format!("ask-{}", self.inner.names.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        self.inner.settings.cluster.protocol_version
    }

    fn index(&self) -> std::sync::RwLockReadGuard<'_, PathIndex> {
        self.inner
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn index_mut(&self) -> std::sync::RwLockWriteGuard<'_, PathIndex> {
        self.inner
            .index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn guardian(&self) -> MutexGuard<'_, HashMap<ActorPath, GuardianChild>> {
        self.inner
            .guardian
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn remote_watches(&self) -> MutexGuard<'_, HashMap<UniqueNode, HashSet<(ActorId, ActorId)>>> {
        self.inner
            .remote_watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn find_cell(&self, path: &ActorPath) -> Option<Arc<dyn ErasedCell>> {
        self.index().get(path).cloned()
    }

    fn name_conflict(path: &ActorPath) -> FrameworkError {
        FrameworkError::NameConflict {
            parent: path.parent().unwrap_or_else(ActorPath::root),
            name: path.name().to_string(),
        }
    }

    pub(crate) fn spawn_cell<M: Message>(
        &self,
        path: ActorPath,
        props: Props<M>,
        parent: ParentLink,
    ) -> Result<Spawned<M>, FrameworkError> {
        if self.inner.terminating.load(Ordering::Acquire) {
            return Err(FrameworkError::SystemShutdown);
        }
        let incarnation = self.next_incarnation();
        let id = ActorId::new(self.node().clone(), path.clone(), incarnation);
        let capacity = props
            .mailbox_capacity
            .unwrap_or(self.inner.settings.mailbox_capacity);
        let (handle, queues) = MailboxHandle::<M>::new(id, capacity);
        {
            let mut index = self.index_mut();
            if index.contains_key(&path) {
                return Err(Self::name_conflict(&path));
            }
            let max = self.inner.settings.max_actors;
            if self.inner.live_actors.load(Ordering::Acquire) >= max {
                return Err(FrameworkError::CapacityExhausted { max });
            }
            let erased: Arc<dyn ErasedCell> = handle.clone();
            index.insert(path, erased);
            self.inner.live_actors.fetch_add(1, Ordering::AcqRel);
        }
        let ctx = ActorContext::new(self.clone(), handle.clone());
        let actor = ctx.myself();
        let cell = ActorCell::new(props, ctx, queues, parent);
        let join = tokio::spawn(cell.run());
        Ok(Spawned {
            actor,
            cell: handle,
            join,
        })
    }

    /// Registers a non-actor cell (adapter, ask promise).
    pub(crate) fn register_cell(
        &self,
        path: ActorPath,
        cell: Arc<dyn ErasedCell>,
    ) -> Result<(), FrameworkError> {
        let mut index = self.index_mut();
        if index.contains_key(&path) {
            return Err(Self::name_conflict(&path));
        }
        index.insert(path, cell);
        Ok(())
    }

    pub(crate) fn remove_cell(&self, path: &ActorPath) {
        self.index_mut().remove(path);
    }

    pub(crate) fn actor_stopped(&self, path: &ActorPath) {
        if self.index_mut().remove(path).is_some() {
            self.inner.live_actors.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn guardian_child_terminated(&self, id: &ActorId, escalation: Option<ActorFailure>) {
        self.guardian().remove(id.path());
        if let Some(failure) = escalation {
            error!(actor = %id, error = %failure, "Top-level actor escalated a failure to the guardian");
        }
    }

    pub(crate) fn retired(&self, id: ActorId) {
        if let Some(retired) = self.inner.retired.get() {
            let _ = retired.send(id);
        }
    }

    pub(crate) fn receptionist_handle(&self) -> Option<&ReceptionistHandle> {
        self.inner.receptionist.get()
    }

    /// Routes a system message to a local cell or, over the cluster, to a remote one. Watches
    /// that cannot be delivered are answered with `Terminated` right away.
    pub(crate) fn deliver_system(&self, target: &ActorId, message: SystemMessage) {
        if !target.is_on(self.node()) {
            self.deliver_system_remote(target, message);
            return;
        }
        let delivered = match self.find_cell(target.path()) {
            Some(cell) if cell.id().incarnation() == target.incarnation() => {
                cell.send_system(message)
            }
            _ => Err(message),
        };
        if let Err(message) = delivered {
            self.bounce(message);
        }
    }

    fn deliver_system_remote(&self, target: &ActorId, message: SystemMessage) {
        let wire = match &message {
            SystemMessage::Watch { watchee, watcher } => {
                self.remote_watches()
                    .entry(target.node().clone())
                    .or_default()
                    .insert((watchee.clone(), watcher.clone()));
                SystemEnvelope::Watch {
                    watchee: watchee.clone(),
                    watcher: watcher.clone(),
                }
            }
            SystemMessage::Unwatch { watchee, watcher } => {
                self.forget_remote_watch(watchee, watcher);
                SystemEnvelope::Unwatch {
                    watchee: watchee.clone(),
                    watcher: watcher.clone(),
                }
            }
            SystemMessage::Terminated {
                id,
                existence_confirmed,
                ..
            } => SystemEnvelope::Terminated {
                watchee: id.clone(),
                watcher: target.clone(),
                existence_confirmed: *existence_confirmed,
            },
            SystemMessage::ChildTerminated { .. } | SystemMessage::Stop => {
                debug!(target = %target, "System message is local only");
                return;
            }
        };
        let sent = self.inner.cluster.get().is_some_and(|cluster| {
            cluster
                .send_frame(target.node(), &Frame::System(wire), None)
                .is_ok()
        });
        if !sent {
            if let SystemMessage::Watch { watchee, watcher } = &message {
                self.forget_remote_watch(watchee, watcher);
            }
            self.bounce(message);
        }
    }

    fn bounce(&self, message: SystemMessage) {
        if let SystemMessage::Watch { watchee, watcher } = message {
            self.deliver_system(
                &watcher,
                SystemMessage::Terminated {
                    id: watchee,
                    existence_confirmed: false,
                    node_terminated: false,
                },
            );
        }
    }

    fn forget_remote_watch(&self, watchee: &ActorId, watcher: &ActorId) {
        let mut watches = self.remote_watches();
        if let Some(entries) = watches.get_mut(watchee.node()) {
            entries.remove(&(watchee.clone(), watcher.clone()));
            if entries.is_empty() {
                watches.remove(watchee.node());
            }
        }
    }

    /// A remote node went down: every local watcher of its actors gets `Terminated`.
    pub(crate) fn node_terminated(&self, node: &UniqueNode) {
        let entries = self.remote_watches().remove(node).unwrap_or_default();
        self.notify_remote_watchers(entries, true);
    }

    /// Association to `node` failed for good before any nid was learned.
    pub(crate) fn node_unreachable(&self, node: &Node) {
        let entries: Vec<(ActorId, ActorId)> = {
            let mut watches = self.remote_watches();
            let keys: Vec<UniqueNode> = watches
                .keys()
                .filter(|unique| &unique.node == node)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| watches.remove(key))
                .flatten()
                .collect()
        };
        self.notify_remote_watchers(entries, false);
    }

    fn notify_remote_watchers(
        &self,
        entries: impl IntoIterator<Item = (ActorId, ActorId)>,
        existence_confirmed: bool,
    ) {
        for (watchee, watcher) in entries {
            self.deliver_system(
                &watcher,
                SystemMessage::Terminated {
                    id: watchee,
                    existence_confirmed,
                    node_terminated: true,
                },
            );
        }
    }

    /// Entry point for user messages arriving over an association.
    pub(crate) fn deliver_envelope(&self, envelope: Envelope) {
        let Envelope {
            sender,
            recipient,
            type_tag,
            payload,
            version,
        } = envelope;
        let undeliverable = |reason| Undelivered {
            message: format!("<{type_tag}>"),
            reason,
        };
        let result = if !recipient.is_on(self.node()) {
            Err(undeliverable(DeadLetterReason::NoAssociation))
        } else if !self.protocol_version().is_compatible_with(&version) {
            Err(undeliverable(DeadLetterReason::DecodeFailed))
        } else {
            match self.find_cell(recipient.path()) {
                Some(cell) => cell.deliver_encoded(&recipient, &type_tag, &payload, self),
                None => Err(undeliverable(DeadLetterReason::Terminated)),
            }
        };
        if let Err(undelivered) = result {
            debug!(%sender, %recipient, reason = ?undelivered.reason, "Remote message undeliverable");
            self.dead_letters()
                .record(undelivered.into_dead_letter(recipient));
        }
    }

    /// Entry point for death watch traffic arriving over an association.
    pub(crate) fn deliver_remote_system(&self, message: SystemEnvelope) {
        match message {
            SystemEnvelope::Watch { watchee, watcher } => {
                self.deliver_system(&watchee.clone(), SystemMessage::Watch { watchee, watcher });
            }
            SystemEnvelope::Unwatch { watchee, watcher } => {
                self.deliver_system(&watchee.clone(), SystemMessage::Unwatch { watchee, watcher });
            }
            SystemEnvelope::Terminated {
                watchee,
                watcher,
                existence_confirmed,
            } => {
                self.forget_remote_watch(&watchee, &watcher);
                self.deliver_system(
                    &watcher,
                    SystemMessage::Terminated {
                        id: watchee,
                        existence_confirmed,
                        node_terminated: false,
                    },
                );
            }
        }
    }
}

impl fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorSystem")
            .field("node", &self.inner.node)
            .field("live_actors", &self.live_actors())
            .finish()
    }
}
