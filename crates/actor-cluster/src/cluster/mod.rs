//! # Cluster
//!
//! Everything that makes several actor systems one cluster:
//!
//! - [`transport`]: byte channels between processes (TCP, or in-memory for tests),
//! - [`wire`]: the frames exchanged over them,
//! - [`association`]: the handshake bookkeeping, at most one association per peer endpoint,
//! - [`swim`]: the SWIM failure detector,
//! - [`membership`]: the forward-only member lifecycle and the events it publishes.
//!
//! A single owner task, the cluster shell, mutates all of this. The rest of the runtime talks to
//! it through a cloneable [`ClusterControl`]: commands go in over a channel, membership and the
//! set of live associations come out as `arc-swap` snapshots.
//!
//! Outbound frames never wait. A frame for an associated peer goes straight to that peer's
//! channel; a frame for a peer that is still associating is buffered (up to
//! `pending_frames_max`) and flushed, in order, the moment the association is published.

pub(crate) mod association;
pub mod membership;
pub(crate) mod shell;
pub mod swim;
pub mod transport;
pub mod wire;

pub use membership::{ClusterEvent, Member, MemberStatus, Membership, MembershipChange};

use crate::cluster::association::ConnectionId;
use crate::cluster::transport::Channel;
use crate::cluster::wire::{Envelope, Frame, HandshakeOffer, ProtocolVersion};
use crate::dead_letters::DeadLetterReason;
use crate::error::{AssociationError, FrameworkError};
use crate::identity::{ActorId, Node, UniqueNode};
use arc_swap::ArcSwap;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

const EVENT_BUFFER: usize = 1024;

/// Requests to the cluster shell, from the public API and from its own connection tasks.
pub(crate) enum ClusterCommand {
    Join(Node),
    Associate(Node),
    Down(UniqueNode),
    Leave,
    Sever(UniqueNode),
    Shutdown(oneshot::Sender<()>),
    Accepted(Channel),
    Offer {
        connection: ConnectionId,
        offer: HandshakeOffer,
        tx: mpsc::Sender<Bytes>,
        decision: oneshot::Sender<bool>,
    },
    HandshakeDone {
        node: Node,
        connection: ConnectionId,
        result: Result<(UniqueNode, Channel), AssociationError>,
    },
    Inbound {
        peer: UniqueNode,
        frame: Frame,
    },
    Closed(ConnectionId),
}

/// Send handle of one live association.
#[derive(Debug, Clone)]
pub(crate) struct RemoteControl {
    pub peer: UniqueNode,
    pub connection: ConnectionId,
    pub tx: mpsc::Sender<Bytes>,
}

impl RemoteControl {
    pub(crate) fn send(&self, bytes: Bytes) -> Result<(), DeadLetterReason> {
        self.tx.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => DeadLetterReason::MailboxFull,
            TrySendError::Closed(_) => DeadLetterReason::NoAssociation,
        })
    }
}

/// A frame waiting for its association.
#[derive(Debug)]
pub(crate) struct PendingFrame {
    pub target: UniqueNode,
    pub bytes: Bytes,
    pub recipient: Option<ActorId>,
    pub description: String,
}

pub(crate) enum Routed {
    Sent,
    /// Buffered; `first` when the buffer for that endpoint was empty.
    Queued { first: bool },
}

#[derive(Default)]
struct PendingState {
    queues: HashMap<Node, VecDeque<PendingFrame>>,
    closed: HashSet<UniqueNode>,
    shut_down: bool,
}

/// Outbound routing shared by every [`ClusterControl`] and the shell. The association snapshot is
/// read lock-free; it is only ever replaced while holding the pending lock.
#[derive(Default)]
pub(crate) struct Routes {
    remotes: ArcSwap<HashMap<UniqueNode, RemoteControl>>,
    pending: Mutex<PendingState>,
}

impl Routes {
    fn pending(&self) -> MutexGuard<'_, PendingState> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn send(
        &self,
        frame: PendingFrame,
        max_pending: usize,
    ) -> Result<Routed, DeadLetterReason> {
        if let Some(remote) = self.remotes.load().get(&frame.target) {
            return remote.send(frame.bytes).map(|()| Routed::Sent);
        }
        let mut pending = self.pending();
        let remotes = self.remotes.load();
        if let Some(remote) = remotes.get(&frame.target) {
            return remote.send(frame.bytes).map(|()| Routed::Sent);
        }
        if pending.shut_down || pending.closed.contains(&frame.target) {
            return Err(DeadLetterReason::NoAssociation);
        }
        if remotes.keys().any(|peer| peer.node == frame.target.node) {
            // Someone else lives at that endpoint now.
            return Err(DeadLetterReason::NoAssociation);
        }
        let queue = pending
            .queues
            .entry(frame.target.node.clone())
            .or_default();
        if queue.len() >= max_pending {
            return Err(DeadLetterReason::MailboxFull);
        }
        let first = queue.is_empty();
        queue.push_back(frame);
        Ok(Routed::Queued { first })
    }

    /// Makes `remote` visible after flushing what was buffered for it. Returns the frames that
    /// cannot be delivered.
    pub(crate) fn publish(&self, remote: RemoteControl) -> Vec<PendingFrame> {
        let mut pending = self.pending();
        let mut undeliverable = Vec::new();
        for frame in pending
            .queues
            .remove(&remote.peer.node)
            .unwrap_or_default()
        {
            if frame.target != remote.peer {
                undeliverable.push(frame);
            } else if let Err(reason) = remote.send(frame.bytes.clone()) {
                debug!(peer = %remote.peer, %reason, "Dropping buffered frame");
                undeliverable.push(frame);
            }
        }
        let mut remotes = HashMap::clone(&self.remotes.load());
        remotes.insert(remote.peer.clone(), remote);
        self.remotes.store(Arc::new(remotes));
        undeliverable
    }

    /// Withdraws the association of `peer` if it still runs over `connection`.
    pub(crate) fn unpublish(&self, peer: &UniqueNode, connection: ConnectionId) {
        let _pending = self.pending();
        let current = self.remotes.load();
        if current
            .get(peer)
            .is_some_and(|remote| remote.connection == connection)
        {
            let mut remotes = HashMap::clone(&current);
            remotes.remove(peer);
            self.remotes.store(Arc::new(remotes));
        }
    }

    /// Refuses all further traffic to `peer`. Returns the frames buffered for it.
    pub(crate) fn close(&self, peer: &UniqueNode) -> Vec<PendingFrame> {
        let mut pending = self.pending();
        pending.closed.insert(peer.clone());
        let current = self.remotes.load();
        if current.contains_key(peer) {
            let mut remotes = HashMap::clone(&current);
            remotes.remove(peer);
            self.remotes.store(Arc::new(remotes));
        }
        let mut dropped = Vec::new();
        if let Some(queue) = pending.queues.get_mut(&peer.node) {
            let (stale, keep): (Vec<_>, Vec<_>) =
                queue.drain(..).partition(|frame| &frame.target == peer);
            queue.extend(keep);
            dropped = stale;
            if queue.is_empty() {
                pending.queues.remove(&peer.node);
            }
        }
        dropped
    }

    pub(crate) fn drain_pending(&self, node: &Node) -> Vec<PendingFrame> {
        self.pending()
            .queues
            .remove(node)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub(crate) fn has_pending(&self, node: &Node) -> bool {
        self.pending().queues.contains_key(node)
    }

    /// Closes every route. Returns everything still buffered.
    pub(crate) fn shut_down(&self) -> Vec<PendingFrame> {
        let mut pending = self.pending();
        pending.shut_down = true;
        self.remotes.store(Arc::new(HashMap::new()));
        pending
            .queues
            .drain()
            .flat_map(|(_, queue)| queue)
            .collect()
    }

    pub(crate) fn remote(&self, peer: &UniqueNode) -> Option<RemoteControl> {
        self.remotes.load().get(peer).cloned()
    }

    pub(crate) fn peers(&self) -> Vec<UniqueNode> {
        self.remotes.load().keys().cloned().collect()
    }
}

struct ControlInner {
    local: UniqueNode,
    version: ProtocolVersion,
    pending_frames_max: usize,
    commands: mpsc::UnboundedSender<ClusterCommand>,
    routes: Routes,
    membership: ArcSwap<Membership>,
    events: broadcast::Sender<ClusterEvent>,
}

/// Handle to this node's cluster shell. Cheap to clone.
#[derive(Clone)]
pub struct ClusterControl {
    inner: Arc<ControlInner>,
}

impl ClusterControl {
    pub(crate) fn new(
        local: UniqueNode,
        version: ProtocolVersion,
        pending_frames_max: usize,
        commands: mpsc::UnboundedSender<ClusterCommand>,
        membership: Membership,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(ControlInner {
                local,
                version,
                pending_frames_max,
                commands,
                routes: Routes::default(),
                membership: ArcSwap::from_pointee(membership),
                events,
            }),
        }
    }

    pub fn local_node(&self) -> &UniqueNode {
        &self.inner.local
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.inner.version
    }

    /// Associates with the node at `seed` and, through gossip, with everyone it knows.
    pub fn join(&self, seed: &Node) {
        self.command(ClusterCommand::Join(seed.clone()));
    }

    /// Declares `node` down: it is severed, tombstoned, and its actors are considered terminated.
    pub fn down(&self, node: &UniqueNode) {
        self.command(ClusterCommand::Down(node.clone()));
    }

    /// Marks this node as leaving and tells the cluster.
    pub fn leave(&self) {
        self.command(ClusterCommand::Leave);
    }

    /// Forcefully ends the association with `node`. The peer is told to consider itself down.
    pub fn sever(&self, node: &UniqueNode) {
        self.command(ClusterCommand::Sever(node.clone()));
    }

    pub fn membership(&self) -> Arc<Membership> {
        self.inner.membership.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    /// Peers with a live association.
    pub fn associated_nodes(&self) -> Vec<UniqueNode> {
        self.inner.routes.peers()
    }

    /// Waits until `predicate` holds for the membership snapshot. Returns `false` on timeout.
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&Membership) -> bool,
    {
        let mut events = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.membership()) {
                return true;
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
                Ok(Err(RecvError::Closed)) | Err(_) => return predicate(&self.membership()),
            }
        }
    }

    /// Waits until `node` reached at least `status`.
    pub async fn wait_for_status(
        &self,
        node: &UniqueNode,
        status: MemberStatus,
        timeout: Duration,
    ) -> bool {
        self.wait_for(timeout, |membership| {
            membership
                .status_of(node)
                .is_some_and(|current| current >= status)
        })
        .await
    }

    pub(crate) async fn shutdown(&self) -> Result<(), FrameworkError> {
        let (done, stopped) = oneshot::channel();
        self.inner
            .commands
            .send(ClusterCommand::Shutdown(done))
            .map_err(|_| FrameworkError::ActorClosed)?;
        stopped.await.map_err(|_| FrameworkError::ActorDropped)
    }

    pub(crate) fn send_envelope(&self, envelope: Envelope) -> Result<(), DeadLetterReason> {
        let recipient = envelope.recipient.clone();
        self.send_frame(recipient.node(), &Frame::Envelope(envelope), Some(&recipient))
    }

    /// Sends `frame` to `node`, associating first if needed.
    pub(crate) fn send_frame(
        &self,
        node: &UniqueNode,
        frame: &Frame,
        recipient: Option<&ActorId>,
    ) -> Result<(), DeadLetterReason> {
        if node == &self.inner.local {
            return Err(DeadLetterReason::NoAssociation);
        }
        let bytes = frame
            .encode()
            .map_err(|_| DeadLetterReason::EncodeFailed)?;
        let pending = PendingFrame {
            target: node.clone(),
            bytes,
            recipient: recipient.cloned(),
            description: frame.describe(),
        };
        match self
            .inner
            .routes
            .send(pending, self.inner.pending_frames_max)?
        {
            Routed::Sent | Routed::Queued { first: false } => {}
            Routed::Queued { first: true } => {
                self.command(ClusterCommand::Associate(node.node.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn routes(&self) -> &Routes {
        &self.inner.routes
    }

    pub(crate) fn publish_membership(&self, membership: Membership) {
        self.inner.membership.store(Arc::new(membership));
    }

    pub(crate) fn publish_event(&self, event: ClusterEvent) {
        let _ = self.inner.events.send(event);
    }

    fn command(&self, command: ClusterCommand) {
        if self.inner.commands.send(command).is_err() {
            debug!(node = %self.inner.local, "Cluster shell is gone, dropping command");
        }
    }
}

impl std::fmt::Debug for ClusterControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterControl")
            .field("local", &self.inner.local)
            .finish()
    }
}
