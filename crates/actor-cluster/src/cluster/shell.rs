//! # Cluster Shell
//!
//! The owner task of all cluster state. It processes, one at a time:
//!
//! - commands from [`ClusterControl`](super::ClusterControl),
//! - handshake offers and completions reported by connection tasks,
//! - frames that are not user traffic (SWIM, receptionist, severance notices),
//! - the SWIM protocol period and timeout ticks.
//!
//! User envelopes and death watch frames bypass the shell: the connection's reader task hands
//! them straight to the actor system, which keeps per-connection order.

use crate::cluster::association::{
    AssociationTable, CompletionDecision, ConnectionId, OfferDecision,
};
use crate::cluster::membership::{ClusterEvent, MemberStatus, Membership};
use crate::cluster::swim::{SwimDirective, SwimInstance, SwimStatus};
use crate::cluster::transport::{Channel, Listener, Transport};
use crate::cluster::wire::{Frame, HandshakeOffer, RejectReason};
use crate::cluster::{ClusterCommand, ClusterControl, PendingFrame, RemoteControl};
use crate::config::ClusterSettings;
use crate::dead_letters::{DeadLetter, DeadLetterReason};
use crate::error::{AssociationError, FrameworkError};
use crate::identity::{Node, UniqueNode};
use crate::system::ActorSystem;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

const CAPABILITIES: &[&str] = &["swim", "receptionist-oplog"];
const MIN_TICK: Duration = Duration::from_millis(5);

struct Connection {
    /// `None` while an inbound connection is still in its handshake.
    tx: Option<mpsc::Sender<Bytes>>,
    reader: Option<JoinHandle<()>>,
}

pub(crate) struct ClusterShell {
    system: ActorSystem,
    control: ClusterControl,
    settings: ClusterSettings,
    local: UniqueNode,
    transport: Arc<dyn Transport>,
    listener: Option<Box<dyn Listener>>,
    commands: mpsc::UnboundedReceiver<ClusterCommand>,
    commands_tx: mpsc::UnboundedSender<ClusterCommand>,
    table: AssociationTable,
    swim: SwimInstance,
    membership: Membership,
    connections: HashMap<ConnectionId, Connection>,
    next_connection: ConnectionId,
    seeds: HashSet<Node>,
    attempts: HashMap<Node, u32>,
    downed_at: HashMap<UniqueNode, Instant>,
    removed_at: HashMap<UniqueNode, Instant>,
    self_down: bool,
    rng: StdRng,
}

impl ClusterShell {
    /// Binds the listener and builds the shell. The caller publishes the control before spawning
    /// [`run`](Self::run), so inbound traffic always finds it installed.
    pub(crate) async fn bind(
        system: ActorSystem,
        transport: Arc<dyn Transport>,
    ) -> Result<(ClusterControl, ClusterShell), FrameworkError> {
        let settings = system.settings().cluster.clone();
        let local = system.node().clone();
        let listener = transport.bind(&local.node).await?;

        let mut membership = Membership::new();
        membership.apply(&local, MemberStatus::Up);

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let control = ClusterControl::new(
            local.clone(),
            settings.protocol_version,
            settings.pending_frames_max,
            commands_tx.clone(),
            membership.clone(),
        );
        info!(node = %local, "Cluster listening");

        let shell = ClusterShell {
            table: AssociationTable::new(local.clone(), settings.protocol_version),
            swim: SwimInstance::new(local.clone(), settings.swim.clone()),
            seeds: settings.seed_nodes.iter().cloned().collect(),
            system,
            control: control.clone(),
            settings,
            local,
            transport,
            listener: Some(listener),
            commands,
            commands_tx,
            membership,
            connections: HashMap::new(),
            next_connection: 1,
            attempts: HashMap::new(),
            downed_at: HashMap::new(),
            removed_at: HashMap::new(),
            self_down: false,
            rng: StdRng::from_entropy(),
        };
        Ok((control, shell))
    }

    pub(crate) async fn run(mut self) {
        let accept_task = self.listener.take().map(|listener| {
            tokio::spawn(accept_loop(listener, self.commands_tx.clone()))
        });
        let seeds: Vec<Node> = self.seeds.iter().cloned().collect();
        for seed in seeds {
            self.start_handshake(seed);
        }

        let swim_settings = self.settings.swim.clone();
        let mut period = tokio::time::interval(swim_settings.probe_interval());
        period.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = tokio::time::interval((swim_settings.ping_timeout() / 2).max(MIN_TICK));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ClusterCommand::Shutdown(done)) => {
                        self.stop();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = period.tick() => {
                    let directives = self.swim.on_period(Instant::now(), &mut self.rng);
                    self.perform(directives);
                }
                _ = tick.tick() => self.on_tick(),
            }
        }

        if let Some(task) = accept_task {
            task.abort();
        }
        info!(node = %self.local, "Cluster shell stopped");
    }

    fn handle(&mut self, command: ClusterCommand) {
        match command {
            ClusterCommand::Join(node) => {
                info!(seed = %node, "Joining cluster");
                self.seeds.insert(node.clone());
                self.start_handshake(node);
            }
            ClusterCommand::Associate(node) => {
                if self.wanted(&node) {
                    self.start_handshake(node);
                }
            }
            ClusterCommand::Down(node) => {
                if node == self.local {
                    self.self_downed("administratively downed");
                } else {
                    info!(member = %node, "Downing member");
                    self.mark_down(&node);
                }
            }
            ClusterCommand::Leave => self.leave(),
            ClusterCommand::Sever(node) => self.sever(&node),
            ClusterCommand::Accepted(channel) => self.accept_connection(channel),
            ClusterCommand::Offer {
                connection,
                offer,
                tx,
                decision,
            } => self.on_offer(connection, offer, tx, decision),
            ClusterCommand::HandshakeDone {
                node,
                connection,
                result,
            } => self.on_handshake_done(node, connection, result),
            ClusterCommand::Inbound { peer, frame } => self.on_frame(peer, frame),
            ClusterCommand::Closed(connection) => self.on_closed(connection),
            ClusterCommand::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Handshakes
    // -------------------------------------------------------------------------

    fn next_connection(&mut self) -> ConnectionId {
        let connection = self.next_connection;
        self.next_connection += 1;
        connection
    }

    fn start_handshake(&mut self, node: Node) {
        if self.self_down {
            return;
        }
        let connection = self.next_connection();
        if !self.table.begin_outbound(&node, connection) {
            trace!(peer = %node, "Association exists or is in flight");
            return;
        }
        debug!(peer = %node, connection, "Starting handshake");
        let transport = self.transport.clone();
        let offer = HandshakeOffer {
            origin: self.local.clone(),
            target: node.clone(),
            version: self.settings.protocol_version,
            capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        };
        let timeout = self.settings.handshake_timeout();
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, handshake(transport, offer)).await {
                Ok(result) => result,
                Err(_) => Err(AssociationError::HandshakeTimeout { node: node.clone() }),
            };
            let _ = commands.send(ClusterCommand::HandshakeDone {
                node,
                connection,
                result,
            });
        });
    }

    fn accept_connection(&mut self, channel: Channel) {
        let connection = self.next_connection();
        let reader = tokio::spawn(inbound_connection(
            connection,
            channel,
            self.commands_tx.clone(),
            self.system.clone(),
            self.settings.handshake_timeout(),
        ));
        self.connections.insert(
            connection,
            Connection {
                tx: None,
                reader: Some(reader),
            },
        );
    }

    fn on_offer(
        &mut self,
        connection: ConnectionId,
        offer: HandshakeOffer,
        tx: mpsc::Sender<Bytes>,
        decision: oneshot::Sender<bool>,
    ) {
        let origin = offer.origin.clone();
        let verdict = if self.self_down {
            OfferDecision::Reject(RejectReason::ShuttingDown)
        } else {
            self.table.on_offer(&offer, connection)
        };
        match verdict {
            OfferDecision::Accept { replaced } => {
                if let Err(e) = send_frame_on(&tx, &Frame::Accept {
                    origin: self.local.clone(),
                }) {
                    debug!(peer = %origin, error = %e, "Failed to send handshake accept");
                }
                let _ = decision.send(true);
                if let Some(entry) = self.connections.get_mut(&connection) {
                    entry.tx = Some(tx.clone());
                }
                if let Some(replaced) = replaced {
                    self.close_connection(replaced);
                }
                self.associated(origin, connection, tx);
            }
            OfferDecision::Reject(reason) => {
                warn!(peer = %origin, %reason, "Rejecting handshake");
                let _ = send_frame_on(&tx, &Frame::Reject { reason });
                let _ = decision.send(false);
                self.connections.remove(&connection);
            }
        }
    }

    fn on_handshake_done(
        &mut self,
        node: Node,
        connection: ConnectionId,
        result: Result<(UniqueNode, Channel), AssociationError>,
    ) {
        let error = match result {
            Ok((peer, channel)) => match self.table.on_accepted(&node, peer.clone(), connection) {
                CompletionDecision::Associated { replaced } => {
                    if let Some(replaced) = replaced {
                        self.close_connection(replaced);
                    }
                    let Channel { tx, rx } = channel;
                    let reader = tokio::spawn(read_frames(
                        connection,
                        peer.clone(),
                        rx,
                        self.commands_tx.clone(),
                        self.system.clone(),
                    ));
                    self.connections.insert(
                        connection,
                        Connection {
                            tx: Some(tx.clone()),
                            reader: Some(reader),
                        },
                    );
                    self.associated(peer, connection, tx);
                    return;
                }
                CompletionDecision::Superseded => {
                    debug!(peer = %peer, "Handshake superseded by concurrent association");
                    return;
                }
                CompletionDecision::Failed(e) => e,
            },
            Err(e) => {
                self.table.outbound_finished(&node, connection);
                e
            }
        };

        if let AssociationError::Rejected {
            reason: RejectReason::Tombstoned,
            ..
        } = &error
        {
            // The peer downed this incarnation. Its severance notice may never have arrived.
            warn!(peer = %node, "Rejected as tombstoned");
            self.attempts.remove(&node);
            self.self_downed("tombstoned by peer");
            return;
        }
        if let AssociationError::Rejected {
            reason: RejectReason::TieBreakLost,
            ..
        } = &error
        {
            debug!(peer = %node, "Lost handshake tie-break, waiting for the peer's handshake");
            return;
        }
        if self.table.peer_at(&node).is_some() {
            debug!(peer = %node, error = %error, "Handshake failed but an association exists");
            return;
        }

        let attempts = {
            let attempts = self.attempts.entry(node.clone()).or_insert(0);
            *attempts += 1;
            *attempts
        };
        let backoff = &self.settings.handshake_retry;
        if error.is_retriable() && !backoff.is_exhausted(attempts) && self.wanted(&node) {
            let delay = backoff.delay_for(attempts - 1);
            debug!(peer = %node, error = %error, attempts, ?delay, "Association failed, retrying");
            let commands = self.commands_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = commands.send(ClusterCommand::Associate(node));
            });
        } else {
            warn!(peer = %node, error = %error, attempts, "Giving up association");
            self.attempts.remove(&node);
            let dropped = self.control.routes().drain_pending(&node);
            self.dead_letter(dropped);
            self.system.node_unreachable(&node);
        }
    }

    fn associated(&mut self, peer: UniqueNode, connection: ConnectionId, tx: mpsc::Sender<Bytes>) {
        self.attempts.remove(&peer.node);
        let undeliverable = self.control.routes().publish(RemoteControl {
            peer: peer.clone(),
            connection,
            tx,
        });
        self.dead_letter(undeliverable);
        info!(peer = %peer, connection, "Associated");

        let now = Instant::now();
        let directives = self.swim.add_member(&peer, now);
        if let Some(change) = self.membership.apply(&peer, MemberStatus::Joining) {
            self.publish(vec![ClusterEvent::MembershipChange(change)]);
        }
        self.perform(directives);
    }

    fn on_closed(&mut self, connection: ConnectionId) {
        self.connections.remove(&connection);
        let Some(peer) = self.table.on_closed(connection) else {
            return;
        };
        self.control.routes().unpublish(&peer, connection);
        info!(peer = %peer, connection, "Association closed");
        if self.wanted(&peer.node) {
            let delay = self.settings.handshake_retry.delay_for(0);
            let commands = self.commands_tx.clone();
            let node = peer.node.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = commands.send(ClusterCommand::Associate(node));
            });
        }
    }

    fn close_connection(&mut self, connection: ConnectionId) {
        if let Some(entry) = self.connections.remove(&connection) {
            if let Some(reader) = entry.reader {
                reader.abort();
            }
        }
    }

    /// Whether this node still wants an association with `node`.
    fn wanted(&self, node: &Node) -> bool {
        if self.self_down {
            return false;
        }
        if self.control.routes().has_pending(node) {
            return true;
        }
        let members_at: Vec<MemberStatus> = self
            .membership
            .members()
            .filter(|member| &member.node.node == node)
            .map(|member| member.status)
            .collect();
        if members_at.is_empty() {
            return self.seeds.contains(node);
        }
        members_at.iter().any(|status| !status.is_down())
    }

    // -------------------------------------------------------------------------
    // Frames
    // -------------------------------------------------------------------------

    fn on_frame(&mut self, peer: UniqueNode, frame: Frame) {
        match frame {
            Frame::Swim(message) => {
                let directives = self.swim.on_message(message, Instant::now());
                self.perform(directives);
            }
            Frame::Receptionist(message) => match self.system.receptionist_handle() {
                Some(receptionist) => receptionist.deliver_remote(peer, message),
                None => debug!(peer = %peer, "No receptionist for replication traffic"),
            },
            Frame::RestInPeace { from, to } => {
                if to == self.local {
                    info!(peer = %from, "Received RestInPeace");
                    self.self_downed("severed by peer");
                } else {
                    debug!(peer = %from, to = %to, "Ignoring RestInPeace for another incarnation");
                }
            }
            Frame::Leaving { node } => {
                if let Some(change) = self.membership.apply(&node, MemberStatus::Leaving) {
                    info!(member = %node, "Member is leaving");
                    self.publish(vec![ClusterEvent::MembershipChange(change)]);
                }
            }
            Frame::Envelope(envelope) => self.system.deliver_envelope(envelope),
            Frame::System(message) => self.system.deliver_remote_system(message),
            Frame::Offer(_) | Frame::Accept { .. } | Frame::Reject { .. } => {
                warn!(peer = %peer, "Handshake frame on an established association");
            }
        }
    }

    fn send(&self, node: &UniqueNode, frame: &Frame) {
        if let Err(reason) = self.control.send_frame(node, frame, None) {
            trace!(peer = %node, %reason, frame = %frame.describe(), "Frame not sent");
        }
    }

    // -------------------------------------------------------------------------
    // Failure detection and membership
    // -------------------------------------------------------------------------

    fn perform(&mut self, directives: Vec<SwimDirective>) {
        let mut events = Vec::new();
        for directive in directives {
            match directive {
                SwimDirective::Send { to, message } => self.send(&to, &Frame::Swim(message)),
                SwimDirective::Reachable(node) => {
                    if self.membership.status_of(&node) == Some(MemberStatus::Joining) {
                        if let Some(change) = self.membership.apply(&node, MemberStatus::Up) {
                            info!(member = %node, "Member is up");
                            events.push(ClusterEvent::MembershipChange(change));
                        }
                    }
                }
                SwimDirective::StatusChanged {
                    node,
                    previous,
                    status,
                } => match status {
                    SwimStatus::Dead => {
                        warn!(member = %node, "Member confirmed dead");
                        self.mark_down(&node);
                    }
                    SwimStatus::Suspect { incarnation } => {
                        warn!(member = %node, incarnation, "Member is suspect");
                    }
                    SwimStatus::Alive { .. } => match previous {
                        None => {
                            if !self.table.is_tombstoned(&node) && !self.membership.is_down(&node)
                            {
                                debug!(member = %node, "Discovered member through gossip");
                                self.start_handshake(node.node.clone());
                            }
                        }
                        Some(SwimStatus::Suspect { .. }) => {
                            info!(member = %node, "Member refuted suspicion");
                        }
                        Some(_) => {}
                    },
                },
                SwimDirective::SelfDeclaredDead => self.self_downed("declared dead by gossip"),
            }
        }
        self.publish(events);
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let directives = self.swim.on_tick(now, &mut self.rng);
        self.perform(directives);

        let grace = self.settings.down_removal_grace();
        let expired: Vec<UniqueNode> = self
            .downed_at
            .iter()
            .filter(|(_, since)| **since + grace <= now)
            .map(|(node, _)| node.clone())
            .collect();
        let mut events = Vec::new();
        for node in expired {
            self.downed_at.remove(&node);
            self.swim.remove_member(&node);
            if let Some(change) = self.membership.apply(&node, MemberStatus::Removed) {
                info!(member = %node, "Member removed");
                events.push(ClusterEvent::MembershipChange(change));
            }
            self.removed_at.insert(node, now);
        }
        let forgotten: Vec<UniqueNode> = self
            .removed_at
            .iter()
            .filter(|(_, since)| **since + grace <= now)
            .map(|(node, _)| node.clone())
            .collect();
        let forgot_any = !forgotten.is_empty();
        for node in forgotten {
            self.removed_at.remove(&node);
            self.membership.forget(&node);
        }
        if forgot_any && events.is_empty() {
            self.control.publish_membership(self.membership.clone());
        }
        self.publish(events);
    }

    /// Takes a peer out of the cluster for good.
    fn mark_down(&mut self, node: &UniqueNode) {
        let mut events = Vec::new();
        if let Some(change) = self.membership.apply(node, MemberStatus::Down) {
            info!(member = %node, previous = ?change.previous, "Member is down");
            self.downed_at.insert(node.clone(), Instant::now());
            events.push(ClusterEvent::MembershipChange(change));
        }
        if let Some(directive) = self.swim.declare_dead(node, Instant::now()) {
            trace!(member = %node, ?directive, "Gossiping death");
        }
        self.sever(node);
        self.publish(events);
        self.system.node_terminated(node);
    }

    /// Best-effort `RestInPeace`, then close and tombstone.
    fn sever(&mut self, node: &UniqueNode) {
        if let Some(remote) = self.control.routes().remote(node) {
            let notice = Frame::RestInPeace {
                from: self.local.clone(),
                to: node.clone(),
            };
            match notice.encode() {
                Ok(bytes) => {
                    if let Err(reason) = remote.send(bytes) {
                        debug!(peer = %node, %reason, "RestInPeace not sent");
                    }
                }
                Err(e) => debug!(peer = %node, error = %e, "RestInPeace not encoded"),
            }
        }
        let dropped = self.control.routes().close(node);
        self.dead_letter(dropped);
        if let Some(connection) = self.table.tombstone(node) {
            info!(peer = %node, connection, "Severed association");
            self.close_connection(connection);
        }
        if self.membership.status_of(node).is_none() {
            if let Some(change) = self.membership.apply(node, MemberStatus::Down) {
                self.downed_at.insert(node.clone(), Instant::now());
                self.publish(vec![ClusterEvent::MembershipChange(change)]);
                self.system.node_terminated(node);
            }
        }
    }

    fn self_downed(&mut self, reason: &str) {
        if self.self_down {
            return;
        }
        self.self_down = true;
        warn!(node = %self.local, reason, "Self node was marked [.down]");
        let mut events = Vec::new();
        if let Some(change) = self.membership.apply(&self.local, MemberStatus::Down) {
            events.push(ClusterEvent::MembershipChange(change));
        }
        events.push(ClusterEvent::SelfDowned);
        self.publish(events);

        for peer in self.control.routes().peers() {
            if let Some(connection) = self.table.tombstone(&peer) {
                self.close_connection(connection);
            }
        }
        let dropped = self.control.routes().shut_down();
        self.dead_letter(dropped);

        if self.settings.shutdown_on_self_down {
            let system = self.system.clone();
            tokio::spawn(async move { system.shutdown().await });
        }
    }

    fn leave(&mut self) {
        let Some(change) = self.membership.apply(&self.local, MemberStatus::Leaving) else {
            return;
        };
        info!(node = %self.local, "Leaving cluster");
        let notice = Frame::Leaving {
            node: self.local.clone(),
        };
        for peer in self.control.routes().peers() {
            self.send(&peer, &notice);
        }
        self.publish(vec![ClusterEvent::MembershipChange(change)]);
    }

    fn publish(&self, events: Vec<ClusterEvent>) {
        if events.is_empty() {
            return;
        }
        self.control.publish_membership(self.membership.clone());
        for event in events {
            self.control.publish_event(event);
        }
    }

    fn dead_letter(&self, frames: Vec<PendingFrame>) {
        for frame in frames {
            match frame.recipient {
                Some(recipient) => self.system.dead_letters().record(DeadLetter {
                    recipient,
                    message: frame.description,
                    reason: DeadLetterReason::NoAssociation,
                }),
                None => trace!(peer = %frame.target, frame = %frame.description, "Dropped frame"),
            }
        }
    }

    fn stop(&mut self) {
        if !self.self_down && self.membership.status_of(&self.local) != Some(MemberStatus::Leaving)
        {
            let notice = Frame::Leaving {
                node: self.local.clone(),
            };
            for peer in self.control.routes().peers() {
                self.send(&peer, &notice);
            }
        }
        let dropped = self.control.routes().shut_down();
        self.dead_letter(dropped);
        let connections: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for connection in connections {
            self.close_connection(connection);
        }
    }
}

// =============================================================================
// Connection tasks
// =============================================================================

fn send_frame_on(tx: &mpsc::Sender<Bytes>, frame: &Frame) -> Result<(), FrameworkError> {
    let bytes = frame.encode()?;
    tx.try_send(bytes).map_err(|_| FrameworkError::ActorClosed)
}

async fn accept_loop(mut listener: Box<dyn Listener>, commands: mpsc::UnboundedSender<ClusterCommand>) {
    while let Some(channel) = listener.accept().await {
        if commands.send(ClusterCommand::Accepted(channel)).is_err() {
            break;
        }
    }
}

/// Initiator side: connect, offer, wait for the verdict.
async fn handshake(
    transport: Arc<dyn Transport>,
    offer: HandshakeOffer,
) -> Result<(UniqueNode, Channel), AssociationError> {
    let node = offer.target.clone();
    let mut channel = transport.connect(&node).await?;
    let bytes = Frame::Offer(offer)
        .encode()
        .map_err(|e| AssociationError::ConnectFailed {
            node: node.clone(),
            reason: e.to_string(),
        })?;
    channel
        .tx
        .send(bytes)
        .await
        .map_err(|_| AssociationError::ChannelClosed(node.clone()))?;
    let reply = channel
        .rx
        .recv()
        .await
        .ok_or_else(|| AssociationError::ChannelClosed(node.clone()))?;
    match Frame::decode(&reply) {
        Ok(Frame::Accept { origin }) => Ok((origin, channel)),
        Ok(Frame::Reject { reason }) => Err(AssociationError::Rejected { node, reason }),
        _ => Err(AssociationError::ProtocolViolation { node }),
    }
}

/// Acceptor side: the first frame must be an offer, which the shell rules on.
async fn inbound_connection(
    connection: ConnectionId,
    channel: Channel,
    commands: mpsc::UnboundedSender<ClusterCommand>,
    system: ActorSystem,
    handshake_timeout: Duration,
) {
    let Channel { tx, mut rx } = channel;
    let offer = match tokio::time::timeout(handshake_timeout, rx.recv()).await {
        Ok(Some(bytes)) => match Frame::decode(&bytes) {
            Ok(Frame::Offer(offer)) => offer,
            Ok(other) => {
                warn!(connection, frame = %other.describe(), "Expected a handshake offer");
                let _ = commands.send(ClusterCommand::Closed(connection));
                return;
            }
            Err(e) => {
                warn!(connection, error = %e, "Undecodable handshake offer");
                let _ = commands.send(ClusterCommand::Closed(connection));
                return;
            }
        },
        Ok(None) | Err(_) => {
            debug!(connection, "Inbound connection closed before handshake");
            let _ = commands.send(ClusterCommand::Closed(connection));
            return;
        }
    };
    let peer = offer.origin.clone();
    let (decision, verdict) = oneshot::channel();
    let offered = ClusterCommand::Offer {
        connection,
        offer,
        tx,
        decision,
    };
    if commands.send(offered).is_err() || !matches!(verdict.await, Ok(true)) {
        return;
    }
    read_frames(connection, peer, rx, commands, system).await;
}

async fn read_frames(
    connection: ConnectionId,
    peer: UniqueNode,
    mut rx: mpsc::Receiver<Bytes>,
    commands: mpsc::UnboundedSender<ClusterCommand>,
    system: ActorSystem,
) {
    while let Some(bytes) = rx.recv().await {
        match Frame::decode(&bytes) {
            Ok(Frame::Envelope(envelope)) => system.deliver_envelope(envelope),
            Ok(Frame::System(message)) => system.deliver_remote_system(message),
            Ok(frame) => {
                let inbound = ClusterCommand::Inbound {
                    peer: peer.clone(),
                    frame,
                };
                if commands.send(inbound).is_err() {
                    return;
                }
            }
            Err(e) => warn!(peer = %peer, error = %e, "Dropping undecodable frame"),
        }
    }
    let _ = commands.send(ClusterCommand::Closed(connection));
}
