//! # Receptionist Shell
//!
//! The owner task of the op-log. Local requests, retired actors, pulled batches and membership
//! changes are processed one at a time; subscribers are told about every key whose merged view
//! changed.
//!
//! Anti-entropy is pull based: every `sync_interval_slow` (or `sync_interval_fast` after a pull
//! that came back full) a `SyncRequest` goes to each associated member that is joining or up.

use crate::cluster::wire::Frame;
use crate::cluster::{ClusterControl, ClusterEvent, MemberStatus};
use crate::config::ReceptionistSettings;
use crate::identity::{ActorId, UniqueNode};
use crate::receptionist::oplog::{ErasedKey, OpLog};
use crate::receptionist::{Notify, ReceptionistMessage, ReceptionistRequest};
use crate::system::ActorSystem;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

struct Subscription {
    subscriber: ActorId,
    notify: Notify,
    last: Vec<ActorId>,
}

pub(crate) struct ReceptionistShell {
    system: ActorSystem,
    settings: ReceptionistSettings,
    requests: mpsc::UnboundedReceiver<ReceptionistRequest>,
    retired: mpsc::UnboundedReceiver<ActorId>,
    log: OpLog,
    subscriptions: HashMap<ErasedKey, Vec<Subscription>>,
    /// Peers whose last pull came back as a full batch.
    behind: BTreeSet<UniqueNode>,
}

impl ReceptionistShell {
    pub(crate) fn new(
        system: ActorSystem,
        requests: mpsc::UnboundedReceiver<ReceptionistRequest>,
        retired: mpsc::UnboundedReceiver<ActorId>,
    ) -> Self {
        Self {
            settings: system.settings().cluster.receptionist.clone(),
            log: OpLog::new(system.node().clone()),
            system,
            requests,
            retired,
            subscriptions: HashMap::new(),
            behind: BTreeSet::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let cluster = self.system.cluster().ok();
        let mut events = cluster.as_ref().map(ClusterControl::subscribe);
        let mut next_sync = Instant::now() + self.settings.sync_interval_fast();
        debug!(node = %self.system.node(), clustered = cluster.is_some(), "Receptionist started");

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(ReceptionistRequest::Shutdown(done)) => {
                        let _ = done.send(());
                        break;
                    }
                    Some(request) => self.handle(request, cluster.as_ref()),
                    None => break,
                },
                Some(id) = self.retired.recv() => self.retire(id),
                event = recv_event(&mut events) => match event {
                    Ok(event) => {
                        if self.on_cluster_event(event) {
                            next_sync = Instant::now();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Receptionist lagged behind cluster events");
                        if let Some(cluster) = &cluster {
                            self.reconcile_down_members(cluster);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => events = None,
                },
                _ = tokio::time::sleep_until(next_sync), if cluster.is_some() => {
                    if let Some(cluster) = &cluster {
                        self.pull(cluster);
                    }
                    let interval = if self.behind.is_empty() {
                        self.settings.sync_interval_slow()
                    } else {
                        self.settings.sync_interval_fast()
                    };
                    next_sync = Instant::now() + interval;
                }
            }
        }
        debug!(node = %self.system.node(), "Receptionist stopped");
    }

    fn handle(&mut self, request: ReceptionistRequest, cluster: Option<&ClusterControl>) {
        match request {
            ReceptionistRequest::Register {
                key,
                actor,
                respond_to,
            } => {
                let registered =
                    self.system.is_alive(&actor) && self.log.register(key.clone(), actor.clone());
                if registered {
                    info!(%key, actor = %actor, "Registered");
                    self.notify_changed([key]);
                }
                let _ = respond_to.send(Ok(registered));
            }
            ReceptionistRequest::Unregister {
                key,
                actor,
                respond_to,
            } => {
                let unregistered = self.log.unregister(&key, &actor);
                if unregistered {
                    info!(%key, actor = %actor, "Unregistered");
                    self.notify_changed([key]);
                }
                let _ = respond_to.send(Ok(unregistered));
            }
            ReceptionistRequest::Lookup { key, respond_to } => {
                let _ = respond_to.send(Ok(self.log.lookup(&key)));
            }
            ReceptionistRequest::Subscribe {
                key,
                subscriber,
                notify,
                respond_to,
            } => {
                debug!(%key, subscriber = %subscriber, "Subscribed");
                let current = self.log.lookup(&key);
                notify(&self.system, &current);
                self.subscriptions.entry(key).or_default().push(Subscription {
                    subscriber,
                    notify,
                    last: current,
                });
                let _ = respond_to.send(Ok(()));
            }
            ReceptionistRequest::Remote { peer, message } => match cluster {
                Some(cluster) => self.on_remote(cluster, peer, message),
                None => debug!(peer = %peer, "Replication message without a cluster"),
            },
            ReceptionistRequest::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    /// A local actor stopped or restarted: its registrations and subscriptions go with it.
    fn retire(&mut self, id: ActorId) {
        let keys = self.log.retire(&id);
        if !keys.is_empty() {
            info!(actor = %id, keys = keys.len(), "Retired registrations of terminated actor");
        }
        for subscriptions in self.subscriptions.values_mut() {
            subscriptions.retain(|subscription| subscription.subscriber != id);
        }
        self.subscriptions.retain(|_, subscriptions| !subscriptions.is_empty());
        self.notify_changed(keys);
    }

    fn on_remote(&mut self, cluster: &ClusterControl, peer: UniqueNode, message: ReceptionistMessage) {
        match message {
            ReceptionistMessage::SyncRequest { after_sequence } => {
                let ops = self.log.ops_after(after_sequence, self.settings.sync_batch_max);
                trace!(peer = %peer, after_sequence, ops = ops.len(), "Serving sync request");
                let response = ReceptionistMessage::SyncResponse {
                    ops,
                    highest_sequence: self.log.highest_sequence(),
                };
                if let Err(reason) = cluster.send_frame(&peer, &Frame::Receptionist(response), None) {
                    debug!(peer = %peer, %reason, "Sync response not sent");
                }
            }
            ReceptionistMessage::SyncResponse {
                ops,
                highest_sequence,
            } => {
                let live = cluster
                    .membership()
                    .status_of(&peer)
                    .is_some_and(|status| !status.is_down());
                if !live {
                    debug!(peer = %peer, "Ignoring sync response from a member that is not live");
                    return;
                }
                match self.log.apply_batch(&peer, &ops) {
                    Ok(touched) => {
                        trace!(peer = %peer, ops = ops.len(), highest_sequence, "Applied sync batch");
                        if self.log.applied(&peer) < highest_sequence {
                            self.behind.insert(peer);
                        } else {
                            self.behind.remove(&peer);
                        }
                        self.notify_changed(touched);
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Rejected replication batch");
                        self.behind.insert(peer);
                    }
                }
            }
        }
    }

    fn pull(&self, cluster: &ClusterControl) {
        let membership = cluster.membership();
        for peer in cluster.associated_nodes() {
            let pullable = matches!(
                membership.status_of(&peer),
                Some(MemberStatus::Joining | MemberStatus::Up)
            );
            if !pullable {
                continue;
            }
            let request = ReceptionistMessage::SyncRequest {
                after_sequence: self.log.applied(&peer),
            };
            if let Err(reason) = cluster.send_frame(&peer, &Frame::Receptionist(request), None) {
                debug!(peer = %peer, %reason, "Sync request not sent");
            }
        }
    }

    /// Returns `true` when a pull should happen right away.
    fn on_cluster_event(&mut self, event: ClusterEvent) -> bool {
        match event {
            ClusterEvent::MembershipChange(change) if change.status.is_down() => {
                self.behind.remove(&change.node);
                let touched = self.log.node_down(&change.node);
                if !touched.is_empty() {
                    info!(member = %change.node, keys = touched.len(), "Dropped registrations of down member");
                }
                self.notify_changed(touched);
                if change.status == MemberStatus::Removed {
                    self.log.forget(&change.node);
                    debug!(member = %change.node, "Forgot replication state of removed member");
                }
                false
            }
            ClusterEvent::MembershipChange(change) => {
                matches!(change.status, MemberStatus::Joining | MemberStatus::Up)
            }
            ClusterEvent::SelfDowned => false,
        }
    }

    fn reconcile_down_members(&mut self, cluster: &ClusterControl) {
        let membership = cluster.membership();
        let down: Vec<(UniqueNode, MemberStatus)> = membership
            .members()
            .filter(|member| member.status.is_down())
            .map(|member| (member.node.clone(), member.status))
            .collect();
        for (node, status) in down {
            let touched = self.log.node_down(&node);
            self.notify_changed(touched);
            if status == MemberStatus::Removed {
                self.log.forget(&node);
            }
        }
    }

    fn notify_changed(&mut self, keys: impl IntoIterator<Item = ErasedKey>) {
        for key in keys {
            let Some(subscriptions) = self.subscriptions.get_mut(&key) else {
                continue;
            };
            let current = self.log.lookup(&key);
            subscriptions.retain(|subscription| self.system.is_alive(&subscription.subscriber));
            for subscription in subscriptions.iter_mut() {
                if subscription.last != current {
                    (subscription.notify)(&self.system, &current);
                    subscription.last = current.clone();
                }
            }
        }
    }
}

async fn recv_event(
    events: &mut Option<broadcast::Receiver<ClusterEvent>>,
) -> Result<ClusterEvent, broadcast::error::RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
