//! # Association Table
//!
//! Pure bookkeeping of which peer process is associated at which endpoint, which outbound
//! handshakes are in flight and which peers are tombstoned. The cluster shell owns one table and
//! feeds it handshake events; the table decides, the shell performs the I/O.
//!
//! At most one association exists per [`Node`]. Racing handshakes between the same two processes
//! are settled with [`UniqueNode::wins_tie_break_against`]: the association whose initiator has
//! the lower nid survives, and both sides reach the same verdict without talking to each other.
//!
//! Connections are numbered by the shell. Events carrying a connection id that no longer matches
//! the table are stale and ignored.

use crate::cluster::wire::{HandshakeOffer, ProtocolVersion, RejectReason};
use crate::error::AssociationError;
use crate::identity::{Node, UniqueNode};
use std::collections::{HashMap, HashSet};

pub(crate) type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Association {
    pub peer: UniqueNode,
    pub connection: ConnectionId,
    pub initiator: UniqueNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OfferDecision {
    /// Install the association; `replaced` is the connection it superseded, to be closed.
    Accept { replaced: Option<ConnectionId> },
    Reject(RejectReason),
}

#[derive(Debug)]
pub(crate) enum CompletionDecision {
    Associated { replaced: Option<ConnectionId> },
    /// An association that wins the tie-break already exists; drop the new connection.
    Superseded,
    Failed(AssociationError),
}

#[derive(Debug)]
pub(crate) struct AssociationTable {
    local: UniqueNode,
    version: ProtocolVersion,
    associated: HashMap<Node, Association>,
    outbound: HashMap<Node, ConnectionId>,
    tombstones: HashSet<UniqueNode>,
}

impl AssociationTable {
    pub(crate) fn new(local: UniqueNode, version: ProtocolVersion) -> Self {
        Self {
            local,
            version,
            associated: HashMap::new(),
            outbound: HashMap::new(),
            tombstones: HashSet::new(),
        }
    }

    /// Registers an outbound handshake. Returns `false` when there is nothing to do: the node is
    /// this one, already associated, or already being dialed.
    pub(crate) fn begin_outbound(&mut self, node: &Node, connection: ConnectionId) -> bool {
        if node == &self.local.node
            || self.associated.contains_key(node)
            || self.outbound.contains_key(node)
        {
            return false;
        }
        self.outbound.insert(node.clone(), connection);
        true
    }

    pub(crate) fn is_in_flight(&self, node: &Node) -> bool {
        self.outbound.contains_key(node)
    }

    /// The acceptor's side of a handshake.
    pub(crate) fn on_offer(
        &mut self,
        offer: &HandshakeOffer,
        connection: ConnectionId,
    ) -> OfferDecision {
        let origin = &offer.origin;
        if !self.version.is_compatible_with(&offer.version) {
            return OfferDecision::Reject(RejectReason::IncompatibleProtocol {
                local: self.version,
                remote: offer.version,
            });
        }
        if offer.target != self.local.node {
            return OfferDecision::Reject(RejectReason::WrongTarget {
                expected: offer.target.clone(),
                actual: self.local.node.clone(),
            });
        }
        if self.tombstones.contains(origin) {
            return OfferDecision::Reject(RejectReason::Tombstoned);
        }
        if let Some(existing) = self.associated.get(&origin.node) {
            if &existing.peer != origin {
                return OfferDecision::Reject(RejectReason::IdentityConflict {
                    existing: existing.peer.clone(),
                });
            }
            if existing.initiator.wins_tie_break_against(origin) {
                return OfferDecision::Reject(RejectReason::TieBreakLost);
            }
        } else if self.outbound.contains_key(&origin.node)
            && self.local.wins_tie_break_against(origin)
        {
            return OfferDecision::Reject(RejectReason::TieBreakLost);
        }
        let replaced = self.install(Association {
            peer: origin.clone(),
            connection,
            initiator: origin.clone(),
        });
        OfferDecision::Accept { replaced }
    }

    /// The initiator's side: `target` accepted as `peer` on `connection`.
    pub(crate) fn on_accepted(
        &mut self,
        target: &Node,
        peer: UniqueNode,
        connection: ConnectionId,
    ) -> CompletionDecision {
        self.outbound_finished(target, connection);
        if &peer.node != target {
            return CompletionDecision::Failed(AssociationError::ProtocolViolation {
                node: target.clone(),
            });
        }
        if self.tombstones.contains(&peer) {
            return CompletionDecision::Failed(AssociationError::Tombstoned(peer));
        }
        if let Some(existing) = self.associated.get(target) {
            if existing.peer != peer {
                return CompletionDecision::Failed(AssociationError::IdentityConflict {
                    node: target.clone(),
                    existing: existing.peer.clone(),
                });
            }
            if existing.initiator.wins_tie_break_against(&self.local) {
                return CompletionDecision::Superseded;
            }
        }
        let initiator = self.local.clone();
        let replaced = self.install(Association {
            peer,
            connection,
            initiator,
        });
        CompletionDecision::Associated { replaced }
    }

    /// Forgets an in-flight outbound handshake, if `connection` is still the current one.
    pub(crate) fn outbound_finished(&mut self, node: &Node, connection: ConnectionId) {
        if self.outbound.get(node) == Some(&connection) {
            self.outbound.remove(node);
        }
    }

    /// A connection closed. Returns the peer whose association it carried, if any.
    pub(crate) fn on_closed(&mut self, connection: ConnectionId) -> Option<UniqueNode> {
        let node = self
            .associated
            .iter()
            .find(|(_, association)| association.connection == connection)
            .map(|(node, _)| node.clone())?;
        self.associated.remove(&node).map(|association| association.peer)
    }

    /// Tombstones `peer` for good. Returns the connection to close, if it was associated.
    pub(crate) fn tombstone(&mut self, peer: &UniqueNode) -> Option<ConnectionId> {
        self.tombstones.insert(peer.clone());
        match self.associated.get(&peer.node) {
            Some(existing) if &existing.peer == peer => self
                .associated
                .remove(&peer.node)
                .map(|association| association.connection),
            _ => None,
        }
    }

    pub(crate) fn is_tombstoned(&self, peer: &UniqueNode) -> bool {
        self.tombstones.contains(peer)
    }

    pub(crate) fn association(&self, peer: &UniqueNode) -> Option<&Association> {
        self.associated
            .get(&peer.node)
            .filter(|association| &association.peer == peer)
    }

    pub(crate) fn peer_at(&self, node: &Node) -> Option<&UniqueNode> {
        self.associated.get(node).map(|association| &association.peer)
    }

    pub(crate) fn associated_peers(&self) -> Vec<UniqueNode> {
        self.associated
            .values()
            .map(|association| association.peer.clone())
            .collect()
    }

    fn install(&mut self, association: Association) -> Option<ConnectionId> {
        self.associated
            .insert(association.peer.node.clone(), association)
            .map(|previous| previous.connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> Node {
        Node::new("sys", "127.0.0.1", port)
    }

    fn unique(port: u16, nid: u64) -> UniqueNode {
        UniqueNode::new(node(port), nid)
    }

    fn offer(origin: &UniqueNode, target: &Node) -> HandshakeOffer {
        HandshakeOffer {
            origin: origin.clone(),
            target: target.clone(),
            version: ProtocolVersion::CURRENT,
            capabilities: Vec::new(),
        }
    }

    #[test]
    fn test_accepts_fresh_offer() {
        let local = unique(1, 10);
        let remote = unique(2, 20);
        let mut table = AssociationTable::new(local.clone(), ProtocolVersion::CURRENT);
        assert_eq!(
            table.on_offer(&offer(&remote, &local.node), 1),
            OfferDecision::Accept { replaced: None }
        );
        assert_eq!(table.peer_at(&remote.node), Some(&remote));
    }

    #[test]
    fn test_rejects_incompatible_version_and_wrong_target() {
        let local = unique(1, 10);
        let remote = unique(2, 20);
        let mut table = AssociationTable::new(local.clone(), ProtocolVersion::CURRENT);

        let mut bad_version = offer(&remote, &local.node);
        bad_version.version = ProtocolVersion::new(2, 0, 0);
        assert!(matches!(
            table.on_offer(&bad_version, 1),
            OfferDecision::Reject(RejectReason::IncompatibleProtocol { .. })
        ));

        assert!(matches!(
            table.on_offer(&offer(&remote, &node(9)), 2),
            OfferDecision::Reject(RejectReason::WrongTarget { .. })
        ));
        assert!(table.associated_peers().is_empty());
    }

    #[test]
    fn test_tombstoned_origin_is_rejected() {
        let local = unique(1, 10);
        let remote = unique(2, 20);
        let mut table = AssociationTable::new(local.clone(), ProtocolVersion::CURRENT);
        table.on_offer(&offer(&remote, &local.node), 1);

        assert_eq!(table.tombstone(&remote), Some(1));
        assert!(table.is_tombstoned(&remote));
        assert_eq!(
            table.on_offer(&offer(&remote, &local.node), 2),
            OfferDecision::Reject(RejectReason::Tombstoned)
        );
    }

    #[test]
    fn test_restarted_process_conflicts_with_live_association() {
        let local = unique(1, 10);
        let old = unique(2, 20);
        let restarted = unique(2, 21);
        let mut table = AssociationTable::new(local.clone(), ProtocolVersion::CURRENT);
        table.on_offer(&offer(&old, &local.node), 1);

        assert_eq!(
            table.on_offer(&offer(&restarted, &local.node), 2),
            OfferDecision::Reject(RejectReason::IdentityConflict { existing: old })
        );
    }

    #[test]
    fn test_concurrent_handshakes_keep_exactly_one_association() {
        let low = unique(1, 5);
        let high = unique(2, 50);
        let mut low_table = AssociationTable::new(low.clone(), ProtocolVersion::CURRENT);
        let mut high_table = AssociationTable::new(high.clone(), ProtocolVersion::CURRENT);

        // Both dial at the same time.
        assert!(low_table.begin_outbound(&high.node, 1));
        assert!(high_table.begin_outbound(&low.node, 1));

        // Each side receives the other's offer.
        assert_eq!(
            low_table.on_offer(&offer(&high, &low.node), 2),
            OfferDecision::Reject(RejectReason::TieBreakLost)
        );
        assert_eq!(
            high_table.on_offer(&offer(&low, &high.node), 2),
            OfferDecision::Accept { replaced: None }
        );

        // The low side's handshake completes, the high side's was rejected.
        assert!(matches!(
            low_table.on_accepted(&high.node, high.clone(), 1),
            CompletionDecision::Associated { replaced: None }
        ));
        high_table.outbound_finished(&low.node, 1);

        assert_eq!(low_table.association(&high).unwrap().initiator, low);
        assert_eq!(high_table.association(&low).unwrap().initiator, low);
        assert!(!high_table.is_in_flight(&low.node));
    }

    #[test]
    fn test_late_completion_loses_to_winning_inbound() {
        let low = unique(1, 5);
        let high = unique(2, 50);
        let mut high_table = AssociationTable::new(high.clone(), ProtocolVersion::CURRENT);
        assert!(high_table.begin_outbound(&low.node, 1));
        high_table.on_offer(&offer(&low, &high.node), 2);

        assert!(matches!(
            high_table.on_accepted(&low.node, low.clone(), 1),
            CompletionDecision::Superseded
        ));
        assert_eq!(high_table.association(&low).unwrap().connection, 2);
    }

    #[test]
    fn test_reconnect_from_same_initiator_replaces_old_connection() {
        let local = unique(1, 10);
        let remote = unique(2, 20);
        let mut table = AssociationTable::new(local.clone(), ProtocolVersion::CURRENT);
        table.on_offer(&offer(&remote, &local.node), 1);
        assert_eq!(
            table.on_offer(&offer(&remote, &local.node), 2),
            OfferDecision::Accept { replaced: Some(1) }
        );
    }

    #[test]
    fn test_stale_close_is_ignored() {
        let local = unique(1, 10);
        let remote = unique(2, 20);
        let mut table = AssociationTable::new(local.clone(), ProtocolVersion::CURRENT);
        table.on_offer(&offer(&remote, &local.node), 1);
        table.on_offer(&offer(&remote, &local.node), 2);

        assert_eq!(table.on_closed(1), None);
        assert_eq!(table.on_closed(2), Some(remote.clone()));
        assert!(table.association(&remote).is_none());
    }

    #[test]
    fn test_begin_outbound_skips_self_and_duplicates() {
        let local = unique(1, 10);
        let mut table = AssociationTable::new(local.clone(), ProtocolVersion::CURRENT);
        assert!(!table.begin_outbound(&local.node, 1));
        assert!(table.begin_outbound(&node(2), 2));
        assert!(!table.begin_outbound(&node(2), 3));
    }
}
