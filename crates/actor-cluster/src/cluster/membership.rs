//! # Membership
//!
//! The local view of who is in the cluster. Each member moves forward only through
//! `Joining -> Up -> Leaving -> Down -> Removed`; stages may be skipped but never revisited, so a
//! node that was declared down stays down for as long as its nid lives.

use crate::identity::UniqueNode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberStatus {
    Joining,
    Up,
    Leaving,
    Down,
    Removed,
}

impl MemberStatus {
    /// Down and removed members own nothing and are not talked to.
    pub fn is_down(self) -> bool {
        matches!(self, Self::Down | Self::Removed)
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Joining => "joining",
            Self::Up => "up",
            Self::Leaving => "leaving",
            Self::Down => "down",
            Self::Removed => "removed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub node: UniqueNode,
    pub status: MemberStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub node: UniqueNode,
    pub previous: Option<MemberStatus>,
    pub status: MemberStatus,
}

/// Events published by the cluster shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    MembershipChange(MembershipChange),
    /// This node learned that the cluster declared it down.
    SelfDowned,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    members: BTreeMap<UniqueNode, Member>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `node` to `status` if that is a forward move. Unknown nodes are added.
    pub fn apply(&mut self, node: &UniqueNode, status: MemberStatus) -> Option<MembershipChange> {
        let previous = self.members.get(node).map(|member| member.status);
        if previous.is_some_and(|current| current >= status) {
            return None;
        }
        self.members.insert(
            node.clone(),
            Member {
                node: node.clone(),
                status,
            },
        );
        Some(MembershipChange {
            node: node.clone(),
            previous,
            status,
        })
    }

    /// Drops a removed member entirely.
    pub fn forget(&mut self, node: &UniqueNode) -> bool {
        match self.members.get(node) {
            Some(member) if member.status == MemberStatus::Removed => {
                self.members.remove(node);
                true
            }
            _ => false,
        }
    }

    pub fn member(&self, node: &UniqueNode) -> Option<&Member> {
        self.members.get(node)
    }

    pub fn status_of(&self, node: &UniqueNode) -> Option<MemberStatus> {
        self.member(node).map(|member| member.status)
    }

    pub fn is_down(&self, node: &UniqueNode) -> bool {
        self.status_of(node).is_some_and(MemberStatus::is_down)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Members that are neither down nor removed.
    pub fn live_members(&self) -> impl Iterator<Item = &Member> {
        self.members().filter(|member| !member.status.is_down())
    }

    pub fn with_status(&self, status: MemberStatus) -> Vec<UniqueNode> {
        self.members()
            .filter(|member| member.status == status)
            .map(|member| member.node.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Node;

    fn unique(port: u16) -> UniqueNode {
        UniqueNode::new(Node::new("sys", "127.0.0.1", port), port as u64)
    }

    #[test]
    fn test_transitions_only_move_forward() {
        let mut membership = Membership::new();
        let node = unique(1);

        let change = membership.apply(&node, MemberStatus::Joining).unwrap();
        assert_eq!(change.previous, None);
        assert!(membership.apply(&node, MemberStatus::Up).is_some());
        assert!(membership.apply(&node, MemberStatus::Joining).is_none());
        assert!(membership.apply(&node, MemberStatus::Up).is_none());

        let down = membership.apply(&node, MemberStatus::Down).unwrap();
        assert_eq!(down.previous, Some(MemberStatus::Up));
        assert!(membership.apply(&node, MemberStatus::Up).is_none());
        assert_eq!(membership.status_of(&node), Some(MemberStatus::Down));
        assert!(membership.is_down(&node));
    }

    #[test]
    fn test_stages_can_be_skipped() {
        let mut membership = Membership::new();
        let node = unique(1);
        let change = membership.apply(&node, MemberStatus::Down).unwrap();
        assert_eq!(change.previous, None);
        assert!(membership.live_members().next().is_none());
    }

    #[test]
    fn test_only_removed_members_are_forgotten() {
        let mut membership = Membership::new();
        let node = unique(1);
        membership.apply(&node, MemberStatus::Down);
        assert!(!membership.forget(&node));
        membership.apply(&node, MemberStatus::Removed);
        assert!(membership.forget(&node));
        assert!(membership.is_empty());
    }

    #[test]
    fn test_with_status_filters() {
        let mut membership = Membership::new();
        membership.apply(&unique(1), MemberStatus::Up);
        membership.apply(&unique(2), MemberStatus::Joining);
        membership.apply(&unique(3), MemberStatus::Up);
        assert_eq!(membership.with_status(MemberStatus::Up).len(), 2);
        assert_eq!(membership.live_members().count(), 3);
    }
}
