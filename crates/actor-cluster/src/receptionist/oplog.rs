//! # Registration Op-Log
//!
//! Each node owns an append-only log of registration operations on its own actors (plus the
//! unregisters it synthesizes for actors of nodes that went down). Peers pull each other's logs
//! in batches and keep one partition per origin.
//!
//! The merged view of a key is the union of every partition minus actors unregistered by a
//! foreign origin, minus actors of nodes that are down. Partitions only ever grow in sequence
//! order, so applying the same batches in any interleaving across origins converges on the same
//! view.

use crate::error::ReplicationError;
use crate::identity::{ActorId, UniqueNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

/// A registration key with its message type erased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ErasedKey {
    pub type_tag: String,
    pub id: String,
}

impl fmt::Display for ErasedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.id, self.type_tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Register,
    Unregister,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpEntry {
    pub sequence: u64,
    pub kind: OpKind,
    pub key: ErasedKey,
    pub actor: ActorId,
}

type Registrations = BTreeMap<ErasedKey, BTreeSet<ActorId>>;

#[derive(Debug, Default)]
struct Partition {
    applied: u64,
    registrations: Registrations,
}

#[derive(Debug)]
pub(crate) struct OpLog {
    local: UniqueNode,
    ops: Vec<OpEntry>,
    own: Registrations,
    partitions: HashMap<UniqueNode, Partition>,
    /// `(key, actor)` pairs unregistered by someone other than the owner.
    tombstones: HashSet<(ErasedKey, ActorId)>,
    down: HashSet<UniqueNode>,
}

impl OpLog {
    pub(crate) fn new(local: UniqueNode) -> Self {
        Self {
            local,
            ops: Vec::new(),
            own: BTreeMap::new(),
            partitions: HashMap::new(),
            tombstones: HashSet::new(),
            down: HashSet::new(),
        }
    }

    pub(crate) fn highest_sequence(&self) -> u64 {
        self.ops.len() as u64
    }

    fn append(&mut self, kind: OpKind, key: ErasedKey, actor: ActorId) {
        let sequence = self.highest_sequence() + 1;
        self.ops.push(OpEntry {
            sequence,
            kind,
            key,
            actor,
        });
    }

    /// Registers a local actor. Returns `false` if it was already registered under `key`.
    pub(crate) fn register(&mut self, key: ErasedKey, actor: ActorId) -> bool {
        if !self.own.entry(key.clone()).or_default().insert(actor.clone()) {
            return false;
        }
        self.append(OpKind::Register, key, actor);
        true
    }

    pub(crate) fn unregister(&mut self, key: &ErasedKey, actor: &ActorId) -> bool {
        let removed = self
            .own
            .get_mut(key)
            .is_some_and(|actors| actors.remove(actor));
        if removed {
            if self.own.get(key).is_some_and(BTreeSet::is_empty) {
                self.own.remove(key);
            }
            self.append(OpKind::Unregister, key.clone(), actor.clone());
        }
        removed
    }

    /// Unregisters a local actor from every key. Returns the affected keys.
    pub(crate) fn retire(&mut self, actor: &ActorId) -> Vec<ErasedKey> {
        let keys: Vec<ErasedKey> = self
            .own
            .iter()
            .filter(|(_, actors)| actors.contains(actor))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.unregister(key, actor);
        }
        keys
    }

    /// Own ops after `after_sequence`, at most `max` of them.
    pub(crate) fn ops_after(&self, after_sequence: u64, max: usize) -> Vec<OpEntry> {
        let start = usize::try_from(after_sequence)
            .unwrap_or(usize::MAX)
            .min(self.ops.len());
        self.ops[start..].iter().take(max).cloned().collect()
    }

    /// Highest sequence applied from `origin`; the next pull asks for what follows it.
    pub(crate) fn applied(&self, origin: &UniqueNode) -> u64 {
        self.partitions
            .get(origin)
            .map_or(0, |partition| partition.applied)
    }

    /// Applies a batch pulled from `origin`. Returns the keys whose merged view may have
    /// changed. A batch with a gap or a foreign registration is rejected whole.
    pub(crate) fn apply_batch(
        &mut self,
        origin: &UniqueNode,
        ops: &[OpEntry],
    ) -> Result<BTreeSet<ErasedKey>, ReplicationError> {
        if self.down.contains(origin) {
            return Err(ReplicationError::OriginDown(origin.clone()));
        }
        let mut expected = self.applied(origin) + 1;
        for op in ops {
            if op.sequence < expected {
                continue;
            }
            if op.sequence > expected {
                return Err(ReplicationError::SequenceGap {
                    origin: origin.clone(),
                    expected,
                    actual: op.sequence,
                });
            }
            if op.kind == OpKind::Register && !op.actor.is_on(origin) {
                return Err(ReplicationError::ForeignRegistration {
                    origin: origin.clone(),
                    actor: op.actor.clone(),
                });
            }
            expected += 1;
        }

        let mut touched = BTreeSet::new();
        let partition = self.partitions.entry(origin.clone()).or_default();
        let already_applied = partition.applied;
        for op in ops.iter().filter(|op| op.sequence > already_applied) {
            partition.applied = op.sequence;
            match op.kind {
                OpKind::Register => {
                    partition
                        .registrations
                        .entry(op.key.clone())
                        .or_default()
                        .insert(op.actor.clone());
                }
                OpKind::Unregister if op.actor.is_on(origin) => {
                    if let Some(actors) = partition.registrations.get_mut(&op.key) {
                        actors.remove(&op.actor);
                        if actors.is_empty() {
                            partition.registrations.remove(&op.key);
                        }
                    }
                }
                OpKind::Unregister => {
                    self.tombstones.insert((op.key.clone(), op.actor.clone()));
                }
            }
            touched.insert(op.key.clone());
        }
        Ok(touched)
    }

    /// Drops everything `node` owned and records unregisters for its actors in the local log,
    /// so peers that missed the failure learn about it on their next pull.
    pub(crate) fn node_down(&mut self, node: &UniqueNode) -> BTreeSet<ErasedKey> {
        if node == &self.local || !self.down.insert(node.clone()) {
            return BTreeSet::new();
        }
        let mut owned: BTreeSet<(ErasedKey, ActorId)> = BTreeSet::new();
        if let Some(partition) = self.partitions.remove(node) {
            for (key, actors) in partition.registrations {
                owned.extend(actors.into_iter().map(|actor| (key.clone(), actor)));
            }
        }
        for partition in self.partitions.values() {
            for (key, actors) in &partition.registrations {
                owned.extend(
                    actors
                        .iter()
                        .filter(|actor| actor.is_on(node))
                        .map(|actor| (key.clone(), actor.clone())),
                );
            }
        }
        let mut touched = BTreeSet::new();
        for (key, actor) in owned {
            if self.tombstones.insert((key.clone(), actor.clone())) {
                self.append(OpKind::Unregister, key.clone(), actor);
            }
            touched.insert(key);
        }
        touched
    }

    /// Forgets a removed node. Its registrations went with [`node_down`](Self::node_down); this
    /// drops the markers that kept them hidden.
    pub(crate) fn forget(&mut self, node: &UniqueNode) {
        if node == &self.local {
            return;
        }
        self.down.remove(node);
        self.partitions.remove(node);
        self.tombstones.retain(|(_, actor)| !actor.is_on(node));
    }

    /// The merged view of `key`, in `ActorId` order.
    pub(crate) fn lookup(&self, key: &ErasedKey) -> Vec<ActorId> {
        let mut actors: BTreeSet<ActorId> = self.own.get(key).cloned().unwrap_or_default();
        for partition in self.partitions.values() {
            if let Some(registered) = partition.registrations.get(key) {
                actors.extend(registered.iter().cloned());
            }
        }
        actors
            .into_iter()
            .filter(|actor| !self.down.contains(actor.node()))
            .filter(|actor| !self.tombstones.contains(&(key.clone(), actor.clone())))
            .collect()
    }

    pub(crate) fn keys(&self) -> BTreeSet<ErasedKey> {
        let mut keys: BTreeSet<ErasedKey> = self.own.keys().cloned().collect();
        for partition in self.partitions.values() {
            keys.extend(partition.registrations.keys().cloned());
        }
        keys
    }
}
