//! # SWIM Failure Detector
//!
//! A pure state machine. The cluster shell feeds it protocol periods, timer ticks and inbound
//! messages (always with an explicit `now`) and performs the [`SwimDirective`]s it returns.
//!
//! Each period a few random non-dead members get a `Ping`. Without an `Ack` within the ping
//! timeout, other members are asked to probe through `PingReq`. Without an indirect ack either,
//! the target becomes `Suspect`, and a suspect that does not refute within the suspicion timeout
//! becomes `Dead`. Status updates ride on every message as gossip.
//!
//! Precedence (what may replace what):
//!
//! | incoming      | replaces                                   |
//! |---------------|--------------------------------------------|
//! | `Dead`        | anything but `Dead`                        |
//! | `Suspect(i)`  | `Alive(j)` with `i >= j`, `Suspect(j)` with `i > j` |
//! | `Alive(i)`    | `Alive(j)` or `Suspect(j)` with `i > j`    |

use crate::config::SwimSettings;
use crate::identity::UniqueNode;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwimStatus {
    Alive { incarnation: u64 },
    Suspect { incarnation: u64 },
    Dead,
}

impl SwimStatus {
    pub fn supersedes(&self, other: &SwimStatus) -> bool {
        use SwimStatus::*;
        match (self, other) {
            (_, Dead) => false,
            (Dead, _) => true,
            (Suspect { incarnation: i }, Alive { incarnation: j }) => i >= j,
            (Suspect { incarnation: i }, Suspect { incarnation: j }) => i > j,
            (Alive { incarnation: i }, Alive { incarnation: j }) => i > j,
            (Alive { incarnation: i }, Suspect { incarnation: j }) => i > j,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Dead)
    }
}

impl fmt::Display for SwimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alive { incarnation } => write!(f, "alive({incarnation})"),
            Self::Suspect { incarnation } => write!(f, "suspect({incarnation})"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipEntry {
    pub node: UniqueNode,
    pub status: SwimStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwimMessage {
    Ping {
        origin: UniqueNode,
        sequence: u64,
        gossip: Vec<GossipEntry>,
    },
    /// Asks `origin`'s peer to ping `target` on its behalf.
    PingReq {
        origin: UniqueNode,
        target: UniqueNode,
        sequence: u64,
        gossip: Vec<GossipEntry>,
    },
    /// `target` is alive at `incarnation`. Sent by the target itself or forwarded by a proxy.
    Ack {
        origin: UniqueNode,
        target: UniqueNode,
        sequence: u64,
        incarnation: u64,
        gossip: Vec<GossipEntry>,
    },
    /// A proxy did not hear from `target` in time.
    Nack {
        origin: UniqueNode,
        target: UniqueNode,
        sequence: u64,
        gossip: Vec<GossipEntry>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SwimDirective {
    Send {
        to: UniqueNode,
        message: SwimMessage,
    },
    /// A probe of `node` was acknowledged.
    Reachable(UniqueNode),
    StatusChanged {
        node: UniqueNode,
        previous: Option<SwimStatus>,
        status: SwimStatus,
    },
    /// Gossip says this node is dead.
    SelfDeclaredDead,
}

#[derive(Debug, Clone)]
enum ProbeStage {
    Direct,
    Indirect,
    Proxy { requester: UniqueNode, sequence: u64 },
}

#[derive(Debug, Clone)]
struct Probe {
    target: UniqueNode,
    deadline: Instant,
    stage: ProbeStage,
}

#[derive(Debug)]
pub(crate) struct SwimInstance {
    local: UniqueNode,
    settings: SwimSettings,
    incarnation: u64,
    members: HashMap<UniqueNode, SwimStatus>,
    suspicions: HashMap<UniqueNode, Instant>,
    probes: HashMap<u64, Probe>,
    next_sequence: u64,
    /// Remaining transmissions per gossiped member.
    gossip: HashMap<UniqueNode, u32>,
    self_dead: bool,
}

impl SwimInstance {
    pub(crate) fn new(local: UniqueNode, settings: SwimSettings) -> Self {
        Self {
            local,
            settings,
            incarnation: 0,
            members: HashMap::new(),
            suspicions: HashMap::new(),
            probes: HashMap::new(),
            next_sequence: 1,
            gossip: HashMap::new(),
            self_dead: false,
        }
    }

    pub(crate) fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub(crate) fn status(&self, node: &UniqueNode) -> Option<SwimStatus> {
        if node == &self.local {
            return Some(SwimStatus::Alive {
                incarnation: self.incarnation,
            });
        }
        self.members.get(node).copied()
    }

    /// Adds a member learned through an association. Everything known is re-announced so the
    /// newcomer catches up through gossip.
    pub(crate) fn add_member(&mut self, node: &UniqueNode, now: Instant) -> Vec<SwimDirective> {
        if node == &self.local {
            return Vec::new();
        }
        let directives = self
            .apply_status(node, SwimStatus::Alive { incarnation: 0 }, now)
            .into_iter()
            .collect();
        let limit = self.retransmit_limit();
        let known: Vec<UniqueNode> = self
            .members
            .keys()
            .cloned()
            .chain(std::iter::once(self.local.clone()))
            .collect();
        for member in known {
            self.gossip.insert(member, limit);
        }
        directives
    }

    /// Administrative down.
    pub(crate) fn declare_dead(&mut self, node: &UniqueNode, now: Instant) -> Option<SwimDirective> {
        if node == &self.local {
            return None;
        }
        self.apply_status(node, SwimStatus::Dead, now)
    }

    pub(crate) fn remove_member(&mut self, node: &UniqueNode) {
        self.members.remove(node);
        self.suspicions.remove(node);
        self.gossip.remove(node);
        self.probes.retain(|_, probe| &probe.target != node);
    }

    /// Starts a protocol period: pings `probe_fanout` random live members not already probed.
    pub(crate) fn on_period<R: Rng>(&mut self, now: Instant, rng: &mut R) -> Vec<SwimDirective> {
        let probing: Vec<&UniqueNode> = self.probes.values().map(|probe| &probe.target).collect();
        let candidates: Vec<UniqueNode> = self
            .members
            .iter()
            .filter(|(node, status)| !status.is_dead() && !probing.contains(node))
            .map(|(node, _)| node.clone())
            .collect();
        let targets: Vec<UniqueNode> = candidates
            .choose_multiple(rng, self.settings.probe_fanout)
            .cloned()
            .collect();

        let mut directives = Vec::with_capacity(targets.len());
        for target in targets {
            let sequence = self.next_sequence();
            self.probes.insert(
                sequence,
                Probe {
                    target: target.clone(),
                    deadline: now + self.settings.ping_timeout(),
                    stage: ProbeStage::Direct,
                },
            );
            let gossip = self.gossip_payload();
            directives.push(SwimDirective::Send {
                to: target,
                message: SwimMessage::Ping {
                    origin: self.local.clone(),
                    sequence,
                    gossip,
                },
            });
        }
        directives
    }

    /// Expires probes and suspicions.
    pub(crate) fn on_tick<R: Rng>(&mut self, now: Instant, rng: &mut R) -> Vec<SwimDirective> {
        let mut directives = Vec::new();

        let mut expired: Vec<(u64, Probe)> = self
            .probes
            .iter()
            .filter(|(_, probe)| probe.deadline <= now)
            .map(|(sequence, probe)| (*sequence, probe.clone()))
            .collect();
        expired.sort_by_key(|(sequence, _)| *sequence);

        for (sequence, probe) in expired {
            self.probes.remove(&sequence);
            match probe.stage {
                ProbeStage::Direct => {
                    let helpers: Vec<UniqueNode> = self
                        .members
                        .iter()
                        .filter(|(node, status)| !status.is_dead() && *node != &probe.target)
                        .map(|(node, _)| node.clone())
                        .collect::<Vec<_>>()
                        .choose_multiple(rng, self.settings.indirect_probe_count)
                        .cloned()
                        .collect();
                    if helpers.is_empty() {
                        directives.extend(self.suspect(&probe.target, now));
                        continue;
                    }
                    for helper in helpers {
                        let gossip = self.gossip_payload();
                        directives.push(SwimDirective::Send {
                            to: helper,
                            message: SwimMessage::PingReq {
                                origin: self.local.clone(),
                                target: probe.target.clone(),
                                sequence,
                                gossip,
                            },
                        });
                    }
                    self.probes.insert(
                        sequence,
                        Probe {
                            target: probe.target,
                            deadline: now + self.settings.ping_timeout() * 2,
                            stage: ProbeStage::Indirect,
                        },
                    );
                }
                ProbeStage::Indirect => {
                    directives.extend(self.suspect(&probe.target, now));
                }
                ProbeStage::Proxy {
                    requester,
                    sequence,
                } => {
                    let gossip = self.gossip_payload();
                    directives.push(SwimDirective::Send {
                        to: requester,
                        message: SwimMessage::Nack {
                            origin: self.local.clone(),
                            target: probe.target,
                            sequence,
                            gossip,
                        },
                    });
                }
            }
        }

        let timeout = self.settings.suspicion_timeout();
        let confirmed: Vec<UniqueNode> = self
            .suspicions
            .iter()
            .filter(|(_, since)| **since + timeout <= now)
            .map(|(node, _)| node.clone())
            .collect();
        for node in confirmed {
            directives.extend(self.apply_status(&node, SwimStatus::Dead, now));
        }
        directives
    }

    pub(crate) fn on_message(&mut self, message: SwimMessage, now: Instant) -> Vec<SwimDirective> {
        let mut directives = Vec::new();
        match message {
            SwimMessage::Ping {
                origin,
                sequence,
                gossip,
            } => {
                self.merge(gossip, now, &mut directives);
                if !self.members.contains_key(&origin) {
                    directives.extend(self.add_member(&origin, now));
                }
                let gossip = self.gossip_payload();
                directives.push(SwimDirective::Send {
                    to: origin,
                    message: SwimMessage::Ack {
                        origin: self.local.clone(),
                        target: self.local.clone(),
                        sequence,
                        incarnation: self.incarnation,
                        gossip,
                    },
                });
            }
            SwimMessage::PingReq {
                origin,
                target,
                sequence,
                gossip,
            } => {
                self.merge(gossip, now, &mut directives);
                let proxied = self.next_sequence();
                self.probes.insert(
                    proxied,
                    Probe {
                        target: target.clone(),
                        deadline: now + self.settings.ping_timeout(),
                        stage: ProbeStage::Proxy {
                            requester: origin,
                            sequence,
                        },
                    },
                );
                let gossip = self.gossip_payload();
                directives.push(SwimDirective::Send {
                    to: target,
                    message: SwimMessage::Ping {
                        origin: self.local.clone(),
                        sequence: proxied,
                        gossip,
                    },
                });
            }
            SwimMessage::Ack {
                target,
                sequence,
                incarnation,
                gossip,
                ..
            } => {
                self.merge(gossip, now, &mut directives);
                let expected = self
                    .probes
                    .get(&sequence)
                    .is_some_and(|probe| probe.target == target);
                if !expected {
                    return directives;
                }
                let Some(probe) = self.probes.remove(&sequence) else {
                    return directives;
                };
                directives.extend(self.apply_status(
                    &target,
                    SwimStatus::Alive { incarnation },
                    now,
                ));
                match probe.stage {
                    ProbeStage::Proxy {
                        requester,
                        sequence,
                    } => {
                        let gossip = self.gossip_payload();
                        directives.push(SwimDirective::Send {
                            to: requester,
                            message: SwimMessage::Ack {
                                origin: self.local.clone(),
                                target,
                                sequence,
                                incarnation,
                                gossip,
                            },
                        });
                    }
                    ProbeStage::Direct | ProbeStage::Indirect => {
                        directives.push(SwimDirective::Reachable(target));
                    }
                }
            }
            SwimMessage::Nack { gossip, .. } => {
                self.merge(gossip, now, &mut directives);
            }
        }
        directives
    }

    fn suspect(&mut self, node: &UniqueNode, now: Instant) -> Option<SwimDirective> {
        let incarnation = match self.members.get(node)? {
            SwimStatus::Alive { incarnation } => *incarnation,
            SwimStatus::Suspect { .. } | SwimStatus::Dead => return None,
        };
        self.apply_status(node, SwimStatus::Suspect { incarnation }, now)
    }

    fn merge(&mut self, gossip: Vec<GossipEntry>, now: Instant, out: &mut Vec<SwimDirective>) {
        for entry in gossip {
            if entry.node == self.local {
                out.extend(self.hear_about_self(entry.status));
            } else {
                out.extend(self.apply_status(&entry.node, entry.status, now));
            }
        }
    }

    fn hear_about_self(&mut self, status: SwimStatus) -> Option<SwimDirective> {
        match status {
            SwimStatus::Suspect { incarnation } if incarnation >= self.incarnation => {
                self.incarnation = incarnation + 1;
                self.gossip.insert(self.local.clone(), self.retransmit_limit());
                None
            }
            SwimStatus::Alive { incarnation } if incarnation > self.incarnation => {
                self.incarnation = incarnation;
                None
            }
            SwimStatus::Dead if !self.self_dead => {
                self.self_dead = true;
                Some(SwimDirective::SelfDeclaredDead)
            }
            _ => None,
        }
    }

    fn apply_status(
        &mut self,
        node: &UniqueNode,
        status: SwimStatus,
        now: Instant,
    ) -> Option<SwimDirective> {
        let previous = self.members.get(node).copied();
        if previous.is_some_and(|current| !status.supersedes(&current)) {
            return None;
        }
        self.members.insert(node.clone(), status);
        match status {
            SwimStatus::Suspect { .. } => {
                self.suspicions.insert(node.clone(), now);
            }
            SwimStatus::Alive { .. } | SwimStatus::Dead => {
                self.suspicions.remove(node);
            }
        }
        if status.is_dead() {
            self.probes.retain(|_, probe| &probe.target != node);
        }
        self.gossip.insert(node.clone(), self.retransmit_limit());
        Some(SwimDirective::StatusChanged {
            node: node.clone(),
            previous,
            status,
        })
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// `multiplier * ceil(log2(n + 1))` for a cluster of `n` members.
    fn retransmit_limit(&self) -> u32 {
        let n = self.members.len() + 1;
        let log = usize::BITS - n.leading_zeros();
        self.settings.gossip_retransmit_multiplier * log.max(1)
    }

    /// Up to `gossip_max_per_message` entries, freshest first. Each inclusion uses up one
    /// transmission.
    fn gossip_payload(&mut self) -> Vec<GossipEntry> {
        let mut pending: Vec<(UniqueNode, u32)> = self
            .gossip
            .iter()
            .map(|(node, remaining)| (node.clone(), *remaining))
            .collect();
        pending.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        pending.truncate(self.settings.gossip_max_per_message);

        let mut entries = Vec::with_capacity(pending.len());
        for (node, remaining) in pending {
            if let Some(status) = self.status(&node) {
                entries.push(GossipEntry {
                    node: node.clone(),
                    status,
                });
            }
            if remaining <= 1 {
                self.gossip.remove(&node);
            } else {
                self.gossip.insert(node, remaining - 1);
            }
        }
        entries
    }
}
