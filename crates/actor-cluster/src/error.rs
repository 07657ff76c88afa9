//! # Framework Errors
//!
//! Common error types used throughout the runtime. [`FrameworkError`] is what public operations
//! return; the association layer and the receptionist replication have their own enums that
//! convert into it.
//!
//! Two classes of failure never show up here:
//!
//! - Addressing failures (a `tell` to a dead actor, a full mailbox, a missing association) become
//!   dead letters, see [`crate::dead_letters`].
//! - Failures raised by behaviors are [`crate::ActorFailure`]s and go to supervision.

use crate::cluster::wire::RejectReason;
use crate::codec::CodecError;
use crate::identity::{ActorId, ActorPath, Node, UniqueNode};
use std::time::Duration;

/// Errors that can occur within the actor runtime itself.
#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    #[error("Actor closed")]
    ActorClosed,
    #[error("Actor dropped response channel")]
    ActorDropped,
    #[error("Invalid path segment `{segment}`: {reason}")]
    InvalidPathSegment {
        segment: String,
        reason: &'static str,
    },
    #[error("Cannot parse {kind} from `{input}`: {reason}")]
    Parse {
        kind: &'static str,
        input: String,
        reason: String,
    },
    #[error("Name `{name}` is already taken under {parent}")]
    NameConflict { parent: ActorPath, name: String },
    #[error("Actor capacity exhausted ({max} live actors)")]
    CapacityExhausted { max: usize },
    #[error("Actor system is shutting down")]
    SystemShutdown,
    #[error("Ask timed out after {0:?}")]
    AskTimeout(Duration),
    #[error("Ask target {0} terminated before replying")]
    AskTargetTerminated(ActorId),
    #[error("Actor {0} is not local to this node")]
    NotLocal(ActorId),
    #[error("Cluster is not enabled on this actor system")]
    ClusterDisabled,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Association(#[from] AssociationError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl FrameworkError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Failures while establishing or holding an association with a peer node.
#[derive(Debug, thiserror::Error)]
pub enum AssociationError {
    #[error("Connection to {node} failed: {reason}")]
    ConnectFailed { node: Node, reason: String },
    #[error("Handshake with {node} timed out")]
    HandshakeTimeout { node: Node },
    #[error("Handshake rejected by {node}: {reason}")]
    Rejected { node: Node, reason: RejectReason },
    #[error("Unexpected handshake frame from {node}")]
    ProtocolViolation { node: Node },
    #[error("Peer {0} is tombstoned")]
    Tombstoned(UniqueNode),
    #[error("Node {node} is already associated as {existing}")]
    IdentityConflict { node: Node, existing: UniqueNode },
    #[error("Channel to {0} closed")]
    ChannelClosed(Node),
}

impl AssociationError {
    /// Transient errors are retried with backoff; everything else is final for that peer.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. } | Self::HandshakeTimeout { .. } | Self::ChannelClosed(_) => {
                true
            }
            Self::Rejected { reason, .. } => reason.is_retriable(),
            Self::ProtocolViolation { .. } | Self::Tombstoned(_) | Self::IdentityConflict { .. } => {
                false
            }
        }
    }

    pub fn node(&self) -> &Node {
        match self {
            Self::ConnectFailed { node, .. }
            | Self::HandshakeTimeout { node }
            | Self::Rejected { node, .. }
            | Self::ProtocolViolation { node }
            | Self::IdentityConflict { node, .. }
            | Self::ChannelClosed(node) => node,
            Self::Tombstoned(unique) => &unique.node,
        }
    }
}

/// A replication batch that cannot be applied. The whole batch is discarded and the next pull
/// restarts from the last applied sequence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    #[error("Sequence gap from {origin}: expected {expected}, got {actual}")]
    SequenceGap {
        origin: UniqueNode,
        expected: u64,
        actual: u64,
    },
    #[error("{origin} replicated a registration for foreign actor {actor}")]
    ForeignRegistration { origin: UniqueNode, actor: ActorId },
    #[error("Ignoring batch from {0}, which is down")]
    OriginDown(UniqueNode),
}
