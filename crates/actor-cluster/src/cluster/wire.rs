//! # Wire Frames
//!
//! Everything two nodes say to each other is one [`Frame`], encoded with [`crate::codec`] and
//! carried as one transport message. The first frame on a connection is always a handshake.

use crate::cluster::swim::SwimMessage;
use crate::codec::{self, CodecError};
use crate::identity::{ActorId, Node, UniqueNode};
use crate::receptionist::ReceptionistMessage;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic version of the wire protocol. Peers must agree on the major version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// First frame sent by the initiator of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeOffer {
    pub origin: UniqueNode,
    /// The endpoint the initiator believes it dialed.
    pub target: Node,
    pub version: ProtocolVersion,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    IncompatibleProtocol {
        local: ProtocolVersion,
        remote: ProtocolVersion,
    },
    WrongTarget {
        expected: Node,
        actual: Node,
    },
    /// The acceptor tombstoned the origin; it must restart with a new nid to come back.
    Tombstoned,
    /// Another live process is associated at the origin's endpoint.
    IdentityConflict {
        existing: UniqueNode,
    },
    /// A concurrent handshake between the same two nodes won.
    TieBreakLost,
    /// The acceptor has been downed itself and takes no new associations.
    ShuttingDown,
}

impl RejectReason {
    /// None of the reasons go away by retrying the same handshake.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::IncompatibleProtocol { .. }
            | Self::WrongTarget { .. }
            | Self::Tombstoned
            | Self::IdentityConflict { .. }
            | Self::TieBreakLost
            | Self::ShuttingDown => false,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompatibleProtocol { local, remote } => {
                write!(f, "incompatible protocol (local {local}, remote {remote})")
            }
            Self::WrongTarget { expected, actual } => {
                write!(f, "wrong target (this is {actual}, offer was for {expected})")
            }
            Self::Tombstoned => write!(f, "origin is tombstoned"),
            Self::IdentityConflict { existing } => {
                write!(f, "endpoint already associated as {existing}")
            }
            Self::TieBreakLost => write!(f, "concurrent handshake won"),
            Self::ShuttingDown => write!(f, "acceptor is shutting down"),
        }
    }
}

/// A user message in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The actor that sent the message, or the sending node's dead letters id for sends made
    /// outside any actor.
    pub sender: ActorId,
    pub recipient: ActorId,
    /// Rust type name of the payload, checked against the recipient's message type.
    pub type_tag: String,
    pub payload: Vec<u8>,
    pub version: ProtocolVersion,
}

impl Envelope {
    /// Encodes `message` for `recipient`.
    pub fn seal<M: Serialize>(
        sender: ActorId,
        recipient: ActorId,
        message: &M,
        version: ProtocolVersion,
    ) -> Result<Self, CodecError> {
        let payload = codec::encode(message)?;
        Ok(Self {
            sender,
            recipient,
            type_tag: std::any::type_name::<M>().to_string(),
            payload: payload.to_vec(),
            version,
        })
    }
}

/// Death watch traffic between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemEnvelope {
    Watch {
        watchee: ActorId,
        watcher: ActorId,
    },
    Unwatch {
        watchee: ActorId,
        watcher: ActorId,
    },
    Terminated {
        watchee: ActorId,
        watcher: ActorId,
        existence_confirmed: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Offer(HandshakeOffer),
    Accept { origin: UniqueNode },
    Reject { reason: RejectReason },
    Envelope(Envelope),
    System(SystemEnvelope),
    Swim(SwimMessage),
    Receptionist(ReceptionistMessage),
    /// `from` severed the association with `to`, which must consider itself down.
    RestInPeace { from: UniqueNode, to: UniqueNode },
    Leaving { node: UniqueNode },
}

impl Frame {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }

    /// Short label for logs and dead letters.
    pub fn describe(&self) -> String {
        match self {
            Self::Offer(_) => "<handshake offer>".to_string(),
            Self::Accept { .. } => "<handshake accept>".to_string(),
            Self::Reject { .. } => "<handshake reject>".to_string(),
            Self::Envelope(envelope) => format!("<{}>", envelope.type_tag),
            Self::System(SystemEnvelope::Watch { .. }) => "<watch>".to_string(),
            Self::System(SystemEnvelope::Unwatch { .. }) => "<unwatch>".to_string(),
            Self::System(SystemEnvelope::Terminated { .. }) => "<terminated>".to_string(),
            Self::Swim(_) => "<swim>".to_string(),
            Self::Receptionist(_) => "<receptionist>".to_string(),
            Self::RestInPeace { .. } => "<rest in peace>".to_string(),
            Self::Leaving { .. } => "<leaving>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ActorPath;

    #[test]
    fn test_major_version_decides_compatibility() {
        let current = ProtocolVersion::CURRENT;
        assert!(current.is_compatible_with(&ProtocolVersion::new(1, 4, 2)));
        assert!(!current.is_compatible_with(&ProtocolVersion::new(2, 0, 0)));
        assert_eq!(current.to_string(), "1.0.0");
    }

    #[test]
    fn test_offer_frame_survives_the_codec() {
        let origin = UniqueNode::new(Node::new("a", "127.0.0.1", 7001), 42);
        let frame = Frame::Offer(HandshakeOffer {
            origin: origin.clone(),
            target: Node::new("b", "127.0.0.1", 7002),
            version: ProtocolVersion::CURRENT,
            capabilities: vec!["receptionist".into()],
        });
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        match decoded {
            Frame::Offer(offer) => {
                assert_eq!(offer.origin, origin);
                assert_eq!(offer.capabilities, vec!["receptionist".to_string()]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_envelope_keeps_its_sender_across_the_codec() {
        let a = UniqueNode::new(Node::new("a", "127.0.0.1", 7001), 42);
        let b = UniqueNode::new(Node::new("b", "127.0.0.1", 7002), 43);
        let sender = ActorId::new(a, ActorPath::user().child("pinger").unwrap(), 3);
        let recipient = ActorId::new(b, ActorPath::user().child("ponger").unwrap(), 1);
        let envelope =
            Envelope::seal(sender.clone(), recipient.clone(), &7u32, ProtocolVersion::CURRENT)
                .unwrap();
        assert_eq!(envelope.type_tag, "u32");

        let frame = Frame::Envelope(envelope);
        match Frame::decode(&frame.encode().unwrap()).unwrap() {
            Frame::Envelope(decoded) => {
                assert_eq!(decoded.sender, sender);
                assert_eq!(decoded.sender.incarnation(), 3);
                assert_eq!(decoded.recipient, recipient);
                assert_eq!(codec::decode::<u32>(&decoded.payload).unwrap(), 7);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_reject_reasons_are_final() {
        assert!(!RejectReason::Tombstoned.is_retriable());
        assert!(!RejectReason::TieBreakLost.is_retriable());
        assert!(!RejectReason::ShuttingDown.is_retriable());
        let reason = RejectReason::IncompatibleProtocol {
            local: ProtocolVersion::CURRENT,
            remote: ProtocolVersion::new(2, 0, 0),
        };
        assert_eq!(
            reason.to_string(),
            "incompatible protocol (local 1.0.0, remote 2.0.0)"
        );
    }
}
