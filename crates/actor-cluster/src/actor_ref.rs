//! # Actor References
//!
//! [`ActorRef<M>`] is the only way to talk to an actor. It carries the target's [`ActorId`] and a
//! sink that knows how to reach it: a local mailbox, a message adapter, an ask promise, the
//! association to a remote node, or nothing at all.
//!
//! `tell` never fails from the caller's point of view. Whatever cannot be delivered is recorded
//! as a dead letter.
//!
//! References serialize as their `ActorId` and are resolved again on the receiving side, so they
//! can be embedded in messages (the usual `reply_to` pattern).

use crate::ask::Promise;
use crate::cluster::wire::{Envelope, ProtocolVersion};
use crate::cluster::ClusterControl;
use crate::codec;
use crate::codec::CodecError;
use crate::dead_letters::{DeadLetterReason, Undelivered};
use crate::error::FrameworkError;
use crate::identity::{ActorId, ActorPath, UniqueNode};
use crate::message::{Message, SystemMessage};
use crate::system::ActorSystem;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

tokio::task_local! {
    /// The actor whose behavior is running on the current task.
    static SENDER: ActorId;
}

/// Runs `future` as `sender`. Remote sends made inside it carry `sender` in their envelope.
pub(crate) fn sending_as<F: Future>(sender: ActorId, future: F) -> impl Future<Output = F::Output> {
    SENDER.scope(sender, future)
}

fn current_sender() -> Option<ActorId> {
    SENDER.try_with(ActorId::clone).ok()
}

/// Builds the envelope for a remote send from the current task.
pub(crate) fn outbound_envelope<M: Message>(
    local: &UniqueNode,
    target: &ActorId,
    message: &M,
    version: ProtocolVersion,
) -> Result<Envelope, CodecError> {
    let sender = current_sender()
        .unwrap_or_else(|| ActorId::new(local.clone(), ActorPath::dead_letters(), 0));
    Envelope::seal(sender, target.clone(), message, version)
}

/// Something that accepts messages of type `M` addressed to a given id.
pub(crate) trait MessageSink<M>: Send + Sync {
    fn tell(&self, target: &ActorId, message: M) -> Result<(), Undelivered>;
}

/// Sink of references that can never be delivered to.
pub(crate) struct Unreachable(pub DeadLetterReason);

impl<M: Message> MessageSink<M> for Unreachable {
    fn tell(&self, _target: &ActorId, message: M) -> Result<(), Undelivered> {
        Err(Undelivered::of(&message, self.0))
    }
}

/// Sink of references to actors on other nodes.
pub(crate) struct RemoteSink {
    cluster: ClusterControl,
}

impl RemoteSink {
    pub(crate) fn new(cluster: ClusterControl) -> Self {
        Self { cluster }
    }
}

impl<M: Message> MessageSink<M> for RemoteSink {
    fn tell(&self, target: &ActorId, message: M) -> Result<(), Undelivered> {
        let envelope = match outbound_envelope(
            self.cluster.local_node(),
            target,
            &message,
            self.cluster.protocol_version(),
        ) {
            Ok(envelope) => envelope,
            Err(_) => return Err(Undelivered::of(&message, DeadLetterReason::EncodeFailed)),
        };
        self.cluster
            .send_envelope(envelope)
            .map_err(|reason| Undelivered::of(&message, reason))
    }
}

pub struct ActorRef<M: Message> {
    id: ActorId,
    sink: Arc<dyn MessageSink<M>>,
    system: ActorSystem,
}

impl<M: Message> ActorRef<M> {
    pub(crate) fn new(id: ActorId, sink: Arc<dyn MessageSink<M>>, system: ActorSystem) -> Self {
        Self { id, sink, system }
    }

    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub fn path(&self) -> &ActorPath {
        self.id.path()
    }

    pub fn is_local(&self) -> bool {
        self.id.is_on(self.system.node())
    }

    /// Fire-and-forget send. Undeliverable messages become dead letters.
    pub fn tell(&self, message: M) {
        if let Err(undelivered) = self.sink.tell(&self.id, message) {
            self.system
                .dead_letters()
                .record(undelivered.into_dead_letter(self.id.clone()));
        }
    }

    /// Request/response. `make` receives a one-shot reply reference and builds the request.
    ///
    /// Resolves exactly once: with the reply, with [`FrameworkError::AskTimeout`] after
    /// `timeout`, or with [`FrameworkError::AskTargetTerminated`] if the target dies first.
    ///
    /// A restart is not a termination. If the target fails on the request and its supervisor
    /// restarts it, the request is gone with the old state and the ask ends in `AskTimeout`.
    pub async fn ask<R, F>(&self, make: F, timeout: Duration) -> Result<R, FrameworkError>
    where
        R: Message,
        F: FnOnce(ActorRef<R>) -> M,
    {
        let (reply_to, promise) = Promise::<R>::register(&self.system, &self.id)?;
        self.system.deliver_system(
            &self.id,
            SystemMessage::Watch {
                watchee: self.id.clone(),
                watcher: reply_to.id().clone(),
            },
        );
        self.tell(make(reply_to));
        promise.wait(timeout).await
    }
}

impl<M: Message> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            sink: self.sink.clone(),
            system: self.system.clone(),
        }
    }
}

impl<M: Message> PartialEq for ActorRef<M> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<M: Message> Eq for ActorRef<M> {}

impl<M: Message> Hash for ActorRef<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<M: Message> fmt::Debug for ActorRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorRef({})", self.id)
    }
}

impl<M: Message> fmt::Display for ActorRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

impl<M: Message> Serialize for ActorRef<M> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.id.serialize(serializer)
    }
}

impl<'de, M: Message> Deserialize<'de> for ActorRef<M> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let id = ActorId::deserialize(deserializer)?;
        let system = codec::current_system()
            .ok_or_else(|| D::Error::custom(CodecError::MissingSystemContext))?;
        Ok(system.resolve(&id))
    }
}
