//! # Messages
//!
//! Every actor declares one closed message type. Anything that can be serialized, debugged and
//! moved across tasks qualifies, so the same message type works for local and remote delivery.
//!
//! The runtime also exchanges a small set of system messages with each cell. They travel on a
//! separate, unbounded queue that is always drained before the user queue.

use crate::behavior::ActorFailure;
use crate::error::FrameworkError;
use crate::identity::ActorId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tokio::sync::oneshot;

/// Marker for types an actor can receive.
pub trait Message: Serialize + DeserializeOwned + Debug + Send + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Debug + Send + 'static {}

/// Type alias for the one-shot response channel used by owner tasks.
pub type Response<T> = oneshot::Sender<Result<T, FrameworkError>>;

/// Runtime-internal messages for a cell's system queue.
#[derive(Debug, Clone)]
pub(crate) enum SystemMessage {
    /// `watcher` wants a `Terminated` when `watchee` (the cell itself or one of its adapters) dies.
    Watch { watchee: ActorId, watcher: ActorId },
    Unwatch { watchee: ActorId, watcher: ActorId },
    Terminated {
        id: ActorId,
        existence_confirmed: bool,
        node_terminated: bool,
    },
    ChildTerminated {
        id: ActorId,
        escalation: Option<ActorFailure>,
    },
    Stop,
}

/// A user message stamped with the incarnation it was addressed to.
#[derive(Debug)]
pub(crate) struct Addressed<M> {
    pub incarnation: u32,
    pub message: M,
}
