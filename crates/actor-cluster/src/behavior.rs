//! # Behaviors
//!
//! A [`Behavior`] is the current message handler of an actor. Handling a message or a
//! [`Signal`] returns a [`Next`] telling the cell what to do before the next dequeue:
//!
//! - [`Next::Same`] keeps the current behavior.
//! - [`Next::Become`] installs a new behavior (state machines are chains of behaviors).
//! - [`Next::Stop`] stops the actor.
//! - [`Next::Unhandled`] declares the input unhandled. For most inputs this is the same as
//!   `Same`; an unhandled [`Signal::Terminated`] fails the actor (death pact) and an unhandled
//!   escalating [`Signal::ChildTerminated`] fails the parent with the child's failure.
//!
//! Returning `Err(ActorFailure)` (or panicking) hands the failure to the actor's
//! [`SupervisionStrategy`](crate::SupervisionStrategy).
//!
//! ```rust,no_run
//! use actor_cluster::{ActorContext, ActorFailure, Behavior, Next};
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! enum CounterMsg {
//!     Increment,
//! }
//!
//! #[derive(Default)]
//! struct Counter {
//!     value: u64,
//! }
//!
//! #[async_trait]
//! impl Behavior for Counter {
//!     type Message = CounterMsg;
//!
//!     async fn receive(
//!         &mut self,
//!         _ctx: &mut ActorContext<CounterMsg>,
//!         msg: CounterMsg,
//!     ) -> Result<Next<CounterMsg>, ActorFailure> {
//!         match msg {
//!             CounterMsg::Increment => self.value += 1,
//!         }
//!         Ok(Next::Same)
//!     }
//! }
//! ```

use crate::context::ActorContext;
use crate::identity::ActorId;
use crate::message::Message;
use crate::supervision::SupervisionStrategy;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

#[async_trait]
pub trait Behavior: Send + 'static {
    type Message: Message;

    async fn receive(
        &mut self,
        ctx: &mut ActorContext<Self::Message>,
        msg: Self::Message,
    ) -> Result<Next<Self::Message>, ActorFailure>;

    async fn receive_signal(
        &mut self,
        ctx: &mut ActorContext<Self::Message>,
        signal: Signal,
    ) -> Result<Next<Self::Message>, ActorFailure> {
        let _ = (ctx, signal);
        Ok(Next::Unhandled)
    }
}

pub type BoxBehavior<M> = Box<dyn Behavior<Message = M>>;

pub enum Next<M: Message> {
    Same,
    Become(BoxBehavior<M>),
    Stop,
    Unhandled,
}

impl<M: Message> Next<M> {
    pub fn become_<B: Behavior<Message = M>>(behavior: B) -> Self {
        Next::Become(Box::new(behavior))
    }
}

impl<M: Message> fmt::Debug for Next<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Next::Same => f.write_str("Same"),
            Next::Become(_) => f.write_str("Become(..)"),
            Next::Stop => f.write_str("Stop"),
            Next::Unhandled => f.write_str("Unhandled"),
        }
    }
}

/// Lifecycle notifications delivered through [`Behavior::receive_signal`].
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// First input of every incarnation.
    Start,
    /// Delivered to the failing behavior before it is replaced.
    PreRestart,
    /// Last input before the actor is removed. Children are already stopped.
    PostStop,
    /// A watched actor terminated. `node_terminated` is set when its node went down.
    Terminated {
        id: ActorId,
        existence_confirmed: bool,
        node_terminated: bool,
    },
    ChildTerminated {
        id: ActorId,
        escalation: Option<ActorFailure>,
    },
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Start => "Start",
            Signal::PreRestart => "PreRestart",
            Signal::PostStop => "PostStop",
            Signal::Terminated { .. } => "Terminated",
            Signal::ChildTerminated { .. } => "ChildTerminated",
        }
    }
}

/// Error type of behaviors.
///
/// Any `std::error::Error` converts into it with `?`. It intentionally does not implement
/// `Error` itself, otherwise the blanket `From` would overlap with `From<T> for T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorFailure {
    message: String,
}

impl ActorFailure {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::msg(format!("panicked: {detail}"))
    }
}

impl fmt::Display for ActorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E> From<E> for ActorFailure
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::msg(error.to_string())
    }
}

pub(crate) type BehaviorFactory<M> = Arc<dyn Fn() -> BoxBehavior<M> + Send + Sync>;

/// Everything needed to (re)create an actor: the behavior factory, the supervision strategy and
/// an optional mailbox capacity override.
pub struct Props<M: Message> {
    pub(crate) factory: BehaviorFactory<M>,
    pub(crate) supervision: SupervisionStrategy,
    pub(crate) mailbox_capacity: Option<usize>,
}

impl<M: Message> Props<M> {
    /// The factory is invoked on spawn and again on every restart.
    pub fn new<B, F>(factory: F) -> Self
    where
        B: Behavior<Message = M>,
        F: Fn() -> B + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(move || Box::new(factory()) as BoxBehavior<M>),
            supervision: SupervisionStrategy::default(),
            mailbox_capacity: None,
        }
    }

    pub fn with_supervision(mut self, supervision: SupervisionStrategy) -> Self {
        self.supervision = supervision;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = Some(capacity);
        self
    }

    pub fn supervision(&self) -> &SupervisionStrategy {
        &self.supervision
    }
}

impl<M: Message> Clone for Props<M> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            supervision: self.supervision.clone(),
            mailbox_capacity: self.mailbox_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct DiskError;

    fn fallible() -> Result<(), ActorFailure> {
        Err::<(), _>(DiskError)?;
        Ok(())
    }

    #[test]
    fn test_errors_convert_into_failures() {
        assert_eq!(fallible().unwrap_err().message(), "disk on fire");
    }

    #[test]
    fn test_panic_payloads_become_failures() {
        let failure = ActorFailure::from_panic(Box::new("boom"));
        assert_eq!(failure.message(), "panicked: boom");
        let failure = ActorFailure::from_panic(Box::new(String::from("bang")));
        assert_eq!(failure.message(), "panicked: bang");
    }
}
