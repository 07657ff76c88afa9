//! # Test Kit
//!
//! [`TestProbe`] is a real actor whose inbox the test reads. Hand out [`TestProbe::actor`]
//! wherever a reference is expected (`reply_to` fields, receptionist subscriptions, remote
//! senders) and assert on what arrives.
//!
//! ```rust,no_run
//! use actor_cluster::testkit::TestProbe;
//! use actor_cluster::{ActorSystem, ActorSystemSettings};
//! # #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)] struct Pong;
//!
//! # async fn demo() -> Result<(), actor_cluster::FrameworkError> {
//! let system = ActorSystem::start(ActorSystemSettings::for_testing("probe-demo")).await?;
//! let mut probe = TestProbe::<Pong>::spawn(&system, "probe").await?;
//! probe.actor().tell(Pong);
//! assert_eq!(probe.expect_message().await, Pong);
//! # Ok(())
//! # }
//! ```
//!
//! Probe expectations panic on failure, like `assert!`.

use crate::actor_ref::ActorRef;
use crate::behavior::{ActorFailure, Behavior, Next, Props, Signal};
use crate::context::ActorContext;
use crate::error::FrameworkError;
use crate::identity::ActorId;
use crate::message::Message;
use crate::system::ActorSystem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// A `Terminated` observed by a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminated {
    pub id: ActorId,
    pub existence_confirmed: bool,
    pub node_terminated: bool,
}

#[derive(Debug)]
enum ProbeEvent<M> {
    Message(M),
    Terminated(Terminated),
}

#[derive(Debug, Serialize, Deserialize)]
enum ProbeInput<M> {
    Message(M),
    Watch(ActorId),
}

struct ProbeBehavior<M: Message> {
    events: mpsc::UnboundedSender<ProbeEvent<M>>,
    ready: Arc<Mutex<Option<oneshot::Sender<ActorRef<M>>>>>,
}

#[async_trait]
impl<M: Message> Behavior for ProbeBehavior<M> {
    type Message = ProbeInput<M>;

    async fn receive(
        &mut self,
        ctx: &mut ActorContext<ProbeInput<M>>,
        msg: ProbeInput<M>,
    ) -> Result<Next<ProbeInput<M>>, ActorFailure> {
        match msg {
            ProbeInput::Message(message) => {
                let _ = self.events.send(ProbeEvent::Message(message));
            }
            ProbeInput::Watch(id) => ctx.watch_id(id),
        }
        Ok(Next::Same)
    }

    async fn receive_signal(
        &mut self,
        ctx: &mut ActorContext<ProbeInput<M>>,
        signal: Signal,
    ) -> Result<Next<ProbeInput<M>>, ActorFailure> {
        match signal {
            Signal::Start => {
                let adapter = ctx.message_adapter(ProbeInput::Message)?;
                let ready = self
                    .ready
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(ready) = ready {
                    let _ = ready.send(adapter);
                }
            }
            Signal::Terminated {
                id,
                existence_confirmed,
                node_terminated,
            } => {
                let _ = self.events.send(ProbeEvent::Terminated(Terminated {
                    id,
                    existence_confirmed,
                    node_terminated,
                }));
            }
            _ => {}
        }
        Ok(Next::Same)
    }
}

pub struct TestProbe<M: Message> {
    system: ActorSystem,
    control: ActorRef<ProbeInput<M>>,
    actor: ActorRef<M>,
    events: mpsc::UnboundedReceiver<ProbeEvent<M>>,
    timeout: Duration,
}

impl<M: Message> TestProbe<M> {
    pub async fn spawn(system: &ActorSystem, name: &str) -> Result<Self, FrameworkError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (ready_tx, ready) = oneshot::channel();
        let ready_tx = Arc::new(Mutex::new(Some(ready_tx)));
        let control = system.spawn(
            name,
            Props::new(move || ProbeBehavior {
                events: events_tx.clone(),
                ready: ready_tx.clone(),
            }),
        )?;
        let actor = tokio::time::timeout(DEFAULT_TIMEOUT, ready)
            .await
            .map_err(|_| FrameworkError::AskTimeout(DEFAULT_TIMEOUT))?
            .map_err(|_| FrameworkError::ActorDropped)?;
        Ok(Self {
            system: system.clone(),
            control,
            actor,
            events,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The reference to hand out. Messages sent to it are what the probe expects.
    pub fn actor(&self) -> ActorRef<M> {
        self.actor.clone()
    }

    pub fn id(&self) -> &ActorId {
        self.actor.id()
    }

    /// Death watch on `target`; observe it with [`expect_terminated`](Self::expect_terminated).
    pub fn watch<N: Message>(&self, target: &ActorRef<N>) {
        self.control.tell(ProbeInput::Watch(target.id().clone()));
    }

    async fn next_event(&mut self, deadline: Instant) -> Option<ProbeEvent<M>> {
        tokio::time::timeout_at(deadline, self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// The next message, which must arrive within the probe's timeout.
    pub async fn expect_message(&mut self) -> M {
        let deadline = Instant::now() + self.timeout;
        match self.next_event(deadline).await {
            Some(ProbeEvent::Message(message)) => message,
            Some(ProbeEvent::Terminated(terminated)) => {
                panic!("expected a message, got {terminated:?}")
            }
            None => panic!("no message within {:?}", self.timeout),
        }
    }

    pub async fn expect_no_message(&mut self, within: Duration) {
        if let Some(event) = self.next_event(Instant::now() + within).await {
            panic!("expected silence for {within:?}, got {event:?}");
        }
    }

    /// Skips messages until one satisfies `predicate`.
    pub async fn fish_for(&mut self, mut predicate: impl FnMut(&M) -> bool) -> M {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.next_event(deadline).await {
                Some(ProbeEvent::Message(message)) if predicate(&message) => return message,
                Some(_) => continue,
                None => panic!("no matching message within {:?}", self.timeout),
            }
        }
    }

    /// Waits for the `Terminated` of a watched actor. Messages received meanwhile are dropped.
    pub async fn expect_terminated(&mut self, id: &ActorId) -> Terminated {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.next_event(deadline).await {
                Some(ProbeEvent::Terminated(terminated)) if &terminated.id == id => {
                    return terminated
                }
                Some(_) => continue,
                None => panic!("{id} did not terminate within {:?}", self.timeout),
            }
        }
    }

    pub fn stop(&self) {
        self.system.stop(&self.control);
    }
}
