//! # Actor Cells
//!
//! The execution engine behind every actor. A cell is one tokio task owning:
//!
//! - the current behavior and the props to rebuild it,
//! - a bounded user queue and an unbounded system queue,
//! - the watchers registered on it and its restart window.
//!
//! **Concurrency Model**: the task processes one input at a time, so behaviors need no locks.
//! System messages are always taken before user messages. A behavior returned by one message is
//! installed before the next dequeue.
//!
//! Senders hold a [`MailboxHandle`], which checks the addressed incarnation against the live one
//! at enqueue. The cell checks it again at dequeue, because a restart may have happened in
//! between.

use crate::actor_ref::{sending_as, MessageSink};
use crate::behavior::{ActorFailure, BoxBehavior, Next, Props, Signal};
use crate::codec;
use crate::context::ActorContext;
use crate::dead_letters::{DeadLetterReason, Undelivered};
use crate::identity::ActorId;
use crate::message::{Addressed, Message, SystemMessage};
use crate::supervision::{RestartWindow, StopReason, SupervisionStrategy};
use crate::system::ActorSystem;
use arc_swap::ArcSwap;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

/// Type-erased view of anything registered in the path index.
pub(crate) trait ErasedCell: Send + Sync {
    fn id(&self) -> ActorId;

    /// Hands the message back when the cell no longer accepts system messages.
    fn send_system(&self, message: SystemMessage) -> Result<(), SystemMessage>;

    /// Delivers a payload that arrived over an association.
    fn deliver_encoded(
        &self,
        target: &ActorId,
        type_tag: &str,
        payload: &[u8],
        system: &ActorSystem,
    ) -> Result<(), Undelivered>;

    /// `Box<Arc<dyn MessageSink<M>>>` for the cell's message type, for typed resolution.
    fn sink_any(self: Arc<Self>) -> Box<dyn Any + Send + Sync>;
}

pub(crate) fn decode_payload<M: Message>(
    type_tag: &str,
    payload: &[u8],
    system: &ActorSystem,
) -> Result<M, Undelivered> {
    if type_tag != std::any::type_name::<M>() {
        return Err(Undelivered {
            message: format!("<{type_tag}>"),
            reason: DeadLetterReason::WrongMessageType,
        });
    }
    codec::with_system(system, || codec::decode::<M>(payload)).map_err(|e| Undelivered {
        message: format!("<{type_tag}: {e}>"),
        reason: DeadLetterReason::DecodeFailed,
    })
}

// =============================================================================
// MailboxHandle
// =============================================================================

const ALIVE: u8 = 0;
const STOPPING: u8 = 1;

/// Sender side of an actor's queues, shared by every reference to it.
pub(crate) struct MailboxHandle<M: Message> {
    id: ArcSwap<ActorId>,
    state: AtomicU8,
    user_tx: mpsc::Sender<Addressed<M>>,
    system_tx: mpsc::UnboundedSender<SystemMessage>,
}

pub(crate) type Queues<M> = (
    mpsc::Receiver<Addressed<M>>,
    mpsc::UnboundedReceiver<SystemMessage>,
);

impl<M: Message> MailboxHandle<M> {
    pub(crate) fn new(id: ActorId, capacity: usize) -> (Arc<Self>, Queues<M>) {
        let (user_tx, user_rx) = mpsc::channel(capacity.max(1));
        let (system_tx, system_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id: ArcSwap::from_pointee(id),
            state: AtomicU8::new(ALIVE),
            user_tx,
            system_tx,
        });
        (handle, (user_rx, system_rx))
    }

    pub(crate) fn current_id(&self) -> ActorId {
        self.id.load().as_ref().clone()
    }

    pub(crate) fn incarnation(&self) -> u32 {
        self.id.load().incarnation()
    }

    pub(crate) fn rebind(&self, id: ActorId) {
        self.id.store(Arc::new(id));
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state.load(Ordering::Acquire) == ALIVE
    }

    pub(crate) fn begin_stop(&self) {
        self.state.store(STOPPING, Ordering::Release);
    }

    pub(crate) fn enqueue(&self, incarnation: u32, message: M) -> Result<(), Undelivered> {
        if !self.is_alive() {
            return Err(Undelivered::of(&message, DeadLetterReason::Terminated));
        }
        if incarnation != self.incarnation() {
            return Err(Undelivered::of(
                &message,
                DeadLetterReason::IncarnationMismatch,
            ));
        }
        self.user_tx
            .try_send(Addressed {
                incarnation,
                message,
            })
            .map_err(|e| match e {
                TrySendError::Full(addressed) => {
                    Undelivered::of(&addressed.message, DeadLetterReason::MailboxFull)
                }
                TrySendError::Closed(addressed) => {
                    Undelivered::of(&addressed.message, DeadLetterReason::Terminated)
                }
            })
    }
}

impl<M: Message> MessageSink<M> for MailboxHandle<M> {
    fn tell(&self, target: &ActorId, message: M) -> Result<(), Undelivered> {
        self.enqueue(target.incarnation(), message)
    }
}

impl<M: Message> ErasedCell for MailboxHandle<M> {
    fn id(&self) -> ActorId {
        self.current_id()
    }

    fn send_system(&self, message: SystemMessage) -> Result<(), SystemMessage> {
        self.system_tx.send(message).map_err(|e| e.0)
    }

    fn deliver_encoded(
        &self,
        target: &ActorId,
        type_tag: &str,
        payload: &[u8],
        system: &ActorSystem,
    ) -> Result<(), Undelivered> {
        let message = decode_payload::<M>(type_tag, payload, system)?;
        self.enqueue(target.incarnation(), message)
    }

    fn sink_any(self: Arc<Self>) -> Box<dyn Any + Send + Sync> {
        Box::new(self as Arc<dyn MessageSink<M>>)
    }
}

// =============================================================================
// Message adapters
// =============================================================================

/// A reference of type `N` that maps into its owner's mailbox. Bound to the owner's incarnation
/// at creation time.
pub(crate) struct AdapterCell<N, M: Message> {
    id: ActorId,
    owner: Arc<MailboxHandle<M>>,
    map: Box<dyn Fn(N) -> M + Send + Sync>,
}

impl<N: Message, M: Message> AdapterCell<N, M> {
    pub(crate) fn new(
        id: ActorId,
        owner: Arc<MailboxHandle<M>>,
        map: Box<dyn Fn(N) -> M + Send + Sync>,
    ) -> Self {
        Self { id, owner, map }
    }
}

impl<N: Message, M: Message> MessageSink<N> for AdapterCell<N, M> {
    fn tell(&self, target: &ActorId, message: N) -> Result<(), Undelivered> {
        if target.incarnation() != self.id.incarnation() {
            return Err(Undelivered::of(
                &message,
                DeadLetterReason::IncarnationMismatch,
            ));
        }
        if !self.owner.is_alive() || self.owner.incarnation() != self.id.incarnation() {
            return Err(Undelivered::of(&message, DeadLetterReason::Terminated));
        }
        self.owner
            .enqueue(self.id.incarnation(), (self.map)(message))
    }
}

impl<N: Message, M: Message> ErasedCell for AdapterCell<N, M> {
    fn id(&self) -> ActorId {
        self.id.clone()
    }

    fn send_system(&self, message: SystemMessage) -> Result<(), SystemMessage> {
        match message {
            SystemMessage::Watch { .. } | SystemMessage::Unwatch { .. } => {
                self.owner.send_system(message)
            }
            other => Err(other),
        }
    }

    fn deliver_encoded(
        &self,
        target: &ActorId,
        type_tag: &str,
        payload: &[u8],
        system: &ActorSystem,
    ) -> Result<(), Undelivered> {
        let message = decode_payload::<N>(type_tag, payload, system)?;
        self.tell(target, message)
    }

    fn sink_any(self: Arc<Self>) -> Box<dyn Any + Send + Sync> {
        Box::new(self as Arc<dyn MessageSink<N>>)
    }
}

// =============================================================================
// ActorCell
// =============================================================================

pub(crate) enum ParentLink {
    Actor(Arc<dyn ErasedCell>),
    /// Virtual parent of top-level actors.
    Guardian,
}

enum Directive {
    Continue,
    Restart(ActorFailure),
    Stop(StopReason),
}

type Outcome<M> = Result<Result<Next<M>, ActorFailure>, Box<dyn Any + Send>>;

pub(crate) struct ActorCell<M: Message> {
    props: Props<M>,
    behavior: BoxBehavior<M>,
    ctx: ActorContext<M>,
    user_rx: mpsc::Receiver<Addressed<M>>,
    system_rx: mpsc::UnboundedReceiver<SystemMessage>,
    parent: ParentLink,
    /// `(watcher, watchee)`; the watchee is this actor or one of its adapters.
    watchers: HashSet<(ActorId, ActorId)>,
    restarts: Option<RestartWindow>,
}

impl<M: Message> ActorCell<M> {
    pub(crate) fn new(
        props: Props<M>,
        ctx: ActorContext<M>,
        queues: Queues<M>,
        parent: ParentLink,
    ) -> Self {
        let behavior = (props.factory)();
        let restarts = props.supervision.restart_window();
        let (user_rx, system_rx) = queues;
        Self {
            props,
            behavior,
            ctx,
            user_rx,
            system_rx,
            parent,
            watchers: HashSet::new(),
            restarts,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(actor = %self.ctx.id(), "Started");
        let mut directive = self.signal(Signal::Start).await;
        let reason = loop {
            directive = match directive {
                Directive::Continue => self.next().await,
                Directive::Restart(failure) => self.restart(failure).await,
                Directive::Stop(reason) => break reason,
            };
        };
        self.finish(reason).await;
    }

    async fn next(&mut self) -> Directive {
        tokio::select! {
            biased;
            Some(message) = self.system_rx.recv() => self.on_system(message).await,
            Some(addressed) = self.user_rx.recv() => self.on_message(addressed).await,
            else => Directive::Stop(StopReason::Stopped),
        }
    }

    async fn on_message(&mut self, addressed: Addressed<M>) -> Directive {
        if addressed.incarnation != self.ctx.handle.incarnation() {
            let stale = self.ctx.id_with_incarnation(addressed.incarnation);
            let undelivered =
                Undelivered::of(&addressed.message, DeadLetterReason::IncarnationMismatch);
            self.ctx
                .system
                .dead_letters()
                .record(undelivered.into_dead_letter(stale));
            return Directive::Continue;
        }
        trace!(actor = %self.ctx.id(), message = ?addressed.message, "Received");
        let acting = self.ctx.id().clone();
        let receive = self.behavior.receive(&mut self.ctx, addressed.message);
        let outcome = AssertUnwindSafe(sending_as(acting, receive))
            .catch_unwind()
            .await;
        self.settle(outcome, None)
    }

    async fn on_system(&mut self, message: SystemMessage) -> Directive {
        match message {
            SystemMessage::Watch { watchee, watcher } => {
                if self.owns(&watchee) {
                    debug!(actor = %self.ctx.id(), %watcher, "Watched");
                    self.watchers.insert((watcher, watchee));
                } else {
                    self.ctx.system.deliver_system(
                        &watcher,
                        SystemMessage::Terminated {
                            id: watchee,
                            existence_confirmed: false,
                            node_terminated: false,
                        },
                    );
                }
                Directive::Continue
            }
            SystemMessage::Unwatch { watchee, watcher } => {
                self.watchers.remove(&(watcher, watchee));
                Directive::Continue
            }
            SystemMessage::Terminated {
                id,
                existence_confirmed,
                node_terminated,
            } => {
                if !self.ctx.watching.remove(&id) {
                    trace!(actor = %self.ctx.id(), terminated = %id, "Dropping duplicate Terminated");
                    return Directive::Continue;
                }
                self.signal(Signal::Terminated {
                    id,
                    existence_confirmed,
                    node_terminated,
                })
                .await
            }
            SystemMessage::ChildTerminated { id, escalation } => {
                if !self.ctx.remove_child(&id) {
                    return Directive::Continue;
                }
                self.signal(Signal::ChildTerminated { id, escalation }).await
            }
            SystemMessage::Stop => Directive::Stop(StopReason::Stopped),
        }
    }

    fn owns(&self, watchee: &ActorId) -> bool {
        let current = self.ctx.handle.incarnation();
        if watchee.incarnation() != current || !watchee.is_on(self.ctx.system.node()) {
            return false;
        }
        watchee.path() == self.ctx.id().path() || self.ctx.adapters.contains(watchee.path())
    }

    async fn signal(&mut self, signal: Signal) -> Directive {
        let on_unhandled = match &signal {
            Signal::Terminated { id, .. } => Some(ActorFailure::msg(format!(
                "Death pact with {id} was triggered"
            ))),
            Signal::ChildTerminated {
                escalation: Some(failure),
                ..
            } => Some(failure.clone()),
            _ => None,
        };
        let acting = self.ctx.id().clone();
        let receive = self.behavior.receive_signal(&mut self.ctx, signal);
        let outcome = AssertUnwindSafe(sending_as(acting, receive))
            .catch_unwind()
            .await;
        self.settle(outcome, on_unhandled)
    }

    /// Delivers a signal whose outcome does not matter (`PreRestart`, `PostStop`).
    async fn notify(&mut self, signal: Signal) {
        let name = signal.name();
        let acting = self.ctx.id().clone();
        let receive = self.behavior.receive_signal(&mut self.ctx, signal);
        let outcome = AssertUnwindSafe(sending_as(acting, receive))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(_)) => return,
            Ok(Err(failure)) => failure,
            Err(panic) => ActorFailure::from_panic(panic),
        };
        warn!(actor = %self.ctx.id(), signal = name, error = %failure, "Failure while handling signal");
    }

    fn settle(&mut self, outcome: Outcome<M>, on_unhandled: Option<ActorFailure>) -> Directive {
        match outcome {
            Ok(Ok(Next::Same)) => Directive::Continue,
            Ok(Ok(Next::Become(behavior))) => {
                self.behavior = behavior;
                Directive::Continue
            }
            Ok(Ok(Next::Stop)) => Directive::Stop(StopReason::Stopped),
            Ok(Ok(Next::Unhandled)) => match on_unhandled {
                Some(failure) => self.supervise(failure),
                None => {
                    trace!(actor = %self.ctx.id(), "Unhandled");
                    Directive::Continue
                }
            },
            Ok(Err(failure)) => self.supervise(failure),
            Err(panic) => self.supervise(ActorFailure::from_panic(panic)),
        }
    }

    fn supervise(&mut self, failure: ActorFailure) -> Directive {
        warn!(actor = %self.ctx.id(), error = %failure, "Actor failed");
        match &self.props.supervision {
            SupervisionStrategy::Resume => Directive::Continue,
            SupervisionStrategy::Stop => Directive::Stop(StopReason::Failed(failure)),
            SupervisionStrategy::Escalate => Directive::Stop(StopReason::Escalated(failure)),
            SupervisionStrategy::Restart { max_restarts, .. } => {
                let allowed = self
                    .restarts
                    .as_mut()
                    .is_some_and(|window| window.record(Instant::now()));
                if allowed {
                    Directive::Restart(failure)
                } else {
                    warn!(actor = %self.ctx.id(), max_restarts, "Restart quota exhausted, stopping");
                    Directive::Stop(StopReason::Escalated(failure))
                }
            }
        }
    }

    async fn restart(&mut self, failure: ActorFailure) -> Directive {
        let previous = self.ctx.id().clone();
        self.notify(Signal::PreRestart).await;
        self.ctx.stop_children().await;
        self.ctx.abort_tasks();
        self.retire_adapters();
        self.ctx.unwatch_all();

        let incarnation = self.ctx.system.next_incarnation();
        self.ctx.rebind(incarnation);
        self.ctx.system.retired(previous.clone());
        info!(actor = %previous, incarnation, error = %failure, "Restarting");

        self.behavior = (self.props.factory)();
        self.signal(Signal::Start).await
    }

    /// Removes adapters from the index and notifies everyone watching them.
    fn retire_adapters(&mut self) {
        let incarnation = self.ctx.handle.incarnation();
        let node = self.ctx.system.node().clone();
        for path in self.ctx.adapters.drain() {
            self.ctx.system.remove_cell(&path);
            self.ctx
                .system
                .retired(ActorId::new(node.clone(), path, incarnation));
        }
        let own_path = self.ctx.id().path().clone();
        let (adapter_watchers, own_watchers): (HashSet<_>, HashSet<_>) = self
            .watchers
            .drain()
            .partition(|(_, watchee)| watchee.path() != &own_path);
        self.watchers = own_watchers;
        for (watcher, watchee) in adapter_watchers {
            self.ctx.system.deliver_system(
                &watcher,
                SystemMessage::Terminated {
                    id: watchee,
                    existence_confirmed: true,
                    node_terminated: false,
                },
            );
        }
    }

    async fn finish(mut self, reason: StopReason) {
        let id = self.ctx.id().clone();
        let system = self.ctx.system.clone();
        self.ctx.handle.begin_stop();
        self.ctx.stop_children().await;
        self.notify(Signal::PostStop).await;
        self.ctx.abort_tasks();
        self.retire_adapters();
        system.actor_stopped(id.path());

        self.user_rx.close();
        while let Ok(addressed) = self.user_rx.try_recv() {
            let recipient = self.ctx.id_with_incarnation(addressed.incarnation);
            let undelivered = Undelivered::of(&addressed.message, DeadLetterReason::Terminated);
            system
                .dead_letters()
                .record(undelivered.into_dead_letter(recipient));
        }
        self.system_rx.close();
        while let Ok(message) = self.system_rx.try_recv() {
            match message {
                SystemMessage::Watch { watchee, watcher } => {
                    self.watchers.insert((watcher, watchee));
                }
                escalated @ SystemMessage::ChildTerminated {
                    escalation: Some(_),
                    ..
                } => {
                    let undelivered = Undelivered::of(&escalated, DeadLetterReason::Terminated);
                    system.dead_letters().record(undelivered.into_dead_letter(id.clone()));
                }
                _ => {}
            }
        }

        for (watcher, watchee) in self.watchers.drain() {
            system.deliver_system(
                &watcher,
                SystemMessage::Terminated {
                    id: watchee,
                    existence_confirmed: true,
                    node_terminated: false,
                },
            );
        }
        self.ctx.unwatch_all();

        let escalation = reason.escalation();
        match &self.parent {
            ParentLink::Actor(parent) => {
                let notice = SystemMessage::ChildTerminated {
                    id: id.clone(),
                    escalation,
                };
                if let Err(notice) = parent.send_system(notice) {
                    debug!(actor = %id, parent = %parent.id(), "Parent stopped before the child");
                    let undelivered = Undelivered::of(&notice, DeadLetterReason::Terminated);
                    system
                        .dead_letters()
                        .record(undelivered.into_dead_letter(parent.id()));
                }
            }
            ParentLink::Guardian => system.guardian_child_terminated(&id, escalation),
        }
        system.retired(id.clone());
        info!(actor = %id, %reason, "Stopped");
    }
}
