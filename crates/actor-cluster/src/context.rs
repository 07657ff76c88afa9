//! # Actor Context
//!
//! The handle a behavior gets alongside every message: its own identity and reference, its
//! children, death watch, message adapters and off-actor continuations.

use crate::actor_ref::{ActorRef, MessageSink};
use crate::behavior::Props;
use crate::cell::{AdapterCell, ErasedCell, MailboxHandle, ParentLink};
use crate::error::FrameworkError;
use crate::identity::{ActorId, ActorPath};
use crate::message::{Message, SystemMessage};
use crate::system::ActorSystem;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

pub(crate) struct ChildEntry {
    id: ActorId,
    cell: Arc<dyn ErasedCell>,
    join: JoinHandle<()>,
}

pub struct ActorContext<M: Message> {
    pub(crate) system: ActorSystem,
    pub(crate) handle: Arc<MailboxHandle<M>>,
    myself: ActorRef<M>,
    children: HashMap<String, ChildEntry>,
    pub(crate) watching: HashSet<ActorId>,
    pub(crate) adapters: HashSet<ActorPath>,
    next_adapter: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl<M: Message> ActorContext<M> {
    pub(crate) fn new(system: ActorSystem, handle: Arc<MailboxHandle<M>>) -> Self {
        let sink: Arc<dyn MessageSink<M>> = handle.clone();
        let myself = ActorRef::new(handle.current_id(), sink, system.clone());
        Self {
            system,
            handle,
            myself,
            children: HashMap::new(),
            watching: HashSet::new(),
            adapters: HashSet::new(),
            next_adapter: 1,
            tasks: Vec::new(),
        }
    }

    pub fn id(&self) -> &ActorId {
        self.myself.id()
    }

    pub fn myself(&self) -> ActorRef<M> {
        self.myself.clone()
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// Spawns a child named `name` under this actor. Children are stopped before their parent.
    pub fn spawn<C: Message>(
        &mut self,
        name: &str,
        props: Props<C>,
    ) -> Result<ActorRef<C>, FrameworkError> {
        let path = self.id().path().child(name)?;
        let parent: Arc<dyn ErasedCell> = self.handle.clone();
        let spawned = self
            .system
            .spawn_cell(path, props, ParentLink::Actor(parent))?;
        self.children.insert(
            name.to_string(),
            ChildEntry {
                id: spawned.actor.id().clone(),
                cell: spawned.cell,
                join: spawned.join,
            },
        );
        Ok(spawned.actor)
    }

    pub fn spawn_anonymous<C: Message>(
        &mut self,
        props: Props<C>,
    ) -> Result<ActorRef<C>, FrameworkError> {
        let name = self.system.anonymous_name();
        self.spawn(&name, props)
    }

    /// Asks a child to stop. Returns `false` if `child` is not a live child of this actor.
    pub fn stop<C: Message>(&mut self, child: &ActorRef<C>) -> bool {
        match self.children.get(child.id().name()) {
            Some(entry) if entry.id.same_path_as(child.id()) => {
                let _ = entry.cell.send_system(SystemMessage::Stop);
                true
            }
            _ => false,
        }
    }

    pub fn children(&self) -> Vec<ActorId> {
        self.children.values().map(|entry| entry.cell.id()).collect()
    }

    pub fn child<C: Message>(&self, name: &str) -> Option<ActorRef<C>> {
        self.children
            .get(name)
            .map(|entry| self.system.resolve(&entry.cell.id()))
    }

    /// Delivers exactly one [`Signal::Terminated`](crate::Signal::Terminated) when `target`
    /// terminates, including when its node goes down. Leaving it unhandled fails this actor.
    pub fn watch<N: Message>(&mut self, target: &ActorRef<N>) {
        self.watch_id(target.id().clone());
    }

    pub(crate) fn watch_id(&mut self, watchee: ActorId) {
        if &watchee == self.id() || !self.watching.insert(watchee.clone()) {
            return;
        }
        let watcher = self.id().clone();
        self.system
            .deliver_system(&watchee.clone(), SystemMessage::Watch { watchee, watcher });
    }

    pub fn unwatch<N: Message>(&mut self, target: &ActorRef<N>) {
        let watchee = target.id().clone();
        if self.watching.remove(&watchee) {
            let watcher = self.id().clone();
            self.system
                .deliver_system(&watchee.clone(), SystemMessage::Unwatch { watchee, watcher });
        }
    }

    /// A reference of another message type that maps into this actor's mailbox.
    ///
    /// Each call creates a new adapter under `<own path>/$adapter-N`. Adapters are reachable over
    /// the network, can be watched, and die with the current incarnation of this actor.
    pub fn message_adapter<N, F>(&mut self, map: F) -> Result<ActorRef<N>, FrameworkError>
    where
        N: Message,
        F: Fn(N) -> M + Send + Sync + 'static,
    {
        let name = format!("$adapter-{}", self.next_adapter);
        self.next_adapter += 1;
        let path = self.id().path().child(&name)?;
        let id = ActorId::new(
            self.system.node().clone(),
            path.clone(),
            self.handle.incarnation(),
        );
        let cell = Arc::new(AdapterCell::new(
            id.clone(),
            self.handle.clone(),
            Box::new(map),
        ));
        let erased: Arc<dyn ErasedCell> = cell.clone();
        self.system.register_cell(path.clone(), erased)?;
        self.adapters.insert(path);
        let sink: Arc<dyn MessageSink<N>> = cell;
        Ok(ActorRef::new(id, sink, self.system.clone()))
    }

    /// Runs `future` off-actor and feeds its mapped result back as a message. Pending futures are
    /// aborted when this actor stops or restarts.
    pub fn pipe_to_self<T, F, G>(&mut self, future: F, map: G)
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
        G: FnOnce(T) -> M + Send + 'static,
    {
        let myself = self.myself.clone();
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(tokio::spawn(async move {
            let value = future.await;
            myself.tell(map(value));
        }));
    }

    /// [`ActorRef::ask`] with the outcome piped back to this actor.
    pub fn ask<N, R, F, G>(&mut self, target: &ActorRef<N>, make: F, timeout: Duration, map: G)
    where
        N: Message,
        R: Message,
        F: FnOnce(ActorRef<R>) -> N + Send + 'static,
        G: FnOnce(Result<R, FrameworkError>) -> M + Send + 'static,
    {
        let target = target.clone();
        self.pipe_to_self(async move { target.ask(make, timeout).await }, map);
    }

    pub(crate) fn id_with_incarnation(&self, incarnation: u32) -> ActorId {
        ActorId::new(
            self.system.node().clone(),
            self.id().path().clone(),
            incarnation,
        )
    }

    pub(crate) fn rebind(&mut self, incarnation: u32) {
        let id = self.id_with_incarnation(incarnation);
        self.handle.rebind(id.clone());
        let sink: Arc<dyn MessageSink<M>> = self.handle.clone();
        self.myself = ActorRef::new(id, sink, self.system.clone());
    }

    /// Forgets a child that terminated. Returns `false` for unknown or already stopped children.
    pub(crate) fn remove_child(&mut self, id: &ActorId) -> bool {
        match self.children.get(id.name()) {
            Some(entry) if entry.id.same_path_as(id) => {
                self.children.remove(id.name());
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn stop_children(&mut self) {
        let children: Vec<ChildEntry> = self.children.drain().map(|(_, entry)| entry).collect();
        for child in &children {
            let _ = child.cell.send_system(SystemMessage::Stop);
        }
        for child in children {
            if let Err(e) = child.join.await {
                warn!(child = %child.id, error = %e, "Child task ended abnormally");
            }
        }
    }

    pub(crate) fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub(crate) fn unwatch_all(&mut self) {
        let watcher = self.id().clone();
        for watchee in self.watching.drain() {
            self.system.deliver_system(
                &watchee.clone(),
                SystemMessage::Unwatch {
                    watchee,
                    watcher: watcher.clone(),
                },
            );
        }
    }
}
