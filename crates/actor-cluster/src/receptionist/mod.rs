//! # Receptionist
//!
//! Cluster-wide service discovery. Actors are registered under a [`RegistrationKey`], typed by
//! the message type they accept, and found again through [`ReceptionistClient::lookup`] or a
//! subscription that receives the full [`Listing`] whenever it changes.
//!
//! There is no coordinator. Every node owns an op-log of its own registrations ([`oplog`]) and
//! pulls its peers' logs periodically; see [`shell`] for the owner task.
//!
//! ```rust,no_run
//! use actor_cluster::{ActorSystem, ActorSystemSettings, RegistrationKey};
//! # #[derive(Debug, serde::Serialize, serde::Deserialize)] struct Greet(String);
//!
//! # async fn demo(system: ActorSystem, greeter: actor_cluster::ActorRef<Greet>) -> Result<(), actor_cluster::FrameworkError> {
//! let key = RegistrationKey::<Greet>::new("greeters");
//! system.receptionist().register(&key, &greeter).await?;
//! let listing = system.receptionist().lookup(&key).await?;
//! for greeter in listing.actors() {
//!     greeter.tell(Greet("hello".into()));
//! }
//! # Ok(())
//! # }
//! ```

pub mod oplog;
pub(crate) mod shell;

use crate::actor_ref::ActorRef;
use crate::error::FrameworkError;
use crate::identity::{ActorId, UniqueNode};
use crate::message::{Message, Response};
use crate::system::ActorSystem;
pub use oplog::{ErasedKey, OpEntry, OpKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Replication traffic between receptionists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceptionistMessage {
    /// Asks for the receiver's own ops after `after_sequence`.
    SyncRequest { after_sequence: u64 },
    SyncResponse {
        ops: Vec<OpEntry>,
        highest_sequence: u64,
    },
}

/// Identifies a group of actors accepting messages of type `M`.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct RegistrationKey<M> {
    id: String,
    #[serde(skip)]
    _message: PhantomData<fn() -> M>,
}

impl<M: Message> RegistrationKey<M> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            _message: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn erased(&self) -> ErasedKey {
        ErasedKey {
            type_tag: std::any::type_name::<M>().to_string(),
            id: self.id.clone(),
        }
    }
}

impl<M> Clone for RegistrationKey<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            _message: PhantomData,
        }
    }
}

impl<M> PartialEq for RegistrationKey<M> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<M> Eq for RegistrationKey<M> {}

impl<M> fmt::Debug for RegistrationKey<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegistrationKey<{}>({})", std::any::type_name::<M>(), self.id)
    }
}

/// Every actor currently registered under a key, as seen by this node.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Listing<M: Message> {
    key: RegistrationKey<M>,
    actors: Vec<ActorRef<M>>,
}

impl<M: Message> Listing<M> {
    pub fn key(&self) -> &RegistrationKey<M> {
        &self.key
    }

    pub fn actors(&self) -> &[ActorRef<M>] {
        &self.actors
    }

    pub fn ids(&self) -> Vec<ActorId> {
        self.actors.iter().map(|actor| actor.id().clone()).collect()
    }

    pub fn contains(&self, id: &ActorId) -> bool {
        self.actors.iter().any(|actor| actor.id() == id)
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn into_actors(self) -> Vec<ActorRef<M>> {
        self.actors
    }

    fn resolve(system: &ActorSystem, key: RegistrationKey<M>, ids: &[ActorId]) -> Self {
        Self {
            key,
            actors: ids.iter().map(|id| system.resolve(id)).collect(),
        }
    }
}

impl<M: Message> Clone for Listing<M> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            actors: self.actors.clone(),
        }
    }
}

impl<M: Message> fmt::Debug for Listing<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listing")
            .field("key", &self.key.id)
            .field("actors", &self.actors)
            .finish()
    }
}

/// Pushes a listing, already resolved to ids, to one subscriber.
pub(crate) type Notify = Box<dyn Fn(&ActorSystem, &[ActorId]) + Send>;

pub(crate) enum ReceptionistRequest {
    Register {
        key: ErasedKey,
        actor: ActorId,
        respond_to: Response<bool>,
    },
    Unregister {
        key: ErasedKey,
        actor: ActorId,
        respond_to: Response<bool>,
    },
    Lookup {
        key: ErasedKey,
        respond_to: Response<Vec<ActorId>>,
    },
    Subscribe {
        key: ErasedKey,
        subscriber: ActorId,
        notify: Notify,
        respond_to: Response<()>,
    },
    Remote {
        peer: UniqueNode,
        message: ReceptionistMessage,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Sending half of the receptionist's request queue.
#[derive(Clone)]
pub(crate) struct ReceptionistHandle {
    sender: mpsc::UnboundedSender<ReceptionistRequest>,
}

impl ReceptionistHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ReceptionistRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// A handle whose receptionist is gone; every request fails with `ActorClosed`.
    pub(crate) fn closed() -> Self {
        let (handle, _) = Self::channel();
        handle
    }

    pub(crate) fn deliver_remote(&self, peer: UniqueNode, message: ReceptionistMessage) {
        if self
            .sender
            .send(ReceptionistRequest::Remote { peer, message })
            .is_err()
        {
            debug!("Receptionist stopped, dropping replication message");
        }
    }

    pub(crate) async fn shutdown(&self) {
        let (done, stopped) = oneshot::channel();
        if self.sender.send(ReceptionistRequest::Shutdown(done)).is_ok() {
            let _ = stopped.await;
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Response<T>) -> ReceptionistRequest,
    ) -> Result<T, FrameworkError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(make(respond_to))
            .map_err(|_| FrameworkError::ActorClosed)?;
        response.await.map_err(|_| FrameworkError::ActorDropped)?
    }
}

/// Typed access to the local receptionist. Obtained from [`ActorSystem::receptionist`].
#[derive(Clone)]
pub struct ReceptionistClient {
    system: ActorSystem,
    handle: ReceptionistHandle,
}

impl ReceptionistClient {
    pub(crate) fn new(system: ActorSystem, handle: ReceptionistHandle) -> Self {
        Self { system, handle }
    }

    /// Registers a local actor under `key`. Returns `false` if it already was.
    pub async fn register<M: Message>(
        &self,
        key: &RegistrationKey<M>,
        actor: &ActorRef<M>,
    ) -> Result<bool, FrameworkError> {
        let actor = self.local(actor)?;
        let key = key.erased();
        self.handle
            .request(|respond_to| ReceptionistRequest::Register {
                key,
                actor,
                respond_to,
            })
            .await
    }

    pub async fn unregister<M: Message>(
        &self,
        key: &RegistrationKey<M>,
        actor: &ActorRef<M>,
    ) -> Result<bool, FrameworkError> {
        let actor = self.local(actor)?;
        let key = key.erased();
        self.handle
            .request(|respond_to| ReceptionistRequest::Unregister {
                key,
                actor,
                respond_to,
            })
            .await
    }

    pub async fn lookup<M: Message>(
        &self,
        key: &RegistrationKey<M>,
    ) -> Result<Listing<M>, FrameworkError> {
        let erased = key.erased();
        let ids = self
            .handle
            .request(|respond_to| ReceptionistRequest::Lookup {
                key: erased,
                respond_to,
            })
            .await?;
        Ok(Listing::resolve(&self.system, key.clone(), &ids))
    }

    /// Sends the current listing of `key` to `subscriber` now and again on every change, until
    /// the subscriber terminates.
    pub async fn subscribe<M: Message>(
        &self,
        key: &RegistrationKey<M>,
        subscriber: &ActorRef<Listing<M>>,
    ) -> Result<(), FrameworkError> {
        let subscriber_id = self.local(subscriber)?;
        let typed_key = key.clone();
        let target = subscriber.clone();
        let notify: Notify = Box::new(move |system: &ActorSystem, ids: &[ActorId]| {
            target.tell(Listing::resolve(system, typed_key.clone(), ids));
        });
        let key = key.erased();
        self.handle
            .request(|respond_to| ReceptionistRequest::Subscribe {
                key,
                subscriber: subscriber_id,
                notify,
                respond_to,
            })
            .await
    }

    fn local<N: Message>(&self, actor: &ActorRef<N>) -> Result<ActorId, FrameworkError> {
        if actor.is_local() {
            Ok(actor.id().clone())
        } else {
            Err(FrameworkError::NotLocal(actor.id().clone()))
        }
    }
}

impl fmt::Debug for ReceptionistClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceptionistClient")
            .field("node", self.system.node())
            .finish()
    }
}
