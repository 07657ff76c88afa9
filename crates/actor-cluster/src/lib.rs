//! # Actor Cluster
//!
//! A distributed actor runtime on top of tokio. Actors are isolated units of sequential
//! computation that talk only through asynchronous messages, are addressable across a cluster
//! of nodes, and survive failures through supervision and death watch.
//!
//! ## Layers
//!
//! 1. **Identity** ([`identity`]) - [`Node`], [`UniqueNode`], [`ActorPath`] and [`ActorId`].
//!    An `ActorId` names one incarnation of an actor; a restarted actor gets a new one, so
//!    messages for the old incarnation never reach the new one.
//! 2. **Engine** ([`ActorSystem`], [`Behavior`], [`ActorContext`]) - one tokio task per actor,
//!    a bounded user mailbox drained strictly one message at a time, an unbounded system queue
//!    that always goes first, supervision ([`SupervisionStrategy`]) and death watch.
//! 3. **Cluster** ([`cluster`]) - handshakes and associations between nodes, SWIM failure
//!    detection and the membership lifecycle.
//! 4. **Receptionist** ([`receptionist`]) - a gossip-replicated registry to find actors by
//!    [`RegistrationKey`] anywhere in the cluster.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use actor_cluster::{
//!     ActorContext, ActorFailure, ActorRef, ActorSystem, ActorSystemSettings, Behavior, Next,
//!     Props,
//! };
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! enum GreeterMsg {
//!     Greet { name: String, reply_to: ActorRef<String> },
//! }
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl Behavior for Greeter {
//!     type Message = GreeterMsg;
//!
//!     async fn receive(
//!         &mut self,
//!         _ctx: &mut ActorContext<GreeterMsg>,
//!         msg: GreeterMsg,
//!     ) -> Result<Next<GreeterMsg>, ActorFailure> {
//!         let GreeterMsg::Greet { name, reply_to } = msg;
//!         reply_to.tell(format!("Hello, {name}!"));
//!         Ok(Next::Same)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), actor_cluster::FrameworkError> {
//!     let system = ActorSystem::start(ActorSystemSettings::new("demo")).await?;
//!     let greeter = system.spawn("greeter", Props::new(|| Greeter))?;
//!     let greeting: String = greeter
//!         .ask(
//!             |reply_to| GreeterMsg::Greet { name: "Ada".into(), reply_to },
//!             Duration::from_secs(1),
//!         )
//!         .await?;
//!     assert_eq!(greeting, "Hello, Ada!");
//!     system.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Clustering
//!
//! Enable clustering in [`ClusterSettings`] and point nodes at a seed. Use
//! [`cluster::transport::LocalNetwork`] to run several nodes in one test process.

pub mod actor_ref;
mod ask;
pub mod behavior;
mod cell;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod context;
pub mod dead_letters;
pub mod error;
pub mod identity;
pub mod message;
pub mod receptionist;
pub mod supervision;
pub mod system;
pub mod telemetry;
pub mod testkit;

pub use actor_ref::ActorRef;
pub use behavior::{ActorFailure, Behavior, BoxBehavior, Next, Props, Signal};
pub use cluster::{ClusterControl, ClusterEvent, Member, MemberStatus, Membership};
pub use config::{
    ActorSystemSettings, BackoffSettings, ClusterSettings, ReceptionistSettings, SwimSettings,
};
pub use context::ActorContext;
pub use dead_letters::{DeadLetter, DeadLetterReason};
pub use error::{AssociationError, FrameworkError, ReplicationError};
pub use identity::{ActorId, ActorPath, Node, UniqueNode};
pub use message::{Message, Response};
pub use receptionist::{Listing, ReceptionistClient, RegistrationKey};
pub use supervision::SupervisionStrategy;
pub use system::ActorSystem;
