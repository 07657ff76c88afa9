//! # Cluster Lifecycle
//!
//! Starting, wiring and stopping the nodes of the sample. [`GreeterCluster`] runs every node
//! in this process on a [`LocalNetwork`](actor_cluster::cluster::transport::LocalNetwork), so
//! the demo needs no open ports; swap in
//! [`ActorSystem::start`](actor_cluster::ActorSystem::start) to run each node in its own
//! process over TCP.
//!
//! Startup order:
//!
//! 1. The first node starts with no seeds.
//! 2. Every other node seeds the first one and joins through it.
//! 3. Each node spawns one greeter, which registers itself with the receptionist.
//! 4. [`GreeterCluster::await_convergence`] waits until every node sees every greeter.
//!
//! Tracing is set up by the caller through [`actor_cluster::telemetry`].

pub mod greeter_cluster;

pub use greeter_cluster::*;
