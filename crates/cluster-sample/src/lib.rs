//! # Greeter Cluster Sample
//!
//! A small application on top of `actor-cluster`: every node runs a greeter, greeters find each
//! other through the receptionist, and clients on any node reach any greeter.
//!
//! - **[model]**: the messages and replies that cross node boundaries.
//! - **[greeter_actor]**: the greeter behavior and its registration key.
//! - **[clients]**: [`GreeterClient`](clients::GreeterClient), which hides lookup and ask.
//! - **[lifecycle]**: [`GreeterCluster`](lifecycle::GreeterCluster), which starts, wires and
//!   stops the nodes.

pub mod clients;
pub mod greeter_actor;
pub mod lifecycle;
pub mod model;
