//! Shared actors and node setup for the integration tests.

#![allow(dead_code)]

use actor_cluster::cluster::transport::LocalNetwork;
use actor_cluster::telemetry::try_setup_tracing;
use actor_cluster::{
    ActorContext, ActorFailure, ActorRef, ActorSystem, ActorSystemSettings, Behavior,
    ClusterSettings, Next, Node,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn start_local(name: &str) -> ActorSystem {
    try_setup_tracing();
    ActorSystem::start(ActorSystemSettings::for_testing(name))
        .await
        .expect("local system starts")
}

pub fn node(port: u16) -> Node {
    Node::new("test", "127.0.0.1", port)
}

pub fn cluster_settings(port: u16, seeds: &[u16]) -> ActorSystemSettings {
    let cluster = ClusterSettings::for_testing(node(port))
        .with_seed_nodes(seeds.iter().copied().map(node).collect());
    ActorSystemSettings::for_testing("test").with_cluster(cluster)
}

pub async fn start_node(network: &LocalNetwork, port: u16, seeds: &[u16]) -> ActorSystem {
    start_node_with(network, cluster_settings(port, seeds)).await
}

pub async fn start_node_with(network: &LocalNetwork, settings: ActorSystemSettings) -> ActorSystem {
    try_setup_tracing();
    let transport = network.transport_for(&settings.node());
    ActorSystem::start_with_transport(settings, transport)
        .await
        .expect("clustered system starts")
}

/// Waits until `system` sees every node of `others` as up.
pub async fn await_up(system: &ActorSystem, others: &[&ActorSystem]) {
    let cluster = system.cluster().expect("cluster enabled");
    for other in others {
        let up = cluster
            .wait_for_status(other.node(), actor_cluster::MemberStatus::Up, WAIT)
            .await;
        assert!(up, "{} never saw {} up", system.node(), other.node());
    }
}

/// Ask round trip through `echo`. Everything sent to its node before returns has arrived there.
pub async fn ping(echo: &ActorRef<EchoMsg>) {
    let reply: String = echo
        .ask(
            |reply_to| EchoMsg::Echo {
                text: "ping".into(),
                reply_to,
            },
            WAIT,
        )
        .await
        .expect("echo answers");
    assert_eq!(reply, "ping");
}

// -----------------------------------------------------------------------------
// Echo
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub enum EchoMsg {
    Echo { text: String, reply_to: ActorRef<String> },
    Forward { value: u32, to: ActorRef<u32> },
}

pub struct Echo;

#[async_trait]
impl Behavior for Echo {
    type Message = EchoMsg;

    async fn receive(
        &mut self,
        _ctx: &mut ActorContext<EchoMsg>,
        msg: EchoMsg,
    ) -> Result<Next<EchoMsg>, ActorFailure> {
        match msg {
            EchoMsg::Echo { text, reply_to } => reply_to.tell(text),
            EchoMsg::Forward { value, to } => to.tell(value),
        }
        Ok(Next::Same)
    }
}

// -----------------------------------------------------------------------------
// Silent: accepts anything, answers nothing
// -----------------------------------------------------------------------------

pub struct Silent;

#[async_trait]
impl Behavior for Silent {
    type Message = EchoMsg;

    async fn receive(
        &mut self,
        _ctx: &mut ActorContext<EchoMsg>,
        _msg: EchoMsg,
    ) -> Result<Next<EchoMsg>, ActorFailure> {
        Ok(Next::Same)
    }
}
