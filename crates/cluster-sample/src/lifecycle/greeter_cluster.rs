use crate::clients::GreeterClient;
use crate::greeter_actor::{self, greeter_key, GreeterError};
use crate::model::GreeterMsg;
use actor_cluster::cluster::transport::LocalNetwork;
use actor_cluster::{
    ActorRef, ActorSystem, ActorSystemSettings, ClusterSettings, MemberStatus, Node,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const SYSTEM_NAME: &str = "greeters";

/// One greeter per node, every node in this process.
pub struct GreeterCluster {
    network: LocalNetwork,
    nodes: Vec<ActorSystem>,
    greeters: Vec<ActorRef<GreeterMsg>>,
}

impl GreeterCluster {
    /// Starts one node per port. The first port is the seed of all others.
    pub async fn start(ports: &[u16]) -> Result<Self, GreeterError> {
        let network = LocalNetwork::new();
        let mut nodes = Vec::with_capacity(ports.len());
        let mut greeters = Vec::with_capacity(ports.len());
        let seed = ports.first().map(|port| Self::node(*port));

        for port in ports {
            let bind = Self::node(*port);
            let mut cluster = ClusterSettings::for_testing(bind.clone());
            if let Some(seed) = seed.as_ref().filter(|seed| **seed != bind) {
                cluster = cluster.with_seed_node(seed.clone());
            }
            let settings = ActorSystemSettings::new(SYSTEM_NAME).with_cluster(cluster);
            let system =
                ActorSystem::start_with_transport(settings, network.transport_for(&bind)).await?;
            let greeter = system.spawn("greeter", greeter_actor::props())?;
            info!(node = %system.node(), greeter = %greeter.id(), "Node started");
            nodes.push(system);
            greeters.push(greeter);
        }
        Ok(Self {
            network,
            nodes,
            greeters,
        })
    }

    pub fn node(port: u16) -> Node {
        Node::new(SYSTEM_NAME, "127.0.0.1", port)
    }

    pub fn nodes(&self) -> &[ActorSystem] {
        &self.nodes
    }

    pub fn system(&self, index: usize) -> Option<&ActorSystem> {
        self.nodes.get(index)
    }

    /// The greeter spawned on node `index`.
    pub fn greeter(&self, index: usize) -> Option<&ActorRef<GreeterMsg>> {
        self.greeters.get(index)
    }

    pub fn client(&self, index: usize) -> Option<GreeterClient> {
        self.system(index).cloned().map(GreeterClient::new)
    }

    /// Waits until every live node sees every live node up and lists `expected` greeters.
    pub async fn await_convergence(
        &self,
        expected: usize,
        timeout: Duration,
    ) -> Result<(), GreeterError> {
        let deadline = Instant::now() + timeout;
        let live: Vec<&ActorSystem> = self.nodes.iter().filter(|n| !n.is_terminated()).collect();
        for system in &live {
            let cluster = system.cluster()?;
            for other in &live {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if !cluster
                    .wait_for_status(other.node(), MemberStatus::Up, remaining)
                    .await
                {
                    return Err(GreeterError::NotConverged(timeout));
                }
            }
            loop {
                let listing = system.receptionist().lookup(&greeter_key()).await?;
                if listing.len() == expected {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(
                        node = %system.node(),
                        listed = listing.len(),
                        expected,
                        "Greeters did not converge"
                    );
                    return Err(GreeterError::NotConverged(timeout));
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
        Ok(())
    }

    /// Has node `observer` declare node `target` down, then waits for the target to notice and
    /// shut itself down.
    pub async fn down(
        &self,
        observer: usize,
        target: usize,
        timeout: Duration,
    ) -> Result<(), GreeterError> {
        let observer = self
            .system(observer)
            .ok_or(GreeterError::UnknownNode(observer))?;
        let target = self
            .system(target)
            .ok_or(GreeterError::UnknownNode(target))?;
        info!(observer = %observer.node(), target = %target.node(), "Downing node");
        observer.cluster()?.down(target.node());
        tokio::time::timeout(timeout, target.when_terminated())
            .await
            .map_err(|_| GreeterError::NotConverged(timeout))
    }

    /// Cuts node `index` off the network without telling anyone. Failure detection takes it
    /// from there.
    pub fn isolate(&self, index: usize) {
        if let Some(system) = self.system(index) {
            warn!(node = %system.node(), "Isolating node");
            self.network.isolate(&system.node().node);
        }
    }

    pub async fn shutdown(self) {
        for system in self.nodes.iter().rev() {
            system.shutdown().await;
        }
        info!("All nodes stopped");
    }
}
