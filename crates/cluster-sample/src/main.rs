//! # Greeter Cluster Demo
//!
//! Runs three nodes in one process and walks through the life of a small cluster:
//!
//! 1. Start the nodes; each one spawns a greeter that registers with the receptionist.
//! 2. Wait until every node lists all three greeters.
//! 3. Greet from the first node; requests are spread over local and remote greeters.
//! 4. Down the last node and watch its greeter disappear from every listing.
//!
//! ```bash
//! RUST_LOG=info cargo run -p cluster-sample
//! RUST_LOG=actor_cluster::cluster=debug cargo run -p cluster-sample
//! ```

use cluster_sample::greeter_actor::GreeterError;
use cluster_sample::lifecycle::GreeterCluster;
use std::time::Duration;
use tracing::{error, info, Instrument};

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), GreeterError> {
    actor_cluster::telemetry::setup_tracing();

    info!("Starting greeter cluster");
    let cluster = GreeterCluster::start(&[7355, 7356, 7357]).await?;

    async {
        cluster.await_convergence(3, CONVERGENCE_TIMEOUT).await?;
        info!("All nodes see all greeters");
        Ok::<_, GreeterError>(())
    }
    .instrument(tracing::info_span!("convergence"))
    .await?;

    let client = cluster.client(0).ok_or(GreeterError::UnknownNode(0))?;
    let span = tracing::info_span!("greetings");
    async {
        for name in ["Ada", "Grace", "Barbara", "Edsger"] {
            match client.greet(name).await {
                Ok(greeting) => info!(text = %greeting.text, by = %greeting.greeted_by, "Greeted"),
                Err(e) => error!(error = %e, name, "Greeting failed"),
            }
        }
    }
    .instrument(span)
    .await;

    let span = tracing::info_span!("downing");
    async {
        cluster.down(0, 2, CONVERGENCE_TIMEOUT).await?;
        cluster.await_convergence(2, CONVERGENCE_TIMEOUT).await?;
        info!("Downed node is gone from every listing");
        let greeting = client.greet("again").await?;
        info!(text = %greeting.text, by = %greeting.greeted_by, "Greeted after downing");
        Ok::<_, GreeterError>(())
    }
    .instrument(span)
    .await?;

    cluster.shutdown().await;
    info!("Demo completed");
    Ok(())
}
