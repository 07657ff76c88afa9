use actor_cluster::telemetry::try_setup_tracing;
use actor_cluster::{ActorSystem, ActorSystemSettings, FrameworkError};
use cluster_sample::clients::GreeterClient;
use cluster_sample::greeter_actor::{greeter_key, GreeterError};
use cluster_sample::lifecycle::GreeterCluster;
use std::collections::HashSet;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_greetings_are_spread_over_the_cluster() {
    try_setup_tracing();
    let cluster = GreeterCluster::start(&[7401, 7402]).await.unwrap();
    cluster.await_convergence(2, WAIT).await.unwrap();

    let client = cluster.client(0).unwrap();
    let mut greeted_by = HashSet::new();
    for name in ["Ada", "Grace"] {
        let greeting = client.greet(name).await.unwrap();
        assert_eq!(greeting.text, format!("Hello, {name}!"));
        greeted_by.insert(greeting.greeted_by);
    }
    assert_eq!(greeted_by.len(), 2, "both greeters answered: {greeted_by:?}");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failing_greeter_restarts_and_registers_again() {
    try_setup_tracing();
    let cluster = GreeterCluster::start(&[7411]).await.unwrap();
    cluster.await_convergence(1, WAIT).await.unwrap();
    let system = cluster.system(0).unwrap();
    let original = cluster.greeter(0).unwrap().clone();

    let client = cluster
        .client(0)
        .unwrap()
        .with_timeout(Duration::from_millis(300));
    client.greet("Ada").await.unwrap();
    let failed = client.greet("  ").await;
    assert!(matches!(
        failed,
        Err(GreeterError::Framework(FrameworkError::AskTimeout(_)))
    ));

    let deadline = tokio::time::Instant::now() + WAIT;
    let restarted = loop {
        let listing = system.receptionist().lookup(&greeter_key()).await.unwrap();
        if listing.len() == 1 && !listing.contains(original.id()) {
            break listing.into_actors().remove(0);
        }
        assert!(tokio::time::Instant::now() < deadline, "greeter never re-registered");
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert_eq!(restarted.path(), original.path());
    assert!(restarted.id().incarnation() > original.id().incarnation());
    assert_eq!(client.count(&restarted).await.unwrap(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_downed_node_leaves_the_listing() {
    try_setup_tracing();
    let cluster = GreeterCluster::start(&[7421, 7422, 7423]).await.unwrap();
    cluster.await_convergence(3, WAIT).await.unwrap();

    cluster.down(0, 2, WAIT).await.unwrap();
    assert!(cluster.system(2).unwrap().is_terminated());
    cluster.await_convergence(2, WAIT).await.unwrap();

    let downed = cluster.system(2).unwrap().node().node.to_string();
    let client = cluster.client(1).unwrap();
    for name in ["Barbara", "Edsger", "Frances"] {
        let greeting = client.greet(name).await.unwrap();
        assert_ne!(greeting.greeted_by, downed);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_no_greeters_is_an_error() {
    try_setup_tracing();
    let system = ActorSystem::start(ActorSystemSettings::for_testing("lonely"))
        .await
        .unwrap();
    let client = GreeterClient::new(system.clone());

    assert!(matches!(
        client.greet("anyone").await,
        Err(GreeterError::NoGreeters)
    ));
    system.shutdown().await;
}
