mod common;

use actor_cluster::cluster::transport::LocalNetwork;
use actor_cluster::testkit::TestProbe;
use actor_cluster::{ClusterEvent, FrameworkError, MemberStatus, Props};
use common::{await_up, ping, start_local, start_node, Echo, EchoMsg, WAIT};
use std::time::Duration;

#[tokio::test]
async fn test_two_nodes_become_up() {
    let network = LocalNetwork::new();
    let first = start_node(&network, 7001, &[]).await;
    let second = start_node(&network, 7002, &[7001]).await;

    await_up(&first, &[&second]).await;
    await_up(&second, &[&first]).await;

    let cluster = first.cluster().unwrap();
    assert_eq!(cluster.associated_nodes(), vec![second.node().clone()]);
    assert_eq!(
        cluster.membership().status_of(first.node()),
        Some(MemberStatus::Up)
    );

    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test]
async fn test_cluster_operations_require_clustering() {
    let system = start_local("standalone").await;
    assert!(matches!(
        system.cluster(),
        Err(FrameworkError::ClusterDisabled)
    ));
    system.shutdown().await;
}

#[tokio::test]
async fn test_remote_ask_round_trip() {
    let network = LocalNetwork::new();
    let first = start_node(&network, 7001, &[]).await;
    let second = start_node(&network, 7002, &[7001]).await;
    await_up(&second, &[&first]).await;

    let echo = first.spawn("echo", Props::new(|| Echo)).unwrap();
    let remote = second.resolve::<EchoMsg>(echo.id());
    assert!(!remote.is_local());

    let reply: String = remote
        .ask(
            |reply_to| EchoMsg::Echo {
                text: "over the wire".into(),
                reply_to,
            },
            WAIT,
        )
        .await
        .unwrap();
    assert_eq!(reply, "over the wire");

    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test]
async fn test_remote_messages_keep_sender_order() {
    let network = LocalNetwork::new();
    let first = start_node(&network, 7001, &[]).await;
    let second = start_node(&network, 7002, &[7001]).await;
    await_up(&second, &[&first]).await;

    let echo = first
        .spawn("echo", Props::new(|| Echo).with_mailbox_capacity(512))
        .unwrap();
    let remote = second.resolve::<EchoMsg>(echo.id());
    let mut probe = TestProbe::<u32>::spawn(&second, "probe")
        .await
        .unwrap()
        .with_timeout(WAIT);

    for value in 0..100 {
        remote.tell(EchoMsg::Forward {
            value,
            to: probe.actor(),
        });
    }
    for expected in 0..100 {
        assert_eq!(probe.expect_message().await, expected);
    }

    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test]
async fn test_messages_sent_before_association_are_delivered() {
    let network = LocalNetwork::new();
    let first = start_node(&network, 7001, &[]).await;
    let second = start_node(&network, 7002, &[]).await;
    let echo = first.spawn("echo", Props::new(|| Echo)).unwrap();
    let mut probe = TestProbe::<u32>::spawn(&second, "probe")
        .await
        .unwrap()
        .with_timeout(WAIT);

    // No seeds: the first send triggers the association.
    let remote = second.resolve::<EchoMsg>(echo.id());
    remote.tell(EchoMsg::Forward {
        value: 1,
        to: probe.actor(),
    });
    remote.tell(EchoMsg::Forward {
        value: 2,
        to: probe.actor(),
    });
    assert_eq!(probe.expect_message().await, 1);
    assert_eq!(probe.expect_message().await, 2);

    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test]
async fn test_remote_watch_fires_when_actor_stops() {
    let network = LocalNetwork::new();
    let first = start_node(&network, 7001, &[]).await;
    let second = start_node(&network, 7002, &[7001]).await;
    await_up(&second, &[&first]).await;

    let echo = first.spawn("echo", Props::new(|| Echo)).unwrap();
    let mut probe = TestProbe::<u32>::spawn(&second, "probe")
        .await
        .unwrap()
        .with_timeout(WAIT);
    let remote = second.resolve::<EchoMsg>(echo.id());
    probe.watch(&remote);
    // Once the reply is in, the probe has sent its watch; the ping makes sure it landed.
    remote.tell(EchoMsg::Forward {
        value: 1,
        to: probe.actor(),
    });
    assert_eq!(probe.expect_message().await, 1);
    ping(&remote).await;

    first.stop(&echo);
    let terminated = probe.expect_terminated(echo.id()).await;
    assert!(terminated.existence_confirmed);
    assert!(!terminated.node_terminated);

    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test]
async fn test_downing_a_node_terminates_its_actors_and_the_node() {
    let network = LocalNetwork::new();
    let first = start_node(&network, 7001, &[]).await;
    let second = start_node(&network, 7002, &[7001]).await;
    await_up(&second, &[&first]).await;

    let echo = first.spawn("echo", Props::new(|| Echo)).unwrap();
    let mut probe = TestProbe::<u32>::spawn(&second, "probe")
        .await
        .unwrap()
        .with_timeout(WAIT);
    let remote = second.resolve::<EchoMsg>(echo.id());
    probe.watch(&remote);
    remote.tell(EchoMsg::Forward {
        value: 1,
        to: probe.actor(),
    });
    assert_eq!(probe.expect_message().await, 1);

    let cluster = second.cluster().unwrap();
    let mut events = first.cluster().unwrap().subscribe();
    cluster.down(first.node());

    let terminated = probe.expect_terminated(echo.id()).await;
    assert!(terminated.node_terminated);
    assert_eq!(
        cluster.membership().status_of(first.node()),
        Some(MemberStatus::Down)
    );

    // The downed node learns about it and shuts itself down.
    let self_downed = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(ClusterEvent::SelfDowned) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await;
    assert_eq!(self_downed, Ok(true));
    assert!(tokio::time::timeout(WAIT, first.when_terminated())
        .await
        .is_ok());

    // Tombstoned: messages for the downed node are dead letters from now on.
    let mut letters = second.dead_letters().subscribe();
    remote.tell(EchoMsg::Forward {
        value: 2,
        to: probe.actor(),
    });
    let letter = tokio::time::timeout(WAIT, letters.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(letter.recipient, *echo.id());

    second.shutdown().await;
}

#[tokio::test]
async fn test_downed_node_shuts_down_without_the_severance_notice() {
    let network = LocalNetwork::new();
    let first = start_node(&network, 7001, &[]).await;
    let second = start_node(&network, 7002, &[7001]).await;
    await_up(&first, &[&second]).await;

    let mut events = second.cluster().unwrap().subscribe();
    let cluster = first.cluster().unwrap();

    // Down the second node while it cannot hear about it.
    network.isolate(&second.node().node);
    cluster.down(second.node());
    assert!(
        cluster
            .wait_for_status(second.node(), MemberStatus::Down, WAIT)
            .await
    );
    network.heal(&second.node().node);

    // Reconnecting gets it rejected as tombstoned, which is enough to stop.
    let self_downed = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(ClusterEvent::SelfDowned) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await;
    assert_eq!(self_downed, Ok(true));
    assert!(tokio::time::timeout(WAIT, second.when_terminated())
        .await
        .is_ok());
    assert!(!cluster.associated_nodes().contains(second.node()));

    first.shutdown().await;
}

#[tokio::test]
async fn test_isolated_node_is_detected_and_downed() {
    let network = LocalNetwork::new();
    let first = start_node(&network, 7001, &[]).await;
    let second = start_node(&network, 7002, &[7001]).await;
    await_up(&first, &[&second]).await;

    network.isolate(&second.node().node);

    let cluster = first.cluster().unwrap();
    let downed = cluster
        .wait_for_status(second.node(), MemberStatus::Down, WAIT)
        .await;
    assert!(downed, "isolated node was never declared down");
    assert!(!cluster.associated_nodes().contains(second.node()));

    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test]
async fn test_mutual_seeds_settle_on_one_association() {
    let network = LocalNetwork::new();
    let first = start_node(&network, 7001, &[7002]).await;
    let second = start_node(&network, 7002, &[7001]).await;

    await_up(&first, &[&second]).await;
    await_up(&second, &[&first]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        first.cluster().unwrap().associated_nodes(),
        vec![second.node().clone()]
    );
    assert_eq!(
        second.cluster().unwrap().associated_nodes(),
        vec![first.node().clone()]
    );

    let echo = second.spawn("echo", Props::new(|| Echo)).unwrap();
    let reply: String = first
        .resolve::<EchoMsg>(echo.id())
        .ask(
            |reply_to| EchoMsg::Echo {
                text: "still talking".into(),
                reply_to,
            },
            WAIT,
        )
        .await
        .unwrap();
    assert_eq!(reply, "still talking");

    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test]
async fn test_gossip_connects_nodes_that_never_met() {
    let network = LocalNetwork::new();
    let first = start_node(&network, 7001, &[]).await;
    let second = start_node(&network, 7002, &[7001]).await;
    let third = start_node(&network, 7003, &[7002]).await;

    await_up(&first, &[&second, &third]).await;
    await_up(&second, &[&first, &third]).await;
    await_up(&third, &[&first, &second]).await;

    third.shutdown().await;
    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test]
async fn test_leaving_member_is_seen_as_leaving() {
    let network = LocalNetwork::new();
    let first = start_node(&network, 7001, &[]).await;
    let second = start_node(&network, 7002, &[7001]).await;
    await_up(&first, &[&second]).await;

    second.cluster().unwrap().leave();
    let leaving = first
        .cluster()
        .unwrap()
        .wait_for_status(second.node(), MemberStatus::Leaving, WAIT)
        .await;
    assert!(leaving);

    second.shutdown().await;
    first.shutdown().await;
}
