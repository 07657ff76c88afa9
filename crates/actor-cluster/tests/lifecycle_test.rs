mod common;

use actor_cluster::testkit::TestProbe;
use actor_cluster::{
    ActorContext, ActorFailure, ActorRef, Behavior, DeadLetterReason, FrameworkError, Next, Props,
    Signal,
};
use async_trait::async_trait;
use common::{start_local, Echo, EchoMsg, Silent};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[tokio::test]
async fn test_ask_round_trip() {
    let system = start_local("ask").await;
    let echo = system.spawn("echo", Props::new(|| Echo)).unwrap();

    let reply: String = echo
        .ask(
            |reply_to| EchoMsg::Echo {
                text: "ping".into(),
                reply_to,
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(reply, "ping");
    system.shutdown().await;
}

#[tokio::test]
async fn test_ask_times_out_without_reply() {
    let system = start_local("ask-timeout").await;
    let silent = system.spawn("silent", Props::new(|| Silent)).unwrap();

    let result: Result<String, _> = silent
        .ask(
            |reply_to| EchoMsg::Echo {
                text: "anyone?".into(),
                reply_to,
            },
            Duration::from_millis(100),
        )
        .await;

    assert!(matches!(result, Err(FrameworkError::AskTimeout(_))));
    system.shutdown().await;
}

#[tokio::test]
async fn test_ask_resolves_when_target_terminates() {
    let system = start_local("ask-terminated").await;
    let silent = system.spawn("silent", Props::new(|| Silent)).unwrap();
    let target = silent.clone();
    let stopper = system.clone();

    let ask = tokio::spawn(async move {
        target
            .ask::<String, _>(
                |reply_to| EchoMsg::Echo {
                    text: "hello".into(),
                    reply_to,
                },
                Duration::from_secs(5),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    stopper.stop(&silent);

    let result = ask.await.unwrap();
    assert!(
        matches!(result, Err(FrameworkError::AskTargetTerminated(ref id)) if id == silent.id())
    );
    system.shutdown().await;
}

#[tokio::test]
async fn test_incarnations_grow_and_distinguish_respawns() {
    let system = start_local("incarnations").await;
    let mut probe = TestProbe::<u32>::spawn(&system, "probe").await.unwrap();

    let first = system.spawn("worker", Props::new(|| Echo)).unwrap();
    probe.watch(&first);
    system.stop(&first);
    probe.expect_terminated(first.id()).await;

    let second = system.spawn("worker", Props::new(|| Echo)).unwrap();
    assert_eq!(first.path(), second.path());
    assert_ne!(first.id(), second.id());
    assert!(second.id().incarnation() > first.id().incarnation());
    assert!(!system.is_alive(first.id()));
    assert!(system.is_alive(second.id()));
    system.shutdown().await;
}

#[tokio::test]
async fn test_stale_reference_yields_exactly_one_dead_letter() {
    let system = start_local("stale").await;
    let mut probe = TestProbe::<u32>::spawn(&system, "probe").await.unwrap();
    let worker = system.spawn("worker", Props::new(|| Echo)).unwrap();
    probe.watch(&worker);
    system.stop(&worker);
    probe.expect_terminated(worker.id()).await;

    let mut letters = system.dead_letters().subscribe();
    let before = system.dead_letters().count();
    worker.tell(EchoMsg::Forward {
        value: 1,
        to: probe.actor(),
    });

    let letter = letters.recv().await.unwrap();
    assert_eq!(letter.recipient, *worker.id());
    assert_eq!(letter.reason, DeadLetterReason::Terminated);
    assert_eq!(system.dead_letters().count(), before + 1);
    probe.expect_no_message(Duration::from_millis(100)).await;
    system.shutdown().await;
}

#[tokio::test]
async fn test_reference_to_previous_incarnation_is_not_delivered() {
    let system = start_local("mismatch").await;
    let mut probe = TestProbe::<u32>::spawn(&system, "probe").await.unwrap();
    let first = system.spawn("worker", Props::new(|| Echo)).unwrap();
    probe.watch(&first);
    system.stop(&first);
    probe.expect_terminated(first.id()).await;
    let second = system.spawn("worker", Props::new(|| Echo)).unwrap();

    let mut letters = system.dead_letters().subscribe();
    let stale = system.resolve::<EchoMsg>(first.id());
    stale.tell(EchoMsg::Forward {
        value: 1,
        to: probe.actor(),
    });
    let letter = letters.recv().await.unwrap();
    assert_eq!(letter.reason, DeadLetterReason::IncarnationMismatch);

    second.tell(EchoMsg::Forward {
        value: 2,
        to: probe.actor(),
    });
    assert_eq!(probe.expect_message().await, 2);
    system.shutdown().await;
}

#[tokio::test]
async fn test_messages_from_one_sender_arrive_in_order() {
    let system = start_local("fifo").await;
    let mut probe = TestProbe::<u32>::spawn(&system, "probe").await.unwrap();
    let relay = system
        .spawn("relay", Props::new(|| Echo).with_mailbox_capacity(1024))
        .unwrap();

    for value in 0..200 {
        relay.tell(EchoMsg::Forward {
            value,
            to: probe.actor(),
        });
    }
    for expected in 0..200 {
        assert_eq!(probe.expect_message().await, expected);
    }
    system.shutdown().await;
}

#[tokio::test]
async fn test_name_conflict_leaves_original_untouched() {
    let system = start_local("conflict").await;
    let mut probe = TestProbe::<u32>::spawn(&system, "probe").await.unwrap();
    let original = system.spawn("unique", Props::new(|| Echo)).unwrap();

    let conflict = system.spawn("unique", Props::new(|| Silent));
    assert!(matches!(conflict, Err(FrameworkError::NameConflict { .. })));

    original.tell(EchoMsg::Forward {
        value: 7,
        to: probe.actor(),
    });
    assert_eq!(probe.expect_message().await, 7);
    assert!(system.is_alive(original.id()));
    system.shutdown().await;
}

#[tokio::test]
async fn test_invalid_names_are_rejected() {
    let system = start_local("names").await;
    assert!(matches!(
        system.spawn("with/slash", Props::new(|| Echo)),
        Err(FrameworkError::InvalidPathSegment { .. })
    ));
    assert!(system.spawn("", Props::new(|| Echo)).is_err());
    system.shutdown().await;
}

#[tokio::test]
async fn test_capacity_is_enforced() {
    actor_cluster::telemetry::try_setup_tracing();
    let settings = actor_cluster::ActorSystemSettings::for_testing("capacity").with_max_actors(2);
    let system = actor_cluster::ActorSystem::start(settings).await.unwrap();

    system.spawn("a", Props::new(|| Echo)).unwrap();
    system.spawn("b", Props::new(|| Echo)).unwrap();
    let third = system.spawn("c", Props::new(|| Echo));

    assert!(matches!(
        third,
        Err(FrameworkError::CapacityExhausted { max: 2 })
    ));
    system.shutdown().await;
}

#[tokio::test]
async fn test_watching_a_missing_actor_reports_unconfirmed_existence() {
    let system = start_local("watch-missing").await;
    let mut probe = TestProbe::<u32>::spawn(&system, "probe").await.unwrap();
    let gone = system.spawn("gone", Props::new(|| Echo)).unwrap();
    let mut watcher = TestProbe::<u32>::spawn(&system, "watcher").await.unwrap();
    watcher.watch(&gone);
    system.stop(&gone);
    watcher.expect_terminated(gone.id()).await;

    probe.watch(&gone);
    let terminated = probe.expect_terminated(gone.id()).await;
    assert!(!terminated.existence_confirmed);
    assert!(!terminated.node_terminated);
    system.shutdown().await;
}

// -----------------------------------------------------------------------------
// Message adapters
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
enum OwnerMsg {
    Text(String),
}

struct Owner {
    out: ActorRef<String>,
    adapters: ActorRef<ActorRef<String>>,
}

#[async_trait]
impl Behavior for Owner {
    type Message = OwnerMsg;

    async fn receive(
        &mut self,
        _ctx: &mut ActorContext<OwnerMsg>,
        msg: OwnerMsg,
    ) -> Result<Next<OwnerMsg>, ActorFailure> {
        let OwnerMsg::Text(text) = msg;
        self.out.tell(text.to_uppercase());
        Ok(Next::Same)
    }

    async fn receive_signal(
        &mut self,
        ctx: &mut ActorContext<OwnerMsg>,
        signal: Signal,
    ) -> Result<Next<OwnerMsg>, ActorFailure> {
        if signal == Signal::Start {
            let adapter = ctx.message_adapter(OwnerMsg::Text)?;
            self.adapters.tell(adapter);
        }
        Ok(Next::Unhandled)
    }
}

#[tokio::test]
async fn test_adapter_maps_messages_and_dies_with_owner() {
    let system = start_local("adapters").await;
    let mut out = TestProbe::<String>::spawn(&system, "out").await.unwrap();
    let mut adapters = TestProbe::<ActorRef<String>>::spawn(&system, "adapters")
        .await
        .unwrap();
    let (out_ref, adapters_ref) = (out.actor(), adapters.actor());
    let owner = system
        .spawn(
            "owner",
            Props::new(move || Owner {
                out: out_ref.clone(),
                adapters: adapters_ref.clone(),
            }),
        )
        .unwrap();

    let adapter = adapters.expect_message().await;
    assert!(adapter.path().starts_with(owner.path()));
    adapter.tell("hello".to_string());
    assert_eq!(out.expect_message().await, "HELLO");

    adapters.watch(&adapter);
    system.stop(&owner);
    let terminated = adapters.expect_terminated(adapter.id()).await;
    assert!(terminated.existence_confirmed);

    let mut letters = system.dead_letters().subscribe();
    adapter.tell("too late".to_string());
    let letter = letters.recv().await.unwrap();
    assert_eq!(letter.recipient, *adapter.id());
    out.expect_no_message(Duration::from_millis(100)).await;
    system.shutdown().await;
}

// -----------------------------------------------------------------------------
// Children and shutdown
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
enum ParentMsg {
    SpawnChild(String),
}

struct Parent {
    children: ActorRef<ActorRef<EchoMsg>>,
}

#[async_trait]
impl Behavior for Parent {
    type Message = ParentMsg;

    async fn receive(
        &mut self,
        ctx: &mut ActorContext<ParentMsg>,
        msg: ParentMsg,
    ) -> Result<Next<ParentMsg>, ActorFailure> {
        let ParentMsg::SpawnChild(name) = msg;
        let child = ctx.spawn(&name, Props::new(|| Echo))?;
        self.children.tell(child);
        Ok(Next::Same)
    }
}

#[tokio::test]
async fn test_children_stop_with_their_parent() {
    let system = start_local("children").await;
    let mut children = TestProbe::<ActorRef<EchoMsg>>::spawn(&system, "children")
        .await
        .unwrap();
    let children_ref = children.actor();
    let parent = system
        .spawn(
            "parent",
            Props::new(move || Parent {
                children: children_ref.clone(),
            }),
        )
        .unwrap();

    parent.tell(ParentMsg::SpawnChild("kid".into()));
    let kid = children.expect_message().await;
    assert_eq!(kid.path().parent().as_ref(), Some(parent.path()));

    children.watch(&kid);
    system.stop(&parent);
    children.expect_terminated(kid.id()).await;
    assert!(!system.is_alive(parent.id()));
    system.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let system = start_local("shutdown").await;
    system.spawn("a", Props::new(|| Echo)).unwrap();
    system.spawn("b", Props::new(|| Echo)).unwrap();
    assert_eq!(system.live_actors(), 2);

    system.shutdown().await;
    assert!(system.is_terminated());
    assert_eq!(system.live_actors(), 0);
    assert!(matches!(
        system.spawn("late", Props::new(|| Echo)),
        Err(FrameworkError::SystemShutdown)
    ));
}
