mod common;

use actor_cluster::testkit::TestProbe;
use actor_cluster::{
    ActorContext, ActorFailure, ActorRef, Behavior, DeadLetterReason, FrameworkError, Next,
    Props, Signal, SupervisionStrategy,
};
use async_trait::async_trait;
use common::{start_local, Echo, EchoMsg, WAIT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// -----------------------------------------------------------------------------
// Flaky: reports every start, fails on demand
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
enum FlakyMsg {
    Fail,
    Panic,
    Add(u32),
    Get(ActorRef<u32>),
    FailBeforeReply(ActorRef<u32>),
}

struct Flaky {
    starts: ActorRef<u32>,
    total: u32,
}

#[async_trait]
impl Behavior for Flaky {
    type Message = FlakyMsg;

    async fn receive(
        &mut self,
        _ctx: &mut ActorContext<FlakyMsg>,
        msg: FlakyMsg,
    ) -> Result<Next<FlakyMsg>, ActorFailure> {
        match msg {
            FlakyMsg::Fail => return Err(ActorFailure::msg("asked to fail")),
            FlakyMsg::Panic => panic!("asked to panic"),
            FlakyMsg::Add(n) => self.total += n,
            FlakyMsg::Get(reply_to) => reply_to.tell(self.total),
            FlakyMsg::FailBeforeReply(_) => {
                return Err(ActorFailure::msg("failed before replying"));
            }
        }
        Ok(Next::Same)
    }

    async fn receive_signal(
        &mut self,
        ctx: &mut ActorContext<FlakyMsg>,
        signal: Signal,
    ) -> Result<Next<FlakyMsg>, ActorFailure> {
        if signal == Signal::Start {
            self.starts.tell(ctx.id().incarnation());
        }
        Ok(Next::Unhandled)
    }
}

fn flaky(starts: ActorRef<u32>) -> Props<FlakyMsg> {
    Props::new(move || Flaky {
        starts: starts.clone(),
        total: 0,
    })
}

#[tokio::test]
async fn test_default_strategy_stops_on_failure() {
    let system = start_local("default-stop").await;
    let mut starts = TestProbe::<u32>::spawn(&system, "starts").await.unwrap();
    let actor = system.spawn("flaky", flaky(starts.actor())).unwrap();
    starts.expect_message().await;

    starts.watch(&actor);
    actor.tell(FlakyMsg::Fail);
    let terminated = starts.expect_terminated(actor.id()).await;
    assert!(terminated.existence_confirmed);
    assert!(!system.is_alive(actor.id()));
    system.shutdown().await;
}

#[tokio::test]
async fn test_resume_keeps_state() {
    let system = start_local("resume").await;
    let mut starts = TestProbe::<u32>::spawn(&system, "starts").await.unwrap();
    let mut totals = TestProbe::<u32>::spawn(&system, "totals").await.unwrap();
    let actor = system
        .spawn(
            "flaky",
            flaky(starts.actor()).with_supervision(SupervisionStrategy::Resume),
        )
        .unwrap();
    starts.expect_message().await;

    actor.tell(FlakyMsg::Add(2));
    actor.tell(FlakyMsg::Fail);
    actor.tell(FlakyMsg::Panic);
    actor.tell(FlakyMsg::Add(3));
    actor.tell(FlakyMsg::Get(totals.actor()));

    assert_eq!(totals.expect_message().await, 5);
    starts.expect_no_message(Duration::from_millis(100)).await;
    assert!(system.is_alive(actor.id()));
    system.shutdown().await;
}

#[tokio::test]
async fn test_restart_rebuilds_state_under_new_incarnation() {
    let system = start_local("restart").await;
    let mut starts = TestProbe::<u32>::spawn(&system, "starts").await.unwrap();
    let mut totals = TestProbe::<u32>::spawn(&system, "totals").await.unwrap();
    let actor = system
        .spawn(
            "flaky",
            flaky(starts.actor())
                .with_supervision(SupervisionStrategy::restart(3, Duration::from_secs(10))),
        )
        .unwrap();
    let first = starts.expect_message().await;
    actor.tell(FlakyMsg::Add(4));
    actor.tell(FlakyMsg::Panic);
    let second = starts.expect_message().await;
    assert!(second > first);

    let current = system
        .lookup_path::<FlakyMsg>(actor.path())
        .expect("restarted actor is still registered");
    assert_eq!(current.id().incarnation(), second);
    current.tell(FlakyMsg::Get(totals.actor()));
    assert_eq!(totals.expect_message().await, 0);
    assert!(!system.is_alive(actor.id()));
    system.shutdown().await;
}

#[tokio::test]
async fn test_ask_interrupted_by_a_restart_times_out() {
    let system = start_local("ask-restart").await;
    let mut starts = TestProbe::<u32>::spawn(&system, "starts").await.unwrap();
    let actor = system
        .spawn(
            "flaky",
            flaky(starts.actor())
                .with_supervision(SupervisionStrategy::restart(3, Duration::from_secs(10))),
        )
        .unwrap();
    let first = starts.expect_message().await;

    let result = actor
        .ask(FlakyMsg::FailBeforeReply, Duration::from_millis(300))
        .await;
    assert!(matches!(result, Err(FrameworkError::AskTimeout(_))));
    assert!(starts.expect_message().await > first);
    system.shutdown().await;
}

// -----------------------------------------------------------------------------
// Supervisor: owns one flaky child and reports how it ended
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
enum SupervisorMsg {
    FailChild,
}

struct Supervisor {
    starts: ActorRef<u32>,
    outcomes: ActorRef<String>,
    strategy: SupervisionStrategy,
    handles_child_termination: bool,
}

#[async_trait]
impl Behavior for Supervisor {
    type Message = SupervisorMsg;

    async fn receive(
        &mut self,
        ctx: &mut ActorContext<SupervisorMsg>,
        msg: SupervisorMsg,
    ) -> Result<Next<SupervisorMsg>, ActorFailure> {
        let SupervisorMsg::FailChild = msg;
        if let Some(child) = ctx.child::<FlakyMsg>("child") {
            child.tell(FlakyMsg::Fail);
        }
        Ok(Next::Same)
    }

    async fn receive_signal(
        &mut self,
        ctx: &mut ActorContext<SupervisorMsg>,
        signal: Signal,
    ) -> Result<Next<SupervisorMsg>, ActorFailure> {
        match signal {
            Signal::Start => {
                let props = flaky(self.starts.clone()).with_supervision(self.strategy.clone());
                ctx.spawn("child", props)?;
                Ok(Next::Same)
            }
            Signal::ChildTerminated { escalation, .. } if self.handles_child_termination => {
                let outcome = match escalation {
                    Some(failure) => format!("escalated: {failure}"),
                    None => "stopped".to_string(),
                };
                self.outcomes.tell(outcome);
                Ok(Next::Same)
            }
            _ => Ok(Next::Unhandled),
        }
    }
}

fn supervisor(
    starts: &TestProbe<u32>,
    outcomes: &TestProbe<String>,
    strategy: SupervisionStrategy,
    handles_child_termination: bool,
) -> Props<SupervisorMsg> {
    let (starts, outcomes) = (starts.actor(), outcomes.actor());
    Props::new(move || Supervisor {
        starts: starts.clone(),
        outcomes: outcomes.clone(),
        strategy: strategy.clone(),
        handles_child_termination,
    })
}

#[tokio::test]
async fn test_restart_quota_then_escalation_to_parent() {
    let system = start_local("quota").await;
    let mut starts = TestProbe::<u32>::spawn(&system, "starts").await.unwrap();
    let mut outcomes = TestProbe::<String>::spawn(&system, "outcomes").await.unwrap();
    let strategy = SupervisionStrategy::restart(3, Duration::from_secs(10));
    let parent = system
        .spawn("parent", supervisor(&starts, &outcomes, strategy, true))
        .unwrap();

    let mut incarnations = vec![starts.expect_message().await];
    for _ in 0..3 {
        parent.tell(SupervisorMsg::FailChild);
        incarnations.push(starts.expect_message().await);
    }
    assert!(incarnations.windows(2).all(|pair| pair[0] < pair[1]));

    parent.tell(SupervisorMsg::FailChild);
    assert_eq!(outcomes.expect_message().await, "escalated: asked to fail");
    outcomes.expect_no_message(Duration::from_millis(100)).await;
    starts.expect_no_message(Duration::from_millis(50)).await;
    assert!(system.is_alive(parent.id()));
    system.shutdown().await;
}

#[tokio::test]
async fn test_stopped_child_notifies_parent_without_escalation() {
    let system = start_local("child-stop").await;
    let mut starts = TestProbe::<u32>::spawn(&system, "starts").await.unwrap();
    let mut outcomes = TestProbe::<String>::spawn(&system, "outcomes").await.unwrap();
    let parent = system
        .spawn(
            "parent",
            supervisor(&starts, &outcomes, SupervisionStrategy::Stop, true),
        )
        .unwrap();
    starts.expect_message().await;

    parent.tell(SupervisorMsg::FailChild);
    assert_eq!(outcomes.expect_message().await, "stopped");
    system.shutdown().await;
}

#[tokio::test]
async fn test_unhandled_escalation_fails_the_parent() {
    let system = start_local("escalate").await;
    let mut starts = TestProbe::<u32>::spawn(&system, "starts").await.unwrap();
    let outcomes = TestProbe::<String>::spawn(&system, "outcomes").await.unwrap();
    let parent = system
        .spawn(
            "parent",
            supervisor(&starts, &outcomes, SupervisionStrategy::Escalate, false),
        )
        .unwrap();
    starts.expect_message().await;

    starts.watch(&parent);
    parent.tell(SupervisorMsg::FailChild);
    starts.expect_terminated(parent.id()).await;
    system.shutdown().await;
}

// -----------------------------------------------------------------------------
// Escalation racing the parent's own stop
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
enum SlowMsg {
    FailAfter {
        delay: Duration,
        started: ActorRef<String>,
    },
}

struct Slow;

#[async_trait]
impl Behavior for Slow {
    type Message = SlowMsg;

    async fn receive(
        &mut self,
        _ctx: &mut ActorContext<SlowMsg>,
        msg: SlowMsg,
    ) -> Result<Next<SlowMsg>, ActorFailure> {
        let SlowMsg::FailAfter { delay, started } = msg;
        started.tell("failing".into());
        tokio::time::sleep(delay).await;
        Err(ActorFailure::msg("failed while the parent stopped"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum OwnerMsg {
    Relay(SlowMsg),
    Stop,
}

struct Owner;

#[async_trait]
impl Behavior for Owner {
    type Message = OwnerMsg;

    async fn receive(
        &mut self,
        ctx: &mut ActorContext<OwnerMsg>,
        msg: OwnerMsg,
    ) -> Result<Next<OwnerMsg>, ActorFailure> {
        match msg {
            OwnerMsg::Relay(inner) => {
                if let Some(child) = ctx.child::<SlowMsg>("slow") {
                    child.tell(inner);
                }
                Ok(Next::Same)
            }
            OwnerMsg::Stop => Ok(Next::Stop),
        }
    }

    async fn receive_signal(
        &mut self,
        ctx: &mut ActorContext<OwnerMsg>,
        signal: Signal,
    ) -> Result<Next<OwnerMsg>, ActorFailure> {
        if signal == Signal::Start {
            let props = Props::new(|| Slow).with_supervision(SupervisionStrategy::Escalate);
            ctx.spawn("slow", props)?;
            return Ok(Next::Same);
        }
        Ok(Next::Unhandled)
    }
}

#[tokio::test]
async fn test_escalation_reaching_a_stopping_parent_is_a_dead_letter() {
    let system = start_local("late-escalation").await;
    let mut started = TestProbe::<String>::spawn(&system, "started").await.unwrap();
    let owner = system.spawn("owner", Props::new(|| Owner)).unwrap();
    started.watch(&owner);
    let mut letters = system.dead_letters().subscribe();

    owner.tell(OwnerMsg::Relay(SlowMsg::FailAfter {
        delay: Duration::from_millis(200),
        started: started.actor(),
    }));
    assert_eq!(started.expect_message().await, "failing");
    owner.tell(OwnerMsg::Stop);
    started.expect_terminated(owner.id()).await;

    let letter = tokio::time::timeout(WAIT, async {
        loop {
            match letters.recv().await {
                Ok(letter) if letter.recipient == *owner.id() => return letter,
                Ok(_) => continue,
                Err(e) => panic!("dead letter feed ended: {e}"),
            }
        }
    })
    .await
    .expect("escalation recorded as a dead letter");
    assert_eq!(letter.reason, DeadLetterReason::Terminated);
    assert!(letter.message.contains("ChildTerminated"));
    assert!(letter.message.contains("failed while the parent stopped"));
    system.shutdown().await;
}

// -----------------------------------------------------------------------------
// Death watch
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
enum WatcherMsg {}

struct Watcher {
    target: ActorRef<EchoMsg>,
    terminations: Option<ActorRef<String>>,
}

#[async_trait]
impl Behavior for Watcher {
    type Message = WatcherMsg;

    async fn receive(
        &mut self,
        _ctx: &mut ActorContext<WatcherMsg>,
        msg: WatcherMsg,
    ) -> Result<Next<WatcherMsg>, ActorFailure> {
        match msg {}
    }

    async fn receive_signal(
        &mut self,
        ctx: &mut ActorContext<WatcherMsg>,
        signal: Signal,
    ) -> Result<Next<WatcherMsg>, ActorFailure> {
        match (signal, &self.terminations) {
            (Signal::Start, _) => {
                ctx.watch(&self.target);
                Ok(Next::Same)
            }
            (Signal::Terminated { id, .. }, Some(report)) => {
                report.tell(id.name().to_string());
                Ok(Next::Same)
            }
            _ => Ok(Next::Unhandled),
        }
    }
}

#[tokio::test]
async fn test_unhandled_termination_is_a_death_pact() {
    let system = start_local("death-pact").await;
    let mut probe = TestProbe::<u32>::spawn(&system, "probe").await.unwrap();
    let target = system.spawn("target", Props::new(|| Echo)).unwrap();
    let watched = target.clone();
    let watcher = system
        .spawn(
            "watcher",
            Props::new(move || Watcher {
                target: watched.clone(),
                terminations: None,
            }),
        )
        .unwrap();
    probe.watch(&watcher);

    system.stop(&target);
    probe.expect_terminated(watcher.id()).await;
    system.shutdown().await;
}

#[tokio::test]
async fn test_handled_termination_is_delivered_once() {
    let system = start_local("watch-once").await;
    let mut report = TestProbe::<String>::spawn(&system, "report").await.unwrap();
    let target = system.spawn("target", Props::new(|| Echo)).unwrap();
    let (watched, report_ref) = (target.clone(), report.actor());
    let watcher = system
        .spawn(
            "watcher",
            Props::new(move || Watcher {
                target: watched.clone(),
                terminations: Some(report_ref.clone()),
            }),
        )
        .unwrap();

    system.stop(&target);
    assert_eq!(report.expect_message().await, "target");
    report.expect_no_message(Duration::from_millis(200)).await;
    assert!(system.is_alive(watcher.id()));
    system.shutdown().await;
}

// -----------------------------------------------------------------------------
// Become
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
enum SwitchMsg {
    Toggle,
    Read(ActorRef<String>),
}

struct Off;
struct On;

#[async_trait]
impl Behavior for Off {
    type Message = SwitchMsg;

    async fn receive(
        &mut self,
        _ctx: &mut ActorContext<SwitchMsg>,
        msg: SwitchMsg,
    ) -> Result<Next<SwitchMsg>, ActorFailure> {
        match msg {
            SwitchMsg::Toggle => Ok(Next::become_(On)),
            SwitchMsg::Read(reply_to) => {
                reply_to.tell("off".into());
                Ok(Next::Same)
            }
        }
    }
}

#[async_trait]
impl Behavior for On {
    type Message = SwitchMsg;

    async fn receive(
        &mut self,
        _ctx: &mut ActorContext<SwitchMsg>,
        msg: SwitchMsg,
    ) -> Result<Next<SwitchMsg>, ActorFailure> {
        match msg {
            SwitchMsg::Toggle => Ok(Next::Stop),
            SwitchMsg::Read(reply_to) => {
                reply_to.tell("on".into());
                Ok(Next::Same)
            }
        }
    }
}

#[tokio::test]
async fn test_become_switches_behavior_and_stop_ends_it() {
    let system = start_local("become").await;
    let mut probe = TestProbe::<String>::spawn(&system, "probe").await.unwrap();
    let switch = system.spawn("switch", Props::new(|| Off)).unwrap();
    probe.watch(&switch);

    switch.tell(SwitchMsg::Read(probe.actor()));
    switch.tell(SwitchMsg::Toggle);
    switch.tell(SwitchMsg::Read(probe.actor()));
    assert_eq!(probe.expect_message().await, "off");
    assert_eq!(probe.expect_message().await, "on");

    switch.tell(SwitchMsg::Toggle);
    probe.expect_terminated(switch.id()).await;
    system.shutdown().await;
}
