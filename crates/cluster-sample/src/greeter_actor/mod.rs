//! # Greeter Actor
//!
//! A stateless-looking actor with a little state: it counts the greetings it handed out. Every
//! greeter registers itself with the receptionist under [`greeter_key`] when it starts, so
//! clients on any node can find it.
//!
//! An empty name is a failure. Greeters restart on failure, which resets the counter and gives
//! the greeter a new incarnation (and therefore a fresh registration).

pub mod error;

pub use error::*;

use crate::model::{GreeterMsg, Greeting};
use actor_cluster::{
    ActorContext, ActorFailure, Behavior, Next, Props, RegistrationKey, Signal,
    SupervisionStrategy,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

pub fn greeter_key() -> RegistrationKey<GreeterMsg> {
    RegistrationKey::new("greeter")
}

/// Props for a greeter that restarts up to three times a minute.
pub fn props() -> Props<GreeterMsg> {
    Props::new(Greeter::default)
        .with_supervision(SupervisionStrategy::restart(3, Duration::from_secs(60)))
}

#[derive(Default)]
pub struct Greeter {
    greeted: u64,
}

#[async_trait]
impl Behavior for Greeter {
    type Message = GreeterMsg;

    async fn receive(
        &mut self,
        ctx: &mut ActorContext<GreeterMsg>,
        msg: GreeterMsg,
    ) -> Result<Next<GreeterMsg>, ActorFailure> {
        match msg {
            GreeterMsg::Greet { name, reply_to } => {
                if name.trim().is_empty() {
                    return Err(GreeterError::EmptyName.into());
                }
                self.greeted += 1;
                debug!(greeter = %ctx.id(), %name, greeted = self.greeted, "Greeting");
                reply_to.tell(Greeting {
                    text: format!("Hello, {name}!"),
                    greeted_by: ctx.system().node().node.to_string(),
                });
            }
            GreeterMsg::Count { reply_to } => reply_to.tell(self.greeted),
        }
        Ok(Next::Same)
    }

    async fn receive_signal(
        &mut self,
        ctx: &mut ActorContext<GreeterMsg>,
        signal: Signal,
    ) -> Result<Next<GreeterMsg>, ActorFailure> {
        if signal != Signal::Start {
            return Ok(Next::Unhandled);
        }
        let registered = ctx
            .system()
            .receptionist()
            .register(&greeter_key(), &ctx.myself())
            .await;
        match registered {
            Ok(true) => info!(greeter = %ctx.id(), "Greeter registered"),
            Ok(false) => debug!(greeter = %ctx.id(), "Greeter was already registered"),
            Err(e) => warn!(greeter = %ctx.id(), error = %e, "Greeter registration failed"),
        }
        Ok(Next::Same)
    }
}
