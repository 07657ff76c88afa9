use crate::greeter_actor::{greeter_key, GreeterError};
use crate::model::{GreeterMsg, Greeting};
use actor_cluster::{ActorRef, ActorSystem};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Finds greeters through the receptionist and spreads requests over them round-robin.
#[derive(Clone)]
pub struct GreeterClient {
    system: ActorSystem,
    timeout: Duration,
    next: Arc<AtomicUsize>,
}

impl GreeterClient {
    pub fn new(system: ActorSystem) -> Self {
        Self {
            system,
            timeout: Duration::from_secs(2),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Every greeter this node currently knows about, local or remote.
    pub async fn greeters(&self) -> Result<Vec<ActorRef<GreeterMsg>>, GreeterError> {
        let listing = self.system.receptionist().lookup(&greeter_key()).await?;
        Ok(listing.into_actors())
    }

    #[instrument(skip(self), fields(node = %self.system.node()))]
    pub async fn greet(&self, name: &str) -> Result<Greeting, GreeterError> {
        let mut greeters = self.greeters().await?;
        if greeters.is_empty() {
            return Err(GreeterError::NoGreeters);
        }
        greeters.sort_by(|a, b| a.id().cmp(b.id()));
        let index = self.next.fetch_add(1, Ordering::Relaxed) % greeters.len();
        let greeter = &greeters[index];
        debug!(greeter = %greeter.id(), "Sending request");
        let name = name.to_string();
        let greeting = greeter
            .ask(
                |reply_to| GreeterMsg::Greet { name, reply_to },
                self.timeout,
            )
            .await?;
        Ok(greeting)
    }

    /// Greetings handed out by `greeter` since its last (re)start.
    #[instrument(skip(self, greeter), fields(greeter = %greeter.id()))]
    pub async fn count(&self, greeter: &ActorRef<GreeterMsg>) -> Result<u64, GreeterError> {
        debug!("Sending request");
        let count = greeter
            .ask(|reply_to| GreeterMsg::Count { reply_to }, self.timeout)
            .await?;
        Ok(count)
    }
}
