//! Data exchanged between greeters and their callers. Everything here crosses node boundaries,
//! so every type is serializable.

use actor_cluster::ActorRef;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub text: String,
    /// The node the answering greeter runs on.
    pub greeted_by: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum GreeterMsg {
    Greet {
        name: String,
        reply_to: ActorRef<Greeting>,
    },
    /// Number of greetings handed out by the current incarnation.
    Count { reply_to: ActorRef<u64> },
}
