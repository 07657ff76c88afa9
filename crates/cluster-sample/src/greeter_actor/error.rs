use actor_cluster::FrameworkError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GreeterError {
    #[error("No greeter is registered anywhere in the cluster")]
    NoGreeters,
    #[error("Cannot greet an empty name")]
    EmptyName,
    #[error("Cluster did not converge within {0:?}")]
    NotConverged(Duration),
    #[error("No node at index {0}")]
    UnknownNode(usize),
    #[error(transparent)]
    Framework(#[from] FrameworkError),
}
