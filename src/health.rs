pub mod checker;
pub mod service;

use thiserror::Error;

/// Whether the control plane wants this node doing work at all.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AgentState {
    Active,
    Passive,
}

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("health ping failed: `{0}`")]
    Ping(String),
    #[error("could not build health service: `{0}`")]
    Build(String),
}

/// Minimal "alive" ping against the control plane.
pub trait HealthService: Send {
    fn ping(&self) -> Result<(), HealthError>;
}

/// Builds (and rebuilds, after the checker's stop-policy trips) the ping
/// service handle.
pub trait HealthServiceBuilder: Send + Sync {
    type Service: HealthService + 'static;

    fn build(&self) -> Result<Self::Service, HealthError>;
}
