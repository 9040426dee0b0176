pub use crate::agent::config::AgentConfig;
pub use crate::agent::supervisor::{Agent, ExitReason};
pub use crate::cli::Cli;

pub mod agent;
pub mod cli;
pub mod core;
pub mod document;
pub mod engine;
pub mod health;
pub mod hibernate;
pub mod http;
pub mod identity;
pub mod logging;
pub mod message;
pub mod runcommand;
pub mod s3;
pub mod scheduler;
