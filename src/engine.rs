pub mod executor;
pub mod plugin;
pub mod processor;
