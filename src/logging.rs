use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Default directive when `RUST_LOG` is unset: info everywhere, so the poll
/// and reply loops stay quiet unless a deployment asks for more.
const DEFAULT_LOG_DIRECTIVE: &str = "info";

#[derive(Error, Debug)]
#[error("could not install the tracing subscriber: {0}")]
pub struct LoggingInitError(String);

/// Installs the process-wide tracing subscriber. Must run before any
/// subsystem starts logging; a second call fails.
pub fn init_logging() -> Result<(), LoggingInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| LoggingInitError(err.to_string()))
}
