pub mod mds;
pub mod offline;

use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::message::Message;
use crate::runcommand::reply::ReplyPayload;

/// Reason reported to the control plane when an inbound message cannot be
/// handled.
pub const FAIL_REASON_INTERNAL: &str = "internal-handler-exception";

/// A client-side timeout is only "expected" once the long-poll has been held
/// open at least this long.
pub const IDLE_TIMEOUT_THRESHOLD: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport stopped")]
    Stopped,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("service error ({status}): {message}")]
    Service { status: u16, message: String },
    #[error("could not encode payload: {0}")]
    Encoding(String),
    #[error("io error: {0}")]
    Io(String),
}

fn server_closed_patterns() -> &'static Regex {
    static PATTERNS: OnceLock<Regex> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        Regex::new(
            "use of closed network connection|connection closed before message completed|server closed idle connection",
        )
        .expect("closure pattern is valid")
    })
}

fn client_timeout_patterns() -> &'static Regex {
    static PATTERNS: OnceLock<Regex> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        Regex::new("timeout|timed out").expect("timeout pattern is valid")
    })
}

/// Whether a long-poll error is routine closure rather than a failure.
/// Server-side closures are always expected; a client-side timeout only
/// counts once the poll was held open past [`IDLE_TIMEOUT_THRESHOLD`].
pub fn is_expected_closure(err: &TransportError, held_open: Duration) -> bool {
    let TransportError::Transport(message) = err else {
        return false;
    };
    let message = message.to_lowercase();
    if server_closed_patterns().is_match(&message) {
        return true;
    }
    client_timeout_patterns().is_match(&message) && held_open >= IDLE_TIMEOUT_THRESHOLD
}

/// Message transport feeding the run-command pipeline. Implementations must
/// be callable from multiple threads; `stop` cancels any in-flight long-poll.
pub trait Transport: Send + Sync {
    fn get_messages(&self, instance_id: &str) -> Result<Vec<Message>, TransportError>;
    fn ack(&self, message_id: &str) -> Result<(), TransportError>;
    fn send_reply(&self, message_id: &str, payload: &ReplyPayload) -> Result<(), TransportError>;
    fn fail(&self, message_id: &str, reason: &str) -> Result<(), TransportError>;
    fn delete(&self, message_id: &str) -> Result<(), TransportError>;
    fn stop(&self);
}

/// Builds (and rebuilds, after the service's stop-policy trips) a transport
/// handle.
pub trait TransportBuilder: Send + Sync + 'static {
    type T: Transport + 'static;

    fn build(&self) -> Result<Self::T, TransportError>;
}

/// Lazily-built, rebuildable transport slot shared by the poll, reply and
/// fan-out tasks.
pub struct TransportCell<B: TransportBuilder> {
    builder: B,
    slot: Mutex<Option<std::sync::Arc<B::T>>>,
}

impl<B: TransportBuilder> TransportCell<B> {
    pub fn new(builder: B) -> Self {
        Self {
            builder,
            slot: Mutex::new(None),
        }
    }

    /// Current transport handle, building one if needed. The handle is
    /// cloned out so long-polls do not hold the slot lock.
    pub fn get(&self) -> Result<std::sync::Arc<B::T>, TransportError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            debug!("building transport handle");
            *slot = Some(std::sync::Arc::new(self.builder.build()?));
        }
        Ok(slot.as_ref().expect("slot was just filled").clone())
    }

    /// Drops the current handle so the next use reconstructs it.
    pub fn invalidate(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(transport) = slot.take() {
            transport.stop();
        }
    }

    /// Stops the current handle (cancelling any in-flight long-poll) without
    /// dropping it.
    pub fn stop(&self) {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(transport) = slot.as_ref() {
            transport.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_closure_is_always_expected() {
        let err = TransportError::Transport(
            "read tcp 10.0.0.2:443: use of closed network connection".to_string(),
        );
        assert!(is_expected_closure(&err, Duration::from_secs(0)));
        assert!(is_expected_closure(&err, Duration::from_secs(12)));
    }

    #[test]
    fn test_client_timeout_expected_only_past_threshold() {
        let err = TransportError::Transport(
            "timeout error: the request timed out. original error: ...".to_string(),
        );
        assert!(!is_expected_closure(&err, Duration::from_secs(2)));
        assert!(is_expected_closure(&err, Duration::from_secs(12)));
    }

    #[test]
    fn test_service_errors_are_never_expected() {
        let err = TransportError::Service {
            status: 500,
            message: "timed out".to_string(),
        };
        assert!(!is_expected_closure(&err, Duration::from_secs(60)));
    }
}
