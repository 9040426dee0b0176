use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::health::AgentState;

const INITIAL_PING_INTERVAL: Duration = Duration::from_secs(5 * 60);
const MAX_PING_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HibernateOutcome {
    /// The control plane acknowledged the node; start-up may resume.
    Woken,
    /// The agent is shutting down while still hibernating.
    Cancelled,
}

/// Seam for the waits between hibernation pings, so the back-off sequence is
/// testable without real time. `wait` returns true when the wait was
/// interrupted by a shutdown request.
pub trait Waiter {
    fn wait(&mut self, interval: Duration) -> bool;
}

/// Production waiter backed by the supervisor's shutdown channel: a signal
/// (or a closed channel) during the wait interrupts hibernation.
pub struct CancellableWaiter<'a>(pub &'a Receiver<()>);

impl Waiter for CancellableWaiter<'_> {
    fn wait(&mut self, interval: Duration) -> bool {
        !matches!(
            self.0.recv_timeout(interval),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

/// Blocks agent start-up until a health ping reports the node `Active`.
///
/// Pings are spaced with exponential back-off starting at five minutes and
/// capped at one hour. Log output is throttled to one warning per back-off
/// period.
pub fn block_until_active<W, F>(waiter: &mut W, mut ping: F) -> HibernateOutcome
where
    W: Waiter,
    F: FnMut() -> AgentState,
{
    info!("agent is passive, entering hibernation");
    let mut interval = INITIAL_PING_INTERVAL;
    let mut warned_at_interval = Duration::ZERO;

    loop {
        if waiter.wait(interval) {
            return HibernateOutcome::Cancelled;
        }
        match ping() {
            AgentState::Active => {
                info!("control plane acknowledged the node, leaving hibernation");
                return HibernateOutcome::Woken;
            }
            AgentState::Passive => {
                if interval != warned_at_interval {
                    warn!(
                        backoff_seconds = interval.as_secs(),
                        "node still passive, backing off"
                    );
                    warned_at_interval = interval;
                } else {
                    debug!(
                        backoff_seconds = interval.as_secs(),
                        "node still passive"
                    );
                }
            }
        }
        interval = (interval * 2).min(MAX_PING_INTERVAL);
    }
}
