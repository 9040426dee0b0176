use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::{error, info};

/// One-shot request a plugin can make against the agent lifecycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RebootRequest {
    Reboot,
    Shutdown,
}

/// Process-wide reboot signalling, constructed once by the supervisor and
/// threaded through to the subsystems that may request a reboot. A pending
/// reboot is only fired after the requesting document's final reply went out.
pub struct Rebooter {
    requests: Sender<RebootRequest>,
    pending: AtomicBool,
    fired: AtomicBool,
}

impl Rebooter {
    /// Builds the rebooter and the receiving side the core manager watches.
    /// The channel holds a single request; the watcher only ever consumes
    /// one.
    pub fn channel() -> (Arc<Self>, Receiver<RebootRequest>) {
        let (requests, watcher) = bounded(1);
        (
            Arc::new(Self {
                requests,
                pending: AtomicBool::new(false),
                fired: AtomicBool::new(false),
            }),
            watcher,
        )
    }

    /// Enqueues a lifecycle request directly onto the channel.
    pub fn request(&self, request: RebootRequest) {
        if self.requests.try_send(request).is_err() {
            error!(?request, "lifecycle request dropped, watcher already served");
        }
    }

    /// Marks that a reboot should happen once in-flight work has reported.
    pub fn request_pending_reboot(&self) {
        info!("reboot requested, deferring until results are reported");
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn is_reboot_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Publishes the reboot request if one is pending. Fires at most once per
    /// agent lifetime.
    pub fn fire_if_pending(&self) {
        if !self.pending.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.requests.try_send(RebootRequest::Reboot).is_err() {
            error!("could not publish reboot request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fire_only_when_pending() {
        let (rebooter, watcher) = Rebooter::channel();

        rebooter.fire_if_pending();
        assert!(watcher.recv_timeout(Duration::from_millis(20)).is_err());

        rebooter.request_pending_reboot();
        assert!(rebooter.is_reboot_pending());
        rebooter.fire_if_pending();
        assert_eq!(
            watcher.recv_timeout(Duration::from_millis(20)),
            Ok(RebootRequest::Reboot)
        );
        assert!(!rebooter.is_reboot_pending());
    }

    #[test]
    fn test_fires_at_most_once() {
        let (rebooter, watcher) = Rebooter::channel();
        rebooter.request_pending_reboot();
        rebooter.fire_if_pending();
        rebooter.request_pending_reboot();
        rebooter.fire_if_pending();

        assert_eq!(
            watcher.recv_timeout(Duration::from_millis(20)),
            Ok(RebootRequest::Reboot)
        );
        assert!(watcher.recv_timeout(Duration::from_millis(20)).is_err());
    }
}
