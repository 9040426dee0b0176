use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SchedulerError {
    #[error("scheduled job `{0}` panicked")]
    JobPanicked(String),
}

/// A recurring agent job on its own named thread, in place of a cron-style
/// scheduler library. The body runs once per firing and decides the pause
/// before the next one, which lets the poll loop reschedule itself
/// immediately after a long-poll, back off after service errors, or fall
/// back to a fixed cadence, all through the same mechanism. Cancellation is
/// an explicit quit channel selected against the pause.
pub struct PeriodicJob {
    name: String,
    quit: Sender<()>,
    handle: JoinHandle<()>,
}

impl PeriodicJob {
    /// Starts firing immediately. `body` returns the pause until the next
    /// firing; `Duration::ZERO` reschedules at once.
    pub fn spawn<F>(name: &str, body: F) -> Self
    where
        F: FnMut() -> Duration + Send + 'static,
    {
        Self::spawn_after(name, Duration::ZERO, body)
    }

    /// Like [`PeriodicJob::spawn`], but holds off the first firing by
    /// `delay`. A stop request during the delay wins over the first firing.
    pub fn spawn_after<F>(name: &str, delay: Duration, mut body: F) -> Self
    where
        F: FnMut() -> Duration + Send + 'static,
    {
        let (quit, quit_signal) = bounded::<()>(1);
        let handle = Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut pause = delay;
                loop {
                    match quit_signal.recv_timeout(pause) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                    pause = body();
                }
            })
            .expect("spawning a scheduler thread cannot fail");
        Self {
            name: name.to_string(),
            quit,
            handle,
        }
    }

    /// Asks the job to quit and waits for any in-flight firing to return.
    /// The wall-clock bound is therefore the body's own runtime; callers
    /// needing a hard deadline wrap this in [`crate::core::module::ModuleWrapper`].
    pub fn stop(self) -> Result<(), SchedulerError> {
        // a send failure means the thread is already gone; join either way
        let _ = self.quit.try_send(());
        self.handle
            .join()
            .map_err(|_| SchedulerError::JobPanicked(self.name))
    }
}
