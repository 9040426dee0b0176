use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Start times of the most recent poll per subsystem. Two concurrent firings
/// of the same subsystem serialise through this map: only the firing whose
/// start time is still the registered one may short-circuit the scheduler.
#[derive(Default)]
pub struct PollTracker {
    polls: Mutex<HashMap<String, Instant>>,
}

impl PollTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a poll start and returns the instant to check back with.
    pub fn begin(&self, name: &str) -> Instant {
        let started = Instant::now();
        self.polls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), started);
        started
    }

    /// True when `started` is still the registered poll for `name`.
    pub fn is_current(&self, name: &str, started: Instant) -> bool {
        self.polls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|current| *current == started)
            .unwrap_or(false)
    }
}
