use std::sync::Mutex;

/// Counted circuit breaker gating a subsystem's liveness. A policy with
/// `max_errors == 0` never becomes unhealthy.
pub struct StopPolicy {
    name: String,
    max_errors: u32,
    error_count: Mutex<u32>,
}

impl StopPolicy {
    pub fn new<S: Into<String>>(name: S, max_errors: u32) -> Self {
        Self {
            name: name.into(),
            max_errors,
            error_count: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_healthy(&self) -> bool {
        let count = self.error_count.lock().unwrap_or_else(|e| e.into_inner());
        self.max_errors == 0 || *count < self.max_errors
    }

    pub fn add_errors(&self, n: u32) {
        let mut count = self.error_count.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_add(n);
    }

    pub fn reset(&self) {
        let mut count = self.error_count.lock().unwrap_or_else(|e| e.into_inner());
        *count = 0;
    }
}
