use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::Builder;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModuleError {
    #[error("module `{0}` already started")]
    AlreadyStarted(String),
    #[error("module `{0}` never started")]
    NeverStarted(String),
    #[error("module `{0}` stop timed out")]
    StopTimeout(String),
    #[error("module `{0}` panicked: {1}")]
    Panicked(String, String),
    #[error("module `{0}` failed: {1}")]
    Failed(String, String),
}

/// A long-running agent subsystem supervised by the core manager.
///
/// `module_execute` must start the module's background work and return; it is
/// invoked at most once. `module_stop` must be safe to call from a different
/// thread than the one that executed.
pub trait CoreModule: Send {
    fn module_name(&self) -> &str;
    fn module_execute(&mut self) -> Result<(), ModuleError>;
    fn module_stop(&mut self) -> Result<(), ModuleError>;
}

enum StopState {
    Idle,
    InProgress,
    Done(Result<(), ModuleError>),
}

/// Uniform lifecycle around a [`CoreModule`]: single execution, idempotent
/// bounded stop, and panic isolation so a broken module cannot take the
/// manager down with it.
pub struct ModuleWrapper {
    name: String,
    module: Arc<Mutex<Box<dyn CoreModule>>>,
    started: AtomicBool,
    stop_state: Arc<(Mutex<StopState>, Condvar)>,
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl ModuleWrapper {
    pub fn new(module: Box<dyn CoreModule>) -> Self {
        let name = module.module_name().to_string();
        Self {
            name,
            module: Arc::new(Mutex::new(module)),
            started: AtomicBool::new(false),
            stop_state: Arc::new((Mutex::new(StopState::Idle), Condvar::new())),
        }
    }

    pub fn module_name(&self) -> &str {
        &self.name
    }

    /// Runs the module's execute hook. Fails on a second call, and converts a
    /// panic into an error return.
    pub fn module_execute(&self) -> Result<(), ModuleError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ModuleError::AlreadyStarted(self.name.clone()));
        }

        let module = self.module.clone();
        let outcome = catch_unwind(AssertUnwindSafe(move || {
            module
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .module_execute()
        }));
        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload);
                error!(module = self.name, panic = message, "module execute panicked");
                Err(ModuleError::Panicked(self.name.clone(), message))
            }
        }
    }

    /// Requests a stop bounded by `wait`. The underlying stop hook runs on a
    /// helper thread; if it outlives `wait` the caller gets `StopTimeout`
    /// while the hook keeps running, and later callers observe its eventual
    /// result.
    pub fn module_stop(&self, wait: Duration) -> Result<(), ModuleError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ModuleError::NeverStarted(self.name.clone()));
        }

        let (lock, cvar) = &*self.stop_state;
        {
            let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
            match &*state {
                StopState::Done(result) => return result.clone(),
                StopState::InProgress => {}
                StopState::Idle => {
                    *state = StopState::InProgress;
                    self.spawn_stop_thread();
                }
            }
        }

        let deadline = Instant::now() + wait;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let StopState::Done(result) = &*state {
                return result.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ModuleError::StopTimeout(self.name.clone()));
            }
            let (guard, _) = cvar
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    fn spawn_stop_thread(&self) {
        let module = self.module.clone();
        let stop_state = self.stop_state.clone();
        let name = self.name.clone();
        Builder::new()
            .name(format!("{}_stop", self.name))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    module
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .module_stop()
                }));
                let result = match outcome {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(payload);
                        error!(module = name, panic = message, "module stop panicked");
                        Err(ModuleError::Panicked(name, message))
                    }
                };
                let (lock, cvar) = &*stop_state;
                *lock.lock().unwrap_or_else(|e| e.into_inner()) = StopState::Done(result);
                cvar.notify_all();
            })
            .expect("spawning a stop thread cannot fail");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::thread::sleep;

    /// Scriptable module for wrapper and manager tests.
    pub(crate) struct FakeModule {
        pub name: String,
        pub stop_delay: Duration,
        pub panic_on_execute: bool,
        pub panic_on_stop: bool,
    }

    impl FakeModule {
        pub(crate) fn named(name: &str) -> Self {
            Self {
                name: name.to_string(),
                stop_delay: Duration::ZERO,
                panic_on_execute: false,
                panic_on_stop: false,
            }
        }
    }

    impl CoreModule for FakeModule {
        fn module_name(&self) -> &str {
            &self.name
        }

        fn module_execute(&mut self) -> Result<(), ModuleError> {
            if self.panic_on_execute {
                panic!("execute exploded");
            }
            Ok(())
        }

        fn module_stop(&mut self) -> Result<(), ModuleError> {
            if self.panic_on_stop {
                panic!("stop exploded");
            }
            sleep(self.stop_delay);
            Ok(())
        }
    }

    #[test]
    fn test_execute_at_most_once() {
        let wrapper = ModuleWrapper::new(Box::new(FakeModule::named("health")));
        assert!(wrapper.module_execute().is_ok());
        assert_matches!(
            wrapper.module_execute(),
            Err(ModuleError::AlreadyStarted(name)) if name == "health"
        );
    }

    #[test]
    fn test_stop_before_start_fails() {
        let wrapper = ModuleWrapper::new(Box::new(FakeModule::named("health")));
        assert_matches!(
            wrapper.module_stop(Duration::from_millis(10)),
            Err(ModuleError::NeverStarted(_))
        );
    }

    #[test]
    fn test_execute_panic_is_recovered() {
        let mut module = FakeModule::named("broken");
        module.panic_on_execute = true;
        let wrapper = ModuleWrapper::new(Box::new(module));
        assert_matches!(
            wrapper.module_execute(),
            Err(ModuleError::Panicked(_, message)) if message.contains("execute exploded")
        );
    }

    #[test]
    fn test_slow_stop_times_out_and_later_callers_see_result() {
        let mut module = FakeModule::named("slow");
        module.stop_delay = Duration::from_millis(300);
        let wrapper = Arc::new(ModuleWrapper::new(Box::new(module)));
        wrapper.module_execute().unwrap();

        let started = Instant::now();
        assert_matches!(
            wrapper.module_stop(Duration::from_millis(50)),
            Err(ModuleError::StopTimeout(_))
        );
        assert!(started.elapsed() < Duration::from_millis(250));

        // The background stop finishes; a later caller observes its result.
        assert!(wrapper.module_stop(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let wrapper = ModuleWrapper::new(Box::new(FakeModule::named("health")));
        wrapper.module_execute().unwrap();
        assert!(wrapper.module_stop(Duration::from_secs(1)).is_ok());
        assert!(wrapper.module_stop(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_stop_panic_is_recovered() {
        let mut module = FakeModule::named("broken");
        module.panic_on_stop = true;
        let wrapper = ModuleWrapper::new(Box::new(module));
        wrapper.module_execute().unwrap();
        assert_matches!(
            wrapper.module_stop(Duration::from_secs(1)),
            Err(ModuleError::Panicked(_, message)) if message.contains("stop exploded")
        );
    }
}
