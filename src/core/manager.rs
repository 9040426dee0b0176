use std::sync::Arc;
use std::thread::Builder;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{error, info, warn};

use crate::core::module::{CoreModule, ModuleWrapper};
use crate::core::rebooter::RebootRequest;

/// Per-module wait granted to a cooperative stop.
const SOFT_STOP_WAIT: Duration = Duration::from_secs(30);
/// Total budget for a hard stop across all modules.
const HARD_STOP_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopType {
    Soft,
    Hard,
}

/// Hook invoked after a reboot request has unwound the modules.
pub trait MachineReboot: Send + Sync {
    fn reboot(&self);
}

/// Reboots through the OS; kept at the edge so tests can observe the call.
pub struct SystemReboot;

impl MachineReboot for SystemReboot {
    fn reboot(&self) {
        info!("initiating machine reboot");
        #[cfg(target_family = "unix")]
        if let Err(err) = std::process::Command::new("shutdown")
            .args(["-r", "now"])
            .status()
        {
            error!(%err, "could not invoke shutdown");
        }
    }
}

/// Owns the ordered set of module wrappers, starts them concurrently and
/// orchestrates soft/hard stop. A background watcher consumes at most one
/// reboot request per lifetime.
pub struct CoreManager {
    wrappers: Vec<Arc<ModuleWrapper>>,
}

impl CoreManager {
    pub fn new(modules: Vec<Box<dyn CoreModule>>) -> Self {
        Self {
            wrappers: modules
                .into_iter()
                .map(|m| Arc::new(ModuleWrapper::new(m)))
                .collect(),
        }
    }

    /// Launches every module concurrently without waiting for completion, and
    /// starts the reboot watcher.
    pub fn start(&self, reboot_requests: Receiver<RebootRequest>, machine: Arc<dyn MachineReboot>) {
        for wrapper in &self.wrappers {
            let wrapper = wrapper.clone();
            Builder::new()
                .name(wrapper.module_name().to_string())
                .spawn(move || {
                    info!(module = wrapper.module_name(), "starting core module");
                    if let Err(err) = wrapper.module_execute() {
                        error!(module = wrapper.module_name(), %err, "core module failed to start");
                    }
                })
                .expect("spawning a module thread cannot fail");
        }
        self.spawn_reboot_watcher(reboot_requests, machine);
    }

    pub fn stop(&self, stop_type: StopType) {
        info!(?stop_type, "stopping core modules");
        stop_all(&self.wrappers, stop_type);
    }

    fn spawn_reboot_watcher(
        &self,
        reboot_requests: Receiver<RebootRequest>,
        machine: Arc<dyn MachineReboot>,
    ) {
        let wrappers = self.wrappers.clone();
        Builder::new()
            .name("reboot_watcher".to_string())
            .spawn(move || {
                match reboot_requests.recv() {
                    Ok(RebootRequest::Reboot) => {
                        info!("reboot request received, unwinding core modules");
                        stop_all(&wrappers, StopType::Soft);
                        machine.reboot();
                    }
                    Ok(other) => {
                        warn!(request = ?other, "unsupported reboot request");
                    }
                    Err(_) => {
                        // channel closed on shutdown, nothing to act on
                    }
                }
            })
            .expect("spawning the reboot watcher cannot fail");
    }
}

/// Requests a stop on each wrapper in parallel. Soft waits for all to finish;
/// hard returns once the shared deadline elapses regardless of stragglers.
fn stop_all(wrappers: &[Arc<ModuleWrapper>], stop_type: StopType) {
    let wait = match stop_type {
        StopType::Soft => SOFT_STOP_WAIT,
        StopType::Hard => HARD_STOP_DEADLINE,
    };

    let (done_tx, done_rx) = bounded(wrappers.len());
    for wrapper in wrappers {
        let wrapper = wrapper.clone();
        let done_tx = done_tx.clone();
        Builder::new()
            .name(format!("{}_stopper", wrapper.module_name()))
            .spawn(move || {
                let result = wrapper.module_stop(wait);
                if let Err(err) = &result {
                    warn!(module = wrapper.module_name(), %err, "module stop returned error");
                }
                let _ = done_tx.send(wrapper.module_name().to_string());
            })
            .expect("spawning a stopper thread cannot fail");
    }
    drop(done_tx);

    match stop_type {
        StopType::Soft => {
            // wait for every module to report
            while done_rx.recv().is_ok() {}
        }
        StopType::Hard => {
            let deadline = Instant::now() + HARD_STOP_DEADLINE;
            let mut remaining = wrappers.len();
            while remaining > 0 {
                match done_rx.recv_deadline(deadline) {
                    Ok(_) => remaining -= 1,
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(remaining, "hard stop deadline reached with modules still stopping");
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
    }
}
