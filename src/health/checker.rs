use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::{AgentState, HealthServiceBuilder};
use crate::core::module::{CoreModule, ModuleError};
use crate::core::stop_policy::StopPolicy;
use crate::health::HealthService;
use crate::scheduler::PeriodicJob;

pub const HEALTH_MODULE_NAME: &str = "HealthCheck";

const MIN_PING_INTERVAL_MINUTES: u64 = 5;
const MAX_PING_INTERVAL_MINUTES: u64 = 60;
/// Consecutive ping failures tolerated before the service handle is rebuilt.
const MAX_PING_ERRORS: u32 = 5;
/// Upper bound of the random delay before the first ping, so a fleet
/// restarting at once does not align its health traffic.
const FIRST_PING_JITTER_MILLIS: u64 = 5_000;

/// Periodic health ping deciding whether the agent is `Active` or `Passive`.
pub struct HealthChecker<B: HealthServiceBuilder> {
    builder: Arc<B>,
    interval: Duration,
    first_ping_jitter: Duration,
    state: Arc<Mutex<AgentState>>,
    stop_policy: Arc<StopPolicy>,
    job: Option<PeriodicJob>,
}

impl<B> HealthChecker<B>
where
    B: HealthServiceBuilder + 'static,
{
    /// `interval_minutes` is clamped to `[5, 60]`.
    pub fn new(builder: B, interval_minutes: u64) -> Self {
        let minutes = interval_minutes.clamp(MIN_PING_INTERVAL_MINUTES, MAX_PING_INTERVAL_MINUTES);
        let mut checker = Self::with_interval(builder, Duration::from_secs(minutes * 60));
        checker.first_ping_jitter = Duration::from_millis(FIRST_PING_JITTER_MILLIS);
        checker
    }

    fn with_interval(builder: B, interval: Duration) -> Self {
        Self {
            builder: Arc::new(builder),
            interval,
            first_ping_jitter: Duration::ZERO,
            state: Arc::new(Mutex::new(AgentState::Passive)),
            stop_policy: Arc::new(StopPolicy::new(HEALTH_MODULE_NAME, MAX_PING_ERRORS)),
            job: None,
        }
    }

    pub fn agent_state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Builds a fresh service handle and pings once, synchronously. Used at
    /// start-up and by the hibernation loop.
    pub fn check_now(&self) -> AgentState {
        let outcome = self.builder.build().and_then(|service| service.ping());
        let state = match outcome {
            Ok(()) => AgentState::Active,
            Err(err) => {
                debug!(%err, "health ping failed");
                AgentState::Passive
            }
        };
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        state
    }
}

fn update_state(state: &Mutex<AgentState>, value: AgentState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

impl<B> CoreModule for HealthChecker<B>
where
    B: HealthServiceBuilder + 'static,
{
    fn module_name(&self) -> &str {
        HEALTH_MODULE_NAME
    }

    fn module_execute(&mut self) -> Result<(), ModuleError> {
        let builder = self.builder.clone();
        let state = self.state.clone();
        let stop_policy = self.stop_policy.clone();
        let interval = self.interval;

        // spread fleet restarts so the first pings do not align
        let first_ping_delay = if self.first_ping_jitter.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(
                rand::thread_rng().gen_range(0..self.first_ping_jitter.as_millis() as u64),
            )
        };

        let mut service: Option<B::Service> = None;
        let job = PeriodicJob::spawn_after(HEALTH_MODULE_NAME, first_ping_delay, move || {
            if service.is_none() {
                match builder.build() {
                    Ok(built) => service = Some(built),
                    Err(err) => {
                        warn!(%err, "could not build health service");
                        stop_policy.add_errors(1);
                        update_state(&state, AgentState::Passive);
                    }
                }
            }

            if let Some(handle) = &service {
                match handle.ping() {
                    Ok(()) => update_state(&state, AgentState::Active),
                    Err(err) => {
                        warn!(%err, "health ping failed");
                        stop_policy.add_errors(1);
                        update_state(&state, AgentState::Passive);
                    }
                }
            }

            if !stop_policy.is_healthy() {
                debug!("health stop-policy tripped, recreating service handle");
                stop_policy.reset();
                service = None;
            }

            interval
        });

        self.job = Some(job);
        Ok(())
    }

    fn module_stop(&mut self) -> Result<(), ModuleError> {
        match self.job.take() {
            Some(job) => job.stop().map_err(|err| {
                ModuleError::Failed(HEALTH_MODULE_NAME.to_string(), err.to_string())
            }),
            None => Err(ModuleError::NeverStarted(HEALTH_MODULE_NAME.to_string())),
        }
    }
}
