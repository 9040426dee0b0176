use std::sync::Arc;

use crossbeam::channel::Receiver;
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::config::AgentConfig;
use crate::core::manager::{CoreManager, MachineReboot, StopType, SystemReboot};
use crate::core::module::CoreModule;
use crate::core::rebooter::Rebooter;
use crate::document::store::DocumentStore;
use crate::engine::executor::Executor;
use crate::engine::plugin::PluginRegistry;
use crate::health::checker::HealthChecker;
use crate::health::service::HttpHealthServiceBuilder;
use crate::health::AgentState;
use crate::hibernate::{block_until_active, CancellableWaiter, HibernateOutcome};
use crate::identity::{resolve_identity, IdentityError, IdentityStore};
use crate::runcommand::poll::PollTracker;
use crate::runcommand::reply_store::ReplyStore;
use crate::runcommand::service::RunCommandService;
use crate::runcommand::transport::mds::MdsTransportBuilder;
use crate::runcommand::transport::offline::OfflineTransportBuilder;
use crate::s3::redirect::BucketRegionResolver;
use crate::s3::uploader::OutputUploader;

pub const MESSAGE_SERVICE_MODULE: &str = "MessageProcessor";
pub const OFFLINE_SERVICE_MODULE: &str = "OfflineProcessor";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitReason {
    /// The shutdown channel closed; nothing left to supervise.
    Completed,
    /// A user signal requested termination.
    Signalled,
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("identity error: `{0}`")]
    Identity(#[from] IdentityError),
    #[error("could not create bookkeeping directories: `{0}`")]
    Bookkeeping(String),
}

/// Lifecycle supervisor: resolves identity, decides between hibernation and
/// work, assembles the core manager, and unwinds it on shutdown.
pub struct Agent {
    config: AgentConfig,
    plugins: PluginRegistry,
    machine: Arc<dyn MachineReboot>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            plugins: PluginRegistry::new(),
            machine: Arc::new(SystemReboot),
        }
    }

    /// Plugin bodies are wired in by the embedding binary; the core runtime
    /// only drives them.
    pub fn with_plugin_registry(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_machine_reboot(mut self, machine: Arc<dyn MachineReboot>) -> Self {
        self.machine = machine;
        self
    }

    pub fn run(self, shutdown: Receiver<()>) -> Result<ExitReason, AgentError> {
        let identity_store = IdentityStore::new(&self.config.data_root);
        let (instance_id, region) = resolve_identity(
            self.config.instance_id.as_deref(),
            self.config.region.as_deref(),
            &identity_store,
        )?;
        info!(instance_id, region, "agent identity resolved");

        let document_store = Arc::new(DocumentStore::new(&self.config.data_root, &instance_id));
        document_store
            .ensure_dirs()
            .map_err(|err| AgentError::Bookkeeping(err.to_string()))?;
        let reply_store = Arc::new(ReplyStore::new(&self.config.data_root, &instance_id));
        reply_store
            .ensure_dir()
            .map_err(|err| AgentError::Bookkeeping(err.to_string()))?;

        let endpoint = self.config.message_service_endpoint(&region);
        let health = HealthChecker::new(
            HttpHealthServiceBuilder::new(endpoint.clone()),
            self.config.health_check_interval_minutes,
        );

        if health.check_now() == AgentState::Passive {
            let mut waiter = CancellableWaiter(&shutdown);
            if block_until_active(&mut waiter, || health.check_now())
                == HibernateOutcome::Cancelled
            {
                return Ok(ExitReason::Signalled);
            }
        }

        let (rebooter, reboot_consumer) = Rebooter::channel();
        let poll_tracker = Arc::new(PollTracker::new());

        let resolver =
            BucketRegionResolver::new(&region, self.config.object_storage_endpoint.clone());
        let executor = Executor::new(
            Arc::new(self.plugins),
            rebooter.clone(),
            document_store.clone(),
        );
        let executor = match OutputUploader::new(resolver) {
            Ok(uploader) => executor.with_uploader(Arc::new(uploader)),
            Err(err) => {
                warn!(%err, "output uploads disabled");
                executor
            }
        };
        let executor = Arc::new(executor);

        let message_service = RunCommandService::new(
            MESSAGE_SERVICE_MODULE,
            &instance_id,
            MdsTransportBuilder::new(endpoint),
            executor.clone(),
            self.config.command_workers,
            poll_tracker.clone(),
            Some(reply_store),
            document_store.clone(),
            rebooter.clone(),
        );
        let offline_service = RunCommandService::new(
            OFFLINE_SERVICE_MODULE,
            &instance_id,
            OfflineTransportBuilder::new(&self.config.data_root),
            executor,
            self.config.command_workers,
            poll_tracker,
            None,
            document_store,
            rebooter.clone(),
        );

        let modules: Vec<Box<dyn CoreModule>> = vec![
            Box::new(health),
            Box::new(message_service),
            Box::new(offline_service),
        ];
        let manager = CoreManager::new(modules);
        info!("starting the core manager");
        manager.start(reboot_consumer, self.machine.clone());

        // block here until a user signal arrives; a reboot request unwinds
        // through the manager's watcher instead
        let signalled = shutdown.recv().is_ok();
        info!("shutdown requested, stopping core modules");
        manager.stop(StopType::Hard);

        if signalled {
            Ok(ExitReason::Signalled)
        } else {
            Ok(ExitReason::Completed)
        }
    }
}
