use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::document::state::{DocumentStatus, PluginConfiguration};

/// Plugin whose result triggers the association refresh collaborator.
pub const REFRESH_ASSOCIATION_PLUGIN: &str = "aws:refreshAssociation";

/// Cooperative cancellation flag polled between plugin steps.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancel flags of the documents currently executing, keyed by command id.
#[derive(Default)]
pub struct CancelFlagRegistry {
    flags: Mutex<HashMap<String, CancelFlag>>,
}

impl CancelFlagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, command_id: &str) -> CancelFlag {
        let flag = CancelFlag::new();
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(command_id.to_string(), flag.clone());
        flag
    }

    /// Flips the flag of a running command. Returns false when the command is
    /// not executing (already finished, or never arrived).
    pub fn cancel(&self, command_id: &str) -> bool {
        match self
            .flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(command_id)
        {
            Some(flag) => {
                flag.set();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, command_id: &str) {
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(command_id);
    }
}

/// What a plugin body reports back; the executor stamps timing and output
/// routing around it.
#[derive(Debug, Clone)]
pub struct PluginOutcome {
    pub status: DocumentStatus,
    pub code: i32,
    pub output: String,
    pub standard_output: String,
    pub standard_error: String,
    pub error: Option<String>,
}

impl PluginOutcome {
    pub fn success() -> Self {
        Self {
            status: DocumentStatus::Success,
            code: 0,
            output: String::new(),
            standard_output: String::new(),
            standard_error: String::new(),
            error: None,
        }
    }

    pub fn failed(code: i32, error: impl Into<String>) -> Self {
        Self {
            status: DocumentStatus::Failed,
            code,
            output: String::new(),
            standard_output: String::new(),
            standard_error: String::new(),
            error: Some(error.into()),
        }
    }
}

/// A named unit of work executed by the engine. Bodies live outside the core
/// runtime; the engine only locates, gates and drives them.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Platforms (as `std::env::consts::OS` values) the plugin supports.
    /// Empty means every platform.
    fn supported_platforms(&self) -> &[&str] {
        &[]
    }

    fn run(&self, configuration: &PluginConfiguration, cancel: &CancelFlag) -> PluginOutcome;
}

/// Two registries: long-running plugins win over workers on a name conflict.
#[derive(Default)]
pub struct PluginRegistry {
    long_running: HashMap<String, Arc<dyn Plugin>>,
    workers: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_long_running(&mut self, plugin: Arc<dyn Plugin>) {
        self.long_running.insert(plugin.name().to_string(), plugin);
    }

    pub fn register_worker(&mut self, plugin: Arc<dyn Plugin>) {
        self.workers.insert(plugin.name().to_string(), plugin);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.long_running
            .get(name)
            .or_else(|| self.workers.get(name))
            .cloned()
    }

    pub fn platform_supported(plugin: &dyn Plugin) -> bool {
        let platforms = plugin.supported_platforms();
        platforms.is_empty() || platforms.contains(&std::env::consts::OS)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Plugin returning a fixed outcome, optionally claiming an impossible
    /// platform or panicking.
    pub(crate) struct StaticPlugin {
        pub name: String,
        pub outcome: PluginOutcome,
        pub platforms: Vec<&'static str>,
        pub panics: bool,
    }

    impl StaticPlugin {
        pub(crate) fn succeeding(name: &str) -> Self {
            Self {
                name: name.to_string(),
                outcome: PluginOutcome::success(),
                platforms: Vec::new(),
                panics: false,
            }
        }

        pub(crate) fn with_status(name: &str, status: DocumentStatus) -> Self {
            let mut plugin = Self::succeeding(name);
            plugin.outcome.status = status;
            plugin
        }
    }

    impl Plugin for StaticPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn supported_platforms(&self) -> &[&str] {
            &self.platforms
        }

        fn run(&self, _configuration: &PluginConfiguration, _cancel: &CancelFlag) -> PluginOutcome {
            if self.panics {
                panic!("plugin body exploded");
            }
            self.outcome.clone()
        }
    }

    #[test]
    fn test_long_running_wins_on_conflict() {
        let mut registry = PluginRegistry::new();
        let mut long_running = StaticPlugin::succeeding("aws:conflicted");
        long_running.outcome.output = "long-running".to_string();
        let mut worker = StaticPlugin::succeeding("aws:conflicted");
        worker.outcome.output = "worker".to_string();

        registry.register_worker(Arc::new(worker));
        registry.register_long_running(Arc::new(long_running));

        let resolved = registry.resolve("aws:conflicted").unwrap();
        let outcome = resolved.run(&PluginConfiguration::default(), &CancelFlag::new());
        assert_eq!(outcome.output, "long-running");
    }

    #[test]
    fn test_resolve_unknown_plugin() {
        let registry = PluginRegistry::new();
        assert!(registry.resolve("aws:unknown").is_none());
    }

    #[test]
    fn test_platform_gate() {
        let everywhere = StaticPlugin::succeeding("aws:everywhere");
        assert!(PluginRegistry::platform_supported(&everywhere));

        let mut nowhere = StaticPlugin::succeeding("aws:nowhere");
        nowhere.platforms = vec!["plan9"];
        assert!(!PluginRegistry::platform_supported(&nowhere));
    }

    #[test]
    fn test_cancel_flag_registry() {
        let registry = CancelFlagRegistry::new();
        let flag = registry.register("cmd-1");
        assert!(!flag.is_set());

        assert!(registry.cancel("cmd-1"));
        assert!(flag.is_set());

        assert!(!registry.cancel("cmd-unknown"));

        registry.remove("cmd-1");
        assert!(!registry.cancel("cmd-1"));
    }
}
