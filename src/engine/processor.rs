use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

use chrono::Utc;
use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::core::module::panic_message;
use crate::document::state::{DocumentState, DocumentStatus, PluginResult};
use crate::engine::executor::{DocumentResultEvent, Executor};
use crate::engine::plugin::CancelFlagRegistry;

/// The cancel pool is deliberately small and separate so cancels are never
/// starved by long-running commands.
pub const CANCEL_WORKERS: usize = 3;
pub const DEFAULT_COMMAND_WORKERS: usize = 5;

#[derive(Error, Debug, PartialEq)]
pub enum ProcessorError {
    #[error("processor is stopped")]
    Stopped,
}

/// Bounded worker pools driving documents through the executor. Commands and
/// cancels run on separate pools; steps within one document stay sequential
/// while different documents execute concurrently.
pub struct Processor {
    command_jobs: Sender<DocumentState>,
    cancel_jobs: Sender<DocumentState>,
    workers: Vec<JoinHandle<()>>,
    cancel_flags: Arc<CancelFlagRegistry>,
}

/// Cloneable submission handle for the poll path. All handles must be
/// dropped before [`Processor::stop`] can drain the pools.
#[derive(Clone)]
pub struct ProcessorHandle {
    command_jobs: Sender<DocumentState>,
    cancel_jobs: Sender<DocumentState>,
}

impl ProcessorHandle {
    pub fn submit(&self, document: DocumentState) -> Result<(), ProcessorError> {
        self.command_jobs
            .send(document)
            .map_err(|_| ProcessorError::Stopped)
    }

    pub fn submit_cancel(&self, document: DocumentState) -> Result<(), ProcessorError> {
        self.cancel_jobs
            .send(document)
            .map_err(|_| ProcessorError::Stopped)
    }
}

impl Processor {
    pub fn new(
        executor: Arc<Executor>,
        command_workers: usize,
        cancel_flags: Arc<CancelFlagRegistry>,
        results: Sender<DocumentResultEvent>,
    ) -> Self {
        let (command_jobs, command_rx) = unbounded::<DocumentState>();
        let (cancel_jobs, cancel_rx) = unbounded::<DocumentState>();

        let mut workers = Vec::new();
        for i in 0..command_workers.max(1) {
            workers.push(spawn_command_worker(
                i,
                command_rx.clone(),
                executor.clone(),
                cancel_flags.clone(),
                results.clone(),
            ));
        }
        for i in 0..CANCEL_WORKERS {
            workers.push(spawn_cancel_worker(
                i,
                cancel_rx.clone(),
                cancel_flags.clone(),
                results.clone(),
            ));
        }

        Self {
            command_jobs,
            cancel_jobs,
            workers,
            cancel_flags,
        }
    }

    pub fn cancel_flags(&self) -> Arc<CancelFlagRegistry> {
        self.cancel_flags.clone()
    }

    pub fn handle(&self) -> ProcessorHandle {
        ProcessorHandle {
            command_jobs: self.command_jobs.clone(),
            cancel_jobs: self.cancel_jobs.clone(),
        }
    }

    pub fn submit(&self, document: DocumentState) -> Result<(), ProcessorError> {
        self.command_jobs
            .send(document)
            .map_err(|_| ProcessorError::Stopped)
    }

    pub fn submit_cancel(&self, document: DocumentState) -> Result<(), ProcessorError> {
        self.cancel_jobs
            .send(document)
            .map_err(|_| ProcessorError::Stopped)
    }

    /// Closes the job queues and waits for in-flight documents to finish.
    pub fn stop(self) {
        drop(self.command_jobs);
        drop(self.cancel_jobs);
        for worker in self.workers {
            if worker.join().is_err() {
                error!("processor worker panicked during shutdown");
            }
        }
    }
}

fn spawn_command_worker(
    index: usize,
    jobs: Receiver<DocumentState>,
    executor: Arc<Executor>,
    cancel_flags: Arc<CancelFlagRegistry>,
    results: Sender<DocumentResultEvent>,
) -> JoinHandle<()> {
    let worker = move || {
        for document in jobs.iter() {
            let command_id = document.document_info.command_id.clone();
            debug!(command_id, worker = index, "executing document");
            let cancel = cancel_flags.register(&command_id);

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                executor.run(document.clone(), &cancel, &results)
            }));
            if let Err(payload) = outcome {
                error!(
                    command_id,
                    panic = panic_message(payload),
                    "document execution panicked between steps"
                );
                let mut document = document;
                fail_remaining_steps(&mut document);
                document.document_info.status = document.aggregate_status();
                let event = DocumentResultEvent {
                    status: document.document_info.status,
                    document,
                    finished_plugin_id: None,
                };
                if results.send(event).is_err() {
                    warn!(command_id, "result channel closed while reporting panic");
                }
            }

            cancel_flags.remove(&command_id);
        }
    };
    Builder::new()
        .name(format!("command_worker_{index}"))
        .spawn(worker)
        .expect("spawning a command worker cannot fail")
}

fn spawn_cancel_worker(
    index: usize,
    jobs: Receiver<DocumentState>,
    cancel_flags: Arc<CancelFlagRegistry>,
    results: Sender<DocumentResultEvent>,
) -> JoinHandle<()> {
    let worker = move || {
        for mut document in jobs.iter() {
            let target = document
                .cancel_info
                .as_ref()
                .map(|info| info.cancel_command_id.clone());

            let status = match target {
                Some(target_id) if cancel_flags.cancel(&target_id) => {
                    debug!(target_id, "cancel flag set for running command");
                    DocumentStatus::Success
                }
                Some(target_id) => {
                    warn!(target_id, "cancel target is not executing");
                    DocumentStatus::Failed
                }
                None => {
                    warn!(
                        command_id = document.document_info.command_id,
                        "cancel document carries no target"
                    );
                    DocumentStatus::Failed
                }
            };

            document.document_info.status = status;
            let event = DocumentResultEvent {
                status,
                document,
                finished_plugin_id: None,
            };
            if results.send(event).is_err() {
                warn!("result channel closed while reporting cancel outcome");
            }
        }
    };
    Builder::new()
        .name(format!("cancel_worker_{index}"))
        .spawn(worker)
        .expect("spawning a cancel worker cannot fail")
}

/// Steps that never produced a result are marked failed, so the document
/// reaches a terminal status after a panic between steps.
fn fail_remaining_steps(document: &mut DocumentState) {
    let now = Utc::now();
    for step in &mut document.plugin_states {
        if step.result.is_some() {
            continue;
        }
        step.result = Some(PluginResult {
            plugin_name: step.plugin_name.clone(),
            code: 1,
            status: DocumentStatus::Failed,
            start_time: now,
            end_time: now,
            output: String::new(),
            standard_output: String::new(),
            standard_error: String::new(),
            output_bucket: step.configuration.output_bucket.clone(),
            output_prefix: step.configuration.output_prefix.clone(),
            error: Some("execution interrupted".to_string()),
        });
        step.has_executed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rebooter::Rebooter;
    use crate::document::state::{
        CancelInfo, DocumentInfo, DocumentType, PluginConfiguration, PluginState,
    };
    use crate::document::store::DocumentStore;
    use crate::engine::plugin::tests::StaticPlugin;
    use crate::engine::plugin::PluginRegistry;
    use std::time::Duration;
    use tempfile::tempdir;

    fn command_document(command_id: &str, steps: usize) -> DocumentState {
        DocumentState {
            document_info: DocumentInfo {
                command_id: command_id.to_string(),
                document_id: "doc-1".to_string(),
                instance_id: "i-0123456789".to_string(),
                message_id: format!("aws.ssm.{command_id}.i-0123456789"),
                created_date: "2024-03-01T10:00:00Z".to_string(),
                document_name: "test-doc".to_string(),
                status: DocumentStatus::InProgress,
                run_id: "run-1".to_string(),
            },
            plugin_states: (0..steps)
                .map(|i| PluginState {
                    plugin_id: format!("step-{i}"),
                    plugin_name: "aws:runShellScript".to_string(),
                    configuration: PluginConfiguration::default(),
                    has_executed: false,
                    result: None,
                })
                .collect(),
            document_type: DocumentType::SendCommand,
            cancel_info: None,
        }
    }

    fn cancel_document(command_id: &str, target: &str) -> DocumentState {
        let mut document = command_document(command_id, 0);
        document.document_type = DocumentType::CancelCommand;
        document.cancel_info = Some(CancelInfo {
            cancel_command_id: target.to_string(),
        });
        document
    }

    fn processor() -> (Processor, Receiver<DocumentResultEvent>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(dir.path(), "i-0123456789"));
        store.ensure_dirs().unwrap();
        let (rebooter, _consumer) = Rebooter::channel();
        let mut registry = PluginRegistry::new();
        registry.register_worker(Arc::new(StaticPlugin::succeeding("aws:runShellScript")));
        let executor = Arc::new(Executor::new(Arc::new(registry), rebooter, store));
        let (results, results_consumer) = unbounded();
        let processor = Processor::new(
            executor,
            2,
            Arc::new(CancelFlagRegistry::new()),
            results,
        );
        (processor, results_consumer, dir)
    }

    #[test]
    fn test_documents_execute_concurrently_and_report() {
        let (processor, results, _dir) = processor();

        processor.submit(command_document("cmd-a", 1)).unwrap();
        processor.submit(command_document("cmd-b", 1)).unwrap();

        let mut terminal = 0;
        while terminal < 2 {
            let event = results
                .recv_timeout(Duration::from_secs(5))
                .expect("result events should arrive");
            if event.status.is_terminal() {
                terminal += 1;
            }
        }
        processor.stop();
    }

    #[test]
    fn test_cancel_of_unknown_command_fails() {
        let (processor, results, _dir) = processor();

        processor
            .submit_cancel(cancel_document("cancel-1", "missing-cmd"))
            .unwrap();
        let event = results
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(event.status, DocumentStatus::Failed);
        processor.stop();
    }

    #[test]
    fn test_cancel_of_registered_command_succeeds() {
        let (processor, results, _dir) = processor();

        let flags = processor.cancel_flags();
        let flag = flags.register("cmd-running");

        processor
            .submit_cancel(cancel_document("cancel-2", "cmd-running"))
            .unwrap();
        let event = results
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(event.status, DocumentStatus::Success);
        assert!(flag.is_set());
        processor.stop();
    }

    #[test]
    fn test_stop_joins_workers() {
        let (processor, _results, _dir) = processor();
        let flags = processor.cancel_flags();
        processor.stop();
        // pools are drained and joined; nothing is executing anymore
        assert!(!flags.cancel("anything"));
    }

    #[test]
    fn test_fail_remaining_steps_marks_unfinished_only() {
        let mut document = command_document("cmd-p", 2);
        document.plugin_states[0].has_executed = true;
        document.plugin_states[0].result = Some(PluginResult {
            plugin_name: "aws:runShellScript".to_string(),
            code: 0,
            status: DocumentStatus::Success,
            start_time: Utc::now(),
            end_time: Utc::now(),
            output: String::new(),
            standard_output: String::new(),
            standard_error: String::new(),
            output_bucket: String::new(),
            output_prefix: String::new(),
            error: None,
        });

        fail_remaining_steps(&mut document);

        assert_eq!(
            document.plugin_states[0].result.as_ref().unwrap().status,
            DocumentStatus::Success
        );
        assert_eq!(
            document.plugin_states[1].result.as_ref().unwrap().status,
            DocumentStatus::Failed
        );
        assert_eq!(document.aggregate_status(), DocumentStatus::Failed);
    }
}
