use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use crossbeam::channel::Sender;
use tracing::{error, warn};

use crate::core::module::panic_message;
use crate::core::rebooter::Rebooter;
use crate::document::state::{
    DocumentInfo, DocumentState, DocumentStatus, PluginResult, PluginState,
};
use crate::document::store::{DocumentStore, StateDir};
use crate::engine::plugin::{CancelFlag, Plugin, PluginOutcome, PluginRegistry};
use crate::s3::uploader::OutputUploader;

/// Emitted after every plugin step with the per-plugin results accumulated so
/// far and the aggregate document status.
#[derive(Clone)]
pub struct DocumentResultEvent {
    pub document: DocumentState,
    pub status: DocumentStatus,
    pub finished_plugin_id: Option<String>,
}

/// Collaborator notified with the latest document progress.
pub trait AssociationUpdate: Send + Sync {
    fn update(&self, document: &DocumentState);
}

/// Walks a document's plugin steps in order, records per-plugin results, and
/// emits incremental result events.
pub struct Executor {
    registry: Arc<PluginRegistry>,
    rebooter: Arc<Rebooter>,
    store: Arc<DocumentStore>,
    uploader: Option<Arc<OutputUploader>>,
    association_updater: Option<Arc<dyn AssociationUpdate>>,
}

impl Executor {
    pub fn new(
        registry: Arc<PluginRegistry>,
        rebooter: Arc<Rebooter>,
        store: Arc<DocumentStore>,
    ) -> Self {
        Self {
            registry,
            rebooter,
            store,
            uploader: None,
            association_updater: None,
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<OutputUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_association_updater(mut self, updater: Arc<dyn AssociationUpdate>) -> Self {
        self.association_updater = Some(updater);
        self
    }

    /// Runs the document to completion (or cancellation). Steps already
    /// marked `has_executed` re-emit their stored result without running.
    pub fn run(
        &self,
        mut document: DocumentState,
        cancel: &CancelFlag,
        results: &Sender<DocumentResultEvent>,
    ) -> DocumentState {
        document.document_info.status = DocumentStatus::InProgress;
        self.persist(&document);

        let total = document.plugin_states.len();
        for index in 0..total {
            if document.plugin_states[index].has_executed {
                self.emit(&document, index, results);
                continue;
            }

            if cancel.is_set() {
                self.cancel_remaining(&mut document, index, results);
                break;
            }

            let result = self.run_step(&document, index, cancel);
            if result.status == DocumentStatus::SuccessAndReboot {
                self.rebooter.request_pending_reboot();
            }
            self.upload_output(&document.document_info, &document.plugin_states[index], &result);
            {
                let step = &mut document.plugin_states[index];
                step.result = Some(result);
                step.has_executed = true;
            }
            self.persist(&document);
            self.emit(&document, index, results);
        }

        document.document_info.status = document.aggregate_status();
        self.persist(&document);
        if document.document_info.status.is_terminal() {
            if let Err(err) = self.store.move_document(
                &document.document_info.command_id,
                StateDir::Current,
                StateDir::Completed,
            ) {
                error!(
                    command_id = document.document_info.command_id,
                    %err,
                    "could not move completed document state"
                );
            }
        }
        document
    }

    fn run_step(&self, document: &DocumentState, index: usize, cancel: &CancelFlag) -> PluginResult {
        let step = &document.plugin_states[index];
        let start_time = Utc::now();

        let outcome = match self.registry.resolve(&step.plugin_name) {
            None => PluginOutcome::failed(1, format!("plugin {} not found", step.plugin_name)),
            Some(plugin) => {
                if !PluginRegistry::platform_supported(plugin.as_ref()) {
                    PluginOutcome::failed(
                        1,
                        format!(
                            "plugin {} does not support platform {}",
                            step.plugin_name,
                            std::env::consts::OS
                        ),
                    )
                } else {
                    self.invoke_plugin(plugin.as_ref(), step, cancel)
                }
            }
        };

        PluginResult {
            plugin_name: step.plugin_name.clone(),
            code: outcome.code,
            status: outcome.status,
            start_time,
            end_time: Utc::now(),
            output: outcome.output,
            standard_output: outcome.standard_output,
            standard_error: outcome.standard_error,
            output_bucket: step.configuration.output_bucket.clone(),
            output_prefix: step.configuration.output_prefix.clone(),
            error: outcome.error,
        }
    }

    fn invoke_plugin(
        &self,
        plugin: &dyn Plugin,
        step: &PluginState,
        cancel: &CancelFlag,
    ) -> PluginOutcome {
        match catch_unwind(AssertUnwindSafe(|| {
            plugin.run(&step.configuration, cancel)
        })) {
            Ok(outcome) => outcome,
            Err(payload) => {
                error!(
                    plugin = step.plugin_name,
                    panic = panic_message(payload),
                    "plugin panicked"
                );
                PluginOutcome::failed(1, "plugin crashed")
            }
        }
    }

    /// Marks every not-yet-executed step from `index` onwards as cancelled
    /// without invoking it.
    fn cancel_remaining(
        &self,
        document: &mut DocumentState,
        index: usize,
        results: &Sender<DocumentResultEvent>,
    ) {
        for rest in index..document.plugin_states.len() {
            if document.plugin_states[rest].has_executed {
                self.emit(document, rest, results);
                continue;
            }
            let now = Utc::now();
            {
                let step = &mut document.plugin_states[rest];
                step.result = Some(PluginResult {
                    plugin_name: step.plugin_name.clone(),
                    code: 0,
                    status: DocumentStatus::Cancelled,
                    start_time: now,
                    end_time: now,
                    output: String::new(),
                    standard_output: String::new(),
                    standard_error: String::new(),
                    output_bucket: step.configuration.output_bucket.clone(),
                    output_prefix: step.configuration.output_prefix.clone(),
                    error: None,
                });
                step.has_executed = true;
            }
            self.persist(document);
            self.emit(document, rest, results);
        }
    }

    fn upload_output(&self, info: &DocumentInfo, step: &PluginState, result: &PluginResult) {
        let Some(uploader) = &self.uploader else {
            return;
        };
        let bucket = &step.configuration.output_bucket;
        if bucket.is_empty() {
            return;
        }
        let prefix = step.configuration.output_prefix.trim_matches('/');
        let streams = [
            ("stdout", &result.standard_output),
            ("stderr", &result.standard_error),
        ];
        for (name, content) in streams {
            if content.is_empty() {
                continue;
            }
            let key = if prefix.is_empty() {
                format!("{}/{}/{name}", info.command_id, step.plugin_id)
            } else {
                format!("{prefix}/{}/{}/{name}", info.command_id, step.plugin_id)
            };
            if let Err(err) = uploader.put_object(bucket, &key, content.as_bytes()) {
                warn!(bucket, key, %err, "could not upload plugin output");
            }
        }
    }

    fn persist(&self, document: &DocumentState) {
        if let Err(err) = self.store.save(document, StateDir::Current) {
            error!(
                command_id = document.document_info.command_id,
                %err,
                "could not persist document state"
            );
        }
    }

    fn emit(
        &self,
        document: &DocumentState,
        index: usize,
        results: &Sender<DocumentResultEvent>,
    ) {
        let event = DocumentResultEvent {
            document: document.clone(),
            status: document.aggregate_status(),
            finished_plugin_id: Some(document.plugin_states[index].plugin_id.clone()),
        };
        if results.send(event).is_err() {
            warn!(
                command_id = document.document_info.command_id,
                "result channel closed, dropping result event"
            );
        }
        if let Some(updater) = &self.association_updater {
            updater.update(document);
        }
    }
}
