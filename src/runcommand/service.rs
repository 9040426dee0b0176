use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver};
use rand::Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::module::{panic_message, CoreModule, ModuleError};
use crate::core::rebooter::Rebooter;
use crate::core::stop_policy::StopPolicy;
use crate::document::state::DocumentStatus;
use crate::document::store::{DocumentStore, StateDir};
use crate::engine::executor::{DocumentResultEvent, Executor};
use crate::engine::plugin::{CancelFlagRegistry, REFRESH_ASSOCIATION_PLUGIN};
use crate::engine::processor::{Processor, ProcessorHandle};
use crate::message::Message;
use crate::runcommand::payload::{build_cancel_command_document, build_send_command_document};
use crate::runcommand::poll::PollTracker;
use crate::runcommand::reply::{BufferedReply, ReplyPayload};
use crate::runcommand::reply_store::ReplyStore;
use crate::runcommand::transport::{
    is_expected_closure, Transport, TransportBuilder, TransportCell, TransportError,
    FAIL_REASON_INTERNAL,
};
use crate::scheduler::PeriodicJob;

/// Scheduler period for the poll job; a completed firing normally
/// reschedules itself immediately, so this is the fallback cadence when the
/// short-circuit is declined.
const POLL_JOB_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Buffered replies are retried on this cadence.
const REPLY_JOB_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Consecutive unexpected transport errors before the transport is rebuilt.
const MAX_TRANSPORT_ERRORS: u32 = 10;
/// A poll that finished faster than this sleeps a jittered pause before the
/// scheduler fires again, spreading fleet load.
const MIN_POLL_ELAPSED: Duration = Duration::from_secs(1);
const POLL_JITTER_MILLIS_MIN: u64 = 2_000;
const POLL_JITTER_MILLIS_MAX: u64 = 2_500;

/// Collaborator invoked synchronously when a refresh-association plugin
/// result is observed in the reply fan-out.
pub trait AssociationRefresh: Send + Sync {
    fn refresh(&self);
}

/// Long-poll ↔ reply pipeline: pulls documents from a transport, drives them
/// through the execution engine, and returns results, buffering replies on
/// disk while the network is unavailable. Instantiated once per transport
/// (message service and offline file system).
pub struct RunCommandService<B: TransportBuilder> {
    name: String,
    instance_id: String,
    transport: Arc<TransportCell<B>>,
    executor: Arc<Executor>,
    command_workers: usize,
    stop_policy: Arc<StopPolicy>,
    poll_tracker: Arc<PollTracker>,
    reply_store: Option<Arc<ReplyStore>>,
    document_store: Arc<DocumentStore>,
    rebooter: Arc<Rebooter>,
    association_refresher: Option<Arc<dyn AssociationRefresh>>,
    processor: Option<Processor>,
    poll_job: Option<PeriodicJob>,
    reply_job: Option<PeriodicJob>,
    fan_out_thread: Option<JoinHandle<()>>,
}

impl<B: TransportBuilder> RunCommandService<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        instance_id: &str,
        transport_builder: B,
        executor: Arc<Executor>,
        command_workers: usize,
        poll_tracker: Arc<PollTracker>,
        reply_store: Option<Arc<ReplyStore>>,
        document_store: Arc<DocumentStore>,
        rebooter: Arc<Rebooter>,
    ) -> Self {
        Self {
            name: name.to_string(),
            instance_id: instance_id.to_string(),
            transport: Arc::new(TransportCell::new(transport_builder)),
            executor,
            command_workers,
            stop_policy: Arc::new(StopPolicy::new(name, MAX_TRANSPORT_ERRORS)),
            poll_tracker,
            reply_store,
            document_store,
            rebooter,
            association_refresher: None,
            processor: None,
            poll_job: None,
            reply_job: None,
            fan_out_thread: None,
        }
    }

    pub fn with_association_refresher(mut self, refresher: Arc<dyn AssociationRefresh>) -> Self {
        self.association_refresher = Some(refresher);
        self
    }

    /// Resubmits documents that were mid-flight when the previous agent
    /// lifetime ended. Steps already marked executed are not re-run.
    fn resume_in_flight_documents(&self, processor: &ProcessorHandle) {
        let command_ids = match self.document_store.list(StateDir::Current) {
            Ok(command_ids) => command_ids,
            Err(err) => {
                warn!(service = self.name, %err, "could not enumerate in-flight documents");
                return;
            }
        };
        for command_id in command_ids {
            match self.document_store.load(&command_id, StateDir::Current) {
                Ok(document) => {
                    info!(service = self.name, command_id, "resuming in-flight document");
                    if processor.submit(document).is_err() {
                        warn!(service = self.name, command_id, "processor stopped during resume");
                        return;
                    }
                }
                Err(err) => {
                    warn!(service = self.name, command_id, %err, "quarantining unreadable document state");
                    self.document_store.quarantine(&command_id, StateDir::Current);
                }
            }
        }
    }
}

struct PollOutcome {
    may_short_circuit: bool,
    errored: bool,
}

/// One poll firing: everything needed to pull and dispatch messages.
struct PollContext<B: TransportBuilder> {
    name: String,
    instance_id: String,
    transport: Arc<TransportCell<B>>,
    stop_policy: Arc<StopPolicy>,
    poll_tracker: Arc<PollTracker>,
    reply_store: Option<Arc<ReplyStore>>,
    document_store: Arc<DocumentStore>,
    processor: ProcessorHandle,
}

impl<B: TransportBuilder> PollContext<B> {
    /// Runs a single poll iteration; panics are recovered so the scheduler
    /// keeps firing. `may_short_circuit` is granted only to the firing whose
    /// start time is still the registered one, so racing firings collapse to
    /// a single reschedule.
    fn run_once(&self) -> PollOutcome {
        let started = self.poll_tracker.begin(&self.name);
        let errored = match catch_unwind(AssertUnwindSafe(|| self.poll())) {
            Ok(errored) => errored,
            Err(payload) => {
                error!(
                    service = self.name,
                    panic = panic_message(payload),
                    "poll iteration panicked"
                );
                false
            }
        };
        PollOutcome {
            may_short_circuit: self.poll_tracker.is_current(&self.name, started),
            errored,
        }
    }

    /// Returns true when a service-level error was counted, so the scheduler
    /// backs off before the next firing.
    fn poll(&self) -> bool {
        if !self.stop_policy.is_healthy() {
            info!(service = self.name, "stop-policy tripped, rebuilding transport");
            self.stop_policy.reset();
            self.transport.invalidate();
            return false;
        }

        let transport = match self.transport.get() {
            Ok(transport) => transport,
            Err(err) => {
                warn!(service = self.name, %err, "could not build transport");
                self.stop_policy.add_errors(1);
                return true;
            }
        };

        let held_open = Instant::now();
        let messages = match transport.get_messages(&self.instance_id) {
            Ok(messages) => messages,
            Err(TransportError::Stopped) => return false,
            Err(err) => {
                return if is_expected_closure(&err, held_open.elapsed()) {
                    debug!(service = self.name, %err, "long-poll closed as expected");
                    false
                } else {
                    warn!(service = self.name, %err, "could not poll for messages");
                    self.stop_policy.add_errors(1);
                    true
                };
            }
        };

        for message in messages {
            self.process_message(transport.as_ref(), message);
        }
        false
    }

    fn process_message(&self, transport: &B::T, message: Message) {
        if let Err(err) = message.validate() {
            warn!(service = self.name, %err, "dropping invalid message");
            self.fail_message(transport, &message.message_id);
            return;
        }

        let topic = match message.parse_topic() {
            Ok(topic) => topic,
            Err(err) => {
                warn!(service = self.name, %err, "dropping message with unknown topic");
                self.fail_message(transport, &message.message_id);
                return;
            }
        };

        let document = if topic.is_cancel() {
            build_cancel_command_document(&message, &self.instance_id)
        } else {
            build_send_command_document(&message, &self.instance_id)
        };
        let document = match document {
            Ok(document) => document,
            Err(err) => {
                warn!(service = self.name, %err, "could not build document from message");
                self.fail_message(transport, &message.message_id);
                return;
            }
        };

        if let Err(err) = transport.ack(&message.message_id) {
            warn!(service = self.name, %err, "could not ack message, leaving for redelivery");
            self.stop_policy.add_errors(1);
            return;
        }

        let command_id = &document.document_info.command_id;
        if !document.document_type.is_cancel() {
            // document states are created exactly once per command id
            if self.document_store.load(command_id, StateDir::Current).is_ok()
                || self
                    .document_store
                    .load(command_id, StateDir::Completed)
                    .is_ok()
            {
                debug!(service = self.name, command_id, "duplicate delivery, already dispatched");
                return;
            }
            if let Err(err) = self.document_store.save(&document, StateDir::Current) {
                error!(service = self.name, command_id, %err, "could not persist document state");
            }
        }

        // an in-progress reply precedes execution
        let payload = ReplyPayload::in_progress(&document);
        if let Err(err) = transport.send_reply(&message.message_id, &payload) {
            warn!(service = self.name, %err, "could not send in-progress reply, buffering");
            self.persist_reply(&message.message_id, payload);
        }

        let submitted = if document.document_type.is_cancel() {
            self.processor.submit_cancel(document)
        } else {
            self.processor.submit(document)
        };
        if submitted.is_err() {
            warn!(service = self.name, "processor stopped, message dropped after ack");
        }
    }

    fn fail_message(&self, transport: &B::T, message_id: &str) {
        if let Err(err) = transport.fail(message_id, FAIL_REASON_INTERNAL) {
            warn!(service = self.name, %err, "could not fail message");
        }
    }

    fn persist_reply(&self, message_id: &str, payload: ReplyPayload) {
        let Some(reply_store) = &self.reply_store else {
            warn!(service = self.name, message_id, "no reply buffer configured, reply dropped");
            return;
        };
        let reply = BufferedReply {
            reply_id: Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            payload,
        };
        if let Err(err) = reply_store.persist(&reply) {
            error!(service = self.name, %err, "could not buffer reply on disk");
        }
    }
}

/// Periodic resend of replies buffered on disk.
struct ReplyContext<B: TransportBuilder> {
    name: String,
    transport: Arc<TransportCell<B>>,
    reply_store: Arc<ReplyStore>,
    stop_policy: Arc<StopPolicy>,
}

impl<B: TransportBuilder> ReplyContext<B> {
    fn run_sweep(&self) {
        let names = match self.reply_store.list() {
            Ok(names) => names,
            Err(err) => {
                warn!(service = self.name, %err, "could not enumerate buffered replies");
                return;
            }
        };
        if names.is_empty() {
            return;
        }

        let transport = match self.transport.get() {
            Ok(transport) => transport,
            Err(err) => {
                warn!(service = self.name, %err, "could not build transport for reply sweep");
                self.stop_policy.add_errors(1);
                return;
            }
        };

        for name in names {
            let reply = match self.reply_store.load(&name) {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(service = self.name, reply = name, %err, "could not load buffered reply");
                    continue;
                }
            };
            match transport.send_reply(&reply.message_id, &reply.payload) {
                Ok(()) => {
                    debug!(service = self.name, reply = name, "buffered reply delivered");
                    if let Err(err) = self.reply_store.delete(&name) {
                        warn!(service = self.name, reply = name, %err, "could not delete sent reply");
                    }
                }
                Err(err) => {
                    warn!(service = self.name, reply = name, %err, "buffered reply still undeliverable");
                    self.stop_policy.add_errors(1);
                }
            }
        }
    }
}

/// Consumes per-step result events and turns them into replies.
struct FanOutContext<B: TransportBuilder> {
    name: String,
    transport: Arc<TransportCell<B>>,
    reply_store: Option<Arc<ReplyStore>>,
    rebooter: Arc<Rebooter>,
    association_refresher: Option<Arc<dyn AssociationRefresh>>,
}

impl<B: TransportBuilder> FanOutContext<B> {
    fn handle(&self, event: DocumentResultEvent) {
        self.refresh_association_if_present(&event);

        let mut payload = ReplyPayload::from_document(&event.document);
        payload.document_status = event.status;
        let message_id = &event.document.document_info.message_id;

        let sent = self
            .transport
            .get()
            .and_then(|transport| transport.send_reply(message_id, &payload));
        if let Err(err) = sent {
            warn!(service = self.name, %err, "could not send reply, buffering");
            match &self.reply_store {
                Some(reply_store) => {
                    let reply = BufferedReply {
                        reply_id: Uuid::new_v4().to_string(),
                        message_id: message_id.clone(),
                        payload,
                    };
                    if let Err(err) = reply_store.persist(&reply) {
                        error!(service = self.name, %err, "could not buffer reply on disk");
                    }
                }
                None => {
                    warn!(service = self.name, message_id, "no reply buffer configured, reply dropped");
                }
            }
        }

        // the final status goes out (or is buffered) before any reboot fires
        if event.status == DocumentStatus::SuccessAndReboot {
            self.rebooter.fire_if_pending();
        }
    }

    fn refresh_association_if_present(&self, event: &DocumentResultEvent) {
        let Some(refresher) = &self.association_refresher else {
            return;
        };
        let Some(finished_id) = &event.finished_plugin_id else {
            return;
        };
        let finished_refresh = event.document.plugin_states.iter().any(|step| {
            step.plugin_id == *finished_id
                && step.plugin_name == REFRESH_ASSOCIATION_PLUGIN
                && step.result.is_some()
        });
        if finished_refresh {
            debug!(service = self.name, "refresh-association result observed");
            refresher.refresh();
        }
    }
}

fn poll_jitter() -> Duration {
    Duration::from_millis(
        rand::thread_rng().gen_range(POLL_JITTER_MILLIS_MIN..POLL_JITTER_MILLIS_MAX),
    )
}

/// Back-off before the next poll after a counted service error:
/// `[1, 1.5] * 2^n` seconds, exponent capped so the wait stays bounded.
fn error_backoff(consecutive_errors: u32) -> Duration {
    let base = 2u64.saturating_pow(consecutive_errors.saturating_sub(1).min(6));
    let factor = rand::thread_rng().gen_range(1.0..1.5);
    Duration::from_secs_f64(base as f64 * factor)
}

impl<B: TransportBuilder> CoreModule for RunCommandService<B> {
    fn module_name(&self) -> &str {
        &self.name
    }

    fn module_execute(&mut self) -> Result<(), ModuleError> {
        info!(service = self.name, "starting run-command service");

        let (results_sender, results_receiver) = unbounded();
        let processor = Processor::new(
            self.executor.clone(),
            self.command_workers,
            Arc::new(CancelFlagRegistry::new()),
            results_sender,
        );

        self.resume_in_flight_documents(&processor.handle());

        let poll_context = PollContext {
            name: self.name.clone(),
            instance_id: self.instance_id.clone(),
            transport: self.transport.clone(),
            stop_policy: self.stop_policy.clone(),
            poll_tracker: self.poll_tracker.clone(),
            reply_store: self.reply_store.clone(),
            document_store: self.document_store.clone(),
            processor: processor.handle(),
        };
        let mut consecutive_errors: u32 = 0;
        self.poll_job = Some(PeriodicJob::spawn(
            &format!("{}_poll", self.name),
            move || {
                let iteration_started = Instant::now();
                let outcome = poll_context.run_once();
                consecutive_errors = if outcome.errored {
                    consecutive_errors.saturating_add(1)
                } else {
                    0
                };
                if outcome.errored {
                    error_backoff(consecutive_errors)
                } else if !outcome.may_short_circuit {
                    // another firing displaced this one; fall back to the
                    // scheduler cadence
                    POLL_JOB_INTERVAL
                } else if iteration_started.elapsed() < MIN_POLL_ELAPSED {
                    // spread load when the long-poll returned quickly
                    poll_jitter()
                } else {
                    Duration::ZERO
                }
            },
        ));

        if let Some(reply_store) = &self.reply_store {
            let reply_context = ReplyContext {
                name: self.name.clone(),
                transport: self.transport.clone(),
                reply_store: reply_store.clone(),
                stop_policy: self.stop_policy.clone(),
            };
            self.reply_job = Some(PeriodicJob::spawn_after(
                &format!("{}_reply", self.name),
                REPLY_JOB_INTERVAL,
                move || {
                    reply_context.run_sweep();
                    REPLY_JOB_INTERVAL
                },
            ));
        }

        let fan_out_context = FanOutContext {
            name: self.name.clone(),
            transport: self.transport.clone(),
            reply_store: self.reply_store.clone(),
            rebooter: self.rebooter.clone(),
            association_refresher: self.association_refresher.clone(),
        };
        self.fan_out_thread = Some(
            Builder::new()
                .name(format!("{}_results", self.name))
                .spawn(move || fan_out(fan_out_context, results_receiver))
                .expect("spawning the result fan-out thread cannot fail"),
        );

        self.processor = Some(processor);
        Ok(())
    }

    fn module_stop(&mut self) -> Result<(), ModuleError> {
        info!(service = self.name, "stopping run-command service");

        // cancel any in-flight long-poll, then wait for the poll loop to
        // observe cancellation and return
        self.transport.stop();
        if let Some(job) = self.poll_job.take() {
            job.stop()
                .map_err(|err| ModuleError::Failed(self.name.clone(), err.to_string()))?;
        }
        if let Some(job) = self.reply_job.take() {
            job.stop()
                .map_err(|err| ModuleError::Failed(self.name.clone(), err.to_string()))?;
        }

        // drain in-flight documents; dropping the pool's senders ends the
        // result channel, which ends the fan-out thread
        if let Some(processor) = self.processor.take() {
            processor.stop();
        }
        if let Some(thread) = self.fan_out_thread.take() {
            if thread.join().is_err() {
                return Err(ModuleError::Failed(
                    self.name.clone(),
                    "result fan-out thread panicked".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn fan_out<B: TransportBuilder>(context: FanOutContext<B>, results: Receiver<DocumentResultEvent>) {
    while let Ok(event) = results.recv() {
        context.handle(event);
    }
}
