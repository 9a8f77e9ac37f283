//! Message Processor (Mailbox)
//!
//! One bounded FIFO queue, one ordered handler chain and one dedicated tokio
//! task per mailbox. The task dequeues strictly in arrival order and runs
//! each handler to completion before looking at the next message, so no two
//! handler invocations of the same mailbox ever overlap.
//!
//! # Wiring vs. running
//!
//! Handlers and policies are registered on the [`MessageProcessor`] before
//! the worker starts. Starting moves the chain into the worker task, which
//! then owns it exclusively; registrations after that point are
//! configuration errors.
//!
//! # Failure policy
//!
//! A failing (or panicking) handler is recorded in the unhandled and
//! exception logs and handed to the exception policy. The default policy
//! escalates: the worker stops, the mailbox becomes `Faulted`, queued
//! messages are abandoned and the supervisor endpoint (if any) receives a
//! [`MailboxFaulted`] event.
//!
//! # Lock Ordering
//!
//! `wiring` before `worker`. Neither lock is held across an `.await`.

use crate::config::{BackpressurePolicy, MailboxConfig};
use crate::diagnostics::{DispatchFault, Diagnostics, MailboxStats};
use crate::endpoint::Endpoint;
use crate::error::{MailboxError, Result};
use crate::handler::{DispatchOutcome, Handler, HandlerChain, HandlerKey};
use crate::lifecycle::{LifecycleState, MailboxFaulted};
use crate::message::{Envelope, Message};

use chrono::Utc;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Decision of the exception policy for a failed dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDirective {
    /// Log and continue with the next message
    Resume,
    /// Fail the worker (fail-fast)
    Escalate,
}

type UnhandledPolicy = Box<dyn FnMut(&Envelope) + Send>;
type ExceptionPolicy = Box<dyn FnMut(&Envelope, &anyhow::Error) -> FaultDirective + Send>;

/// Everything the worker takes ownership of when it starts
struct Wiring {
    receiver: mpsc::Receiver<Envelope>,
    chain: HandlerChain,
    unhandled: Option<UnhandledPolicy>,
    exception: Option<ExceptionPolicy>,
    supervisor: Option<Endpoint>,
}

/// Handler label recorded when a policy itself panics
const UNHANDLED_POLICY: &str = "unhandled policy";
const EXCEPTION_POLICY: &str = "exception policy";

/// Why a dispatch did not complete cleanly
enum Failure {
    /// The matching handler failed; the exception policy decides
    Handler(anyhow::Error),
    /// A user policy panicked; always escalated
    Policy(anyhow::Error),
}

/// How a worker loop ended
#[derive(Debug)]
enum WorkerExit {
    Drained,
    Faulted(MailboxError),
    Killed,
}

/// State shared by the owner, the endpoints and the worker
pub(crate) struct MailboxCore {
    name: Arc<str>,
    config: MailboxConfig,
    sender: mpsc::Sender<Envelope>,
    state: watch::Sender<LifecycleState>,
    diagnostics: Diagnostics,
    wiring: Mutex<Option<Wiring>>,
    worker: Mutex<Option<JoinHandle<WorkerExit>>>,
    drain: Notify,
}

impl MailboxCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Apply a forward transition; false if it is not legal from the
    /// current state
    fn transition(&self, next: LifecycleState) -> bool {
        let name = &self.name;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                debug!(mailbox = %name, from = %state, to = %next, "Mailbox state transition");
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Spawn the worker. `Ok(false)` if it is already running.
    fn start(self: &Arc<Self>) -> Result<bool> {
        let mut wiring_slot = self.wiring.lock();
        match self.state() {
            LifecycleState::Created => {}
            LifecycleState::Running | LifecycleState::Stopping => return Ok(false),
            state => return Err(MailboxError::lifecycle(self.name(), state)),
        }

        let runtime = Handle::try_current().map_err(|e| {
            MailboxError::runtime(format!(
                "Mailbox '{}' cannot start outside a tokio runtime: {}",
                self.name, e
            ))
        })?;
        let wiring = wiring_slot.take().ok_or_else(|| {
            MailboxError::runtime(format!("Mailbox '{}' has no wiring to start", self.name))
        })?;

        let handlers = wiring.chain.len();
        self.transition(LifecycleState::Running);
        let worker = Worker {
            core: Arc::clone(self),
            wiring,
        };
        *self.worker.lock() = Some(runtime.spawn(worker.run()));

        info!(
            mailbox = %self.name,
            handlers = handlers,
            capacity = self.config.capacity,
            "Mailbox started"
        );
        Ok(true)
    }

    /// Reject terminal states; lazily start on first send
    fn admit(self: &Arc<Self>) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            warn!(mailbox = %self.name, state = %state, "Send rejected by lifecycle");
            return Err(MailboxError::lifecycle(self.name(), state));
        }
        if state == LifecycleState::Created
            && self.config.auto_start
            && Handle::try_current().is_ok()
        {
            self.start()?;
        }
        Ok(())
    }

    /// Non-blocking enqueue; a full queue is always a rejection
    pub(crate) fn try_enqueue(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        self.admit()?;
        let message_id = envelope.id();

        self.diagnostics.record_enqueue();
        match self.sender.try_send(envelope) {
            Ok(()) => {
                trace!(mailbox = %self.name, message_id = %message_id, "Message enqueued");
                Ok(())
            }
            Err(TrySendError::Full(rejected)) => {
                self.diagnostics.record_send_rejected(true);
                warn!(
                    mailbox = %self.name,
                    message_id = %message_id,
                    message_type = rejected.type_name(),
                    capacity = self.config.capacity,
                    "Mailbox full, message rejected"
                );
                Err(MailboxError::capacity_exceeded(self.name(), self.config.capacity))
            }
            Err(TrySendError::Closed(_)) => {
                self.diagnostics.record_send_rejected(false);
                Err(MailboxError::lifecycle(self.name(), self.state()))
            }
        }
    }

    /// Enqueue following the configured backpressure policy
    pub(crate) async fn enqueue(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        match self.config.backpressure {
            BackpressurePolicy::Reject => self.try_enqueue(envelope),
            BackpressurePolicy::Block => {
                self.admit()?;
                let permit = self
                    .sender
                    .reserve()
                    .await
                    .map_err(|_| MailboxError::lifecycle(self.name(), self.state()))?;
                self.diagnostics.record_enqueue();
                trace!(mailbox = %self.name, message_id = %envelope.id(), "Message enqueued");
                permit.send(envelope);
                Ok(())
            }
        }
    }

    async fn wait_terminated(&self) -> LifecycleState {
        let mut watcher = self.state.subscribe();
        let result = watcher.wait_for(|state| state.is_terminal()).await;
        match result {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

/// The mailbox owner's handle: wiring, lifecycle and diagnostics.
///
/// Peers never see this type; they get an [`Endpoint`].
pub struct MessageProcessor {
    core: Arc<MailboxCore>,
}

impl MessageProcessor {
    pub fn new(name: impl Into<String>, config: MailboxConfig) -> Result<Self> {
        config.validate()?;
        let name: Arc<str> = Arc::from(name.into());
        let (sender, receiver) = mpsc::channel(config.capacity);
        let (state, _) = watch::channel(LifecycleState::Created);

        debug!(
            mailbox = %name,
            capacity = config.capacity,
            backpressure = ?config.backpressure,
            "Creating mailbox"
        );

        Ok(Self {
            core: Arc::new(MailboxCore {
                name,
                config,
                sender,
                state,
                diagnostics: Diagnostics::default(),
                wiring: Mutex::new(Some(Wiring {
                    receiver,
                    chain: HandlerChain::new(),
                    unhandled: None,
                    exception: None,
                    supervisor: None,
                })),
                worker: Mutex::new(None),
                drain: Notify::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.core.config
    }

    /// Send-only capability for peers
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(Arc::clone(&self.core))
    }

    fn with_wiring<T>(&self, f: impl FnOnce(&mut Wiring) -> Result<T>) -> Result<T> {
        let mut slot = self.core.wiring.lock();
        match slot.as_mut() {
            Some(wiring) => f(wiring),
            None => Err(MailboxError::configuration(
                format!(
                    "Mailbox '{}' is {}; handlers can only be registered before start",
                    self.core.name,
                    self.core.state()
                ),
                Some("handler"),
            )),
        }
    }

    fn register(&self, handler: Handler) -> Result<()> {
        let type_name = handler.type_name();
        self.with_wiring(|wiring| {
            wiring.chain.register(handler).map_err(|e| {
                error!(mailbox = %self.core.name, handler = type_name, "Duplicate handler registration");
                e
            })?;
            self.core
                .diagnostics
                .set_handlers(wiring.chain.types(), wiring.chain.keys());
            debug!(mailbox = %self.core.name, handler = type_name, "Handler registered");
            Ok(())
        })
    }

    /// Register the handler for messages of type `M`
    pub fn register_handler<M, F>(&self, action: F) -> Result<()>
    where
        M: Message,
        F: FnMut(&M) -> anyhow::Result<()> + Send + 'static,
    {
        self.register(Handler::create::<M, F>(action))
    }

    /// Register the catch-all handler; it is always tried last
    pub fn register_catch_all<F>(&self, action: F) -> Result<()>
    where
        F: FnMut(&Envelope) -> anyhow::Result<()> + Send + 'static,
    {
        self.register(Handler::catch_all(action))
    }

    /// Whether a handler for `M` is registered, before or after start
    pub fn has_handler<M: Message>(&self) -> bool {
        self.core
            .diagnostics
            .has_handler(HandlerKey::Type(std::any::TypeId::of::<M>()))
    }

    /// Replace the default exception policy (escalate)
    pub fn register_exception_handler<F>(&self, policy: F) -> Result<()>
    where
        F: FnMut(&Envelope, &anyhow::Error) -> FaultDirective + Send + 'static,
    {
        self.with_wiring(|wiring| {
            wiring.exception = Some(Box::new(policy));
            Ok(())
        })
    }

    /// Replace the default unhandled policy (append to the unhandled log)
    pub fn register_unhandled<F>(&self, policy: F) -> Result<()>
    where
        F: FnMut(&Envelope) + Send + 'static,
    {
        self.with_wiring(|wiring| {
            wiring.unhandled = Some(Box::new(policy));
            Ok(())
        })
    }

    /// Endpoint notified with [`MailboxFaulted`] when the worker fails fast
    pub fn set_supervisor(&self, supervisor: Endpoint) -> Result<()> {
        self.with_wiring(|wiring| {
            wiring.supervisor = Some(supervisor);
            Ok(())
        })
    }

    /// Spawn the worker task. Idempotent while running.
    pub fn start(&self) -> Result<()> {
        self.core.start().map(|_| ())
    }

    pub async fn send<M: Message>(&self, message: M) -> Result<()> {
        self.core.enqueue(Envelope::new(message)).await
    }

    pub fn try_send<M: Message>(&self, message: M) -> Result<()> {
        self.core.try_enqueue(Envelope::new(message))
    }

    /// Drain every queued message in order, then stop.
    ///
    /// Fails only if the drain faults. Calling it again on a stopped mailbox
    /// is a no-op.
    pub async fn graceful_stop(&self) -> Result<()> {
        let core = &self.core;
        match core.state() {
            LifecycleState::Stopped => return Ok(()),
            LifecycleState::Killed => {
                return Err(MailboxError::lifecycle(core.name(), LifecycleState::Killed))
            }
            LifecycleState::Created => {
                core.start()?;
            }
            LifecycleState::Running | LifecycleState::Stopping | LifecycleState::Faulted => {}
        }

        if core.transition(LifecycleState::Stopping) {
            info!(
                mailbox = %core.name,
                queued = core.diagnostics.input_count(),
                "Graceful stop requested, draining mailbox"
            );
        }
        core.drain.notify_one();

        let handle = core.worker.lock().take();
        let exit = match handle {
            Some(handle) => match handle.await {
                Ok(exit) => exit,
                Err(join_error) => {
                    core.transition(LifecycleState::Faulted);
                    return Err(MailboxError::runtime(format!(
                        "Mailbox '{}' worker did not complete: {}",
                        core.name, join_error
                    )));
                }
            },
            // another caller owns the join; wait for the outcome
            None => {
                return match core.wait_terminated().await {
                    LifecycleState::Stopped => Ok(()),
                    state => Err(MailboxError::lifecycle(core.name(), state)),
                };
            }
        };

        match exit {
            WorkerExit::Drained => Ok(()),
            WorkerExit::Faulted(e) => Err(e),
            WorkerExit::Killed => Err(MailboxError::lifecycle(core.name(), LifecycleState::Killed)),
        }
    }

    /// Cancel immediately. Queued messages are abandoned; the message being
    /// dispatched (if any) is allowed to finish.
    pub async fn kill(&self) {
        let core = &self.core;
        let previous = core.state();
        if !core.transition(LifecycleState::Killed) {
            debug!(mailbox = %core.name, state = %previous, "Kill ignored, mailbox already terminal");
            return;
        }

        let abandoned = core.diagnostics.input_count();
        drop(core.wiring.lock().take());
        let handle = core.worker.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            match handle.await {
                Ok(_) => debug!(mailbox = %core.name, "Worker finished before abort"),
                Err(e) if e.is_cancelled() => debug!(mailbox = %core.name, "Worker cancelled"),
                Err(e) => warn!(mailbox = %core.name, error = %e, "Worker ended abnormally"),
            }
        }
        core.diagnostics.reset_queue_depth();

        warn!(
            mailbox = %core.name,
            previous_state = %previous,
            abandoned = abandoned,
            "Mailbox killed"
        );
    }

    /// Resolves once the mailbox reaches a terminal state
    pub async fn wait_terminated(&self) -> LifecycleState {
        self.core.wait_terminated().await
    }

    pub fn state(&self) -> LifecycleState {
        self.core.state()
    }

    /// Current queue depth
    pub fn input_count(&self) -> usize {
        self.core.diagnostics.input_count()
    }

    /// Messages dequeued so far, whatever their outcome
    pub fn processed_count(&self) -> u64 {
        self.core.diagnostics.processed_count()
    }

    /// Registered handler types in dispatch order
    pub fn handler_types(&self) -> Vec<&'static str> {
        self.core.diagnostics.handler_types()
    }

    /// Snapshot of the unhandled-message log
    pub fn unhandled_messages(&self) -> Vec<Envelope> {
        self.core.diagnostics.unhandled_log()
    }

    /// Snapshot of the exception log
    pub fn exceptions(&self) -> Vec<DispatchFault> {
        self.core.diagnostics.exception_log()
    }

    pub fn stats(&self) -> MailboxStats {
        self.core.diagnostics.snapshot()
    }
}

impl fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("name", &self.core.name)
            .field("state", &self.core.state())
            .field("input_count", &self.input_count())
            .field("processed_count", &self.processed_count())
            .finish()
    }
}

impl Drop for MessageProcessor {
    fn drop(&mut self) {
        // break the wiring -> handler -> endpoint -> core cycle
        drop(self.core.wiring.lock().take());
        if let Some(handle) = self.core.worker.lock().take() {
            if self.core.transition(LifecycleState::Killed) {
                debug!(mailbox = %self.core.name, "Mailbox owner dropped, aborting worker");
            }
            handle.abort();
        }
    }
}

/// The dedicated task of one mailbox
struct Worker {
    core: Arc<MailboxCore>,
    wiring: Wiring,
}

impl Worker {
    async fn run(mut self) -> WorkerExit {
        let started = Instant::now();
        debug!(mailbox = %self.core.name, "Entering mailbox loop");

        let mut draining = false;
        let exit = loop {
            let next = tokio::select! {
                biased;

                _ = self.core.drain.notified(), if !draining => {
                    draining = true;
                    self.wiring.receiver.close();
                    debug!(mailbox = %self.core.name, "Drain signalled, queue closed");
                    continue;
                }
                next = self.wiring.receiver.recv() => next,
            };

            let Some(envelope) = next else {
                break WorkerExit::Drained;
            };
            if self.core.state() == LifecycleState::Killed {
                break WorkerExit::Killed;
            }
            self.core.diagnostics.record_dequeue();

            if let Err(e) = self.dispatch(envelope) {
                break WorkerExit::Faulted(e);
            }
        };

        match &exit {
            WorkerExit::Drained => {
                self.core.transition(LifecycleState::Stopped);
                info!(
                    mailbox = %self.core.name,
                    processed = self.core.diagnostics.processed_count(),
                    total_runtime_ms = started.elapsed().as_millis(),
                    "Mailbox drained and stopped"
                );
            }
            WorkerExit::Faulted(e) => {
                self.core.transition(LifecycleState::Faulted);
                let abandoned = self.core.diagnostics.input_count();
                self.core.diagnostics.reset_queue_depth();
                error!(
                    mailbox = %self.core.name,
                    error = %e,
                    error_category = e.category(),
                    abandoned = abandoned,
                    "Mailbox worker faulted"
                );
            }
            WorkerExit::Killed => {
                debug!(mailbox = %self.core.name, "Worker observed kill");
            }
        }
        exit
    }

    /// Run one message through the chain. `Err` means the worker must stop.
    fn dispatch(&mut self, envelope: Envelope) -> Result<()> {
        let started = Instant::now();

        let chain = &mut self.wiring.chain;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| chain.dispatch(&envelope)))
            .unwrap_or_else(|payload| DispatchOutcome::Failed {
                handler: envelope.type_name(),
                error: anyhow::anyhow!("handler panicked: {}", panic_message(payload.as_ref())),
            });

        let failure = match outcome {
            DispatchOutcome::Handled(handler) => {
                self.core.diagnostics.record_handled();
                trace!(
                    mailbox = %self.core.name,
                    message_id = %envelope.id(),
                    handler = handler,
                    "Message handled"
                );
                None
            }
            DispatchOutcome::Unmatched => {
                debug!(
                    mailbox = %self.core.name,
                    message_id = %envelope.id(),
                    message_type = envelope.type_name(),
                    "No handler matched"
                );
                match self.wiring.unhandled.as_mut() {
                    Some(policy) => {
                        self.core.diagnostics.record_unmatched();
                        panic::catch_unwind(AssertUnwindSafe(|| policy(&envelope)))
                            .err()
                            .map(|payload| {
                                let error = anyhow::anyhow!(
                                    "unhandled policy panicked: {}",
                                    panic_message(payload.as_ref())
                                );
                                self.record_failure(&envelope, UNHANDLED_POLICY, &error, started);
                                Failure::Policy(error)
                            })
                    }
                    None => {
                        self.core.diagnostics.record_unhandled(&envelope);
                        None
                    }
                }
            }
            DispatchOutcome::Failed { handler, error } => {
                self.core.diagnostics.record_unhandled(&envelope);
                self.record_failure(&envelope, handler, &error, started);
                Some(Failure::Handler(error))
            }
        };

        self.core.diagnostics.record_processed(started.elapsed());

        let (directive, error) = match failure {
            None => return Ok(()),
            // policy panics always escalate
            Some(Failure::Policy(error)) => (FaultDirective::Escalate, error),
            Some(Failure::Handler(error)) => {
                let directive = match self.wiring.exception.as_mut() {
                    Some(policy) => {
                        match panic::catch_unwind(AssertUnwindSafe(|| policy(&envelope, &error))) {
                            Ok(directive) => directive,
                            Err(payload) => {
                                let policy_error = anyhow::anyhow!(
                                    "exception policy panicked: {}",
                                    panic_message(payload.as_ref())
                                );
                                self.record_failure(
                                    &envelope,
                                    EXCEPTION_POLICY,
                                    &policy_error,
                                    started,
                                );
                                FaultDirective::Escalate
                            }
                        }
                    }
                    None => FaultDirective::Escalate,
                };
                (directive, error)
            }
        };

        match directive {
            FaultDirective::Resume => {
                debug!(mailbox = %self.core.name, message_id = %envelope.id(), "Resuming after handler failure");
                Ok(())
            }
            FaultDirective::Escalate => {
                let fault = MailboxError::dispatch(
                    self.core.name(),
                    envelope.id(),
                    envelope.type_name(),
                    format!("{:#}", error),
                );
                self.notify_supervisor(&envelope, &fault);
                Err(fault)
            }
        }
    }

    /// Append to the exception log and report
    fn record_failure(
        &self,
        envelope: &Envelope,
        handler: &'static str,
        error: &anyhow::Error,
        started: Instant,
    ) {
        self.core.diagnostics.record_fault(DispatchFault {
            message_id: envelope.id(),
            message_type: envelope.type_name(),
            handler,
            error: format!("{:#}", error),
            occurred_at: Utc::now(),
        });
        error!(
            mailbox = %self.core.name,
            message_id = %envelope.id(),
            message_type = envelope.type_name(),
            handler = handler,
            error = %error,
            processing_duration_ns = started.elapsed().as_nanos() as u64,
            "Handler failed"
        );
    }

    fn notify_supervisor(&self, envelope: &Envelope, fault: &MailboxError) {
        let Some(supervisor) = &self.wiring.supervisor else {
            error!(
                mailbox = %self.core.name,
                "No supervisor to escalate to. System intervention required."
            );
            return;
        };

        let notice = MailboxFaulted::new(
            self.core.name(),
            envelope.id(),
            envelope.type_name(),
            fault.to_string(),
        );
        match supervisor.try_send(notice) {
            Ok(()) => warn!(
                mailbox = %self.core.name,
                supervisor = supervisor.target(),
                "Escalated fault to supervisor"
            ),
            Err(e) => error!(
                mailbox = %self.core.name,
                error = %e,
                "Failed to notify supervisor of fault"
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
