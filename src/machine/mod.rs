//! Machines and their dispatch engine.
//!
//! Every machine instance owns a [`Mailbox`](mailbox::Mailbox) guarded by its own lock and a core
//! holding the user state, the state stack and the handler overlays. At most one handler task per
//! machine runs at a time: an enqueue that finds the machine idle hands it off to the scheduler as
//! a new [`HandlerTask`](crate::runtime::scheduler::HandlerTask), and the handler drains the
//! inbox until it is empty, the machine suspends on a receive, or it halts.

use std::any::Any;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::action::{ActionError, ActionName, ActionOutcome, ActionResult, Continuation, Receive};
use crate::event::{
    DefaultEvent, EventInfo, EventType, GotoStateEvent, Halt, OperationId, PushStateEvent,
    WildCard,
};
use crate::machine::context::{ActionScope, Statement};
use crate::machine::error::ProtocolViolation;
use crate::machine::info::MachineInfo;
use crate::machine::mailbox::{Disposition, EnqueueStatus, Mailbox, WaitHandler};
use crate::machine_id::MachineId;
use crate::runtime::Runtime;
use crate::runtime::error::{ActionFault, RuntimeError};
use crate::runtime::scheduler::Notification;
use crate::state::config::MachineConfig;
use crate::state::{Handler, HandlerMap, MachineActionRef, MachineDefinition, StateDescriptor, StateName};

pub use self::context::ActionContext;

pub mod context;
pub mod error;
pub mod info;
pub mod mailbox;

/// A user-defined machine type.
///
/// # Example
/// ```ignore
/// struct Server {
///     pings: u32,
/// }
///
/// impl MachineType for Server {
///     fn configure(config: &mut MachineConfig<Self>) {
///         config.action("reply", |server, ctx| {
///             server.pings += 1;
///             let client = ctx.event::<Ping>().map(|ping| ping.client.clone());
///             match client {
///                 Some(client) => ctx.send(&client, Pong),
///                 None => Ok(()),
///             }
///         });
///
///         config.state("Active").start().on_event_do::<Ping>("reply");
///     }
/// }
/// ```
pub trait MachineType: Send + Sized + 'static {
    /// Declare the states and actions of this type. Runs once per runtime.
    fn configure(config: &mut MachineConfig<Self>);

    /// Name used in machine ids and diagnostics.
    fn type_name() -> &'static str {
        short_type_name::<Self>()
    }

    /// User contribution to [`cached state`](crate::runtime::Runtime::cached_state) hashes.
    fn hashed_state(&self) -> u64 {
        0
    }

    /// Runs once when the machine halts normally.
    fn on_halt(&mut self) {}

    /// Decide what happens when `action` faults or an event reaches an empty state stack.
    ///
    /// Only faults (including caught panics) and unhandled events are offered here. Protocol
    /// violations raised by actions, assertions and runtime errors always fail the run.
    fn on_exception(&mut self, action: ActionName, err: &ActionError) -> ExceptionOutcome {
        let _ = (action, err);
        ExceptionOutcome::Throw
    }

    /// Runs right after an event is taken out of the inbox, before it is handled.
    fn on_event_dequeued(&mut self, event: &EventInfo) {
        let _ = event;
    }

    /// Runs once a dequeued event and every event raised while handling it are done with.
    fn on_event_handled(&mut self, event: &EventInfo) {
        let _ = event;
    }
}

/// What [`MachineType::on_exception`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionOutcome {
    /// Report the error as if there were no hook.
    #[default]
    Throw,
    /// Treat the failed action as completed and keep running.
    Handled,
    /// Halt the machine normally. Nothing is reported.
    Halt,
}

/// Last path segment of a type name, without generic arguments.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let name = std::any::type_name::<T>();
    let base = name.split('<').next().unwrap_or(name);
    base.rsplit("::").next().unwrap_or(base)
}

/// Options for creating a machine.
#[derive(Debug, Default)]
pub struct MachineOptions {
    pub(crate) name: Option<String>,
    pub(crate) endpoint: Option<String>,
    pub(crate) initial_event: Option<EventInfo>,
}

impl MachineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Friendly name replacing the derived `Type(n)` name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Event made available to the entry action of the start state.
    pub fn initial_event<E: crate::event::Event>(mut self, event: E) -> Self {
        self.initial_event = Some(EventInfo::new(event, None, OperationId::NONE));
        self
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "action panicked".to_string()
    }
}

/// Type-erased view of a machine used by the runtime and schedulers.
pub(crate) trait AnyMachine: Send + Sync {
    fn id(&self) -> &MachineId;

    fn enqueue(&self, info: EventInfo) -> Result<EnqueueStatus, RuntimeError>;

    fn run_handler(&self, runtime: &Runtime) -> Result<(), RuntimeError>;

    fn info(&self) -> MachineInfo;

    fn current_state(&self) -> Option<StateName>;

    fn state_stack(&self) -> Vec<StateName>;

    fn inbox_len(&self) -> usize;

    fn cached_state(&self) -> u64;

    fn prioritize_operation(&self, operation: OperationId) -> bool;

    fn is_operation_pending(&self, operation: OperationId) -> bool;
}

/// How the handler should proceed after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Suspended,
    Halted,
}

enum Next {
    Raised(EventInfo),
    Dequeued(EventInfo),
    Default,
    Idle,
}

/// Result of running one piece of user code.
enum Executed<M> {
    Outcome(ActionOutcome<M>),
    Halted,
}

struct Suspended<M> {
    action: ActionName,
    handlers: Vec<WaitHandler>,
    continuation: Continuation<M>,
}

struct Core<M> {
    machine: M,
    stack: Vec<Arc<StateDescriptor<M>>>,
    overlays: Vec<HandlerMap<M>>,
    raised: Option<EventInfo>,
    suspended: Option<Suspended<M>>,
    scope: ActionScope,
    operation: OperationId,
    started: bool,
    initial_event: Option<EventInfo>,
    /// The dequeued event whose handling is still in progress.
    handling: Option<EventInfo>,
}

impl<M> Core<M> {
    fn state_name(&self) -> Option<StateName> {
        self.stack.last().map(|state| state.name())
    }
}

/// What observers see while the core is locked by a running handler.
#[derive(Debug, Default)]
struct Snapshot {
    hash: u64,
    stack: Vec<StateName>,
}

/// One machine instance.
pub(crate) struct MachineCell<M: MachineType> {
    id: MachineId,
    definition: Arc<MachineDefinition<M>>,
    mailbox: Mutex<Mailbox>,
    core: Mutex<Core<M>>,
    /// Refreshed before every notification. Never held while locking anything else.
    snapshot: Mutex<Snapshot>,
}

impl<M: MachineType> MachineCell<M> {
    /// Create a machine whose first handler task is about to be scheduled.
    pub(crate) fn new(
        id: MachineId,
        definition: Arc<MachineDefinition<M>>,
        machine: M,
        initial_event: Option<EventInfo>,
        operation: OperationId,
    ) -> Self {
        let mut mailbox = Mailbox::new(id.clone());
        mailbox.start();

        Self {
            id,
            definition,
            mailbox: Mutex::new(mailbox),
            core: Mutex::new(Core {
                machine,
                stack: Vec::new(),
                overlays: Vec::new(),
                raised: None,
                suspended: None,
                scope: ActionScope::default(),
                operation,
                started: false,
                initial_event,
                handling: None,
            }),
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    /// Publish the current state for observers, then hand `notification` to the scheduler.
    ///
    /// Must not be called with the mailbox locked.
    fn notify(&self, runtime: &Runtime, core: &Core<M>, notification: Notification) {
        let hash = self.hash_state(core, &lock(&self.mailbox));
        *lock(&self.snapshot) = Snapshot {
            hash,
            stack: core.stack.iter().map(|state| state.name()).collect(),
        };
        runtime.notify(notification);
    }

    fn hash_state(&self, core: &Core<M>, mailbox: &Mailbox) -> u64 {
        let info = mailbox.info();

        let mut hasher = ahash::RandomState::with_seeds(0x5eed, 0xcafe, 0xf00d, 0xbeef).build_hasher();
        self.definition.type_name().hash(&mut hasher);
        self.id.value().hash(&mut hasher);
        info.is_running.hash(&mut hasher);
        info.is_halted.hash(&mut hasher);
        core.scope.program_counter.hash(&mut hasher);
        core.machine.hashed_state().hash(&mut hasher);
        for state in &core.stack {
            state.name().hash(&mut hasher);
        }
        for event in mailbox.events() {
            event.event_name().hash(&mut hasher);
            event.event().hashed_state().hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Read the core if no handler holds it, otherwise fall back to the last snapshot.
    fn observe<R>(&self, fresh: impl FnOnce(&Core<M>) -> R, stale: impl FnOnce(&Snapshot) -> R) -> R {
        match self.core.try_lock() {
            Ok(core) => fresh(&core),
            Err(TryLockError::Poisoned(poisoned)) => fresh(&poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => stale(&lock(&self.snapshot)),
        }
    }

    fn protocol(&self, state: Option<StateName>, source: ProtocolViolation) -> RuntimeError {
        RuntimeError::Protocol {
            machine: self.id.clone(),
            state,
            source,
        }
    }

    fn start(&self, runtime: &Runtime, core: &mut Core<M>) -> Result<Flow, RuntimeError> {
        core.started = true;
        let initial = core.initial_event.take();

        tracing::debug!(machine = %self.id, state = self.definition.start_state().name(), "starting machine");
        self.enter_state(
            runtime,
            core,
            Arc::clone(self.definition.start_state()),
            initial.as_ref(),
        )
    }

    fn resume_suspended(
        &self,
        runtime: &Runtime,
        core: &mut Core<M>,
        suspended: Suspended<M>,
    ) -> Result<Flow, RuntimeError> {
        let delivered = {
            let mut mailbox = lock(&self.mailbox);
            let delivered = mailbox.take_delivered();
            if delivered.is_none() {
                mailbox.wait(suspended.handlers.clone());
            }
            delivered
        };

        let Some(event) = delivered else {
            core.suspended = Some(suspended);
            return Ok(Flow::Suspended);
        };

        self.notify(runtime, core, Notification::ReceivedEvent {
            machine: self.id.clone(),
            state: core.state_name().unwrap_or_default(),
            event: event.event_type(),
        });

        let Suspended {
            action,
            continuation,
            ..
        } = suspended;
        let executed = self.resume(runtime, core, action, continuation, event)?;
        self.complete(runtime, core, action, executed)
    }

    fn event_loop(&self, runtime: &Runtime, core: &mut Core<M>) -> Result<(), RuntimeError> {
        loop {
            if !runtime.is_running() {
                lock(&self.mailbox).idle();
                return Ok(());
            }

            if core.raised.is_none() {
                if let Some(handled) = core.handling.take() {
                    core.machine.on_event_handled(&handled);
                }
            }

            let state = core.state_name().unwrap_or_default();
            let event = match self.next_event(core) {
                Next::Raised(event) => {
                    tracing::debug!(machine = %self.id, state, event = %event.event_type(), "handling raised event");
                    self.notify(runtime, core, Notification::HandlingRaisedEvent {
                        machine: self.id.clone(),
                        state,
                        event: event.event_type(),
                    });
                    event
                }

                Next::Dequeued(event) => {
                    core.scope.program_counter = 0;
                    core.operation = event.operation_id();

                    tracing::debug!(machine = %self.id, state, event = %event.event_type(), "dequeued event");
                    self.notify(runtime, core, Notification::DequeuedEvent {
                        machine: self.id.clone(),
                        state,
                        event: event.event_type(),
                        operation: event.operation_id(),
                    });
                    core.machine.on_event_dequeued(&event);
                    core.handling = Some(event.clone());
                    event
                }

                Next::Default => {
                    tracing::debug!(machine = %self.id, state, "default handler fired");
                    self.notify(runtime, core, Notification::DefaultHandlerFired {
                        machine: self.id.clone(),
                        state,
                    });
                    EventInfo::new(DefaultEvent, None, core.operation)
                }

                Next::Idle => return Ok(()),
            };

            match self.handle_event(runtime, core, event)? {
                Flow::Continue => {}
                Flow::Suspended | Flow::Halted => return Ok(()),
            }
        }
    }

    /// Pick the next event: a raised event first, then the first deliverable queued event, then
    /// the default event if the current state handles it.
    fn next_event(&self, core: &mut Core<M>) -> Next {
        let (Some(top), Some(overlay)) = (core.stack.last(), core.overlays.last()) else {
            lock(&self.mailbox).idle();
            return Next::Idle;
        };

        if let Some(raised) = core.raised.take() {
            if !is_ignored(top, overlay, &raised.event_type()) {
                return Next::Raised(raised);
            }

            tracing::debug!(machine = %self.id, state = top.name(), event = %raised.event_type(), "ignored raised event");
        }

        let mut mailbox = lock(&self.mailbox);
        if mailbox.info().is_halted {
            return Next::Idle;
        }

        if let Some(event) = mailbox.dequeue(|event_type| disposition(top, overlay, event_type)) {
            return Next::Dequeued(event);
        }

        if has_default_handler(top, overlay) {
            return Next::Default;
        }

        mailbox.idle();
        Next::Idle
    }

    fn handle_event(
        &self,
        runtime: &Runtime,
        core: &mut Core<M>,
        event: EventInfo,
    ) -> Result<Flow, RuntimeError> {
        let wildcard = EventType::of::<WildCard>();
        let event_type = event.event_type();

        loop {
            let Some(top) = core.stack.last().cloned() else {
                if event.is::<Halt>() {
                    return Ok(self.halt(runtime, core));
                }

                let violation = ProtocolViolation::UnhandledEvent {
                    event: event.event_name(),
                };
                let err = ActionError::Violation(violation.clone());
                return match core.machine.on_exception("handle_event", &err) {
                    ExceptionOutcome::Throw => Err(self.protocol(None, violation)),
                    ExceptionOutcome::Handled | ExceptionOutcome::Halt => {
                        tracing::debug!(machine = %self.id, event = %event_type, "unhandled event halts machine");
                        Ok(self.halt(runtime, core))
                    }
                };
            };

            if let Some(goto) = event.downcast_ref::<GotoStateEvent>() {
                return self.goto_state(runtime, core, goto.state, None, &event);
            }

            if let Some(push) = event.downcast_ref::<PushStateEvent>() {
                return self.push_state(runtime, core, push.state, &event);
            }

            let goto = top
                .goto_transitions
                .get(&event_type)
                .or_else(|| top.goto_transitions.get(&wildcard));
            if let Some(transition) = goto {
                return self.goto_state(
                    runtime,
                    core,
                    transition.target,
                    transition.action.clone(),
                    &event,
                );
            }

            let push = top
                .push_transitions
                .get(&event_type)
                .or_else(|| top.push_transitions.get(&wildcard));
            if let Some(target) = push {
                return self.push_state(runtime, core, *target, &event);
            }

            let action = core.overlays.last().and_then(|overlay| {
                bound_action(overlay, &event_type).or_else(|| bound_action(overlay, &wildcard))
            });
            if let Some(action) = action {
                return self.run_action(runtime, core, &action, Some(&event), false);
            }

            // Not handled here: leave the state and retry with the one below it.
            let flow = self.exit_state(runtime, core, None, Some(&event))?;
            if flow != Flow::Continue {
                return Ok(flow);
            }

            core.stack.pop();
            core.overlays.pop();
            self.notify(runtime, core, Notification::PoppedState {
                machine: self.id.clone(),
                state: top.name(),
            });
            tracing::debug!(machine = %self.id, state = top.name(), event = %event_type, "popped state with unhandled event");
        }
    }

    fn goto_state(
        &self,
        runtime: &Runtime,
        core: &mut Core<M>,
        target: StateName,
        transition_action: Option<MachineActionRef<M>>,
        event: &EventInfo,
    ) -> Result<Flow, RuntimeError> {
        let Some(target) = self.definition.state(target).cloned() else {
            return Err(self.protocol(
                core.state_name(),
                ProtocolViolation::UnknownState { state: target },
            ));
        };

        let flow = self.exit_state(runtime, core, transition_action.as_ref(), Some(event))?;
        if flow != Flow::Continue {
            return Ok(flow);
        }

        core.stack.pop();
        core.overlays.pop();

        tracing::debug!(machine = %self.id, state = target.name(), "goto state");
        self.enter_state(runtime, core, target, Some(event))
    }

    fn push_state(
        &self,
        runtime: &Runtime,
        core: &mut Core<M>,
        target: StateName,
        event: &EventInfo,
    ) -> Result<Flow, RuntimeError> {
        let Some(target) = self.definition.state(target).cloned() else {
            return Err(self.protocol(
                core.state_name(),
                ProtocolViolation::UnknownState { state: target },
            ));
        };

        tracing::debug!(machine = %self.id, state = target.name(), "pushed state");
        self.notify(runtime, core, Notification::PushedState {
            machine: self.id.clone(),
            state: target.name(),
        });
        self.enter_state(runtime, core, target, Some(event))
    }

    /// Honor a pop statement: exit the current state and expose the one below it, without
    /// running its entry action.
    fn pop_state(&self, runtime: &Runtime, core: &mut Core<M>) -> Result<Flow, RuntimeError> {
        let flow = self.exit_state(runtime, core, None, None)?;
        if flow != Flow::Continue {
            return Ok(flow);
        }

        let left = core.stack.pop().map(|state| state.name());
        core.overlays.pop();

        if let Some(state) = left {
            self.notify(runtime, core, Notification::PoppedState {
                machine: self.id.clone(),
                state,
            });
        }

        let Some(current) = core.state_name() else {
            return Err(self.protocol(left, ProtocolViolation::PopWithEmptyStack));
        };

        tracing::debug!(machine = %self.id, from = left.unwrap_or_default(), to = current, "popped state");
        Ok(Flow::Continue)
    }

    fn enter_state(
        &self,
        runtime: &Runtime,
        core: &mut Core<M>,
        target: Arc<StateDescriptor<M>>,
        received: Option<&EventInfo>,
    ) -> Result<Flow, RuntimeError> {
        let overlay = target.overlay(core.overlays.last());
        core.stack.push(Arc::clone(&target));
        core.overlays.push(overlay);

        self.notify(runtime, core, Notification::EnteredState {
            machine: self.id.clone(),
            state: target.name(),
        });

        match &target.entry {
            Some(entry) => self.run_action(runtime, core, entry, received, false),
            None => Ok(Flow::Continue),
        }
    }

    /// Run the exit action of the current state, then the action of the goto transition taken.
    fn exit_state(
        &self,
        runtime: &Runtime,
        core: &mut Core<M>,
        transition_action: Option<&MachineActionRef<M>>,
        received: Option<&EventInfo>,
    ) -> Result<Flow, RuntimeError> {
        let Some(top) = core.stack.last().cloned() else {
            return Ok(Flow::Continue);
        };

        self.notify(runtime, core, Notification::ExitedState {
            machine: self.id.clone(),
            state: top.name(),
        });

        for action in top.exit.iter().chain(transition_action) {
            let flow = self.run_action(runtime, core, action, received, true)?;
            if flow != Flow::Continue {
                return Ok(flow);
            }
        }

        Ok(Flow::Continue)
    }

    fn run_action(
        &self,
        runtime: &Runtime,
        core: &mut Core<M>,
        action: &MachineActionRef<M>,
        received: Option<&EventInfo>,
        inside_on_exit: bool,
    ) -> Result<Flow, RuntimeError> {
        self.notify(runtime, core, Notification::InvokedAction {
            machine: self.id.clone(),
            state: core.state_name().unwrap_or_default(),
            action: action.name(),
            event: received.map(EventInfo::event_type),
        });

        let handler = action.handler();
        let executed = self.execute(
            runtime,
            core,
            action.name(),
            received,
            inside_on_exit,
            |machine, ctx| handler(machine, ctx),
        )?;
        self.complete(runtime, core, action.name(), executed)
    }

    fn resume(
        &self,
        runtime: &Runtime,
        core: &mut Core<M>,
        action: ActionName,
        continuation: Continuation<M>,
        event: EventInfo,
    ) -> Result<Executed<M>, RuntimeError> {
        let received = event.clone();
        self.execute(runtime, core, action, Some(&received), false, move |machine, ctx| {
            continuation(machine, ctx, event)
        })
    }

    /// Invoke user code and translate whatever escaped it.
    fn execute<F>(
        &self,
        runtime: &Runtime,
        core: &mut Core<M>,
        action: ActionName,
        received: Option<&EventInfo>,
        inside_on_exit: bool,
        body: F,
    ) -> Result<Executed<M>, RuntimeError>
    where
        F: FnOnce(&mut M, &mut ActionContext<'_, M>) -> ActionResult<M>,
    {
        let state = core.state_name().unwrap_or_default();
        core.scope.begin(inside_on_exit);

        let Core {
            machine,
            scope,
            operation,
            ..
        } = core;
        let mut ctx = ActionContext {
            runtime,
            id: &self.id,
            definition: self.definition.as_ref(),
            state,
            action,
            received,
            operation: *operation,
            scope,
        };

        let result = if runtime.config().catch_action_panics {
            panic::catch_unwind(AssertUnwindSafe(|| body(machine, &mut ctx)))
                .unwrap_or_else(|payload| Err(ActionError::fault(panic_message(&*payload))))
        } else {
            body(machine, &mut ctx)
        };

        if let Some(violation) = core.scope.violation.take() {
            return Err(self.protocol(Some(state), violation));
        }

        match result {
            Ok(outcome) => Ok(Executed::Outcome(outcome)),
            Err(err) => self.action_failed(runtime, core, state, action, err),
        }
    }

    fn action_failed(
        &self,
        runtime: &Runtime,
        core: &mut Core<M>,
        state: StateName,
        action: ActionName,
        err: ActionError,
    ) -> Result<Executed<M>, RuntimeError> {
        if matches!(err, ActionError::Faulted(_)) {
            match core.machine.on_exception(action, &err) {
                ExceptionOutcome::Throw => {}
                ExceptionOutcome::Handled => {
                    tracing::debug!(machine = %self.id, state, action, error = %err, "action fault handled");
                    return Ok(Executed::Outcome(ActionOutcome::Completed));
                }
                ExceptionOutcome::Halt => {
                    tracing::debug!(machine = %self.id, state, action, error = %err, "action fault halts machine");
                    self.halt(runtime, core);
                    return Ok(Executed::Halted);
                }
            }
        }

        match err {
            ActionError::Cancelled => {
                tracing::debug!(machine = %self.id, state, action, "action cancelled");
                self.halt_abnormally(runtime, core);
                Ok(Executed::Halted)
            }

            ActionError::Violation(violation) => Err(self.protocol(Some(state), violation)),

            ActionError::Assertion(message) => Err(RuntimeError::AssertionFailure(format!(
                "{} in state '{state}' (action '{action}'): {message}",
                self.id
            ))),

            ActionError::Runtime(err) => Err(*err),

            ActionError::Faulted(err) => {
                let message = format!("{err:#}");
                tracing::error!(machine = %self.id, state, action, error = %message, "action faulted");
                self.halt_abnormally(runtime, core);
                Err(ActionFault {
                    machine: self.id.clone(),
                    state,
                    action,
                    message,
                }
                .into())
            }
        }
    }

    /// Process what an action asked for once it returned.
    fn complete(
        &self,
        runtime: &Runtime,
        core: &mut Core<M>,
        action: ActionName,
        mut executed: Executed<M>,
    ) -> Result<Flow, RuntimeError> {
        loop {
            let outcome = match executed {
                Executed::Halted => return Ok(Flow::Halted),
                Executed::Outcome(outcome) => outcome,
            };

            let state = core.state_name().unwrap_or_default();
            let Receive {
                handlers,
                continuation,
            } = match outcome {
                ActionOutcome::Completed => {
                    self.notify(runtime, core, Notification::CompletedAction {
                        machine: self.id.clone(),
                        state,
                        action,
                    });
                    return self.apply_statement(runtime, core);
                }

                ActionOutcome::Receive(receive) => receive,
            };

            if core.scope.inside_on_exit {
                return Err(self.protocol(
                    Some(state),
                    ProtocolViolation::ReceiveInsideOnExit { action },
                ));
            }

            if core.scope.statement.is_some() {
                return Err(self.protocol(
                    Some(state),
                    ProtocolViolation::CallAfterTransitionStatement {
                        action,
                        call: "receive",
                    },
                ));
            }

            self.notify(runtime, core, Notification::ReceiveCalled {
                machine: self.id.clone(),
                state,
            });

            let matched = {
                let mut mailbox = lock(&self.mailbox);
                let matched = mailbox.take_matching(&handlers);
                if matched.is_none() {
                    mailbox.wait(handlers.clone());
                }
                matched
            };

            let Some(event) = matched else {
                tracing::debug!(machine = %self.id, state, action, "waiting to receive");
                self.notify(runtime, core, Notification::WaitingToReceive {
                    machine: self.id.clone(),
                    state,
                    events: handlers.iter().map(WaitHandler::event_type).collect(),
                });
                core.suspended = Some(Suspended {
                    action,
                    handlers,
                    continuation,
                });
                return Ok(Flow::Suspended);
            };

            tracing::debug!(machine = %self.id, state, event = %event.event_type(), "received queued event");
            self.notify(runtime, core, Notification::ReceivedEvent {
                machine: self.id.clone(),
                state,
                event: event.event_type(),
            });
            executed = self.resume(runtime, core, action, continuation, event)?;
        }
    }

    fn apply_statement(&self, runtime: &Runtime, core: &mut Core<M>) -> Result<Flow, RuntimeError> {
        match core.scope.statement.take() {
            None => Ok(Flow::Continue),
            Some(Statement::Raise(event)) => {
                core.raised = Some(event);
                Ok(Flow::Continue)
            }
            Some(Statement::Pop) => self.pop_state(runtime, core),
        }
    }

    fn halt(&self, runtime: &Runtime, core: &mut Core<M>) -> Flow {
        let dropped = lock(&self.mailbox).halt();
        core.raised = None;
        core.suspended = None;
        core.handling = None;
        core.machine.on_halt();

        tracing::info!(machine = %self.id, dropped, "machine halted");
        self.notify(runtime, core, Notification::Halted {
            machine: self.id.clone(),
            dropped,
        });
        Flow::Halted
    }

    fn halt_abnormally(&self, runtime: &Runtime, core: &mut Core<M>) {
        let dropped = lock(&self.mailbox).halt();
        core.raised = None;
        core.suspended = None;
        core.handling = None;

        self.notify(runtime, core, Notification::Halted {
            machine: self.id.clone(),
            dropped,
        });
    }
}

impl<M: MachineType> AnyMachine for MachineCell<M> {
    fn id(&self) -> &MachineId {
        &self.id
    }

    fn enqueue(&self, info: EventInfo) -> Result<EnqueueStatus, RuntimeError> {
        lock(&self.mailbox)
            .enqueue(info)
            .map_err(|source| self.protocol(None, source))
    }

    fn run_handler(&self, runtime: &Runtime) -> Result<(), RuntimeError> {
        let mut guard = lock(&self.core);
        let core = &mut *guard;

        if lock(&self.mailbox).info().is_halted {
            return Ok(());
        }

        let flow = if !core.started {
            self.start(runtime, core)?
        } else if let Some(suspended) = core.suspended.take() {
            self.resume_suspended(runtime, core, suspended)?
        } else {
            Flow::Continue
        };

        match flow {
            Flow::Continue => self.event_loop(runtime, core),
            Flow::Suspended | Flow::Halted => Ok(()),
        }
    }

    fn info(&self) -> MachineInfo {
        lock(&self.mailbox).info()
    }

    fn current_state(&self) -> Option<StateName> {
        self.observe(Core::state_name, |snapshot| snapshot.stack.last().copied())
    }

    fn state_stack(&self) -> Vec<StateName> {
        self.observe(
            |core| core.stack.iter().map(|state| state.name()).collect(),
            |snapshot| snapshot.stack.clone(),
        )
    }

    fn inbox_len(&self) -> usize {
        lock(&self.mailbox).len()
    }

    fn cached_state(&self) -> u64 {
        self.observe(
            |core| self.hash_state(core, &lock(&self.mailbox)),
            |snapshot| snapshot.hash,
        )
    }

    fn prioritize_operation(&self, operation: OperationId) -> bool {
        lock(&self.mailbox).prioritize_operation(operation)
    }

    fn is_operation_pending(&self, operation: OperationId) -> bool {
        lock(&self.mailbox).is_operation_pending(operation)
    }
}

impl<M: MachineType> fmt::Debug for MachineCell<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineCell")
            .field("id", &self.id)
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

fn bound_action<M>(overlay: &HandlerMap<M>, event_type: &EventType) -> Option<MachineActionRef<M>> {
    match overlay.get(event_type) {
        Some(Handler::Action(action)) => Some(action.clone()),
        _ => None,
    }
}

/// Look up `event_type` in the overlay, falling back to its wildcard entry. Events with a
/// transition in the current state are never ignored or deferred.
fn overlay_entry<'a, M>(
    top: &StateDescriptor<M>,
    overlay: &'a HandlerMap<M>,
    event_type: &EventType,
) -> Option<&'a Handler<M>> {
    if top.has_transition(event_type) || is_state_change(event_type) {
        return None;
    }

    overlay
        .get(event_type)
        .or_else(|| overlay.get(&EventType::of::<WildCard>()))
}

/// Goto and push requests always reach the state that asked for them.
fn is_state_change(event_type: &EventType) -> bool {
    event_type.is::<GotoStateEvent>() || event_type.is::<PushStateEvent>()
}

fn is_ignored<M>(top: &StateDescriptor<M>, overlay: &HandlerMap<M>, event_type: &EventType) -> bool {
    matches!(overlay_entry(top, overlay, event_type), Some(Handler::Ignore))
}

fn disposition<M>(
    top: &StateDescriptor<M>,
    overlay: &HandlerMap<M>,
    event_type: &EventType,
) -> Disposition {
    let family_ignored = overlay
        .iter()
        .any(|(ignored, handler)| matches!(handler, Handler::Ignore) && ignored.same_family(event_type));
    if family_ignored && !is_state_change(event_type) {
        return Disposition::Ignore;
    }

    match overlay_entry(top, overlay, event_type) {
        Some(Handler::Ignore) => Disposition::Ignore,
        Some(Handler::Defer) => Disposition::Defer,
        Some(Handler::Action(_)) | None => Disposition::Deliver,
    }
}

fn has_default_handler<M>(top: &StateDescriptor<M>, overlay: &HandlerMap<M>) -> bool {
    let default = EventType::of::<DefaultEvent>();
    overlay.contains_key(&default)
        || top.goto_transitions.contains_key(&default)
        || top.push_transitions.contains_key(&default)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;
    mod nested {
        pub struct Wrapper<T>(pub T);
    }

    #[test]
    fn test_short_type_names() {
        assert_eq!(short_type_name::<Plain>(), "Plain");
        assert_eq!(short_type_name::<nested::Wrapper<Plain>>(), "Wrapper");
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom");

        let payload = panic::catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(panic_message(&*payload), "formatted 1");
    }
}
