use std::fmt;

use crate::action::{ActionError, ActionName};
use crate::event::{Event, EventInfo, EventOrigin, GotoStateEvent, OperationId, PushStateEvent};
use crate::machine::error::ProtocolViolation;
use crate::machine::{MachineOptions, MachineType};
use crate::machine_id::MachineId;
use crate::monitor::MonitorType;
use crate::runtime::Runtime;
use crate::runtime::scheduler::Notification;
use crate::state::{MachineDefinition, StateName};

/// The raise, goto, push or pop statement an action made.
#[derive(Debug)]
pub(crate) enum Statement {
    Raise(EventInfo),
    Pop,
}

/// Per-machine bookkeeping of the action currently executing.
#[derive(Debug, Default)]
pub(crate) struct ActionScope {
    pub(crate) statement: Option<Statement>,
    pub(crate) violation: Option<ProtocolViolation>,
    pub(crate) inside_on_exit: bool,
    /// Number of nondeterministic choices made since the last dequeue.
    pub(crate) program_counter: u64,
}

impl ActionScope {
    pub(crate) fn begin(&mut self, inside_on_exit: bool) {
        self.statement = None;
        self.violation = None;
        self.inside_on_exit = inside_on_exit;
    }

    /// Record `violation` so that it fails the action even if user code drops the error.
    pub(crate) fn reject(&mut self, violation: ProtocolViolation) -> ActionError {
        self.violation.get_or_insert_with(|| violation.clone());
        ActionError::Violation(violation)
    }

    /// Only one raise, goto, push or pop per action, and none inside an exit action.
    pub(crate) fn check_statement(&mut self, action: ActionName) -> Result<(), ActionError> {
        if self.inside_on_exit {
            return Err(self.reject(ProtocolViolation::TransitionInsideOnExit { action }));
        }

        if self.statement.is_some() {
            return Err(self.reject(ProtocolViolation::MultipleTransitionStatements { action }));
        }

        Ok(())
    }

    fn check_choice(&mut self, action: ActionName, call: &'static str) -> Result<(), ActionError> {
        if self.statement.is_some() {
            return Err(self.reject(ProtocolViolation::CallAfterTransitionStatement { action, call }));
        }

        self.program_counter += 1;
        Ok(())
    }
}

/// The capabilities available to a machine action.
///
/// A context is only valid for the duration of one action invocation.
pub struct ActionContext<'a, M> {
    pub(crate) runtime: &'a Runtime,
    pub(crate) id: &'a MachineId,
    pub(crate) definition: &'a MachineDefinition<M>,
    pub(crate) state: StateName,
    pub(crate) action: ActionName,
    pub(crate) received: Option<&'a EventInfo>,
    pub(crate) operation: OperationId,
    pub(crate) scope: &'a mut ActionScope,
}

impl<M: MachineType> ActionContext<'_, M> {
    /// Id of the machine running the action.
    pub fn id(&self) -> &MachineId {
        self.id
    }

    /// Name of the state on top of the stack.
    pub fn current_state(&self) -> StateName {
        self.state
    }

    pub fn action_name(&self) -> ActionName {
        self.action
    }

    /// The event that triggered this action, if any.
    pub fn received_event(&self) -> Option<&EventInfo> {
        self.received
    }

    /// The triggering event as its concrete type.
    pub fn event<E: Event>(&self) -> Option<&E> {
        self.received.and_then(EventInfo::downcast_ref::<E>)
    }

    /// The operation of the event being handled.
    pub fn operation_id(&self) -> OperationId {
        self.operation
    }

    fn origin(&self) -> EventOrigin {
        EventOrigin {
            sender: self.id.clone(),
            sender_state: Some(self.state),
        }
    }

    /// Send `event` to `target`, inheriting the current operation.
    pub fn send<E: Event>(&mut self, target: &MachineId, event: E) -> Result<(), ActionError> {
        let info = EventInfo::new(event, Some(self.origin()), self.operation);
        self.runtime.deliver(target, info)?;
        Ok(())
    }

    /// Send `event` to `target` as the first event of a new operation.
    pub fn send_starter<E: Event>(
        &mut self,
        target: &MachineId,
        event: E,
    ) -> Result<OperationId, ActionError> {
        let operation = self.runtime.next_operation_id();
        let info = EventInfo::new(event, Some(self.origin()), operation);
        self.runtime.deliver(target, info)?;
        Ok(operation)
    }

    pub fn create_machine<T: MachineType>(&mut self, machine: T) -> Result<MachineId, ActionError> {
        self.create_machine_with(machine, MachineOptions::new())
    }

    pub fn create_machine_with<T: MachineType>(
        &mut self,
        machine: T,
        options: MachineOptions,
    ) -> Result<MachineId, ActionError> {
        let id = self
            .runtime
            .create_from(machine, options, Some(self.origin()), self.operation)?;
        Ok(id)
    }

    /// Synchronously hand `event` to the monitor of type `T`.
    pub fn monitor<T: MonitorType, E: Event>(&mut self, event: E) -> Result<(), ActionError> {
        let info = EventInfo::new(event, Some(self.origin()), self.operation);
        self.runtime.monitor_event::<T>(info)?;
        Ok(())
    }

    /// Handle `event` next, before anything queued in the inbox.
    pub fn raise<E: Event>(&mut self, event: E) -> Result<(), ActionError> {
        self.check_statement()?;

        let info = EventInfo::new(event, Some(self.origin()), self.operation);
        tracing::debug!(machine = %self.id, state = self.state, event = %info.event_type(), "raised event");
        self.runtime.notify(Notification::RaisedEvent {
            machine: self.id.clone(),
            state: self.state,
            event: info.event_type(),
        });
        self.scope.statement = Some(Statement::Raise(info));
        Ok(())
    }

    /// Exit the current state and enter `state` once the action completes.
    pub fn goto(&mut self, state: StateName) -> Result<(), ActionError> {
        self.check_target(state)?;
        self.raise(GotoStateEvent { state })
    }

    /// Push `state` on top of the current state once the action completes.
    pub fn push(&mut self, state: StateName) -> Result<(), ActionError> {
        self.check_target(state)?;
        self.raise(PushStateEvent { state })
    }

    /// Pop the current state once the action completes.
    pub fn pop(&mut self) -> Result<(), ActionError> {
        self.check_statement()?;

        self.runtime.notify(Notification::PopInvoked {
            machine: self.id.clone(),
            state: self.state,
        });
        self.scope.statement = Some(Statement::Pop);
        Ok(())
    }

    /// A nondeterministic boolean choice.
    pub fn random(&mut self) -> Result<bool, ActionError> {
        self.random_with_bound(2)
    }

    /// A nondeterministic boolean choice that is `true` with probability `1 / max_value`.
    pub fn random_with_bound(&mut self, max_value: u32) -> Result<bool, ActionError> {
        self.check_choice("random")?;
        Ok(self.runtime.scheduler().next_boolean(self.id, max_value))
    }

    /// A nondeterministic boolean choice that the scheduler must resolve fairly.
    pub fn fair_random(&mut self, unique_id: &str) -> Result<bool, ActionError> {
        self.check_choice("fair_random")?;
        Ok(self.runtime.scheduler().next_fair_boolean(self.id, unique_id))
    }

    /// A nondeterministic integer in `0..max_value`.
    pub fn random_integer(&mut self, max_value: u32) -> Result<u32, ActionError> {
        self.check_choice("random_integer")?;
        Ok(self.runtime.scheduler().next_integer(self.id, max_value))
    }

    /// Fail the run with `message` unless `condition` holds.
    pub fn assert(&self, condition: bool, message: impl fmt::Display) -> Result<(), ActionError> {
        if condition {
            Ok(())
        } else {
            Err(ActionError::Assertion(message.to_string()))
        }
    }

    fn check_statement(&mut self) -> Result<(), ActionError> {
        self.scope.check_statement(self.action)
    }

    fn check_target(&mut self, state: StateName) -> Result<(), ActionError> {
        if self.definition.contains_state(state) {
            return Ok(());
        }

        Err(self.scope.reject(ProtocolViolation::UnknownState { state }))
    }

    fn check_choice(&mut self, call: &'static str) -> Result<(), ActionError> {
        self.scope.check_choice(self.action, call)
    }
}

impl<M> fmt::Debug for ActionContext<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("id", self.id)
            .field("state", &self.state)
            .field("action", &self.action)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}
