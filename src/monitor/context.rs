use std::fmt;

use crate::action::{ActionError, ActionName};
use crate::event::{Event, EventInfo, GotoStateEvent, OperationId};
use crate::machine::context::{ActionScope, Statement};
use crate::machine::error::ProtocolViolation;
use crate::monitor::MonitorDefinition;
use crate::runtime::Runtime;
use crate::runtime::scheduler::Notification;
use crate::state::StateName;

/// The capabilities available to a monitor action.
pub struct MonitorContext<'a, T> {
    pub(crate) runtime: &'a Runtime,
    pub(crate) definition: &'a MonitorDefinition<T>,
    pub(crate) state: StateName,
    pub(crate) action: ActionName,
    pub(crate) received: Option<&'a EventInfo>,
    pub(crate) scope: &'a mut ActionScope,
}

impl<T> MonitorContext<'_, T> {
    pub fn monitor_name(&self) -> &'static str {
        self.definition.type_name()
    }

    pub fn current_state(&self) -> StateName {
        self.state
    }

    pub fn received_event(&self) -> Option<&EventInfo> {
        self.received
    }

    pub fn event<E: Event>(&self) -> Option<&E> {
        self.received.and_then(EventInfo::downcast_ref::<E>)
    }

    /// Process `event` right after this action, before control returns to the observed machine.
    pub fn raise<E: Event>(&mut self, event: E) -> Result<(), ActionError> {
        self.scope.check_statement(self.action)?;

        let info = EventInfo::new(event, None, OperationId::NONE);
        self.runtime.notify(Notification::MonitorRaisedEvent {
            monitor: self.monitor_name(),
            state: self.state,
            event: info.event_type(),
        });
        self.scope.statement = Some(Statement::Raise(info));
        Ok(())
    }

    pub fn goto(&mut self, state: StateName) -> Result<(), ActionError> {
        if !self.definition.contains_state(state) {
            return Err(self.scope.reject(ProtocolViolation::UnknownState { state }));
        }

        self.raise(GotoStateEvent { state })
    }

    /// Report a safety violation unless `condition` holds.
    pub fn assert(&self, condition: bool, message: impl fmt::Display) -> Result<(), ActionError> {
        if condition {
            Ok(())
        } else {
            Err(ActionError::Assertion(message.to_string()))
        }
    }
}

impl<T> fmt::Debug for MonitorContext<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorContext")
            .field("monitor", &self.monitor_name())
            .field("state", &self.state)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}
