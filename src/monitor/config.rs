//! The declarative configuration surface of monitor types.

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::{ActionError, ActionName};
use crate::event::{Event, EventType};
use crate::monitor::MonitorContext;
use crate::state::StateName;
use crate::state::config::StateDecl;

pub(crate) type MonitorAction<T> =
    dyn Fn(&mut T, &mut MonitorContext<'_, T>) -> Result<(), ActionError> + Send + Sync;

/// Builder the [`MonitorType::configure`](crate::monitor::MonitorType::configure) hook populates.
///
/// Monitor states have no stack: they support goto transitions, actions and ignores, and may be
/// marked hot (progress is pending) or cold (progress was made).
///
/// # Example
/// ```ignore
/// fn configure(config: &mut MonitorConfig<Self>) {
///     config.action("count", |monitor, _| {
///         monitor.pending += 1;
///         Ok(())
///     });
///
///     config.state("Idle").start().cold().on_event_goto::<Request>("Busy");
///     config.state("Busy").hot().on_event_goto::<Response>("Idle");
/// }
/// ```
pub struct MonitorConfig<T> {
    type_name: &'static str,
    pub(crate) states: Vec<StateDecl>,
    pub(crate) actions: HashMap<ActionName, Arc<MonitorAction<T>>>,
    pub(crate) duplicate_action: Option<ActionName>,
}

impl<T: 'static> MonitorConfig<T> {
    pub(crate) fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            states: Vec::new(),
            actions: HashMap::new(),
            duplicate_action: None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn action<F>(&mut self, name: ActionName, action: F) -> &mut Self
    where
        F: Fn(&mut T, &mut MonitorContext<'_, T>) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        if self.actions.insert(name, Arc::new(action)).is_some() && self.duplicate_action.is_none() {
            self.duplicate_action = Some(name);
        }
        self
    }

    pub fn state(&mut self, name: StateName) -> MonitorStateBuilder<'_> {
        let index = self.states.len();
        self.states.push(StateDecl::new(name));
        MonitorStateBuilder {
            decl: &mut self.states[index],
        }
    }
}

/// Declares the handlers of one monitor state.
pub struct MonitorStateBuilder<'a> {
    decl: &'a mut StateDecl,
}

impl MonitorStateBuilder<'_> {
    pub fn start(self) -> Self {
        self.decl.is_start = true;
        self
    }

    /// Mark this state as one the monitored system must eventually leave.
    pub fn hot(self) -> Self {
        self.decl.is_hot = true;
        self
    }

    /// Mark this state as one where the monitored system made progress.
    pub fn cold(self) -> Self {
        self.decl.is_cold = true;
        self
    }

    pub fn on_entry(self, action: ActionName) -> Self {
        self.decl.entry = Some(action);
        self
    }

    pub fn on_exit(self, action: ActionName) -> Self {
        self.decl.exit = Some(action);
        self
    }

    pub fn on_event_goto<E: Event>(self, target: StateName) -> Self {
        let event = EventType::of::<E>();
        self.decl.claim(event);
        self.decl.gotos.push((event, target, None));
        self
    }

    pub fn on_event_goto_do<E: Event>(self, target: StateName, action: ActionName) -> Self {
        let event = EventType::of::<E>();
        self.decl.claim(event);
        self.decl.gotos.push((event, target, Some(action)));
        self
    }

    pub fn on_event_do<E: Event>(self, action: ActionName) -> Self {
        let event = EventType::of::<E>();
        self.decl.claim(event);
        self.decl.actions.push((event, action));
        self
    }

    pub fn ignore<E: Event>(self) -> Self {
        let event = EventType::of::<E>();
        self.decl.claim(event);
        self.decl.ignored.push(event);
        self
    }
}
