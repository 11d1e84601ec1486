//! Specification monitors.
//!
//! A monitor is a passive state machine that observes events machines hand to it synchronously
//! and flags safety violations (an event it cannot handle, or a failed assertion) and liveness
//! violations (staying in a hot state for too long).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::action::{ActionError, ActionName, ActionRef};
use crate::event::{EventInfo, EventType, GotoStateEvent, WildCard};
use crate::machine::context::{ActionScope, Statement};
use crate::machine::{lock, panic_message, short_type_name};
use crate::runtime::Runtime;
use crate::runtime::error::RuntimeError;
use crate::runtime::scheduler::Notification;
use crate::state::error::ConfigurationError;
use crate::state::{GotoTransition, StateName};
use crate::state::config::validate_states;

pub use self::config::{MonitorConfig, MonitorStateBuilder};
pub use self::context::MonitorContext;

use self::config::MonitorAction;

pub mod config;
pub mod context;

/// A user-defined monitor type. At most one monitor of each type is registered per runtime.
pub trait MonitorType: Send + Sized + 'static {
    fn configure(config: &mut MonitorConfig<Self>);

    fn type_name() -> &'static str {
        short_type_name::<Self>()
    }
}

type MonitorActionRef<T> = ActionRef<MonitorAction<T>>;

/// Immutable description of one monitor state.
pub struct MonitorState<T> {
    name: StateName,
    is_hot: bool,
    is_cold: bool,
    entry: Option<MonitorActionRef<T>>,
    exit: Option<MonitorActionRef<T>>,
    gotos: HashMap<EventType, GotoTransition<MonitorAction<T>>>,
    actions: HashMap<EventType, MonitorActionRef<T>>,
    ignored: HashSet<EventType>,
}

impl<T> MonitorState<T> {
    pub fn name(&self) -> StateName {
        self.name
    }

    pub fn is_hot(&self) -> bool {
        self.is_hot
    }

    pub fn is_cold(&self) -> bool {
        self.is_cold
    }

    /// A wildcard ignore drops every event without an exact handler. Goto requests are never
    /// ignored.
    fn is_ignored(&self, event: &EventType) -> bool {
        if event.is::<GotoStateEvent>() {
            return false;
        }

        if self.ignored.contains(event) {
            return true;
        }

        self.ignored.contains(&EventType::of::<WildCard>())
            && !self.gotos.contains_key(event)
            && !self.actions.contains_key(event)
    }
}

impl<T> fmt::Debug for MonitorState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorState")
            .field("name", &self.name)
            .field("is_hot", &self.is_hot)
            .field("is_cold", &self.is_cold)
            .finish_non_exhaustive()
    }
}

/// The validated states of one monitor type.
pub struct MonitorDefinition<T> {
    type_name: &'static str,
    states: HashMap<StateName, Arc<MonitorState<T>>>,
    start: Arc<MonitorState<T>>,
}

impl<T: 'static> MonitorDefinition<T> {
    pub(crate) fn build(config: MonitorConfig<T>) -> Result<Self, ConfigurationError> {
        let type_name = config.type_name();
        if let Some(action) = config.duplicate_action {
            return Err(ConfigurationError::DuplicateAction {
                machine: type_name,
                action,
            });
        }

        let actions = config.actions;
        let start = validate_states(type_name, &config.states, |name| actions.contains_key(name))?;

        let mut states = HashMap::with_capacity(config.states.len());
        for decl in config.states {
            let resolve = |action: ActionName| -> Result<MonitorActionRef<T>, ConfigurationError> {
                actions
                    .get(action)
                    .map(|handler| ActionRef::new(action, Arc::clone(handler)))
                    .ok_or(ConfigurationError::UndeclaredAction {
                        machine: type_name,
                        state: decl.name,
                        action,
                    })
            };

            let mut gotos = HashMap::with_capacity(decl.gotos.len());
            for (event, target, action) in &decl.gotos {
                let action = action.map(&resolve).transpose()?;
                gotos.insert(
                    *event,
                    GotoTransition {
                        target: *target,
                        action,
                    },
                );
            }

            let mut bound = HashMap::with_capacity(decl.actions.len());
            for (event, action) in &decl.actions {
                bound.insert(*event, resolve(*action)?);
            }

            let state = MonitorState {
                name: decl.name,
                is_hot: decl.is_hot,
                is_cold: decl.is_cold,
                entry: decl.entry.map(&resolve).transpose()?,
                exit: decl.exit.map(&resolve).transpose()?,
                gotos,
                actions: bound,
                ignored: decl.ignored.iter().copied().collect(),
            };

            states.insert(decl.name, Arc::new(state));
        }

        let start = states
            .get(start)
            .cloned()
            .ok_or(ConfigurationError::NoStartState { machine: type_name })?;

        Ok(Self {
            type_name,
            states,
            start,
        })
    }

    pub fn start_state(&self) -> &Arc<MonitorState<T>> {
        &self.start
    }

    pub fn state(&self, name: &str) -> Option<&Arc<MonitorState<T>>> {
        self.states.get(name)
    }
}

impl<T> MonitorDefinition<T> {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn contains_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }
}

impl<T> fmt::Debug for MonitorDefinition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorDefinition")
            .field("type_name", &self.type_name)
            .field("start", &self.start.name)
            .field("states", &self.states.len())
            .finish()
    }
}

/// Type-erased view of a registered monitor.
pub(crate) trait AnyMonitor: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Enter the start state.
    fn start(&self, runtime: &Runtime) -> Result<(), RuntimeError>;

    /// Handle `event` and every event raised while handling it.
    fn process(&self, runtime: &Runtime, event: EventInfo) -> Result<(), RuntimeError>;

    fn current_state(&self) -> Option<StateName>;

    fn is_hot(&self) -> bool;

    fn is_cold(&self) -> bool;

    /// Count one more step spent in a hot state and fail once the count exceeds `threshold`.
    fn check_liveness_temperature(&self, threshold: u32) -> Result<(), RuntimeError>;

    fn temperature(&self) -> u32;
}

struct MonitorCore<T> {
    monitor: T,
    state: Option<Arc<MonitorState<T>>>,
    scope: ActionScope,
}

/// The queryable part of a monitor. Kept apart from the core so that schedulers may query
/// monitors from inside a notification.
struct MonitorStatus<T> {
    state: Option<Arc<MonitorState<T>>>,
    temperature: u32,
}

/// The single registered instance of a monitor type.
pub(crate) struct MonitorCell<T: MonitorType> {
    definition: Arc<MonitorDefinition<T>>,
    core: Mutex<MonitorCore<T>>,
    status: Mutex<MonitorStatus<T>>,
}

impl<T: MonitorType> MonitorCell<T> {
    pub(crate) fn new(definition: Arc<MonitorDefinition<T>>, monitor: T) -> Self {
        Self {
            definition,
            core: Mutex::new(MonitorCore {
                monitor,
                state: None,
                scope: ActionScope::default(),
            }),
            status: Mutex::new(MonitorStatus {
                state: None,
                temperature: 0,
            }),
        }
    }

    fn set_state(&self, core: &mut MonitorCore<T>, state: Option<Arc<MonitorState<T>>>) {
        let mut status = lock(&self.status);
        if state.as_ref().is_some_and(|s| s.is_cold) {
            status.temperature = 0;
        }
        status.state = state.clone();
        core.state = state;
    }

    fn name(&self) -> &'static str {
        self.definition.type_name()
    }

    fn violation(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::SpecificationViolation {
            monitor: self.name(),
            message: message.into(),
        }
    }

    /// Keep handling raised events until an action completes without raising.
    fn drain(
        &self,
        runtime: &Runtime,
        core: &mut MonitorCore<T>,
        mut raised: Option<EventInfo>,
    ) -> Result<(), RuntimeError> {
        while let Some(event) = raised.take() {
            raised = self.handle(runtime, core, event)?;
        }
        Ok(())
    }

    fn handle(
        &self,
        runtime: &Runtime,
        core: &mut MonitorCore<T>,
        event: EventInfo,
    ) -> Result<Option<EventInfo>, RuntimeError> {
        let Some(state) = core.state.clone() else {
            return Ok(None);
        };

        if let Some(goto) = event.downcast_ref::<GotoStateEvent>() {
            return self.goto_state(runtime, core, goto.state, None, &event);
        }

        let event_type = event.event_type();
        if state.is_ignored(&event_type) {
            tracing::trace!(monitor = self.name(), state = state.name(), event = %event_type, "monitor ignored event");
            return Ok(None);
        }

        let wildcard = EventType::of::<WildCard>();
        let goto = state
            .gotos
            .get(&event_type)
            .or_else(|| state.gotos.get(&wildcard));
        if let Some(transition) = goto {
            return self.goto_state(
                runtime,
                core,
                transition.target,
                transition.action.as_ref(),
                &event,
            );
        }

        let action = state
            .actions
            .get(&event_type)
            .or_else(|| state.actions.get(&wildcard));
        if let Some(action) = action {
            return self.run_action(runtime, core, action, Some(&event), false);
        }

        runtime.notify(Notification::MonitorExitedState {
            monitor: self.name(),
            state: state.name(),
        });
        self.set_state(core, None);

        Err(self.violation(format!(
            "received event '{event_type}' that cannot be handled in state '{}'",
            state.name()
        )))
    }

    fn goto_state(
        &self,
        runtime: &Runtime,
        core: &mut MonitorCore<T>,
        target: StateName,
        transition_action: Option<&MonitorActionRef<T>>,
        event: &EventInfo,
    ) -> Result<Option<EventInfo>, RuntimeError> {
        let Some(target) = self.definition.states.get(target).cloned() else {
            return Err(self.violation(format!("transition to unknown state '{target}'")));
        };

        if let Some(current) = core.state.clone() {
            runtime.notify(Notification::MonitorExitedState {
                monitor: self.name(),
                state: current.name(),
            });

            for action in current.exit.iter().chain(transition_action) {
                self.run_action(runtime, core, action, Some(event), true)?;
            }
        }

        self.enter_state(runtime, core, target, Some(event))
    }

    fn enter_state(
        &self,
        runtime: &Runtime,
        core: &mut MonitorCore<T>,
        target: Arc<MonitorState<T>>,
        received: Option<&EventInfo>,
    ) -> Result<Option<EventInfo>, RuntimeError> {
        tracing::debug!(monitor = self.name(), state = target.name(), hot = target.is_hot, cold = target.is_cold, "monitor entered state");
        runtime.notify(Notification::MonitorEnteredState {
            monitor: self.name(),
            state: target.name(),
            is_hot: target.is_hot,
            is_cold: target.is_cold,
        });

        self.set_state(core, Some(Arc::clone(&target)));

        match &target.entry {
            Some(entry) => self.run_action(runtime, core, entry, received, false),
            None => Ok(None),
        }
    }

    fn run_action(
        &self,
        runtime: &Runtime,
        core: &mut MonitorCore<T>,
        action: &MonitorActionRef<T>,
        received: Option<&EventInfo>,
        inside_on_exit: bool,
    ) -> Result<Option<EventInfo>, RuntimeError> {
        let state = core.state.as_ref().map(|s| s.name()).unwrap_or_default();
        runtime.notify(Notification::MonitorInvokedAction {
            monitor: self.name(),
            state,
            action: action.name(),
        });

        core.scope.begin(inside_on_exit);
        let MonitorCore { monitor, scope, .. } = core;
        let mut ctx = MonitorContext {
            runtime,
            definition: self.definition.as_ref(),
            state,
            action: action.name(),
            received,
            scope,
        };

        let handler = action.handler();
        let result = if runtime.config().catch_action_panics {
            panic::catch_unwind(AssertUnwindSafe(|| handler(monitor, &mut ctx)))
                .unwrap_or_else(|payload| Err(ActionError::fault(panic_message(&*payload))))
        } else {
            handler(monitor, &mut ctx)
        };

        if let Some(violation) = core.scope.violation.take() {
            return Err(self.violation(violation.to_string()));
        }

        match result {
            Ok(()) => {}
            Err(ActionError::Cancelled) => {
                tracing::debug!(monitor = self.name(), state, action = action.name(), "monitor action cancelled");
            }
            Err(ActionError::Violation(violation)) => return Err(self.violation(violation.to_string())),
            Err(ActionError::Assertion(message)) => return Err(self.violation(message)),
            Err(ActionError::Faulted(err)) => return Err(self.violation(format!("{err:#}"))),
            Err(ActionError::Runtime(err)) => return Err(*err),
        }

        match core.scope.statement.take() {
            Some(Statement::Raise(event)) => Ok(Some(event)),
            Some(Statement::Pop) | None => Ok(None),
        }
    }
}

impl<T: MonitorType> AnyMonitor for MonitorCell<T> {
    fn type_name(&self) -> &'static str {
        self.name()
    }

    fn start(&self, runtime: &Runtime) -> Result<(), RuntimeError> {
        let mut guard = lock(&self.core);
        let core = &mut *guard;
        if core.state.is_some() {
            return Ok(());
        }

        let start = Arc::clone(self.definition.start_state());
        let raised = self.enter_state(runtime, core, start, None)?;
        self.drain(runtime, core, raised)
    }

    fn process(&self, runtime: &Runtime, event: EventInfo) -> Result<(), RuntimeError> {
        let mut guard = lock(&self.core);
        let core = &mut *guard;

        let Some(state) = core.state.as_ref().map(|s| s.name()) else {
            tracing::trace!(monitor = self.name(), event = %event.event_type(), "monitor is not in a state");
            return Ok(());
        };

        runtime.notify(Notification::MonitorEvent {
            monitor: self.name(),
            state,
            event: event.event_type(),
        });
        self.drain(runtime, core, Some(event))
    }

    fn current_state(&self) -> Option<StateName> {
        lock(&self.status).state.as_ref().map(|s| s.name())
    }

    fn is_hot(&self) -> bool {
        lock(&self.status).state.as_ref().is_some_and(|s| s.is_hot)
    }

    fn is_cold(&self) -> bool {
        lock(&self.status).state.as_ref().is_some_and(|s| s.is_cold)
    }

    fn check_liveness_temperature(&self, threshold: u32) -> Result<(), RuntimeError> {
        let mut status = lock(&self.status);
        let Some(state) = status.state.as_ref().filter(|s| s.is_hot).map(|s| s.name()) else {
            return Ok(());
        };

        status.temperature += 1;
        if threshold > 0 && status.temperature > threshold {
            tracing::error!(monitor = self.name(), state, temperature = status.temperature, "liveness temperature exceeded");
            return Err(RuntimeError::LivenessViolation {
                monitor: self.name(),
                state,
            });
        }

        Ok(())
    }

    fn temperature(&self) -> u32 {
        lock(&self.status).temperature
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[derive(Debug)]
    struct Request;
    impl Event for Request {}

    #[derive(Debug)]
    struct Response;
    impl Event for Response {}

    struct Progress;

    fn config() -> MonitorConfig<Progress> {
        let mut config = MonitorConfig::new("Progress");
        config.action("noop", |_, _| Ok(()));
        config
    }

    #[test]
    fn test_build_hot_and_cold_states() {
        let mut config = config();
        config
            .state("Idle")
            .start()
            .cold()
            .on_event_goto::<Request>("Busy");
        config
            .state("Busy")
            .hot()
            .on_event_goto_do::<Response>("Idle", "noop");

        let definition = MonitorDefinition::build(config).unwrap();
        let idle = definition.start_state();
        let busy = definition.state("Busy").unwrap();

        assert_eq!(idle.name(), "Idle");
        assert!(idle.is_cold() && !idle.is_hot());
        assert!(busy.is_hot() && !busy.is_cold());
        assert!(definition.contains_state("Busy"));
    }

    #[test]
    fn test_hot_and_cold_state_is_rejected() {
        let mut config = config();
        config.state("Both").start().hot().cold();

        assert!(matches!(
            MonitorDefinition::build(config),
            Err(ConfigurationError::HotAndCold { state: "Both", .. })
        ));
    }

    #[test]
    fn test_wildcard_ignore_spares_exact_handlers() {
        let mut config = config();
        config
            .state("Idle")
            .start()
            .ignore::<WildCard>()
            .on_event_do::<Request>("noop");

        let definition = MonitorDefinition::build(config).unwrap();
        let idle = definition.start_state();

        assert!(!idle.is_ignored(&EventType::of::<Request>()));
        assert!(idle.is_ignored(&EventType::of::<Response>()));
        assert!(!idle.is_ignored(&EventType::of::<GotoStateEvent>()));
    }
}
