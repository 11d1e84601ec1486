//! The declarative configuration surface populated once per machine type.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::action::{ActionError, ActionName, ActionOutcome, ActionResult};
use crate::event::{Event, EventType};
use crate::machine::ActionContext;
use crate::state::error::ConfigurationError;
use crate::state::{MachineAction, StateName};

/// Name-level declaration of one state, shared by machine and monitor configurations.
#[derive(Debug, Clone)]
pub(crate) struct StateDecl {
    pub(crate) name: StateName,
    pub(crate) is_start: bool,
    pub(crate) is_hot: bool,
    pub(crate) is_cold: bool,
    pub(crate) entry: Option<ActionName>,
    pub(crate) exit: Option<ActionName>,
    pub(crate) gotos: Vec<(EventType, StateName, Option<ActionName>)>,
    pub(crate) pushes: Vec<(EventType, StateName)>,
    pub(crate) actions: Vec<(EventType, ActionName)>,
    pub(crate) ignored: Vec<EventType>,
    pub(crate) deferred: Vec<EventType>,
    handled: HashSet<EventType>,
    duplicate: Option<EventType>,
}

impl StateDecl {
    pub(crate) fn new(name: StateName) -> Self {
        Self {
            name,
            is_start: false,
            is_hot: false,
            is_cold: false,
            entry: None,
            exit: None,
            gotos: Vec::new(),
            pushes: Vec::new(),
            actions: Vec::new(),
            ignored: Vec::new(),
            deferred: Vec::new(),
            handled: HashSet::new(),
            duplicate: None,
        }
    }

    /// Record that `event` is handled by this state, remembering the first duplicate.
    pub(crate) fn claim(&mut self, event: EventType) {
        if !self.handled.insert(event) && self.duplicate.is_none() {
            self.duplicate = Some(event);
        }
    }

    fn referenced_actions(&self) -> impl Iterator<Item = ActionName> + '_ {
        self.entry
            .iter()
            .chain(self.exit.iter())
            .copied()
            .chain(self.gotos.iter().filter_map(|(_, _, action)| *action))
            .chain(self.actions.iter().map(|(_, action)| *action))
    }

    fn referenced_states(&self) -> impl Iterator<Item = StateName> + '_ {
        self.gotos
            .iter()
            .map(|(_, target, _)| *target)
            .chain(self.pushes.iter().map(|(_, target)| *target))
    }
}

/// Validate a set of state declarations and return the name of the single start state.
pub(crate) fn validate_states(
    machine: &'static str,
    states: &[StateDecl],
    is_action_declared: impl Fn(ActionName) -> bool,
) -> Result<StateName, ConfigurationError> {
    let mut names = HashSet::new();
    for decl in states {
        if !names.insert(decl.name) {
            return Err(ConfigurationError::DuplicateState {
                machine,
                state: decl.name,
            });
        }
    }

    for decl in states {
        if let Some(event) = decl.duplicate {
            return Err(ConfigurationError::DuplicateHandler {
                machine,
                state: decl.name,
                event: event.name(),
            });
        }

        if decl.is_hot && decl.is_cold {
            return Err(ConfigurationError::HotAndCold {
                machine,
                state: decl.name,
            });
        }

        if let Some(action) = decl.referenced_actions().find(|a| !is_action_declared(*a)) {
            return Err(ConfigurationError::UndeclaredAction {
                machine,
                state: decl.name,
                action,
            });
        }

        if let Some(target) = decl.referenced_states().find(|s| !names.contains(s)) {
            return Err(ConfigurationError::UndeclaredState {
                machine,
                state: decl.name,
                target,
            });
        }
    }

    let starts: Vec<StateName> = states.iter().filter(|s| s.is_start).map(|s| s.name).collect();
    match starts.as_slice() {
        [] => Err(ConfigurationError::NoStartState { machine }),
        [start] => Ok(*start),
        _ => Err(ConfigurationError::MultipleStartStates {
            machine,
            states: starts,
        }),
    }
}

/// Builder the [`MachineType::configure`](crate::machine::MachineType::configure) hook
/// populates: the states of a machine type and the actions they refer to by name.
///
/// # Example
/// ```ignore
/// fn configure(config: &mut MachineConfig<Self>) {
///     config
///         .action("on_ping", |server, ctx| {
///             server.pings += 1;
///             ctx.send(&server.client, Pong)
///         });
///
///     config
///         .state("Init")
///         .start()
///         .on_event_do::<Ping>("on_ping")
///         .defer::<Shutdown>();
/// }
/// ```
pub struct MachineConfig<M> {
    type_name: &'static str,
    pub(crate) states: Vec<StateDecl>,
    pub(crate) actions: HashMap<ActionName, Arc<MachineAction<M>>>,
    pub(crate) duplicate_action: Option<ActionName>,
}

impl<M: 'static> MachineConfig<M> {
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

    /// Register an action that always runs to completion.
    pub fn action<F>(&mut self, name: ActionName, action: F) -> &mut Self
    where
        F: Fn(&mut M, &mut ActionContext<'_, M>) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        self.register(
            name,
            machine_action(move |machine, ctx| {
                action(machine, ctx).map(|()| ActionOutcome::Completed)
            }),
        )
    }

    /// Register an action that may suspend on a receive.
    pub fn receiving_action<F>(&mut self, name: ActionName, action: F) -> &mut Self
    where
        F: Fn(&mut M, &mut ActionContext<'_, M>) -> ActionResult<M> + Send + Sync + 'static,
    {
        self.register(name, machine_action(action))
    }

    fn register(&mut self, name: ActionName, action: Arc<MachineAction<M>>) -> &mut Self {
        if self.actions.insert(name, action).is_some() && self.duplicate_action.is_none() {
            self.duplicate_action = Some(name);
        }
        self
    }

    /// Declare a new state.
    pub fn state(&mut self, name: StateName) -> StateBuilder<'_> {
        let index = self.states.len();
        self.states.push(StateDecl::new(name));
        StateBuilder {
            decl: &mut self.states[index],
        }
    }
}

fn machine_action<M, F>(action: F) -> Arc<MachineAction<M>>
where
    F: Fn(&mut M, &mut ActionContext<'_, M>) -> ActionResult<M> + Send + Sync + 'static,
{
    Arc::new(action)
}

/// Declares the handlers of one machine state.
pub struct StateBuilder<'a> {
    decl: &'a mut StateDecl,
}

impl StateBuilder<'_> {
    /// Mark this state as the start state of the machine.
    pub fn start(self) -> Self {
        self.decl.is_start = true;
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

    /// On `E`, exit this state and enter `target`.
    pub fn on_event_goto<E: Event>(self, target: StateName) -> Self {
        let event = EventType::of::<E>();
        self.decl.claim(event);
        self.decl.gotos.push((event, target, None));
        self
    }

    /// On `E`, exit this state, run `action` after the exit action, then enter `target`.
    pub fn on_event_goto_do<E: Event>(self, target: StateName, action: ActionName) -> Self {
        let event = EventType::of::<E>();
        self.decl.claim(event);
        self.decl.gotos.push((event, target, Some(action)));
        self
    }

    /// On `E`, push `target` on top of this state.
    pub fn on_event_push<E: Event>(self, target: StateName) -> Self {
        let event = EventType::of::<E>();
        self.decl.claim(event);
        self.decl.pushes.push((event, target));
        self
    }

    /// On `E`, run `action` and stay in this state.
    pub fn on_event_do<E: Event>(self, action: ActionName) -> Self {
        let event = EventType::of::<E>();
        self.decl.claim(event);
        self.decl.actions.push((event, action));
        self
    }

    /// Keep `E` queued while this state (or a state pushed on top of it) is current.
    pub fn defer<E: Event>(self) -> Self {
        let event = EventType::of::<E>();
        self.decl.claim(event);
        self.decl.deferred.push(event);
        self
    }

    /// Drop `E` without handling it while this state is current.
    pub fn ignore<E: Event>(self) -> Self {
        let event = EventType::of::<E>();
        self.decl.claim(event);
        self.decl.ignored.push(event);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping;
    impl Event for Ping {}

    struct Dummy;

    fn config() -> MachineConfig<Dummy> {
        let mut config = MachineConfig::new("Dummy");
        config.action("noop", |_, _| Ok(()));
        config
    }

    fn validate(config: &MachineConfig<Dummy>) -> Result<StateName, ConfigurationError> {
        validate_states(config.type_name(), &config.states, |name| {
            config.actions.contains_key(name)
        })
    }

    #[test]
    fn test_single_start_state() {
        let mut config = config();
        config.state("Init").start().on_event_goto::<Ping>("Done");
        config.state("Done").on_entry("noop");

        assert_eq!(validate(&config), Ok("Init"));
    }

    #[test]
    fn test_missing_and_duplicate_start() {
        let mut config = config();
        config.state("A");
        assert_eq!(
            validate(&config),
            Err(ConfigurationError::NoStartState { machine: "Dummy" })
        );

        config.state("B").start();
        config.state("C").start();
        assert!(matches!(
            validate(&config),
            Err(ConfigurationError::MultipleStartStates { states, .. }) if states == vec!["B", "C"]
        ));
    }

    #[test]
    fn test_undeclared_references() {
        let mut config = config();
        config.state("Init").start().on_entry("missing");
        assert!(matches!(
            validate(&config),
            Err(ConfigurationError::UndeclaredAction { action: "missing", .. })
        ));

        let mut config = self::config();
        config.state("Init").start().on_event_push::<Ping>("Nowhere");
        assert!(matches!(
            validate(&config),
            Err(ConfigurationError::UndeclaredState { target: "Nowhere", .. })
        ));
    }

    #[test]
    fn test_duplicate_handler_and_state() {
        let mut config = config();
        config
            .state("Init")
            .start()
            .on_event_do::<Ping>("noop")
            .defer::<Ping>();
        assert!(matches!(
            validate(&config),
            Err(ConfigurationError::DuplicateHandler { state: "Init", .. })
        ));

        let mut config = self::config();
        config.state("Init").start();
        config.state("Init");
        assert!(matches!(
            validate(&config),
            Err(ConfigurationError::DuplicateState { state: "Init", .. })
        ));
    }
}
