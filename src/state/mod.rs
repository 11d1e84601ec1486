//! Per-type state descriptors.
//!
//! A [`MachineDefinition`] is computed once per machine type from its [`MachineConfig`] and shared
//! read-only by every instance of that type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::action::{ActionName, ActionRef, ActionResult};
use crate::event::{EventType, WildCard};
use crate::machine::ActionContext;

use self::config::{MachineConfig, validate_states};
use self::error::ConfigurationError;

pub mod config;
pub mod error;

/// Name a state is declared under.
pub type StateName = &'static str;

pub(crate) type MachineAction<M> =
    dyn Fn(&mut M, &mut ActionContext<'_, M>) -> ActionResult<M> + Send + Sync;

pub(crate) type MachineActionRef<M> = ActionRef<MachineAction<M>>;

/// How the current state overlay treats an event type that has no transition.
pub(crate) enum Handler<M> {
    Action(MachineActionRef<M>),
    Defer,
    Ignore,
}

impl<M> Clone for Handler<M> {
    fn clone(&self) -> Self {
        match self {
            Self::Action(action) => Self::Action(action.clone()),
            Self::Defer => Self::Defer,
            Self::Ignore => Self::Ignore,
        }
    }
}

impl<M> fmt::Debug for Handler<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action(action) => write!(f, "Action({})", action.name()),
            Self::Defer => f.write_str("Defer"),
            Self::Ignore => f.write_str("Ignore"),
        }
    }
}

/// Cumulative action/defer/ignore overlay of a state and every state below it on the stack.
pub(crate) type HandlerMap<M> = HashMap<EventType, Handler<M>>;

/// Target of a goto transition and the action run between exit and entry.
pub(crate) struct GotoTransition<A: ?Sized> {
    pub(crate) target: StateName,
    pub(crate) action: Option<ActionRef<A>>,
}

/// Immutable description of one state of a machine type.
pub struct StateDescriptor<M> {
    name: StateName,
    is_start: bool,
    pub(crate) entry: Option<MachineActionRef<M>>,
    pub(crate) exit: Option<MachineActionRef<M>>,
    pub(crate) goto_transitions: HashMap<EventType, GotoTransition<MachineAction<M>>>,
    pub(crate) push_transitions: HashMap<EventType, StateName>,
    pub(crate) action_bindings: HashMap<EventType, MachineActionRef<M>>,
    pub(crate) ignored: Vec<EventType>,
    pub(crate) deferred: Vec<EventType>,
}

impl<M> StateDescriptor<M> {
    pub fn name(&self) -> StateName {
        self.name
    }

    pub fn is_start(&self) -> bool {
        self.is_start
    }

    /// Whether a goto or push transition of this state applies to `event`, directly or through a
    /// wildcard.
    pub(crate) fn has_transition(&self, event: &EventType) -> bool {
        let wildcard = EventType::of::<WildCard>();
        self.goto_transitions.contains_key(event)
            || self.push_transitions.contains_key(event)
            || self.goto_transitions.contains_key(&wildcard)
            || self.push_transitions.contains_key(&wildcard)
    }

    /// Compute the overlay this state contributes when it is pushed on top of `base`.
    ///
    /// Deferred, action and ignored entries are layered over the base in that order. A wildcard
    /// entry in any of them replaces the overlay entirely. Events with a goto or push transition
    /// are removed, since transitions always take precedence.
    pub(crate) fn overlay(&self, base: Option<&HandlerMap<M>>) -> HandlerMap<M> {
        let mut map = base.cloned().unwrap_or_default();

        layer(&mut map, self.deferred.iter().map(|event| (*event, Handler::Defer)));
        layer(
            &mut map,
            self.action_bindings
                .iter()
                .map(|(event, action)| (*event, Handler::Action(action.clone()))),
        );
        layer(&mut map, self.ignored.iter().map(|event| (*event, Handler::Ignore)));

        let wildcard = EventType::of::<WildCard>();
        for event in self.goto_transitions.keys().chain(self.push_transitions.keys()) {
            if *event == wildcard {
                map.clear();
                break;
            }

            map.remove(event);
        }

        map
    }
}

fn layer<M>(map: &mut HandlerMap<M>, entries: impl Iterator<Item = (EventType, Handler<M>)>) {
    let wildcard = EventType::of::<WildCard>();
    for (event, handler) in entries {
        if event == wildcard {
            map.clear();
            map.insert(event, handler);
            break;
        }

        map.insert(event, handler);
    }
}

impl<M> fmt::Debug for StateDescriptor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDescriptor")
            .field("name", &self.name)
            .field("is_start", &self.is_start)
            .field("entry", &self.entry)
            .field("exit", &self.exit)
            .field("ignored", &self.ignored)
            .field("deferred", &self.deferred)
            .finish_non_exhaustive()
    }
}

/// The validated, resolved set of states of one machine type.
pub struct MachineDefinition<M> {
    type_name: &'static str,
    states: HashMap<StateName, Arc<StateDescriptor<M>>>,
    start: Arc<StateDescriptor<M>>,
}

impl<M: 'static> MachineDefinition<M> {
    /// Validate `config` and resolve every action name it refers to.
    pub(crate) fn build(config: MachineConfig<M>) -> Result<Self, ConfigurationError> {
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
            let resolve = |action: ActionName| -> Result<MachineActionRef<M>, ConfigurationError> {
                actions
                    .get(action)
                    .map(|handler| ActionRef::new(action, Arc::clone(handler)))
                    .ok_or(ConfigurationError::UndeclaredAction {
                        machine: type_name,
                        state: decl.name,
                        action,
                    })
            };

            let mut goto_transitions = HashMap::with_capacity(decl.gotos.len());
            for (event, target, action) in &decl.gotos {
                let action = action.map(&resolve).transpose()?;
                goto_transitions.insert(
                    *event,
                    GotoTransition {
                        target: *target,
                        action,
                    },
                );
            }

            let mut action_bindings = HashMap::with_capacity(decl.actions.len());
            for (event, action) in &decl.actions {
                action_bindings.insert(*event, resolve(*action)?);
            }

            let descriptor = StateDescriptor {
                name: decl.name,
                is_start: decl.is_start,
                entry: decl.entry.map(&resolve).transpose()?,
                exit: decl.exit.map(&resolve).transpose()?,
                goto_transitions,
                push_transitions: decl.pushes.iter().copied().collect(),
                action_bindings,
                ignored: decl.ignored.clone(),
                deferred: decl.deferred.clone(),
            };

            states.insert(decl.name, Arc::new(descriptor));
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

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn start_state(&self) -> &Arc<StateDescriptor<M>> {
        &self.start
    }

    pub fn state(&self, name: &str) -> Option<&Arc<StateDescriptor<M>>> {
        self.states.get(name)
    }

    pub fn contains_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }
}

impl<M> fmt::Debug for MachineDefinition<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineDefinition")
            .field("type_name", &self.type_name)
            .field("start", &self.start.name)
            .field("states", &self.states.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[derive(Debug)]
    struct Ping;
    impl Event for Ping {}

    #[derive(Debug)]
    struct Pong;
    impl Event for Pong {}

    #[derive(Debug)]
    struct Tick;
    impl Event for Tick {}

    struct Dummy;

    fn definition(configure: impl FnOnce(&mut MachineConfig<Dummy>)) -> MachineDefinition<Dummy> {
        let mut config = MachineConfig::new("Dummy");
        config.action("act", |_, _| Ok(()));
        configure(&mut config);
        MachineDefinition::build(config).unwrap()
    }

    fn kind(map: &HandlerMap<Dummy>, event: EventType) -> Option<&'static str> {
        map.get(&event).map(|handler| match handler {
            Handler::Action(_) => "action",
            Handler::Defer => "defer",
            Handler::Ignore => "ignore",
        })
    }

    #[test]
    fn test_build_resolves_actions() {
        let definition = definition(|config| {
            config
                .state("Init")
                .start()
                .on_entry("act")
                .on_event_goto_do::<Ping>("Next", "act");
            config.state("Next").on_event_do::<Pong>("act");
        });

        let init = definition.start_state();
        assert_eq!(init.name(), "Init");
        assert_eq!(init.entry.as_ref().map(|a| a.name()), Some("act"));
        assert!(init.has_transition(&EventType::of::<Ping>()));
        assert!(!init.has_transition(&EventType::of::<Pong>()));
        assert!(definition.contains_state("Next"));
        assert!(!definition.contains_state("Missing"));
    }

    #[test]
    fn test_overlay_is_cumulative() {
        let definition = definition(|config| {
            config.state("Outer").start().defer::<Ping>().ignore::<Tick>();
            config.state("Inner").on_event_do::<Pong>("act");
        });

        let outer = definition.state("Outer").unwrap().overlay(None);
        let inner = definition.state("Inner").unwrap().overlay(Some(&outer));

        assert_eq!(kind(&inner, EventType::of::<Ping>()), Some("defer"));
        assert_eq!(kind(&inner, EventType::of::<Tick>()), Some("ignore"));
        assert_eq!(kind(&inner, EventType::of::<Pong>()), Some("action"));
    }

    #[test]
    fn test_transitions_take_precedence_in_overlay() {
        let definition = definition(|config| {
            config.state("Outer").start().defer::<Ping>();
            config.state("Inner").on_event_goto::<Ping>("Outer");
        });

        let outer = definition.state("Outer").unwrap().overlay(None);
        let inner = definition.state("Inner").unwrap().overlay(Some(&outer));

        assert_eq!(kind(&inner, EventType::of::<Ping>()), None);
    }

    #[test]
    fn test_wildcard_replaces_overlay() {
        let definition = definition(|config| {
            config.state("Outer").start().defer::<Ping>().ignore::<Tick>();
            config.state("Inner").ignore::<WildCard>();
            config.state("Other").on_event_push::<WildCard>("Outer");
        });

        let outer = definition.state("Outer").unwrap().overlay(None);
        let inner = definition.state("Inner").unwrap().overlay(Some(&outer));
        let other = definition.state("Other").unwrap().overlay(Some(&outer));

        assert_eq!(inner.len(), 1);
        assert_eq!(kind(&inner, EventType::of::<WildCard>()), Some("ignore"));
        assert!(other.is_empty());
    }
}
