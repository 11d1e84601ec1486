use crate::action::ActionName;
use crate::state::StateName;

/// Indicates that a machine or monitor type is declared inconsistently.
///
/// These errors are detected once per type, the first time an instance of it is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("'{machine}' must declare a start state")]
    NoStartState { machine: &'static str },

    #[error("'{machine}' declares more than one start state: {states:?}")]
    MultipleStartStates {
        machine: &'static str,
        states: Vec<StateName>,
    },

    #[error("'{machine}' declares state '{state}' more than once")]
    DuplicateState {
        machine: &'static str,
        state: StateName,
    },

    #[error("'{machine}' registers action '{action}' more than once")]
    DuplicateAction {
        machine: &'static str,
        action: ActionName,
    },

    #[error("state '{state}' of '{machine}' refers to undeclared action '{action}'")]
    UndeclaredAction {
        machine: &'static str,
        state: StateName,
        action: ActionName,
    },

    #[error("state '{state}' of '{machine}' transitions to undeclared state '{target}'")]
    UndeclaredState {
        machine: &'static str,
        state: StateName,
        target: StateName,
    },

    #[error("state '{state}' of '{machine}' declares more than one handler for event '{event}'")]
    DuplicateHandler {
        machine: &'static str,
        state: StateName,
        event: &'static str,
    },

    #[error("state '{state}' of monitor '{machine}' cannot be both hot and cold")]
    HotAndCold {
        machine: &'static str,
        state: StateName,
    },
}
