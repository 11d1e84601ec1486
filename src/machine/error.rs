use std::fmt;

use crate::action::ActionName;
use crate::state::StateName;

/// Which declared queue bound an enqueue exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundKind {
    Assert,
    Assume,
}

impl fmt::Display for BoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assert => f.write_str("assert"),
            Self::Assume => f.write_str("assume"),
        }
    }
}

/// Misuse of the machine model by a single machine instance.
///
/// Violations are always fatal to the whole run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("action '{action}' has called multiple raise, goto, push or pop in the same action")]
    MultipleTransitionStatements { action: ActionName },

    #[error("action '{action}' has called raise, goto, push or pop inside an OnExit method")]
    TransitionInsideOnExit { action: ActionName },

    #[error("action '{action}' has called receive inside an OnExit method")]
    ReceiveInsideOnExit { action: ActionName },

    #[error("action '{action}' has called '{call}' after a raise, goto, push or pop statement")]
    CallAfterTransitionStatement {
        action: ActionName,
        call: &'static str,
    },

    #[error("received event '{event}' that cannot be handled")]
    UnhandledEvent { event: &'static str },

    #[error("popped with no matching push")]
    PopWithEmptyStack,

    #[error("there are more than {limit} instances of '{event}' in the input queue ({bound} bound)")]
    QueueBoundExceeded {
        event: &'static str,
        bound: BoundKind,
        limit: usize,
    },

    #[error("state '{state}' is not declared")]
    UnknownState { state: StateName },
}
