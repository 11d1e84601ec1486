use crate::action::ActionName;
use crate::machine::error::ProtocolViolation;
use crate::machine_id::MachineId;
use crate::runtime::machine_map::error::{
    MachineAlreadyPresent, MachineNotFound, MonitorAlreadyRegistered,
};
use crate::state::StateName;
use crate::state::error::ConfigurationError;

/// An error escaped user action code and halted the machine running it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{machine} faulted in state '{state}' while running action '{action}': {message}")]
pub struct ActionFault {
    pub machine: MachineId,
    pub state: StateName,
    pub action: ActionName,
    pub message: String,
}

/// Errors surfaced by the runtime to the host.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// A machine or monitor type is declared inconsistently.
    #[error("invalid configuration of '{type_name}'")]
    Configuration {
        type_name: &'static str,
        #[source]
        source: ConfigurationError,
    },

    /// A machine misused the machine model.
    #[error("{machine}{}: {source}", in_state(.state))]
    Protocol {
        machine: MachineId,
        state: Option<StateName>,
        #[source]
        source: ProtocolViolation,
    },

    /// User action code failed. Only the offending machine is halted.
    #[error(transparent)]
    ActionFault(#[from] ActionFault),

    /// An assertion made by user code failed.
    #[error("assertion failure: {0}")]
    AssertionFailure(String),

    /// A monitor detected a safety violation.
    #[error("monitor '{monitor}' detected a violation: {message}")]
    SpecificationViolation {
        monitor: &'static str,
        message: String,
    },

    /// A monitor stayed in a hot state for too long, or at the end of the run.
    #[error("monitor '{monitor}' detected a liveness bug in hot state '{state}'")]
    LivenessViolation {
        monitor: &'static str,
        state: StateName,
    },

    #[error(transparent)]
    MachineAlreadyPresent(#[from] MachineAlreadyPresent),

    #[error(transparent)]
    MachineNotFound(#[from] MachineNotFound),

    #[error("monitor '{type_name}' is not registered")]
    MonitorNotFound { type_name: &'static str },

    #[error(transparent)]
    MonitorAlreadyRegistered(#[from] MonitorAlreadyRegistered),
}

impl RuntimeError {
    /// Whether the error terminates the run.
    ///
    /// Action faults only halt the machine that raised them.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ActionFault(_))
    }
}

fn in_state(state: &Option<StateName>) -> String {
    match state {
        Some(state) => format!(" in state '{state}'"),
        None => String::new(),
    }
}
