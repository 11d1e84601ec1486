use crate::machine_id::MachineId;

/// Indicates that a machine could not be inserted because its id is already taken.
#[derive(Debug, Clone, thiserror::Error)]
#[error("the provided machine id ({machine_id:?}) is already present")]
pub struct MachineAlreadyPresent {
    pub machine_id: MachineId,
}

/// Indicates that an operation addressed a machine that does not exist in this runtime.
#[derive(Debug, Clone, thiserror::Error)]
#[error("the provided machine id ({machine_id:?}) could not be found")]
pub struct MachineNotFound {
    pub machine_id: MachineId,
}

/// Indicates that a monitor type was registered twice.
#[derive(Debug, Clone, thiserror::Error)]
#[error("monitor '{type_name}' is already registered")]
pub struct MonitorAlreadyRegistered {
    pub type_name: &'static str,
}
