/// Scheduling bookkeeping of one machine, guarded by its mailbox lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MachineInfo {
    /// A handler task is scheduled or executing.
    pub is_running: bool,
    /// The machine processed a halt and will never run again.
    pub is_halted: bool,
    /// An action is suspended on a receive.
    pub is_waiting: bool,
}

impl MachineInfo {
    /// Whether an enqueue should schedule a new handler task.
    pub fn is_idle(&self) -> bool {
        !self.is_running && !self.is_waiting && !self.is_halted
    }
}
