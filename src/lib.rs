pub mod action;
pub mod event;
pub mod machine;
pub mod machine_id;
pub mod monitor;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod testing;

pub use action::{ActionError, ActionOutcome, ActionResult, WaitSet};
pub use event::{Event, EventInfo, EventType, Halt, OperationId, WildCard};
pub use machine::{ActionContext, ExceptionOutcome, MachineOptions, MachineType};
pub use machine_id::MachineId;
pub use monitor::{MonitorConfig, MonitorContext, MonitorType};
pub use runtime::Runtime;
pub use runtime::config::RuntimeConfig;
pub use runtime::error::{ActionFault, RuntimeError};
pub use state::StateName;
pub use state::config::MachineConfig;
