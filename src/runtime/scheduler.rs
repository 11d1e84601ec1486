//! The contract between the dispatch engine and whatever decides which machine runs next.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::runtime::Handle;

use crate::action::ActionName;
use crate::event::{EventType, OperationId};
use crate::machine::AnyMachine;
use crate::machine_id::MachineId;
use crate::runtime::Runtime;
use crate::state::StateName;

/// A decision point reported by the engine.
///
/// Schedulers use these to record and replay executions and to drive liveness checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    EnteredState {
        machine: MachineId,
        state: StateName,
    },
    ExitedState {
        machine: MachineId,
        state: StateName,
    },
    InvokedAction {
        machine: MachineId,
        state: StateName,
        action: ActionName,
        event: Option<EventType>,
    },
    CompletedAction {
        machine: MachineId,
        state: StateName,
        action: ActionName,
    },
    RaisedEvent {
        machine: MachineId,
        state: StateName,
        event: EventType,
    },
    DequeuedEvent {
        machine: MachineId,
        state: StateName,
        event: EventType,
        operation: OperationId,
    },
    HandlingRaisedEvent {
        machine: MachineId,
        state: StateName,
        event: EventType,
    },
    ReceiveCalled {
        machine: MachineId,
        state: StateName,
    },
    WaitingToReceive {
        machine: MachineId,
        state: StateName,
        events: Vec<EventType>,
    },
    ReceivedEvent {
        machine: MachineId,
        state: StateName,
        event: EventType,
    },
    PopInvoked {
        machine: MachineId,
        state: StateName,
    },
    /// `state` was removed from the top of the stack.
    PoppedState {
        machine: MachineId,
        state: StateName,
    },
    /// `state` was pushed on top of the stack.
    PushedState {
        machine: MachineId,
        state: StateName,
    },
    Halted {
        machine: MachineId,
        dropped: usize,
    },
    DefaultHandlerFired {
        machine: MachineId,
        state: StateName,
    },
    MonitorEvent {
        monitor: &'static str,
        state: StateName,
        event: EventType,
    },
    MonitorEnteredState {
        monitor: &'static str,
        state: StateName,
        is_hot: bool,
        is_cold: bool,
    },
    MonitorExitedState {
        monitor: &'static str,
        state: StateName,
    },
    MonitorInvokedAction {
        monitor: &'static str,
        state: StateName,
        action: ActionName,
    },
    MonitorRaisedEvent {
        monitor: &'static str,
        state: StateName,
        event: EventType,
    },
}

impl Notification {
    /// The machine the notification is about, if it is about a machine.
    pub fn machine(&self) -> Option<&MachineId> {
        match self {
            Self::EnteredState { machine, .. }
            | Self::ExitedState { machine, .. }
            | Self::InvokedAction { machine, .. }
            | Self::CompletedAction { machine, .. }
            | Self::RaisedEvent { machine, .. }
            | Self::DequeuedEvent { machine, .. }
            | Self::HandlingRaisedEvent { machine, .. }
            | Self::ReceiveCalled { machine, .. }
            | Self::WaitingToReceive { machine, .. }
            | Self::ReceivedEvent { machine, .. }
            | Self::PopInvoked { machine, .. }
            | Self::PoppedState { machine, .. }
            | Self::PushedState { machine, .. }
            | Self::Halted { machine, .. }
            | Self::DefaultHandlerFired { machine, .. } => Some(machine),
            Self::MonitorEvent { .. }
            | Self::MonitorEnteredState { .. }
            | Self::MonitorExitedState { .. }
            | Self::MonitorInvokedAction { .. }
            | Self::MonitorRaisedEvent { .. } => None,
        }
    }
}

/// Decides when handler tasks run and resolves nondeterministic choices.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `task` at some point in the future. Must not run it on the calling stack.
    fn schedule(&self, task: HandlerTask);

    /// Returns `true` with probability `1 / max_value`.
    fn next_boolean(&self, caller: &MachineId, max_value: u32) -> bool;

    /// A boolean choice that must not be starved: identified by `unique_id` so that repeated
    /// evaluations of the same choice can be made fair.
    fn next_fair_boolean(&self, caller: &MachineId, unique_id: &str) -> bool {
        let _ = unique_id;
        self.next_boolean(caller, 2)
    }

    /// Returns an integer in `0..max_value`.
    fn next_integer(&self, caller: &MachineId, max_value: u32) -> u32;

    fn notify(&self, notification: &Notification) {
        let _ = notification;
    }
}

/// One invocation of the event handler of a machine.
///
/// The runtime guarantees that at most one task per machine exists at a time.
pub struct HandlerTask {
    machine: Arc<dyn AnyMachine>,
    runtime: Runtime,
}

impl HandlerTask {
    pub(crate) fn new(machine: Arc<dyn AnyMachine>, runtime: Runtime) -> Self {
        runtime.handler_started();
        Self { machine, runtime }
    }

    pub fn machine_id(&self) -> &MachineId {
        self.machine.id()
    }

    /// Run the handler of the machine until its inbox is drained, it suspends, or it halts.
    pub fn run(self) {
        if let Err(err) = self.machine.run_handler(&self.runtime) {
            self.runtime.report(err);
        }
    }
}

impl Drop for HandlerTask {
    fn drop(&mut self) {
        self.runtime.handler_finished();
    }
}

impl fmt::Debug for HandlerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTask")
            .field("machine", self.machine.id())
            .finish()
    }
}

/// Production scheduler: handler tasks run on a tokio runtime, choices come from a seeded RNG.
pub struct TokioScheduler {
    handle: Handle,
    rng: Mutex<StdRng>,
}

impl TokioScheduler {
    /// Create a scheduler spawning onto the current tokio runtime.
    ///
    /// # Panics
    /// If called outside the context of a tokio runtime.
    pub fn new(seed: Option<u64>) -> Self {
        Self::with_handle(Handle::current(), seed)
    }

    pub fn with_handle(handle: Handle, seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        Self {
            handle,
            rng: Mutex::new(rng),
        }
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: HandlerTask) {
        self.handle.spawn(async move { task.run() });
    }

    fn next_boolean(&self, _caller: &MachineId, max_value: u32) -> bool {
        self.with_rng(|rng| rng.random_range(0..max_value.max(1)) == 0)
    }

    fn next_integer(&self, _caller: &MachineId, max_value: u32) -> u32 {
        self.with_rng(|rng| rng.random_range(0..max_value.max(1)))
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler").finish_non_exhaustive()
    }
}
