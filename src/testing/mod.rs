//! Deterministic, single-threaded execution for tests.
//!
//! A [`ControlledScheduler`] queues handler tasks instead of running them and executes them one at
//! a time from [`run`](ControlledScheduler::run), picking the next task either in scheduling order
//! or at random from a seeded generator. Every notification the engine emits is recorded.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::machine::lock;
use crate::machine_id::MachineId;
use crate::runtime::Runtime;
use crate::runtime::config::RuntimeConfig;
use crate::runtime::error::RuntimeError;
use crate::runtime::scheduler::{HandlerTask, Notification, Scheduler};

/// How the next handler task is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// In the order the tasks were scheduled.
    #[default]
    Fifo,
    /// Uniformly at random.
    Random,
}

pub struct ControlledScheduler {
    strategy: Strategy,
    max_steps: u64,
    queue: Mutex<VecDeque<HandlerTask>>,
    rng: Mutex<StdRng>,
    trace: Mutex<Vec<Notification>>,
    steps: AtomicU64,
    exhausted: AtomicBool,
    runtime: Mutex<Option<Runtime>>,
}

impl ControlledScheduler {
    pub fn new(strategy: Strategy, seed: u64, max_steps: u64) -> Self {
        Self {
            strategy,
            max_steps,
            queue: Mutex::new(VecDeque::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            trace: Mutex::new(Vec::new()),
            steps: AtomicU64::new(0),
            exhausted: AtomicBool::new(false),
            runtime: Mutex::new(None),
        }
    }

    /// Run queued handler tasks until none is left, the runtime stops, or the step budget is
    /// exhausted. Returns the error that terminated the run, if any.
    ///
    /// Every monitor in a hot state gets one liveness check per executed task.
    pub fn run(&self, runtime: &Runtime) -> Result<(), RuntimeError> {
        *lock(&self.runtime) = Some(runtime.clone());

        while runtime.is_running() {
            let Some(task) = self.next_task() else {
                break;
            };

            tracing::trace!(machine = %task.machine_id(), "running handler");
            task.run();

            if runtime.check_liveness_temperature().is_err() {
                break;
            }
        }

        lock(&self.runtime).take();
        let dropped = mem::take(&mut *lock(&self.queue));
        if !dropped.is_empty() {
            tracing::debug!(tasks = dropped.len(), "dropped pending handlers");
        }
        drop(dropped);

        match runtime.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_task(&self) -> Option<HandlerTask> {
        let mut queue = lock(&self.queue);
        match self.strategy {
            Strategy::Fifo => queue.pop_front(),
            Strategy::Random if queue.is_empty() => None,
            Strategy::Random => {
                let index = lock(&self.rng).random_range(0..queue.len());
                queue.remove(index)
            }
        }
    }

    /// Every notification emitted so far.
    pub fn trace(&self) -> Vec<Notification> {
        lock(&self.trace).clone()
    }

    /// Notifications about `machine`.
    pub fn trace_of(&self, machine: &MachineId) -> Vec<Notification> {
        lock(&self.trace)
            .iter()
            .filter(|notification| notification.machine() == Some(machine))
            .cloned()
            .collect()
    }

    /// Number of events handled so far.
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Whether the last run stopped because it reached the step budget.
    pub fn reached_max_steps(&self) -> bool {
        self.exhausted.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }
}

impl Scheduler for ControlledScheduler {
    fn schedule(&self, task: HandlerTask) {
        lock(&self.queue).push_back(task);
    }

    fn next_boolean(&self, _caller: &MachineId, max_value: u32) -> bool {
        lock(&self.rng).random_range(0..max_value.max(1)) == 0
    }

    fn next_integer(&self, _caller: &MachineId, max_value: u32) -> u32 {
        lock(&self.rng).random_range(0..max_value.max(1))
    }

    fn notify(&self, notification: &Notification) {
        let handled = matches!(
            notification,
            Notification::DequeuedEvent { .. }
                | Notification::HandlingRaisedEvent { .. }
                | Notification::DefaultHandlerFired { .. }
                | Notification::ReceivedEvent { .. }
        );

        lock(&self.trace).push(notification.clone());
        if !handled {
            return;
        }

        let steps = self.steps.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_steps > 0 && steps >= self.max_steps && !self.exhausted.swap(true, Ordering::Relaxed) {
            tracing::warn!(steps, "reached maximum number of steps");
            if let Some(runtime) = lock(&self.runtime).as_ref() {
                runtime.stop();
            }
        }
    }
}

impl fmt::Debug for ControlledScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlledScheduler")
            .field("strategy", &self.strategy)
            .field("max_steps", &self.max_steps)
            .field("steps", &self.steps())
            .finish_non_exhaustive()
    }
}

/// Build a runtime driven by a [`ControlledScheduler`] seeded from `config`.
pub fn controlled(config: RuntimeConfig, strategy: Strategy) -> (Runtime, Arc<ControlledScheduler>) {
    let scheduler = Arc::new(ControlledScheduler::new(
        strategy,
        config.seed.unwrap_or_default(),
        config.max_steps,
    ));
    let runtime = Runtime::with_scheduler(config, scheduler.clone());
    (runtime, scheduler)
}
