//! The runtime: owns every machine and monitor of one execution and routes events between them.

use std::any::TypeId;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::event::{Event, EventInfo, EventOrigin, OperationId};
use crate::machine::info::MachineInfo;
use crate::machine::mailbox::EnqueueStatus;
use crate::machine::{AnyMachine, MachineCell, MachineOptions, MachineType, lock};
use crate::machine_id::{MachineId, MachineIdGenerator};
use crate::monitor::config::MonitorConfig;
use crate::monitor::{AnyMonitor, MonitorCell, MonitorDefinition, MonitorType};
use crate::registry::DefinitionRegistry;
use crate::state::config::MachineConfig;
use crate::state::{MachineDefinition, StateName};

use self::config::RuntimeConfig;
use self::error::{ActionFault, RuntimeError};
use self::machine_map::{MachineMap, MonitorMap};
use self::scheduler::{HandlerTask, Notification, Scheduler, TokioScheduler};

pub mod config;
pub mod error;
pub mod machine_map;
pub mod scheduler;


struct RuntimeInner {
    config: RuntimeConfig,
    machines: MachineMap<dyn AnyMachine>,
    monitors: MonitorMap<dyn AnyMonitor>,
    definitions: DefinitionRegistry,
    ids: MachineIdGenerator,
    is_running: AtomicBool,
    failure: Mutex<Option<RuntimeError>>,
    faults: Mutex<Vec<ActionFault>>,
    operations: AtomicU64,
    scheduler: Arc<dyn Scheduler>,
    /// Number of handler tasks scheduled or running.
    active: watch::Sender<usize>,
}

/// Handle to one execution of a set of machines.
///
/// Cloning is cheap, every clone refers to the same execution.
///
/// # Example
/// ```ignore
/// let runtime = Runtime::new(RuntimeConfig::default());
/// let server = runtime.create_machine(Server::default())?;
/// runtime.send_event(&server, Ping)?;
/// runtime.wait_until_idle().await?;
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime whose handlers run on the current tokio runtime.
    ///
    /// # Panics
    /// If called outside the context of a tokio runtime.
    pub fn new(config: RuntimeConfig) -> Self {
        let scheduler = Arc::new(TokioScheduler::new(config.seed));
        Self::with_scheduler(config, scheduler)
    }

    pub fn with_scheduler(config: RuntimeConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                machines: MachineMap::new(),
                monitors: MonitorMap::new(),
                definitions: DefinitionRegistry::new(),
                ids: MachineIdGenerator::new(),
                is_running: AtomicBool::new(true),
                failure: Mutex::new(None),
                faults: Mutex::new(Vec::new()),
                operations: AtomicU64::new(1),
                scheduler,
                active: watch::Sender::new(0),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    fn definition<T: MachineType>(&self) -> Result<Arc<MachineDefinition<T>>, RuntimeError> {
        self.inner
            .definitions
            .get_or_build(|| {
                let mut config = MachineConfig::new(T::type_name());
                T::configure(&mut config);
                MachineDefinition::build(config)
            })
            .map_err(|source| RuntimeError::Configuration {
                type_name: T::type_name(),
                source,
            })
    }

    fn monitor_definition<T: MonitorType>(
        &self,
    ) -> Result<Arc<MonitorDefinition<T>>, RuntimeError> {
        self.inner
            .definitions
            .get_or_build(|| {
                let mut config = MonitorConfig::new(T::type_name());
                T::configure(&mut config);
                MonitorDefinition::build(config)
            })
            .map_err(|source| RuntimeError::Configuration {
                type_name: T::type_name(),
                source,
            })
    }

    /// Create a machine and schedule it to enter its start state.
    pub fn create_machine<T: MachineType>(&self, machine: T) -> Result<MachineId, RuntimeError> {
        self.create_machine_with(machine, MachineOptions::new())
    }

    pub fn create_machine_with<T: MachineType>(
        &self,
        machine: T,
        options: MachineOptions,
    ) -> Result<MachineId, RuntimeError> {
        self.create_from(machine, options, None, OperationId::NONE)
    }

    pub(crate) fn create_from<T: MachineType>(
        &self,
        machine: T,
        options: MachineOptions,
        origin: Option<EventOrigin>,
        operation: OperationId,
    ) -> Result<MachineId, RuntimeError> {
        let definition = self.definition::<T>()?;
        let id = self.inner.ids.next_id(
            T::type_name(),
            options.name.as_deref(),
            options.endpoint.as_deref(),
        );

        let initial_event = options
            .initial_event
            .map(|event| event.with_origin(origin, operation));
        let cell = Arc::new(MachineCell::new(
            id.clone(),
            definition,
            machine,
            initial_event,
            operation,
        ));

        self.inner.machines.insert_machine(id.clone(), cell.clone())?;
        tracing::debug!(machine = %id, "created machine");

        self.schedule(cell);
        Ok(id)
    }

    /// Send `event` to `target` from outside any machine.
    pub fn send_event<E: Event>(&self, target: &MachineId, event: E) -> Result<(), RuntimeError> {
        self.deliver(target, EventInfo::new(event, None, OperationId::NONE))
    }

    /// Send `event` to `target` as the first event of a new operation.
    pub fn send_starter_event<E: Event>(
        &self,
        target: &MachineId,
        event: E,
    ) -> Result<OperationId, RuntimeError> {
        let operation = self.next_operation_id();
        self.deliver(target, EventInfo::new(event, None, operation))?;
        Ok(operation)
    }

    /// Send `event` to `target` once `delay` has elapsed.
    ///
    /// # Panics
    /// If called outside the context of a tokio runtime.
    pub fn send_after<E: Event>(
        &self,
        target: MachineId,
        event: E,
        delay: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if let Err(err) = runtime.send_event(&target, event) {
                tracing::warn!(machine = %target, error = %err, "failed to deliver delayed event");
            }
        })
    }

    /// Queue-bound violations fail the whole run, whoever the sender is.
    pub(crate) fn deliver(&self, target: &MachineId, info: EventInfo) -> Result<(), RuntimeError> {
        let machine = self.inner.machines.get_machine(target)?;

        let status = machine.enqueue(info).inspect_err(|err| {
            if matches!(err, RuntimeError::Protocol { .. }) {
                self.report(err.clone());
            }
        })?;
        match status {
            EnqueueStatus::NeedsHandler => self.schedule(machine),
            EnqueueStatus::Dropped | EnqueueStatus::Queued | EnqueueStatus::Delivered => {}
        }

        Ok(())
    }

    fn schedule(&self, machine: Arc<dyn AnyMachine>) {
        if !self.is_running() {
            tracing::trace!(machine = %machine.id(), "runtime stopped, not scheduling handler");
            return;
        }

        self.inner
            .scheduler
            .schedule(HandlerTask::new(machine, self.clone()));
    }

    /// Register the single instance of monitor type `T` and enter its start state.
    pub fn register_monitor<T: MonitorType>(&self, monitor: T) -> Result<(), RuntimeError> {
        let definition = self.monitor_definition::<T>()?;
        let cell: Arc<dyn AnyMonitor> = Arc::new(MonitorCell::new(definition, monitor));

        self.inner
            .monitors
            .insert_monitor(TypeId::of::<T>(), T::type_name(), Arc::clone(&cell))?;
        tracing::debug!(monitor = T::type_name(), "registered monitor");

        cell.start(self).inspect_err(|err| self.report(err.clone()))
    }

    /// Hand `event` to the monitor of type `T` from outside any machine.
    pub fn monitor<T: MonitorType, E: Event>(&self, event: E) -> Result<(), RuntimeError> {
        self.monitor_event::<T>(EventInfo::new(event, None, OperationId::NONE))
    }

    /// Events for monitors that were never registered are dropped.
    pub(crate) fn monitor_event<T: MonitorType>(&self, info: EventInfo) -> Result<(), RuntimeError> {
        let Some(monitor) = self.inner.monitors.get_monitor(&TypeId::of::<T>()) else {
            tracing::trace!(monitor = T::type_name(), event = %info.event_type(), "monitor not registered");
            return Ok(());
        };

        monitor
            .process(self, info)
            .inspect_err(|err| self.report(err.clone()))
    }

    fn registered_monitor<T: MonitorType>(&self) -> Result<Arc<dyn AnyMonitor>, RuntimeError> {
        self.inner
            .monitors
            .get_monitor(&TypeId::of::<T>())
            .ok_or(RuntimeError::MonitorNotFound {
                type_name: T::type_name(),
            })
    }

    pub fn monitor_state<T: MonitorType>(&self) -> Result<Option<StateName>, RuntimeError> {
        Ok(self.registered_monitor::<T>()?.current_state())
    }

    pub fn is_monitor_in_hot_state<T: MonitorType>(&self) -> Result<bool, RuntimeError> {
        Ok(self.registered_monitor::<T>()?.is_hot())
    }

    pub fn is_monitor_in_cold_state<T: MonitorType>(&self) -> Result<bool, RuntimeError> {
        Ok(self.registered_monitor::<T>()?.is_cold())
    }

    /// Number of consecutive liveness checks the monitor of type `T` spent in a hot state.
    pub fn monitor_temperature<T: MonitorType>(&self) -> Result<u32, RuntimeError> {
        Ok(self.registered_monitor::<T>()?.temperature())
    }

    /// Advance the temperature of every monitor in a hot state by one step.
    pub fn check_liveness_temperature(&self) -> Result<(), RuntimeError> {
        let threshold = self.inner.config.liveness_temperature_threshold;
        for monitor in self.inner.monitors.monitors() {
            monitor
                .check_liveness_temperature(threshold)
                .inspect_err(|err| self.report(err.clone()))?;
        }
        Ok(())
    }

    /// Fail if any monitor is left in a hot state. Meant for the end of a run.
    pub fn assert_no_monitor_in_hot_state(&self) -> Result<(), RuntimeError> {
        for monitor in self.inner.monitors.monitors() {
            let Some(state) = monitor.current_state().filter(|_| monitor.is_hot()) else {
                continue;
            };

            let err = RuntimeError::LivenessViolation {
                monitor: monitor.type_name(),
                state,
            };
            self.report(err.clone());
            return Err(err);
        }
        Ok(())
    }

    pub fn current_state(&self, machine: &MachineId) -> Result<Option<StateName>, RuntimeError> {
        Ok(self.inner.machines.get_machine(machine)?.current_state())
    }

    /// The state stack of `machine`, bottom first.
    pub fn state_stack(&self, machine: &MachineId) -> Result<Vec<StateName>, RuntimeError> {
        Ok(self.inner.machines.get_machine(machine)?.state_stack())
    }

    pub fn machine_info(&self, machine: &MachineId) -> Result<MachineInfo, RuntimeError> {
        Ok(self.inner.machines.get_machine(machine)?.info())
    }

    pub fn inbox_len(&self, machine: &MachineId) -> Result<usize, RuntimeError> {
        Ok(self.inner.machines.get_machine(machine)?.inbox_len())
    }

    /// Fingerprint of the observable state of `machine`.
    ///
    /// Equal for two machines of the same type and id value with the same state stack, inbox
    /// contents (by event type), status flags, choice count and user-provided state hash.
    pub fn cached_state(&self, machine: &MachineId) -> Result<u64, RuntimeError> {
        Ok(self.inner.machines.get_machine(machine)?.cached_state())
    }

    /// Fingerprint of every machine and monitor of the runtime.
    pub fn cached_program_state(&self) -> u64 {
        let mut hasher = ahash::RandomState::with_seeds(0x5eed, 0xcafe, 0xf00d, 0xbeef).build_hasher();
        let mut machines: Vec<(u64, u64)> = self
            .inner
            .machines
            .machines()
            .iter()
            .map(|machine| (machine.id().value(), machine.cached_state()))
            .collect();
        machines.sort_unstable();
        machines.hash(&mut hasher);

        let mut monitors: Vec<(&'static str, Option<StateName>)> = self
            .inner
            .monitors
            .monitors()
            .iter()
            .map(|monitor| (monitor.type_name(), monitor.current_state()))
            .collect();
        monitors.sort();
        monitors.hash(&mut hasher);

        hasher.finish()
    }

    /// Move the first queued event of `operation` to the front of the inbox of `machine`.
    pub fn prioritize_operation(
        &self,
        machine: &MachineId,
        operation: OperationId,
    ) -> Result<bool, RuntimeError> {
        Ok(self
            .inner
            .machines
            .get_machine(machine)?
            .prioritize_operation(operation))
    }

    pub fn is_operation_pending(
        &self,
        machine: &MachineId,
        operation: OperationId,
    ) -> Result<bool, RuntimeError> {
        Ok(self
            .inner
            .machines
            .get_machine(machine)?
            .is_operation_pending(operation))
    }

    pub fn machine_count(&self) -> usize {
        self.inner.machines.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::Acquire)
    }

    /// Stop scheduling handlers. Running handlers finish the event they are handling.
    pub fn stop(&self) {
        if self.inner.is_running.swap(false, Ordering::AcqRel) {
            tracing::info!("runtime stopped");
        }
    }

    /// The error that terminated the run, if any.
    pub fn failure(&self) -> Option<RuntimeError> {
        lock(&self.inner.failure).clone()
    }

    /// Action faults reported so far, in the order they happened.
    pub fn faults(&self) -> Vec<ActionFault> {
        lock(&self.inner.faults).clone()
    }

    /// Wait until no handler task is scheduled or running, then return the failure, if any.
    pub async fn wait_until_idle(&self) -> Result<(), RuntimeError> {
        let mut active = self.inner.active.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = active.wait_for(|active| *active == 0).await;

        match self.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn notify(&self, notification: Notification) {
        self.inner.scheduler.notify(&notification);
    }

    pub(crate) fn next_operation_id(&self) -> OperationId {
        OperationId(self.inner.operations.fetch_add(1, Ordering::Relaxed))
    }

    /// Record an error that escaped a handler. The first fatal error stops the run.
    pub(crate) fn report(&self, err: RuntimeError) {
        if let RuntimeError::ActionFault(fault) = err {
            lock(&self.inner.faults).push(fault);
            return;
        }

        {
            let mut failure = lock(&self.inner.failure);
            if failure.is_none() {
                tracing::error!(error = %err, "runtime failed");
                *failure = Some(err);
            }
        }

        self.stop();
    }

    pub(crate) fn handler_started(&self) {
        self.inner.active.send_modify(|active| *active += 1);
    }

    pub(crate) fn handler_finished(&self) {
        self.inner
            .active
            .send_modify(|active| *active = active.saturating_sub(1));
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("machines", &self.inner.machines.len())
            .field("monitors", &self.inner.monitors.len())
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}
