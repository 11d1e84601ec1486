use std::any::TypeId;
use std::sync::Arc;

use dashmap::{DashMap, Entry};

use crate::machine_id::MachineId;

use self::error::{MachineAlreadyPresent, MachineNotFound, MonitorAlreadyRegistered};

pub mod error;

/// The machines of a runtime, identified by their [`MachineId`].
///
/// Halted machines stay in the map so that late sends to them are dropped rather than failing.
#[derive(Debug)]
pub struct MachineMap<T: ?Sized> {
    machines: DashMap<MachineId, Arc<T>, ahash::RandomState>,
}

impl<T: ?Sized> MachineMap<T> {
    /// Construct a new empty [`MachineMap`].
    pub fn new() -> MachineMap<T> {
        Self::default()
    }

    /// Track `machine` under `machine_id`.
    pub fn insert_machine(
        &self,
        machine_id: MachineId,
        machine: Arc<T>,
    ) -> Result<(), MachineAlreadyPresent> {
        match self.machines.entry(machine_id) {
            Entry::Occupied(entry) => Err(MachineAlreadyPresent {
                machine_id: entry.key().clone(),
            }),

            Entry::Vacant(slot) => {
                slot.insert(machine);
                Ok(())
            }
        }
    }

    /// Look up the machine for the provided `machine_id`.
    ///
    /// The returned handle is a clone of the shared reference, the map lock is not held.
    pub fn get_machine(&self, machine_id: &MachineId) -> Result<Arc<T>, MachineNotFound> {
        self.machines
            .view(machine_id, |_, machine| Arc::clone(machine))
            .ok_or_else(|| MachineNotFound {
                machine_id: machine_id.clone(),
            })
    }

    /// Snapshot of every tracked machine, ordered by id.
    pub fn machines(&self) -> Vec<Arc<T>> {
        let mut entries: Vec<(MachineId, Arc<T>)> = self
            .machines
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries.into_iter().map(|(_, machine)| machine).collect()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

impl<T: ?Sized> Default for MachineMap<T> {
    fn default() -> Self {
        Self {
            machines: DashMap::default(),
        }
    }
}

/// The monitors of a runtime, at most one instance per monitor type.
#[derive(Debug)]
pub struct MonitorMap<T: ?Sized> {
    monitors: DashMap<TypeId, Arc<T>, ahash::RandomState>,
}

impl<T: ?Sized> MonitorMap<T> {
    pub fn new() -> MonitorMap<T> {
        Self::default()
    }

    pub fn insert_monitor(
        &self,
        type_id: TypeId,
        type_name: &'static str,
        monitor: Arc<T>,
    ) -> Result<(), MonitorAlreadyRegistered> {
        match self.monitors.entry(type_id) {
            Entry::Occupied(_) => Err(MonitorAlreadyRegistered { type_name }),

            Entry::Vacant(slot) => {
                slot.insert(monitor);
                Ok(())
            }
        }
    }

    pub fn get_monitor(&self, type_id: &TypeId) -> Option<Arc<T>> {
        self.monitors.view(type_id, |_, monitor| Arc::clone(monitor))
    }

    /// Snapshot of every registered monitor.
    pub fn monitors(&self) -> Vec<Arc<T>> {
        self.monitors
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }
}

impl<T: ?Sized> Default for MonitorMap<T> {
    fn default() -> Self {
        Self {
            monitors: DashMap::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine_id::MachineIdGenerator;

    #[test]
    fn test_insert_and_get() {
        let ids = MachineIdGenerator::new();
        let map: MachineMap<str> = MachineMap::new();
        let id = ids.next_id("Server", None, None);

        map.insert_machine(id.clone(), Arc::from("server")).unwrap();
        assert!(map.insert_machine(id.clone(), Arc::from("again")).is_err());

        assert_eq!(&*map.get_machine(&id).unwrap(), "server");
        assert!(map.get_machine(&ids.next_id("Client", None, None)).is_err());
    }

    #[test]
    fn test_machines_are_ordered_by_id() {
        let ids = MachineIdGenerator::new();
        let map: MachineMap<u32> = MachineMap::new();
        let first = ids.next_id("A", None, None);
        let second = ids.next_id("B", None, None);

        map.insert_machine(second, Arc::new(2)).unwrap();
        map.insert_machine(first, Arc::new(1)).unwrap();

        let values: Vec<u32> = map.machines().iter().map(|m| **m).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn test_monitor_registered_once() {
        let map: MonitorMap<u32> = MonitorMap::new();
        let key = TypeId::of::<u8>();

        map.insert_monitor(key, "Safety", Arc::new(1)).unwrap();
        assert!(map.insert_monitor(key, "Safety", Arc::new(2)).is_err());
        assert_eq!(map.get_monitor(&key).as_deref(), Some(&1));
        assert!(map.get_monitor(&TypeId::of::<u16>()).is_none());
    }
}
