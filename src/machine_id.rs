use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// An ID for a machine owned by a [`Runtime`](crate::runtime::Runtime).
///
/// The numeric `value` is unique within the runtime that allocated it and is the only part of the
/// id taking part in equality and hashing. The type name, friendly name and endpoint are carried
/// along for logging and error reports.
#[derive(Clone)]
pub struct MachineId {
    value: u64,
    type_name: Arc<str>,
    name: Arc<str>,
    endpoint: Option<Arc<str>>,
}

impl MachineId {
    /// Returns the unique numeric value of this id.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Returns the declared type name of the machine.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the friendly name, or the `Type(value)` name derived when none was given.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the endpoint the machine lives at, if it is not local.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

impl PartialEq for MachineId {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for MachineId {}

impl Hash for MachineId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl PartialOrd for MachineId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MachineId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineId({}, {})", self.value, self.name)
    }
}

impl Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}

/// Allocates monotonically increasing [`MachineId`] values.
///
/// Each runtime owns its own generator, so two runtimes started side by side hand out the same
/// sequence of values. Deterministic replays rely on this.
#[derive(Debug, Default)]
pub struct MachineIdGenerator {
    next: AtomicU64,
}

impl MachineIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new id for a machine of `type_name`.
    ///
    /// When no `friendly_name` is given the name is derived as `type_name(value)`.
    pub fn next_id(
        &self,
        type_name: &str,
        friendly_name: Option<&str>,
        endpoint: Option<&str>,
    ) -> MachineId {
        let value = self.next.fetch_add(1, Ordering::Relaxed);
        let name = match friendly_name {
            Some(name) => Arc::from(name),
            None => Arc::from(format!("{type_name}({value})")),
        };

        MachineId {
            value,
            type_name: Arc::from(type_name),
            name,
            endpoint: endpoint.map(Arc::from),
        }
    }
}
