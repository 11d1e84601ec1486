//! Events exchanged between machines and the metadata the runtime attaches to them.
//!
//! The payload of an event is never inspected by the engine. Dispatch is keyed on the
//! [`EventType`] of the concrete Rust type implementing [`Event`].

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::machine_id::MachineId;
use crate::state::StateName;

/// Upcast helper so that `dyn Event` values can be downcast to their concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A message that can be sent to a machine or a monitor.
///
/// # Queue bounds
/// An event may declare an `assert` or `assume` bound: the maximum number of instances of its
/// type that may sit in a single inbox at the same time. Exceeding either bound on enqueue is a
/// protocol violation.
///
/// # Families
/// Generic events (e.g. `Envelope<T>`) may report a family name. Ignoring any member of a family
/// in a state causes queued members of the whole family to be dropped in that state.
pub trait Event: AsAny + Send + Sync + fmt::Debug {
    /// Name of the generic family this event type belongs to, if any.
    fn family() -> Option<&'static str>
    where
        Self: Sized,
    {
        None
    }

    /// Maximum number of instances of this event type that may be queued in one inbox.
    fn assert_bound(&self) -> Option<usize> {
        None
    }

    /// Same as [`assert_bound`](Event::assert_bound), reported as an assumption.
    fn assume_bound(&self) -> Option<usize> {
        None
    }

    /// Contribution of the payload to cached state hashes of the machine holding it.
    fn hashed_state(&self) -> u64 {
        0
    }
}

/// The runtime type of an event, used as the dispatch key in state declarations.
///
/// Equality and hashing only consider the underlying [`TypeId`].
#[derive(Clone, Copy)]
pub struct EventType {
    id: TypeId,
    name: &'static str,
    family: Option<&'static str>,
}

impl EventType {
    /// The event type of `E`.
    pub fn of<E: Event>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: std::any::type_name::<E>(),
            family: E::family(),
        }
    }

    /// Fully qualified name of the event type.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn family(&self) -> Option<&'static str> {
        self.family
    }

    pub fn is<E: Event>(&self) -> bool {
        self.id == TypeId::of::<E>()
    }

    /// Whether both types belong to the same generic family.
    pub fn same_family(&self, other: &EventType) -> bool {
        matches!((self.family, other.family), (Some(a), Some(b)) if a == b)
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventType {}

impl Hash for EventType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventType({})", self.name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Halts the receiving machine once no state on its stack handles it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Halt;

impl Event for Halt {}

/// Synthetic event handled when the inbox has nothing to offer and the current state declares a
/// default handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEvent;

impl Event for DefaultEvent {}

/// Stands for "any event type" in goto, push, action, defer and ignore declarations.
#[derive(Debug, Clone, Copy, Default)]
pub struct WildCard;

impl Event for WildCard {}

/// Raised by [`goto`](crate::machine::ActionContext::goto) to transition to an explicit state.
#[derive(Debug, Clone, Copy)]
pub struct GotoStateEvent {
    pub state: StateName,
}

impl Event for GotoStateEvent {}

/// Raised by [`push`](crate::machine::ActionContext::push) to push an explicit state.
#[derive(Debug, Clone, Copy)]
pub struct PushStateEvent {
    pub state: StateName,
}

impl Event for PushStateEvent {}

/// Identifies the logical operation an event belongs to.
///
/// Operations start at sends flagged as starters and are inherited by every event sent while
/// handling an event of that operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl OperationId {
    pub const NONE: OperationId = OperationId(0);
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where an event was sent or raised from.
#[derive(Debug, Clone)]
pub struct EventOrigin {
    pub sender: MachineId,
    pub sender_state: Option<StateName>,
}

/// An event together with its origin and operation, as stored in an inbox.
#[derive(Clone)]
pub struct EventInfo {
    event: Arc<dyn Event>,
    event_type: EventType,
    origin: Option<EventOrigin>,
    operation_id: OperationId,
}

impl EventInfo {
    pub fn new<E: Event>(event: E, origin: Option<EventOrigin>, operation_id: OperationId) -> Self {
        Self {
            event: Arc::new(event),
            event_type: EventType::of::<E>(),
            origin,
            operation_id,
        }
    }

    /// Re-attribute the event to `origin` and `operation_id`.
    pub(crate) fn with_origin(
        mut self,
        origin: Option<EventOrigin>,
        operation_id: OperationId,
    ) -> Self {
        self.origin = origin;
        self.operation_id = operation_id;
        self
    }

    pub fn event(&self) -> &dyn Event {
        &*self.event
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn event_name(&self) -> &'static str {
        self.event_type.name()
    }

    pub fn origin(&self) -> Option<&EventOrigin> {
        self.origin.as_ref()
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub fn is<E: Event>(&self) -> bool {
        self.event_type.is::<E>()
    }

    /// Borrow the payload as its concrete type.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        (*self.event).as_any().downcast_ref::<E>()
    }
}

impl fmt::Debug for EventInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventInfo")
            .field("event", &self.event)
            .field("origin", &self.origin)
            .field("operation_id", &self.operation_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping(u32);
    impl Event for Ping {}

    #[derive(Debug)]
    struct Envelope<T>(T);
    impl<T: fmt::Debug + Send + Sync + 'static> Event for Envelope<T> {
        fn family() -> Option<&'static str> {
            Some("Envelope")
        }
    }

    #[test]
    fn test_downcast_payload() {
        let info = EventInfo::new(Ping(7), None, OperationId::NONE);

        assert!(info.is::<Ping>());
        assert!(!info.is::<Halt>());
        assert_eq!(info.downcast_ref::<Ping>().map(|p| p.0), Some(7));
        assert!(info.downcast_ref::<Halt>().is_none());
    }

    #[test]
    fn test_event_types_compare_by_type() {
        assert_eq!(EventType::of::<Ping>(), EventType::of::<Ping>());
        assert_ne!(EventType::of::<Ping>(), EventType::of::<WildCard>());
        assert!(EventType::of::<Ping>().name().ends_with("Ping"));
    }

    #[test]
    fn test_generic_family() {
        let a = EventType::of::<Envelope<u32>>();
        let b = EventType::of::<Envelope<String>>();

        assert_ne!(a, b);
        assert!(a.same_family(&b));
        assert!(!EventType::of::<Ping>().same_family(&a));
    }
}
