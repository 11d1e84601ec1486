//! The action invocation protocol.
//!
//! Actions are plain Rust closures registered by name on a machine or monitor configuration.
//! A machine action either completes synchronously or suspends on a [`WaitSet`], in which case
//! the dispatch engine parks the machine until a matching event arrives and then resumes the
//! action's continuation.

use std::fmt;
use std::sync::Arc;

use crate::event::{Event, EventInfo, EventType};
use crate::machine::ActionContext;
use crate::machine::error::ProtocolViolation;
use crate::machine::mailbox::WaitHandler;
use crate::runtime::error::RuntimeError;

/// Name an action is registered under.
pub type ActionName = &'static str;

/// Error returned by user action code.
///
/// Cancellation is benign and never reported. Faults halt the machine that raised them and are
/// reported to the host. Violations, assertions and runtime errors fail the whole run.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("action was cancelled")]
    Cancelled,

    #[error(transparent)]
    Violation(#[from] ProtocolViolation),

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error(transparent)]
    Runtime(Box<RuntimeError>),

    #[error(transparent)]
    Faulted(#[from] anyhow::Error),
}

impl ActionError {
    /// Build a fault from a plain message.
    pub fn fault(message: impl fmt::Display) -> Self {
        Self::Faulted(anyhow::anyhow!("{message}"))
    }
}

impl From<RuntimeError> for ActionError {
    fn from(err: RuntimeError) -> Self {
        Self::Runtime(Box::new(err))
    }
}

/// Result of a machine action.
pub type ActionResult<M> = Result<ActionOutcome<M>, ActionError>;

/// Resumes a suspended action with the event it was waiting for.
pub type Continuation<M> =
    Box<dyn FnOnce(&mut M, &mut ActionContext<'_, M>, EventInfo) -> ActionResult<M> + Send>;

/// How a machine action finished.
pub enum ActionOutcome<M> {
    /// The action ran to completion.
    Completed,
    /// The action waits for one of the events in the wait set.
    Receive(Receive<M>),
}

impl<M> fmt::Debug for ActionOutcome<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("Completed"),
            Self::Receive(receive) => f
                .debug_tuple("Receive")
                .field(&receive.handlers)
                .finish(),
        }
    }
}

/// A pending receive: what to wait for and what to run once it arrives.
pub struct Receive<M> {
    pub(crate) handlers: Vec<WaitHandler>,
    pub(crate) continuation: Continuation<M>,
}

/// The event types (and optional predicates) a receive waits on.
///
/// # Example
/// ```ignore
/// Ok(WaitSet::new()
///     .event::<Ack>()
///     .event_where::<Reply, _>(|reply| reply.seq == expected)
///     .then(|client, ctx, event| {
///         client.last = event.downcast_ref::<Reply>().map(|r| r.seq);
///         Ok(ActionOutcome::Completed)
///     }))
/// ```
#[derive(Debug, Default)]
pub struct WaitSet {
    handlers: Vec<WaitHandler>,
}

impl WaitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for any event of type `E`.
    pub fn event<E: Event>(mut self) -> Self {
        self.handlers.push(WaitHandler::new(EventType::of::<E>(), None));
        self
    }

    /// Wait for an event of type `E` satisfying `predicate`.
    ///
    /// Events of type `E` failing the predicate stay in the inbox.
    pub fn event_where<E, P>(mut self, predicate: P) -> Self
    where
        E: Event,
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let predicate = move |info: &EventInfo| info.downcast_ref::<E>().is_some_and(&predicate);
        self.handlers
            .push(WaitHandler::new(EventType::of::<E>(), Some(Arc::new(predicate))));
        self
    }

    /// Finish the action by suspending until a matching event arrives, then run `continuation`.
    pub fn then<M, F>(self, continuation: F) -> ActionOutcome<M>
    where
        F: FnOnce(&mut M, &mut ActionContext<'_, M>, EventInfo) -> ActionResult<M> + Send + 'static,
    {
        ActionOutcome::Receive(Receive {
            handlers: self.handlers,
            continuation: Box::new(continuation),
        })
    }
}

/// A named, resolved action handler.
pub struct ActionRef<F: ?Sized> {
    name: ActionName,
    handler: Arc<F>,
}

impl<F: ?Sized> ActionRef<F> {
    pub(crate) fn new(name: ActionName, handler: Arc<F>) -> Self {
        Self { name, handler }
    }

    pub fn name(&self) -> ActionName {
        self.name
    }

    pub(crate) fn handler(&self) -> &Arc<F> {
        &self.handler
    }
}

impl<F: ?Sized> Clone for ActionRef<F> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<F: ?Sized> fmt::Debug for ActionRef<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionRef({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OperationId;

    #[derive(Debug)]
    struct Reply {
        seq: u32,
    }
    impl Event for Reply {}

    #[test]
    fn test_wait_set_predicates() {
        let waits = WaitSet::new().event_where::<Reply, _>(|reply| reply.seq == 2);
        let handler = &waits.handlers[0];

        let wrong = EventInfo::new(Reply { seq: 1 }, None, OperationId::NONE);
        let right = EventInfo::new(Reply { seq: 2 }, None, OperationId::NONE);

        assert!(!handler.matches(&wrong));
        assert!(handler.matches(&right));
    }

    #[test]
    fn test_fault_wraps_message() {
        let err = ActionError::fault("disk on fire");
        assert!(matches!(err, ActionError::Faulted(_)));
        assert_eq!(err.to_string(), "disk on fire");
    }
}
