use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::event::{EventInfo, EventType, OperationId};
use crate::machine::error::{BoundKind, ProtocolViolation};
use crate::machine::info::MachineInfo;
use crate::machine_id::MachineId;

pub(crate) type WaitPredicate = Arc<dyn Fn(&EventInfo) -> bool + Send + Sync>;

/// One `(event type, predicate)` pair a pending receive waits on.
#[derive(Clone)]
pub struct WaitHandler {
    event_type: EventType,
    predicate: Option<WaitPredicate>,
}

impl WaitHandler {
    pub(crate) fn new(event_type: EventType, predicate: Option<WaitPredicate>) -> Self {
        Self {
            event_type,
            predicate,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn matches(&self, info: &EventInfo) -> bool {
        info.event_type() == self.event_type
            && self.predicate.as_ref().is_none_or(|predicate| predicate(info))
    }
}

impl fmt::Debug for WaitHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitHandler")
            .field("event_type", &self.event_type)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

/// How the current state treats a queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Deliver,
    Defer,
    Ignore,
}

/// What an enqueue did with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueStatus {
    /// The machine has halted.
    Dropped,
    /// Appended to the inbox. A handler is already scheduled or the machine is waiting.
    Queued,
    /// Handed to a suspended receive that will be resumed by the running handler.
    Delivered,
    /// The caller must schedule a new handler task.
    NeedsHandler,
}

/// The inbox of a machine together with its receive state.
pub(crate) struct Mailbox {
    owner: MachineId,
    inbox: VecDeque<EventInfo>,
    wait_handlers: Vec<WaitHandler>,
    delivered: Option<EventInfo>,
    info: MachineInfo,
}

impl Mailbox {
    pub(crate) fn new(owner: MachineId) -> Self {
        Self {
            owner,
            inbox: VecDeque::new(),
            wait_handlers: Vec::new(),
            delivered: None,
            info: MachineInfo::default(),
        }
    }

    pub(crate) fn info(&self) -> MachineInfo {
        self.info
    }

    pub(crate) fn len(&self) -> usize {
        self.inbox.len()
    }

    pub(crate) fn event_types(&self) -> impl Iterator<Item = EventType> + '_ {
        self.inbox.iter().map(EventInfo::event_type)
    }

    pub(crate) fn events(&self) -> impl Iterator<Item = &EventInfo> + '_ {
        self.inbox.iter()
    }

    /// Claim the right to run the handler of a freshly created machine.
    pub(crate) fn start(&mut self) {
        self.info.is_running = true;
    }

    pub(crate) fn enqueue(&mut self, info: EventInfo) -> Result<EnqueueStatus, ProtocolViolation> {
        if self.info.is_halted {
            tracing::trace!(machine = %self.owner, event = %info.event_type(), "dropped event sent to halted machine");
            return Ok(EnqueueStatus::Dropped);
        }

        if self.wait_handlers.iter().any(|handler| handler.matches(&info)) {
            tracing::debug!(machine = %self.owner, event = %info.event_type(), "delivered event to pending receive");
            self.wait_handlers.clear();
            self.delivered = Some(info);

            if self.info.is_waiting && !self.info.is_running {
                self.info.is_waiting = false;
                self.info.is_running = true;
                return Ok(EnqueueStatus::NeedsHandler);
            }

            return Ok(EnqueueStatus::Delivered);
        }

        let event_type = info.event_type();
        let bounds = [
            (BoundKind::Assert, info.event().assert_bound()),
            (BoundKind::Assume, info.event().assume_bound()),
        ];

        for (bound, limit) in bounds {
            let Some(limit) = limit else {
                continue;
            };

            let queued = self.event_types().filter(|t| *t == event_type).count();
            if queued >= limit {
                return Err(ProtocolViolation::QueueBoundExceeded {
                    event: event_type.name(),
                    bound,
                    limit,
                });
            }
        }

        tracing::trace!(machine = %self.owner, event = %event_type, "enqueued event");
        self.inbox.push_back(info);

        if self.info.is_idle() {
            self.info.is_running = true;
            return Ok(EnqueueStatus::NeedsHandler);
        }

        Ok(EnqueueStatus::Queued)
    }

    /// Remove and return the first event the current state delivers.
    ///
    /// Ignored events in front of it are removed as well. Deferred events stay in place.
    pub(crate) fn dequeue(
        &mut self,
        mut classify: impl FnMut(&EventType) -> Disposition,
    ) -> Option<EventInfo> {
        let mut index = 0;
        while index < self.inbox.len() {
            let event_type = self.inbox[index].event_type();
            match classify(&event_type) {
                Disposition::Deliver => return self.inbox.remove(index),
                Disposition::Defer => index += 1,
                Disposition::Ignore => {
                    tracing::trace!(machine = %self.owner, event = %event_type, "ignored queued event");
                    self.inbox.remove(index);
                }
            }
        }

        None
    }

    /// Mark the handler as finished. The next enqueue schedules a new one.
    pub(crate) fn idle(&mut self) {
        self.info.is_running = false;
    }

    /// Remove the first queued event matching any of `handlers`.
    pub(crate) fn take_matching(&mut self, handlers: &[WaitHandler]) -> Option<EventInfo> {
        let index = self
            .inbox
            .iter()
            .position(|info| handlers.iter().any(|handler| handler.matches(info)))?;

        self.inbox.remove(index)
    }

    /// Park the machine until an enqueue matches one of `handlers`.
    pub(crate) fn wait(&mut self, handlers: Vec<WaitHandler>) {
        self.wait_handlers = handlers;
        self.info.is_waiting = true;
        self.info.is_running = false;
    }

    pub(crate) fn take_delivered(&mut self) -> Option<EventInfo> {
        self.delivered.take()
    }

    /// Make the machine permanently inert, returning the number of dropped events.
    pub(crate) fn halt(&mut self) -> usize {
        let dropped = self.inbox.len();
        self.inbox.clear();
        self.wait_handlers.clear();
        self.delivered = None;
        self.info = MachineInfo {
            is_running: false,
            is_halted: true,
            is_waiting: false,
        };
        dropped
    }

    /// Move the first event of `operation` to the front of the inbox.
    ///
    /// The event stays in place if an earlier event from the same sender precedes it, so that
    /// per-sender ordering is preserved.
    pub(crate) fn prioritize_operation(&mut self, operation: OperationId) -> bool {
        let Some(index) = self
            .inbox
            .iter()
            .position(|info| info.operation_id() == operation)
        else {
            return false;
        };

        if index == 0 {
            return true;
        }

        let sender = self.inbox[index].origin().map(|origin| &origin.sender);
        let blocked = self
            .inbox
            .iter()
            .take(index)
            .any(|info| info.origin().map(|origin| &origin.sender) == sender);
        if blocked {
            return false;
        }

        if let Some(info) = self.inbox.remove(index) {
            tracing::trace!(machine = %self.owner, %operation, "prioritized operation");
            self.inbox.push_front(info);
        }
        true
    }

    pub(crate) fn is_operation_pending(&self, operation: OperationId) -> bool {
        self.inbox.iter().any(|info| info.operation_id() == operation)
    }
}
