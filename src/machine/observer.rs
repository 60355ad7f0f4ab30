use bytes::Bytes;

use crate::core::{ConnectionState, Context, ErrorCategory, EventKind};

/// Error details attached to a transition that recorded a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub recoverable: bool,
    /// Reconnect attempt counter after the transition.
    pub attempt: u32,
    pub message: String,
    pub context: Context,
}

/// Notification delivered to observers after every committed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub event: EventKind,
    pub context: Context,
    /// Payload of a received message.
    pub message: Option<Bytes>,
    pub error: Option<ErrorReport>,
}

impl StateChange {
    pub fn is_state_change(&self) -> bool {
        self.from != self.to
    }
}

/// Synchronous transition listener. Runs inside the dispatch loop, so it must not block.
pub trait StateObserver: Send + 'static {
    fn on_transition(&mut self, change: &StateChange);
}

impl<F> StateObserver for F
where
    F: FnMut(&StateChange) + Send + 'static,
{
    fn on_transition(&mut self, change: &StateChange) {
        self(change)
    }
}
