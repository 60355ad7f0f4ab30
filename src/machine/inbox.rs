//! The machine's single serialized input channel.

use tokio::sync::mpsc;

use crate::core::{ConnectionId, Event, TimerId};

/// One entry on the machine's inbox.
///
/// Transport notifications and timer firings carry the identity of their source so the
/// machine can drop the ones that outlived it.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineInput {
    /// User command or an event raised by an action.
    Event(Event),
    Transport {
        connection: ConnectionId,
        event: Event,
    },
    Timer {
        id: TimerId,
        event: Event,
    },
}

impl MachineInput {
    pub fn event(&self) -> &Event {
        match self {
            MachineInput::Event(event)
            | MachineInput::Transport { event, .. }
            | MachineInput::Timer { event, .. } => event,
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            MachineInput::Event(event)
            | MachineInput::Transport { event, .. }
            | MachineInput::Timer { event, .. } => event,
        }
    }
}

/// Cloneable producer side of the inbox.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<MachineInput>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MachineInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Push an untagged event. Returns false once the machine is gone.
    pub fn send(&self, event: Event) -> bool {
        self.push(MachineInput::Event(event))
    }

    pub fn transport(&self, connection: ConnectionId, event: Event) -> bool {
        self.push(MachineInput::Transport { connection, event })
    }

    pub fn timer(&self, id: TimerId, event: Event) -> bool {
        self.push(MachineInput::Timer { id, event })
    }

    pub fn push(&self, input: MachineInput) -> bool {
        self.tx.send(input).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Notification sink handed to a transport when a connection is opened.
///
/// Everything emitted through it is tagged with the connection's id.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    connection: ConnectionId,
    inbox: EventSender,
}

impl TransportEvents {
    pub fn new(connection: ConnectionId, inbox: EventSender) -> Self {
        Self { connection, inbox }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn emit(&self, event: Event) -> bool {
        self.inbox.transport(self.connection, event)
    }
}
