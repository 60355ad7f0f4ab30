//! States, events and the machine-owned context.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::classify::ErrorCategory;
use super::types::{ConnectionId, Priority};

/// Connection lifecycle phase. Exactly one is active at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    /// Absorbing: no transition leaves it.
    Terminated,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 6] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Reconnecting,
        ConnectionState::Disconnecting,
        ConnectionState::Terminated,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Terminated)
    }

    /// States in which the machine holds a transport handle.
    pub fn holds_transport(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure description carried by `Event::Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCause {
    pub category: ErrorCategory,
    pub message: String,
    pub code: Option<u16>,
}

impl ErrorCause {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            code: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Protocol, message)
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code}): {}", self.category, self.message),
            None => write!(f, "{}: {}", self.category, self.message),
        }
    }
}

/// Everything the machine reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connect {
        url: String,
        protocols: Vec<String>,
    },
    Disconnect {
        code: Option<u16>,
        reason: Option<String>,
        /// Drop buffered outbound messages as part of the disconnect.
        clear_queue: bool,
    },
    Open {
        timestamp: Instant,
    },
    Close {
        code: u16,
        reason: String,
        was_clean: bool,
    },
    Error {
        cause: ErrorCause,
        timestamp: Instant,
    },
    Retry {
        attempt: u32,
        delay: Duration,
    },
    MaxRetries {
        attempts: u32,
    },
    Terminate {
        reason: Option<String>,
    },
    Message {
        data: Bytes,
        timestamp: Instant,
    },
    Send {
        data: Bytes,
        priority: Priority,
    },
    Ping {
        timestamp: Instant,
    },
    Pong {
        timestamp: Instant,
        latency: Duration,
    },
    /// Rate window rolled over while messages were waiting.
    Flush {
        timestamp: Instant,
    },
    /// A probe sent at `sent_at` was not acknowledged within the pong timeout.
    ProbeTimeout {
        sent_at: Instant,
    },
}

/// Payload-free discriminant of [`Event`], used for logging and observer notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Open,
    Close,
    Error,
    Retry,
    MaxRetries,
    Terminate,
    Message,
    Send,
    Ping,
    Pong,
    Flush,
    ProbeTimeout,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connect { .. } => EventKind::Connect,
            Event::Disconnect { .. } => EventKind::Disconnect,
            Event::Open { .. } => EventKind::Open,
            Event::Close { .. } => EventKind::Close,
            Event::Error { .. } => EventKind::Error,
            Event::Retry { .. } => EventKind::Retry,
            Event::MaxRetries { .. } => EventKind::MaxRetries,
            Event::Terminate { .. } => EventKind::Terminate,
            Event::Message { .. } => EventKind::Message,
            Event::Send { .. } => EventKind::Send,
            Event::Ping { .. } => EventKind::Ping,
            Event::Pong { .. } => EventKind::Pong,
            Event::Flush { .. } => EventKind::Flush,
            Event::ProbeTimeout { .. } => EventKind::ProbeTimeout,
        }
    }

    pub fn connect(url: impl Into<String>) -> Self {
        Event::Connect {
            url: url.into(),
            protocols: Vec::new(),
        }
    }

    pub fn disconnect() -> Self {
        Event::Disconnect {
            code: None,
            reason: None,
            clear_queue: false,
        }
    }

    pub fn terminate() -> Self {
        Event::Terminate { reason: None }
    }

    pub fn error(cause: ErrorCause, timestamp: Instant) -> Self {
        Event::Error { cause, timestamp }
    }

    pub fn send(data: impl Into<Bytes>, priority: Priority) -> Self {
        Event::Send {
            data: data.into(),
            priority,
        }
    }
}

/// Last recorded failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub code: Option<u16>,
    pub timestamp: Instant,
    /// Reconnect attempt counter at the time of the failure.
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub url: Option<String>,
    pub protocols: Vec<String>,
    /// Identity of the transport handle owned by the machine.
    pub transport: Option<ConnectionId>,
    pub status: ConnectionState,
    pub last_error: Option<ErrorRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnect_attempts: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionTiming {
    pub connect_time: Option<Instant>,
    pub disconnect_time: Option<Instant>,
    pub last_ping_time: Option<Instant>,
    pub last_pong_time: Option<Instant>,
    pub window_start: Option<Instant>,
}

/// Machine-owned context. Handed out only as cloned snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub connection: ConnectionInfo,
    pub metrics: ConnectionMetrics,
    pub timing: ConnectionTiming,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connecting_and_connected_hold_transport() {
        let holding: Vec<_> = ConnectionState::ALL
            .into_iter()
            .filter(|s| s.holds_transport())
            .collect();
        assert_eq!(
            holding,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert!(ConnectionState::Terminated.is_terminal());
    }

    #[test]
    fn context_defaults_are_empty() {
        let ctx = Context::default();
        assert_eq!(ctx.connection.status, ConnectionState::Disconnected);
        assert!(ctx.connection.transport.is_none());
        assert_eq!(ctx.metrics, ConnectionMetrics::default());
        assert!(ctx.timing.connect_time.is_none());
    }

    #[test]
    fn error_cause_display_includes_code() {
        let cause = ErrorCause::protocol("malformed frame").with_code(1002);
        assert_eq!(cause.to_string(), "protocol (code 1002): malformed frame");
    }
}
