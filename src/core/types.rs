use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::classify::ErrorCategory;

/// Convenience result alias for stream client operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Canonical error surface shared across the engine, the actor and the facade.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    #[error("Connection error ({category}): {message}")]
    Connection {
        category: ErrorCategory,
        message: String,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Resource exhausted: {message}")]
    ResourceExhausted {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Client terminated")]
    Terminated,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Actor error: {0}")]
    ActorError(String),
}

impl StreamError {
    /// Category used by the recovery policy; `None` for errors that never reach the machine.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            StreamError::Connection { category, .. } => Some(*category),
            StreamError::ProtocolViolation(_) => Some(ErrorCategory::Protocol),
            StreamError::ResourceExhausted { .. } => Some(ErrorCategory::Resource),
            StreamError::Configuration(_)
            | StreamError::Terminated
            | StreamError::InvalidState(_)
            | StreamError::ActorError(_) => None,
        }
    }
}

/// Identity of one transport connection opened by the machine.
///
/// Every notification a transport emits is tagged with it so that late callbacks from a
/// released connection cannot be mistaken for the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identity of one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Outbound message priority. Higher priorities drain first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Why an outbound message was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Queue at capacity under the reject-new policy.
    QueueFull,
    /// Queue at capacity under the drop-newest policy; the message was discarded.
    Dropped,
    /// No connection is active or being established.
    NotConnected,
    /// The client has been terminated.
    Terminated,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::QueueFull => f.write_str("outbound queue full"),
            RejectReason::Dropped => f.write_str("dropped by overflow policy"),
            RejectReason::NotConnected => f.write_str("not connected"),
            RejectReason::Terminated => f.write_str("client terminated"),
        }
    }
}

/// Decision taken for one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Admitted by the rate limiter; handed to the transport.
    Accepted,
    /// Buffered; will be transmitted when the window or the connection allows.
    Queued,
    Rejected(RejectReason),
}

impl SendOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, SendOutcome::Rejected(_))
    }

    /// Map rejections onto the error taxonomy for callers that prefer `?`.
    pub fn into_result(self) -> StreamResult<SendOutcome> {
        match self {
            SendOutcome::Rejected(RejectReason::Terminated) => Err(StreamError::Terminated),
            SendOutcome::Rejected(RejectReason::NotConnected) => Err(StreamError::InvalidState(
                RejectReason::NotConnected.to_string(),
            )),
            SendOutcome::Rejected(reason) => Err(StreamError::ResourceExhausted {
                message: reason.to_string(),
                retry_after: None,
            }),
            accepted => Ok(accepted),
        }
    }
}
