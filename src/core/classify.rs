//! Error classification and recovery policy.

use std::fmt;

/// Failure categories understood by the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Protocol,
    Application,
    Resource,
    Timeout,
}

/// What the machine may do after a failure of a given category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// The client stays usable (a later `connect` may succeed).
    pub recoverable: bool,
    /// The failure feeds the automatic reconnect path.
    pub retryable: bool,
}

impl ErrorCategory {
    pub fn policy(self) -> RecoveryPolicy {
        match self {
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Resource => {
                RecoveryPolicy {
                    recoverable: true,
                    retryable: true,
                }
            }
            ErrorCategory::Application => RecoveryPolicy {
                recoverable: true,
                retryable: false,
            },
            ErrorCategory::Protocol => RecoveryPolicy {
                recoverable: false,
                retryable: false,
            },
        }
    }

    pub fn is_retryable(self) -> bool {
        self.policy().retryable
    }

    pub fn is_recoverable(self) -> bool {
        self.policy().recoverable
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Application => "application",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Map a close code to an error category; `None` means the close was a normal shutdown.
///
/// Normal codes only count as clean when the closing handshake completed.
pub fn classify_close(code: u16, was_clean: bool) -> Option<ErrorCategory> {
    match code {
        CLOSE_NORMAL | CLOSE_GOING_AWAY if was_clean => None,
        CLOSE_NORMAL | CLOSE_GOING_AWAY => Some(ErrorCategory::Network),
        1002 | 1003 | 1007 | 1010 => Some(ErrorCategory::Protocol),
        1008 => Some(ErrorCategory::Application),
        1009 | 1013 => Some(ErrorCategory::Resource),
        1011 | 1012 | 1014 | 1015 => Some(ErrorCategory::Network),
        _ => Some(ErrorCategory::Network),
    }
}
