//! Pure transition table.
//!
//! `plan` maps `(state, event)` to the next state and the actions to run, looking only
//! at the context, the config and an admission preview from the outbound queue. Actions
//! carry their own context update (`Action::apply`); the effects on the transport, clock,
//! queue and monitor are run by the machine afterwards.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Uri;

use crate::core::{
    CLOSE_ABNORMAL, CLOSE_NORMAL, ClientConfig, ConnectionState, Context, ErrorCategory, ErrorCause,
    ErrorRecord, Event, Priority, SendOutcome, StreamError, StreamResult, classify_close,
};

/// Check that `url` is an absolute `ws://` or `wss://` URL.
pub fn validate_url(url: &str) -> StreamResult<()> {
    let uri: Uri = url
        .parse()
        .map_err(|err| StreamError::Configuration(format!("invalid url {url:?}: {err}")))?;
    match uri.scheme_str() {
        Some("ws") | Some("wss") => {}
        other => {
            return Err(StreamError::Configuration(format!(
                "unsupported url scheme {other:?} in {url:?}; expected ws or wss"
            )));
        }
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(StreamError::Configuration(format!(
            "url {url:?} has no host"
        )));
    }
    Ok(())
}

/// Timer slots owned by the machine. At most one timer per slot is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Retry,
    Probe,
    ProbeDeadline,
    CloseTimeout,
    Flush,
}

impl TimerKind {
    /// Slot a timer-delivered event belongs to.
    pub fn of(event: &Event) -> Option<TimerKind> {
        match event {
            Event::Retry { .. } => Some(TimerKind::Retry),
            Event::Ping { .. } => Some(TimerKind::Probe),
            Event::ProbeTimeout { .. } => Some(TimerKind::ProbeDeadline),
            Event::Close { .. } => Some(TimerKind::CloseTimeout),
            Event::Flush { .. } => Some(TimerKind::Flush),
            _ => None,
        }
    }

    pub fn valid_in(self, state: ConnectionState) -> bool {
        match state {
            ConnectionState::Connected => matches!(
                self,
                TimerKind::Probe | TimerKind::ProbeDeadline | TimerKind::Flush
            ),
            ConnectionState::Reconnecting => self == TimerKind::Retry,
            ConnectionState::Disconnecting => self == TimerKind::CloseTimeout,
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Terminated => false,
        }
    }
}

/// One step of a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    RecordTarget { url: String, protocols: Vec<String> },
    ResetReconnectAttempts,
    ClearError,
    OpenTransport,
    /// Handshake finished: reset the monitor, start probing, release held messages.
    RecordConnected { at: Instant },
    RecordError { cause: ErrorCause, at: Instant },
    IncrementReconnectAttempts,
    ScheduleRetry,
    /// Drop the live handle; `close` asks the peer to close first, `None` force-releases.
    ReleaseTransport { close: Option<(u16, String)> },
    /// Start a graceful close and wait for the peer (or the close timeout).
    BeginClose { code: u16, reason: String },
    /// Drop the handle that was being closed gracefully.
    FinishClose,
    RecordDisconnected { at: Instant },
    ReceiveMessage { data: Bytes, at: Instant },
    EnqueueOutbound { data: Bytes, priority: Priority },
    HoldOutbound { data: Bytes, priority: Priority },
    Transmit,
    SendProbe { at: Instant },
    RecordPong { at: Instant, latency: Duration },
    ProbeTimedOut { sent_at: Instant },
    ClearQueue,
    CancelAllTimers,
}

impl Action {
    /// The context part of the action. Effects that produce data (the transport id,
    /// transmitted byte counts) are recorded by the machine once they ran.
    pub fn apply(&self, ctx: &mut Context) {
        match self {
            Action::RecordTarget { url, protocols } => {
                ctx.connection.url = Some(url.clone());
                ctx.connection.protocols = protocols.clone();
            }
            Action::ResetReconnectAttempts => ctx.metrics.reconnect_attempts = 0,
            Action::ClearError => ctx.connection.last_error = None,
            Action::RecordConnected { at } => {
                ctx.timing.connect_time = Some(*at);
                ctx.timing.disconnect_time = None;
            }
            Action::RecordError { cause, at } => {
                ctx.connection.last_error = Some(ErrorRecord {
                    category: cause.category,
                    message: cause.message.clone(),
                    code: cause.code,
                    timestamp: *at,
                    attempt: ctx.metrics.reconnect_attempts,
                });
                ctx.metrics.error_count = ctx.metrics.error_count.saturating_add(1);
            }
            Action::IncrementReconnectAttempts => {
                ctx.metrics.reconnect_attempts = ctx.metrics.reconnect_attempts.saturating_add(1);
            }
            Action::ReleaseTransport { .. } | Action::BeginClose { .. } => {
                ctx.connection.transport = None;
            }
            Action::RecordDisconnected { at } => ctx.timing.disconnect_time = Some(*at),
            Action::ReceiveMessage { data, .. } => {
                ctx.metrics.messages_received = ctx.metrics.messages_received.saturating_add(1);
                ctx.metrics.bytes_received = ctx
                    .metrics
                    .bytes_received
                    .saturating_add(data.len() as u64);
            }
            Action::SendProbe { at } => ctx.timing.last_ping_time = Some(*at),
            Action::RecordPong { at, .. } => {
                ctx.timing.last_pong_time = Some(*at);
                ctx.connection.last_error = None;
            }
            Action::OpenTransport
            | Action::ScheduleRetry
            | Action::FinishClose
            | Action::EnqueueOutbound { .. }
            | Action::HoldOutbound { .. }
            | Action::Transmit
            | Action::ProbeTimedOut { .. }
            | Action::ClearQueue
            | Action::CancelAllTimers => {}
        }
    }
}

/// Outcome of matching one `(state, event)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub to: ConnectionState,
    pub actions: Vec<Action>,
}

impl Plan {
    fn new(to: ConnectionState, actions: Vec<Action>) -> Self {
        Self { to, actions }
    }

    /// The error this plan records, if any.
    pub fn recorded_error(&self) -> Option<&ErrorCause> {
        self.actions.iter().find_map(|action| match action {
            Action::RecordError { cause, .. } => Some(cause),
            _ => None,
        })
    }
}

/// Cause recorded for a close that is not a clean normal closure.
pub fn close_cause(code: u16, reason: &str, was_clean: bool) -> ErrorCause {
    let category = classify_close(code, was_clean).unwrap_or(ErrorCategory::Network);
    let message = if reason.is_empty() {
        format!("connection closed with code {code}")
    } else {
        reason.to_string()
    };
    ErrorCause::new(category, message).with_code(code)
}

/// Where a failure leads: retry while the category allows it and attempts remain.
fn route_failure(
    cause: ErrorCause,
    at: Instant,
    ctx: &Context,
    config: &ClientConfig,
) -> Plan {
    let mut actions = vec![
        Action::RecordError {
            cause: cause.clone(),
            at,
        },
        Action::ReleaseTransport { close: None },
    ];
    let retries_left = ctx.metrics.reconnect_attempts < config.max_retries;
    if cause.category.is_retryable() && retries_left {
        actions.push(Action::IncrementReconnectAttempts);
        actions.push(Action::ScheduleRetry);
        Plan::new(ConnectionState::Reconnecting, actions)
    } else {
        actions.push(Action::RecordDisconnected { at });
        Plan::new(ConnectionState::Disconnected, actions)
    }
}

/// Match `(state, event)` against the transition table.
///
/// `admission` is the queue's answer for a `Send` in the current state, computed without
/// side effects. Returns `None` for pairs with no row; those are no-ops.
pub fn plan(
    state: ConnectionState,
    event: &Event,
    ctx: &Context,
    config: &ClientConfig,
    admission: Option<SendOutcome>,
    now: Instant,
) -> Option<Plan> {
    use ConnectionState as S;

    let admitted = || admission.is_some_and(|outcome| !outcome.is_rejected());

    match (state, event) {
        (S::Terminated, _) => None,
        (_, Event::Terminate { .. }) => Some(Plan::new(
            S::Terminated,
            vec![
                Action::ReleaseTransport { close: None },
                Action::FinishClose,
                Action::CancelAllTimers,
                Action::ClearQueue,
                Action::RecordDisconnected { at: now },
            ],
        )),

        (S::Disconnected, Event::Connect { url, protocols })
            if validate_url(url).is_ok() && ctx.connection.transport.is_none() =>
        {
            Some(Plan::new(
                S::Connecting,
                vec![
                    Action::RecordTarget {
                        url: url.clone(),
                        protocols: protocols.clone(),
                    },
                    Action::ResetReconnectAttempts,
                    Action::ClearError,
                    Action::OpenTransport,
                ],
            ))
        }
        (S::Disconnected, Event::Disconnect { clear_queue: true, .. }) => {
            Some(Plan::new(S::Disconnected, vec![Action::ClearQueue]))
        }

        (S::Connecting, Event::Open { timestamp }) => Some(Plan::new(
            S::Connected,
            vec![
                Action::ResetReconnectAttempts,
                Action::ClearError,
                Action::RecordConnected { at: *timestamp },
            ],
        )),
        (S::Connecting | S::Connected, Event::Error { cause, timestamp }) => {
            Some(route_failure(cause.clone(), *timestamp, ctx, config))
        }
        (
            S::Connecting,
            Event::Close {
                code,
                reason,
                was_clean,
            },
        ) => {
            let cause = if classify_close(*code, *was_clean).is_some() {
                close_cause(*code, reason, *was_clean)
            } else {
                ErrorCause::network("connection closed before the handshake completed")
                    .with_code(*code)
            };
            Some(Plan::new(
                S::Disconnected,
                vec![
                    Action::RecordError { cause, at: now },
                    Action::ReleaseTransport { close: None },
                    Action::RecordDisconnected { at: now },
                ],
            ))
        }
        (
            S::Connecting,
            Event::Disconnect {
                code,
                reason,
                clear_queue,
            },
        ) => {
            let mut actions = vec![
                Action::ReleaseTransport {
                    close: Some((
                        code.unwrap_or(CLOSE_NORMAL),
                        reason.clone().unwrap_or_default(),
                    )),
                },
                Action::RecordDisconnected { at: now },
            ];
            if *clear_queue {
                actions.push(Action::ClearQueue);
            }
            Some(Plan::new(S::Disconnected, actions))
        }
        (S::Connecting | S::Reconnecting, Event::Send { data, priority }) if admitted() => {
            Some(Plan::new(
                state,
                vec![Action::HoldOutbound {
                    data: data.clone(),
                    priority: *priority,
                }],
            ))
        }

        (
            S::Connected,
            Event::Disconnect {
                code,
                reason,
                clear_queue,
            },
        ) => {
            let mut actions = Vec::with_capacity(2);
            if *clear_queue {
                actions.push(Action::ClearQueue);
            }
            actions.push(Action::BeginClose {
                code: code.unwrap_or(CLOSE_NORMAL),
                reason: reason.clone().unwrap_or_default(),
            });
            Some(Plan::new(S::Disconnecting, actions))
        }
        (
            S::Connected,
            Event::Close {
                code,
                reason,
                was_clean,
            },
        ) => match classify_close(*code, *was_clean) {
            None => Some(Plan::new(
                S::Disconnected,
                vec![
                    Action::ReleaseTransport { close: None },
                    Action::RecordDisconnected { at: now },
                ],
            )),
            Some(_) => Some(route_failure(
                close_cause(*code, reason, *was_clean),
                now,
                ctx,
                config,
            )),
        },
        (S::Connected, Event::Message { data, timestamp }) => Some(Plan::new(
            S::Connected,
            vec![Action::ReceiveMessage {
                data: data.clone(),
                at: *timestamp,
            }],
        )),
        (S::Connected, Event::Send { data, priority }) if admitted() => Some(Plan::new(
            S::Connected,
            vec![Action::EnqueueOutbound {
                data: data.clone(),
                priority: *priority,
            }],
        )),
        (S::Connected, Event::Ping { timestamp }) => Some(Plan::new(
            S::Connected,
            vec![Action::SendProbe { at: *timestamp }],
        )),
        (S::Connected, Event::Pong { timestamp, latency }) => Some(Plan::new(
            S::Connected,
            vec![Action::RecordPong {
                at: *timestamp,
                latency: *latency,
            }],
        )),
        (S::Connected, Event::Flush { .. }) => {
            Some(Plan::new(S::Connected, vec![Action::Transmit]))
        }
        (S::Connected, Event::ProbeTimeout { sent_at }) => Some(Plan::new(
            S::Connected,
            vec![Action::ProbeTimedOut { sent_at: *sent_at }],
        )),

        (S::Reconnecting, Event::Retry { attempt, .. })
            if *attempt == ctx.metrics.reconnect_attempts
                && ctx.metrics.reconnect_attempts <= config.max_retries =>
        {
            Some(Plan::new(S::Connecting, vec![Action::OpenTransport]))
        }
        (S::Reconnecting, Event::MaxRetries { attempts }) => Some(Plan::new(
            S::Disconnected,
            vec![
                Action::RecordError {
                    cause: ErrorCause::network(format!(
                        "reconnect abandoned after {attempts} attempts"
                    )),
                    at: now,
                },
                Action::RecordDisconnected { at: now },
            ],
        )),
        (S::Reconnecting, Event::Disconnect { clear_queue, .. }) => {
            let mut actions = vec![Action::RecordDisconnected { at: now }];
            if *clear_queue {
                actions.push(Action::ClearQueue);
            }
            Some(Plan::new(S::Disconnected, actions))
        }

        (S::Disconnecting, Event::Close { .. }) => Some(Plan::new(
            S::Disconnected,
            vec![Action::FinishClose, Action::RecordDisconnected { at: now }],
        )),

        _ => None,
    }
}

/// Close event synthesized when a graceful close is not confirmed in time.
pub fn close_timeout_event() -> Event {
    Event::Close {
        code: CLOSE_ABNORMAL,
        reason: "close timeout".to_string(),
        was_clean: false,
    }
}
