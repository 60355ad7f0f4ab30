use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::clock::{Clock, TokioClock};
use super::inbox::{EventSender, MachineInput, TransportEvents};
use super::observer::{ErrorReport, StateChange, StateObserver};
use super::transition::{Action, TimerKind, close_timeout_event, plan};
use crate::core::{
    CircularBuffer, ClientConfig, ConnectionId, ConnectionState, Context, ErrorCause, Event,
    EventKind, ExponentialBackoff, HealthMonitor, HealthStats, OutboundMessage, OutboundQueue,
    ReconnectStrategy, RejectReason, SendOutcome, StreamError, StreamResult, TimerId,
};
use crate::transport::{Transport, TransportHandle};

/// Result of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub event: EventKind,
    /// False when no row matched and nothing changed.
    pub applied: bool,
    /// Queue decision for `Send` events.
    pub outcome: Option<SendOutcome>,
}

impl Transition {
    fn ignored(state: ConnectionState, event: EventKind, outcome: Option<SendOutcome>) -> Self {
        Self {
            from: state,
            to: state,
            event,
            applied: false,
            outcome,
        }
    }
}

struct Live<H> {
    id: ConnectionId,
    handle: H,
}

#[derive(Default)]
struct Effects {
    outcome: Option<SendOutcome>,
    message: Option<Bytes>,
}

/// Connection lifecycle state machine.
///
/// Owns the context, the transport handle, the outbound queue, the health monitor and
/// every timer. All input is serialized through [`ConnectionMachine::handle_input`] (or
/// [`ConnectionMachine::dispatch`] for already-validated events); nothing inside calls
/// back into the machine, follow-up events go through the inbox instead.
pub struct ConnectionMachine<T: Transport, C: Clock = TokioClock> {
    state: ConnectionState,
    ctx: Context,
    config: ClientConfig,
    transport: T,
    live: Option<Live<T::Handle>>,
    closing: Option<Live<T::Handle>>,
    clock: C,
    inbox: EventSender,
    timers: HashMap<TimerKind, TimerId>,
    next_timer_id: u64,
    next_connection_id: u64,
    queue: OutboundQueue,
    monitor: HealthMonitor,
    reconnect: Box<dyn ReconnectStrategy>,
    observers: Vec<Box<dyn StateObserver>>,
    received: CircularBuffer<Bytes>,
}

impl<T: Transport, C: Clock> ConnectionMachine<T, C> {
    /// Build a machine and the receiving end of its inbox.
    pub fn new(
        config: ClientConfig,
        transport: T,
        clock: C,
    ) -> StreamResult<(Self, mpsc::UnboundedReceiver<MachineInput>)> {
        config.validate()?;
        let (inbox, rx) = EventSender::channel();
        let machine = Self {
            state: ConnectionState::Disconnected,
            ctx: Context::default(),
            transport,
            live: None,
            closing: None,
            clock,
            inbox,
            timers: HashMap::new(),
            next_timer_id: 1,
            next_connection_id: 1,
            queue: OutboundQueue::new(&config),
            monitor: HealthMonitor::new(config.health),
            reconnect: Box::new(ExponentialBackoff::from_config(&config)),
            observers: Vec::new(),
            received: CircularBuffer::new(config.inbound_buffer_capacity),
            config,
        };
        Ok((machine, rx))
    }

    pub fn set_reconnect_strategy(&mut self, strategy: impl ReconnectStrategy) {
        self.reconnect = Box::new(strategy);
    }

    pub fn subscribe(&mut self, observer: impl StateObserver) {
        self.subscribe_boxed(Box::new(observer));
    }

    pub fn subscribe_boxed(&mut self, observer: Box<dyn StateObserver>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn snapshot(&self) -> Context {
        self.ctx.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Producer handle for the inbox this machine reads from.
    pub fn inbox(&self) -> EventSender {
        self.inbox.clone()
    }

    pub fn health(&self) -> HealthStats {
        self.monitor.stats()
    }

    /// Outbound messages buffered and not yet transmitted.
    pub fn queued(&self) -> usize {
        self.queue.pending_len() + self.queue.ready_len()
    }

    /// Most recent received payloads, oldest first.
    pub fn recent_messages(&self) -> impl Iterator<Item = &Bytes> {
        self.received.iter()
    }

    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    /// Drain everything currently waiting on `rx` without blocking.
    pub fn process_pending(&mut self, rx: &mut mpsc::UnboundedReceiver<MachineInput>) -> usize {
        let mut processed = 0;
        while let Ok(input) = rx.try_recv() {
            self.handle_input(input);
            processed += 1;
        }
        processed
    }

    /// Filter stale transport notifications and timer firings, then dispatch.
    pub fn handle_input(&mut self, input: MachineInput) -> Option<Transition> {
        if self.state.is_terminal() {
            return Some(self.dispatch(input.into_event()));
        }

        match input {
            MachineInput::Event(event) => Some(self.dispatch(event)),
            MachineInput::Transport { connection, event } => {
                let current = self.live.as_ref().map(|live| live.id) == Some(connection);
                let awaited_close = matches!(event, Event::Close { .. })
                    && self.closing.as_ref().map(|live| live.id) == Some(connection);
                if current || awaited_close {
                    Some(self.dispatch(event))
                } else {
                    debug!(
                        connection = %connection,
                        event = ?event.kind(),
                        state = %self.state,
                        "dropping notification from released connection"
                    );
                    None
                }
            }
            MachineInput::Timer { id, event } => {
                let Some(kind) = TimerKind::of(&event) else {
                    debug!(timer = id.0, event = ?event.kind(), "dropping unexpected timer event");
                    return None;
                };
                if self.timers.get(&kind) != Some(&id) {
                    debug!(timer = id.0, kind = ?kind, "dropping stale timer");
                    return None;
                }
                self.timers.remove(&kind);
                let event = restamp(event, self.clock.now());
                Some(self.dispatch(event))
            }
        }
    }

    /// Run one event through the transition table.
    pub fn dispatch(&mut self, event: Event) -> Transition {
        let from = self.state;
        let kind = event.kind();

        if from.is_terminal() {
            if kind != EventKind::Terminate {
                warn!(event = ?kind, "event dropped after termination");
            }
            let outcome =
                (kind == EventKind::Send).then_some(SendOutcome::Rejected(RejectReason::Terminated));
            return Transition::ignored(from, kind, outcome);
        }

        let now = self.clock.now();
        let admission = self.admission(&event, now);
        let Some(plan) = plan(from, &event, &self.ctx, &self.config, admission, now) else {
            debug!(
                state = %from,
                event = ?kind,
                connection = ?self.ctx.connection.transport,
                "no transition"
            );
            return Transition::ignored(from, kind, admission);
        };

        let error = plan.recorded_error().cloned();
        self.state = plan.to;
        self.ctx.connection.status = plan.to;
        if from != plan.to {
            self.cancel_timers_invalid_in(plan.to);
        }

        let mut effects = Effects::default();
        for action in plan.actions {
            action.apply(&mut self.ctx);
            self.perform(action, now, error.as_ref(), &mut effects);
        }
        self.ctx.timing.window_start = self.queue.window_start();

        debug!(
            from = %from,
            to = %self.state,
            event = ?kind,
            connection = ?self.ctx.connection.transport,
            "transition"
        );

        if cfg!(debug_assertions)
            && let Err(err) = self.check_invariants()
        {
            panic!("invariant violated after {kind:?} from {from}: {err}");
        }

        self.notify(from, kind, effects.message, error);

        Transition {
            from,
            to: self.state,
            event: kind,
            applied: true,
            outcome: effects.outcome,
        }
    }

    fn admission(&self, event: &Event, now: Instant) -> Option<SendOutcome> {
        let Event::Send { priority, .. } = event else {
            return None;
        };
        Some(match self.state {
            ConnectionState::Connected => self.queue.preview(*priority, now),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.queue.preview_hold(*priority)
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                SendOutcome::Rejected(RejectReason::NotConnected)
            }
            ConnectionState::Terminated => SendOutcome::Rejected(RejectReason::Terminated),
        })
    }

    fn perform(
        &mut self,
        action: Action,
        now: Instant,
        error: Option<&ErrorCause>,
        effects: &mut Effects,
    ) {
        match action {
            Action::OpenTransport => self.open_transport(),
            Action::RecordConnected { at } => {
                info!(
                    connection = ?self.ctx.connection.transport,
                    url = self.ctx.connection.url.as_deref().unwrap_or_default(),
                    held = self.queue.pending_len(),
                    "stream connection established"
                );
                self.monitor.reset();
                self.arm(
                    TimerKind::Probe,
                    self.config.health.ping_interval,
                    Event::Ping { timestamp: at },
                );
                self.transmit(now);
            }
            Action::ScheduleRetry => self.schedule_retry(error),
            Action::ReleaseTransport { close } => {
                if let Some(mut live) = self.live.take() {
                    match close {
                        Some((code, reason)) => live.handle.close(code, &reason),
                        None => live.handle.terminate(),
                    }
                }
            }
            Action::BeginClose { code, reason } => {
                if let Some(mut live) = self.live.take() {
                    live.handle.close(code, &reason);
                    self.closing = Some(live);
                }
                self.arm(
                    TimerKind::CloseTimeout,
                    self.config.close_timeout,
                    close_timeout_event(),
                );
            }
            Action::FinishClose => {
                if let Some(mut live) = self.closing.take() {
                    live.handle.terminate();
                }
            }
            Action::RecordDisconnected { .. } => {
                info!(
                    url = self.ctx.connection.url.as_deref().unwrap_or_default(),
                    state = %self.state,
                    messages_sent = self.ctx.metrics.messages_sent,
                    messages_received = self.ctx.metrics.messages_received,
                    errors = self.ctx.metrics.error_count,
                    "stream connection closed"
                );
            }
            Action::ReceiveMessage { data, .. } => {
                self.received.push(data.clone());
                effects.message = Some(data);
            }
            Action::EnqueueOutbound { data, priority } => {
                let outcome = self
                    .queue
                    .try_send(OutboundMessage::new(data, priority, now), now);
                effects.outcome = Some(outcome);
                self.transmit(now);
            }
            Action::HoldOutbound { data, priority } => {
                let outcome = self.queue.hold(OutboundMessage::new(data, priority, now));
                effects.outcome = Some(outcome);
            }
            Action::Transmit => self.transmit(now),
            Action::SendProbe { at } => {
                // An unanswered probe whose deadline outlived the interval still counts.
                if let Some(previous) = self.monitor.outstanding() {
                    self.probe_failed(previous, now);
                }
                let probed = self
                    .live
                    .as_mut()
                    .is_some_and(|live| live.handle.probe());
                if probed {
                    self.monitor.on_probe_sent(at);
                    self.arm(
                        TimerKind::ProbeDeadline,
                        self.config.health.pong_timeout,
                        Event::ProbeTimeout { sent_at: at },
                    );
                }
                self.arm(
                    TimerKind::Probe,
                    self.config.health.ping_interval,
                    Event::Ping { timestamp: at },
                );
            }
            Action::RecordPong { at, latency } => {
                self.monitor.on_probe_ack(at, latency);
                self.disarm(TimerKind::ProbeDeadline);
            }
            Action::ProbeTimedOut { sent_at } => self.probe_failed(sent_at, now),
            Action::ClearQueue => {
                let dropped = self.queue.clear();
                if dropped > 0 {
                    debug!(dropped, "cleared outbound queue");
                }
            }
            Action::CancelAllTimers => {
                for (_, id) in self.timers.drain() {
                    self.clock.cancel(id);
                }
            }
            Action::RecordTarget { .. }
            | Action::ResetReconnectAttempts
            | Action::ClearError
            | Action::RecordError { .. }
            | Action::IncrementReconnectAttempts => {}
        }
    }

    /// Count the probe sent at `sent_at` as unanswered. Once the threshold is reached the
    /// timeout error is queued, tagged with the connection that was being measured.
    fn probe_failed(&mut self, sent_at: Instant, now: Instant) {
        let Some(event) = self.monitor.on_probe_timeout(sent_at, now) else {
            return;
        };
        let Some(connection) = self.live.as_ref().map(|live| live.id) else {
            return;
        };
        warn!(
            connection = %connection,
            failures = self.monitor.consecutive_failures(),
            health = %self.monitor.tick(),
            "probe failure threshold reached"
        );
        self.inbox.transport(connection, event);
    }

    fn open_transport(&mut self) {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id = self.next_connection_id.wrapping_add(1);

        let url = self.ctx.connection.url.clone().unwrap_or_default();
        let events = TransportEvents::new(id, self.inbox.clone());
        let handle = self
            .transport
            .open(id, &url, &self.ctx.connection.protocols, events);
        self.live = Some(Live { id, handle });
        self.ctx.connection.transport = Some(id);

        info!(
            connection = %id,
            url = %url,
            attempt = self.ctx.metrics.reconnect_attempts,
            "opening stream connection"
        );
    }

    /// Promote what the rate window allows and hand it to the transport.
    fn transmit(&mut self, now: Instant) {
        self.queue.on_window_tick(now);
        if let Some(live) = self.live.as_mut() {
            for message in self.queue.drain() {
                let len = message.data.len() as u64;
                live.handle.send(message.data);
                self.ctx.metrics.messages_sent = self.ctx.metrics.messages_sent.saturating_add(1);
                self.ctx.metrics.bytes_sent = self.ctx.metrics.bytes_sent.saturating_add(len);
            }
        }
        if let Some(delay) = self.queue.next_rollover(now)
            && !self.timers.contains_key(&TimerKind::Flush)
        {
            self.arm(TimerKind::Flush, delay, Event::Flush { timestamp: now });
        }
    }

    fn schedule_retry(&mut self, cause: Option<&ErrorCause>) {
        let attempt = self.ctx.metrics.reconnect_attempts;
        if !self.reconnect.should_retry() {
            self.log_reconnect_plan("retry_suppressed", cause, attempt, None);
            self.inbox.send(Event::MaxRetries { attempts: attempt });
            return;
        }

        let delay = self.reconnect.delay(attempt);
        self.log_reconnect_plan("scheduled", cause, attempt, Some(delay));
        self.arm(TimerKind::Retry, delay, Event::Retry { attempt, delay });
    }

    fn log_reconnect_plan(
        &self,
        note: &str,
        cause: Option<&ErrorCause>,
        attempt: u32,
        delay: Option<Duration>,
    ) {
        let delay_ms = delay.map(|d| d.as_millis().min(u64::MAX as u128) as u64);
        let stats = self.monitor.stats();
        warn!(
            url = self.ctx.connection.url.as_deref().unwrap_or_default(),
            note = %note,
            category = cause.map(|cause| cause.category.as_str()),
            reason = cause.map(|cause| cause.message.as_str()),
            code = cause.and_then(|cause| cause.code),
            attempt,
            max_retries = self.config.max_retries,
            delay_ms,
            queued = self.queued(),
            messages_sent = self.ctx.metrics.messages_sent,
            messages_received = self.ctx.metrics.messages_received,
            errors = self.ctx.metrics.error_count,
            health = %stats.state,
            p50_latency_us = stats.p50_latency_us,
            "stream reconnect plan"
        );
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration, event: Event) {
        let id = TimerId(self.next_timer_id);
        self.next_timer_id = self.next_timer_id.wrapping_add(1);
        if let Some(previous) = self.timers.insert(kind, id) {
            self.clock.cancel(previous);
        }
        self.clock.schedule(id, delay, event, &self.inbox);
    }

    fn disarm(&mut self, kind: TimerKind) {
        if let Some(id) = self.timers.remove(&kind) {
            self.clock.cancel(id);
        }
    }

    fn cancel_timers_invalid_in(&mut self, state: ConnectionState) {
        let clock = &mut self.clock;
        self.timers.retain(|kind, id| {
            let keep = kind.valid_in(state);
            if !keep {
                clock.cancel(*id);
            }
            keep
        });
    }

    fn notify(
        &mut self,
        from: ConnectionState,
        event: EventKind,
        message: Option<Bytes>,
        error: Option<ErrorCause>,
    ) {
        if self.observers.is_empty() {
            return;
        }
        let context = self.ctx.clone();
        let error = error.map(|cause| ErrorReport {
            category: cause.category,
            recoverable: cause.category.is_recoverable(),
            attempt: self.ctx.metrics.reconnect_attempts,
            message: cause.message,
            context: context.clone(),
        });
        let change = StateChange {
            from,
            to: self.state,
            event,
            context,
            message,
            error,
        };
        for observer in &mut self.observers {
            observer.on_transition(&change);
        }
    }

    /// Evaluate the structural invariants. Called after every dispatch in debug builds.
    pub fn check_invariants(&self) -> StreamResult<()> {
        let violated = |what: &str| {
            Err(StreamError::InvalidState(format!(
                "{what} (state {})",
                self.state
            )))
        };

        if self.ctx.connection.status != self.state {
            return violated("context status does not mirror the state");
        }
        let holds = self.ctx.connection.transport.is_some();
        if holds != self.state.holds_transport() {
            return violated("transport handle held outside connecting/connected");
        }
        if self.ctx.connection.transport != self.live.as_ref().map(|live| live.id) {
            return violated("context transport id does not match the live handle");
        }
        if self.closing.is_some() && self.state != ConnectionState::Disconnecting {
            return violated("closing handle kept outside disconnecting");
        }
        if self.state == ConnectionState::Reconnecting {
            let attempts = self.ctx.metrics.reconnect_attempts;
            if attempts == 0 || attempts > self.config.max_retries {
                return violated("reconnect attempts outside 1..=max_retries");
            }
        }
        if self.state == ConnectionState::Connected && self.ctx.connection.last_error.is_some() {
            return violated("connected with a recorded error");
        }
        if !self.timers.keys().all(|kind| kind.valid_in(self.state)) {
            return violated("timer armed that is not valid in this state");
        }
        if self.state == ConnectionState::Terminated && !self.queue.is_empty() {
            return violated("terminated with buffered messages");
        }
        Ok(())
    }
}

/// Timer events are built when scheduled; stamp them with the firing time.
fn restamp(event: Event, now: Instant) -> Event {
    match event {
        Event::Ping { .. } => Event::Ping { timestamp: now },
        Event::Flush { .. } => Event::Flush { timestamp: now },
        other => other,
    }
}

impl<T: Transport, C: Clock> Drop for ConnectionMachine<T, C> {
    fn drop(&mut self) {
        for (_, id) in self.timers.drain() {
            self.clock.cancel(id);
        }
        if let Some(mut live) = self.live.take() {
            live.handle.terminate();
        }
        if let Some(mut live) = self.closing.take() {
            live.handle.terminate();
        }
    }
}
