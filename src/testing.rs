//! Reusable test utilities for driving the connection machine without a real socket.
//!
//! [`MockTransport::channel_pair`] gives a transport plus a [`MockServer`] handle that
//! plays the remote side: it opens, fails and closes connections, and records what the
//! machine wrote. [`ManualClock`] replaces tokio timers with virtual time, and
//! [`MachineHarness`] wires both around a [`ConnectionMachine`] for fully deterministic
//! tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::{
    ClientConfig, ConnectionId, ConnectionState, Context, ErrorCause, Event, StreamResult,
    TimerId,
};
use crate::machine::{
    Clock, ConnectionMachine, EventSender, MachineInput, StateChange, Transition,
    TransportEvents,
};
use crate::transport::{Transport, TransportHandle};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MockConnection {
    id: ConnectionId,
    url: String,
    protocols: Vec<String>,
    events: TransportEvents,
    sent: Vec<Bytes>,
    close: Option<(u16, String)>,
    terminated: bool,
    released: bool,
    probes: usize,
}

struct MockState {
    connections: Vec<MockConnection>,
    auto_open: bool,
    probe_support: bool,
}

impl MockState {
    fn get(&self, id: ConnectionId) -> Option<&MockConnection> {
        self.connections.iter().find(|conn| conn.id == id)
    }

    fn get_mut(&mut self, id: ConnectionId) -> Option<&mut MockConnection> {
        self.connections.iter_mut().find(|conn| conn.id == id)
    }
}

/// A transport that records everything in memory so tests can emulate server behavior.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Build a transport + server control pair.
    pub fn channel_pair() -> (Self, MockServer) {
        let state = Arc::new(Mutex::new(MockState {
            connections: Vec::new(),
            auto_open: false,
            probe_support: true,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockServer { state },
        )
    }
}

impl Transport for MockTransport {
    type Handle = MockHandle;

    fn open(
        &mut self,
        id: ConnectionId,
        url: &str,
        protocols: &[String],
        events: TransportEvents,
    ) -> Self::Handle {
        let mut state = lock(&self.state);
        if state.auto_open {
            events.emit(Event::Open {
                timestamp: Instant::now(),
            });
        }
        state.connections.push(MockConnection {
            id,
            url: url.to_string(),
            protocols: protocols.to_vec(),
            events,
            sent: Vec::new(),
            close: None,
            terminated: false,
            released: false,
            probes: 0,
        });
        MockHandle {
            id,
            state: Arc::clone(&self.state),
        }
    }
}

/// Handle the machine holds for one mock connection.
pub struct MockHandle {
    id: ConnectionId,
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn with<R>(&self, f: impl FnOnce(&mut MockConnection) -> R) -> Option<R> {
        lock(&self.state).get_mut(self.id).map(f)
    }
}

impl TransportHandle for MockHandle {
    fn send(&mut self, data: Bytes) {
        self.with(|conn| conn.sent.push(data));
    }

    fn close(&mut self, code: u16, reason: &str) {
        self.with(|conn| conn.close = Some((code, reason.to_string())));
    }

    fn terminate(&mut self) {
        self.with(|conn| conn.terminated = true);
    }

    fn probe(&mut self) -> bool {
        let mut state = lock(&self.state);
        if !state.probe_support {
            return false;
        }
        match state.get_mut(self.id) {
            Some(conn) => {
                conn.probes += 1;
                true
            }
            None => false,
        }
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.with(|conn| conn.released = true);
    }
}

/// Server-side test handle paired with [`MockTransport`].
#[derive(Clone)]
pub struct MockServer {
    state: Arc<Mutex<MockState>>,
}

impl MockServer {
    /// Emit `Open` as soon as a connection is requested.
    pub fn set_auto_open(&self, auto_open: bool) {
        lock(&self.state).auto_open = auto_open;
    }

    /// When disabled, probes report no support and health is never fed.
    pub fn set_probe_support(&self, supported: bool) {
        lock(&self.state).probe_support = supported;
    }

    /// Number of connections opened so far.
    pub fn connections(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn latest(&self) -> Option<ConnectionId> {
        lock(&self.state).connections.last().map(|conn| conn.id)
    }

    /// Connections the machine still holds a handle for.
    pub fn live(&self) -> Vec<ConnectionId> {
        lock(&self.state)
            .connections
            .iter()
            .filter(|conn| !conn.released)
            .map(|conn| conn.id)
            .collect()
    }

    fn emit(&self, id: ConnectionId, event: Event) -> bool {
        // Clone the sink so the machine never observes the lock held.
        let events = lock(&self.state).get(id).map(|conn| conn.events.clone());
        events.is_some_and(|events| events.emit(event))
    }

    pub fn open(&self, id: ConnectionId) -> bool {
        self.emit(
            id,
            Event::Open {
                timestamp: Instant::now(),
            },
        )
    }

    pub fn message(&self, id: ConnectionId, data: impl Into<Bytes>) -> bool {
        self.emit(
            id,
            Event::Message {
                data: data.into(),
                timestamp: Instant::now(),
            },
        )
    }

    pub fn fail(&self, id: ConnectionId, cause: ErrorCause) -> bool {
        self.emit(id, Event::error(cause, Instant::now()))
    }

    pub fn close(&self, id: ConnectionId, code: u16, reason: &str, was_clean: bool) -> bool {
        self.emit(
            id,
            Event::Close {
                code,
                reason: reason.to_string(),
                was_clean,
            },
        )
    }

    pub fn pong(&self, id: ConnectionId, latency: Duration) -> bool {
        self.emit(
            id,
            Event::Pong {
                timestamp: Instant::now(),
                latency,
            },
        )
    }

    pub fn sent(&self, id: ConnectionId) -> Vec<Bytes> {
        lock(&self.state)
            .get(id)
            .map(|conn| conn.sent.clone())
            .unwrap_or_default()
    }

    /// Everything written across all connections, in connection order.
    pub fn all_sent(&self) -> Vec<Bytes> {
        lock(&self.state)
            .connections
            .iter()
            .flat_map(|conn| conn.sent.iter().cloned())
            .collect()
    }

    /// Close code and reason the machine requested, if any.
    pub fn close_request(&self, id: ConnectionId) -> Option<(u16, String)> {
        lock(&self.state).get(id).and_then(|conn| conn.close.clone())
    }

    pub fn terminated(&self, id: ConnectionId) -> bool {
        lock(&self.state).get(id).is_some_and(|conn| conn.terminated)
    }

    pub fn released(&self, id: ConnectionId) -> bool {
        lock(&self.state).get(id).is_some_and(|conn| conn.released)
    }

    pub fn probes(&self, id: ConnectionId) -> usize {
        lock(&self.state).get(id).map_or(0, |conn| conn.probes)
    }

    pub fn url(&self, id: ConnectionId) -> Option<String> {
        lock(&self.state).get(id).map(|conn| conn.url.clone())
    }

    pub fn protocols(&self, id: ConnectionId) -> Vec<String> {
        lock(&self.state)
            .get(id)
            .map(|conn| conn.protocols.clone())
            .unwrap_or_default()
    }

    /// Poll until `count` connections exist. Returns the latest one.
    pub async fn wait_for_connections(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Option<ConnectionId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.connections() >= count {
                return self.latest();
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

struct Scheduled {
    deadline: Instant,
    event: Event,
    inbox: EventSender,
}

struct ManualState {
    now: Instant,
    timers: HashMap<TimerId, Scheduled>,
    order: BTreeMap<(Instant, TimerId), ()>,
}

/// Virtual-time clock. Timers only fire when a test advances time.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: Instant::now(),
                timers: HashMap::new(),
                order: BTreeMap::new(),
            })),
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).timers.len()
    }

    /// Time until the earliest pending timer.
    pub fn next_deadline(&self) -> Option<Duration> {
        let state = lock(&self.state);
        state
            .order
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(state.now))
    }

    /// Fire the earliest timer due at or before `until`, moving time to its deadline.
    pub fn fire_next(&self, until: Instant) -> Option<TimerId> {
        let (id, scheduled) = {
            let mut state = lock(&self.state);
            let (deadline, id) = *state.order.keys().next()?;
            if deadline > until {
                return None;
            }
            state.order.remove(&(deadline, id));
            let scheduled = state.timers.remove(&id)?;
            if deadline > state.now {
                state.now = deadline;
            }
            (id, scheduled)
        };
        scheduled.inbox.timer(id, scheduled.event);
        Some(id)
    }

    /// Move time forward by `by`, firing every timer that comes due. Returns how many fired.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now() + by;
        let mut fired = 0;
        while self.fire_next(target).is_some() {
            fired += 1;
        }
        self.set_now(target);
        fired
    }

    fn set_now(&self, now: Instant) {
        let mut state = lock(&self.state);
        if now > state.now {
            state.now = now;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        lock(&self.state).now
    }

    fn schedule(&mut self, id: TimerId, delay: Duration, event: Event, inbox: &EventSender) {
        let mut state = lock(&self.state);
        let deadline = state.now + delay;
        if let Some(previous) = state.timers.insert(
            id,
            Scheduled {
                deadline,
                event,
                inbox: inbox.clone(),
            },
        ) {
            state.order.remove(&(previous.deadline, id));
        }
        state.order.insert((deadline, id), ());
    }

    fn cancel(&mut self, id: TimerId) {
        let mut state = lock(&self.state);
        if let Some(scheduled) = state.timers.remove(&id) {
            state.order.remove(&(scheduled.deadline, id));
        }
    }
}

/// A machine over [`MockTransport`] and [`ManualClock`], with every transition recorded.
///
/// All inbox traffic is processed eagerly after each call, so tests observe the settled
/// state.
pub struct MachineHarness {
    machine: ConnectionMachine<MockTransport, ManualClock>,
    rx: mpsc::UnboundedReceiver<MachineInput>,
    server: MockServer,
    clock: ManualClock,
    changes: Arc<Mutex<Vec<StateChange>>>,
}

impl MachineHarness {
    pub fn new(config: ClientConfig) -> StreamResult<Self> {
        let (transport, server) = MockTransport::channel_pair();
        let clock = ManualClock::new();
        let (mut machine, rx) = ConnectionMachine::new(config, transport, clock.clone())?;
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        machine.subscribe(move |change: &StateChange| lock(&sink).push(change.clone()));
        Ok(Self {
            machine,
            rx,
            server,
            clock,
            changes,
        })
    }

    pub fn machine(&self) -> &ConnectionMachine<MockTransport, ManualClock> {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut ConnectionMachine<MockTransport, ManualClock> {
        &mut self.machine
    }

    pub fn server(&self) -> &MockServer {
        &self.server
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn context(&self) -> &Context {
        self.machine.context()
    }

    /// Dispatch a user event, then settle the inbox.
    pub fn dispatch(&mut self, event: Event) -> Transition {
        let transition = self.machine.dispatch(event);
        self.process();
        transition
    }

    /// Handle everything waiting on the inbox.
    pub fn process(&mut self) -> usize {
        let mut total = 0;
        loop {
            let processed = self.machine.process_pending(&mut self.rx);
            if processed == 0 {
                return total;
            }
            total += processed;
        }
    }

    /// Advance virtual time, processing each timer before the next one fires so timers
    /// armed along the way are honoured.
    pub fn advance(&mut self, by: Duration) {
        let target = self.clock.now() + by;
        self.process();
        while self.clock.fire_next(target).is_some() {
            self.process();
        }
        self.clock.set_now(target);
        self.process();
    }

    pub fn connect(&mut self, url: &str) -> Transition {
        self.dispatch(Event::connect(url))
    }

    /// Report `Open` for the newest connection.
    pub fn open_latest(&mut self) -> Option<ConnectionId> {
        let id = self.server.latest()?;
        self.server.open(id);
        self.process();
        Some(id)
    }

    /// Report a failure on the newest connection.
    pub fn fail_latest(&mut self, cause: ErrorCause) -> Option<ConnectionId> {
        let id = self.server.latest()?;
        self.server.fail(id, cause);
        self.process();
        Some(id)
    }

    pub fn changes(&self) -> Vec<StateChange> {
        lock(&self.changes).clone()
    }

    pub fn take_changes(&self) -> Vec<StateChange> {
        std::mem::take(&mut *lock(&self.changes))
    }

    /// Visited states in order, collapsing self-transitions.
    pub fn visited(&self) -> Vec<ConnectionState> {
        let changes = lock(&self.changes);
        let mut states = Vec::new();
        for change in changes.iter().filter(|change| change.is_state_change()) {
            if states.is_empty() {
                states.push(change.from);
            }
            states.push(change.to);
        }
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_fires_in_deadline_order() {
        let (inbox, mut rx) = EventSender::channel();
        let mut clock = ManualClock::new();
        clock.schedule(TimerId(1), Duration::from_secs(3), Event::terminate(), &inbox);
        clock.schedule(TimerId(2), Duration::from_secs(1), Event::disconnect(), &inbox);
        clock.schedule(TimerId(3), Duration::from_secs(2), Event::disconnect(), &inbox);
        clock.cancel(TimerId(3));

        assert_eq!(clock.next_deadline(), Some(Duration::from_secs(1)));
        assert_eq!(clock.advance(Duration::from_secs(5)), 2);

        let fired: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|input| match input {
                MachineInput::Timer { id, .. } => id,
                other => panic!("unexpected input: {other:?}"),
            })
            .collect();
        assert_eq!(fired, vec![TimerId(2), TimerId(1)]);
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn mock_handle_records_and_releases() {
        let (mut transport, server) = MockTransport::channel_pair();
        let (inbox, _rx) = EventSender::channel();
        let id = ConnectionId(1);
        let mut handle = transport.open(
            id,
            "ws://mock/feed",
            &["v1".to_string()],
            TransportEvents::new(id, inbox),
        );

        handle.send(Bytes::from_static(b"hello"));
        assert!(handle.probe());
        handle.close(1000, "bye");
        drop(handle);

        assert_eq!(server.sent(id), vec![Bytes::from_static(b"hello")]);
        assert_eq!(server.probes(id), 1);
        assert_eq!(server.close_request(id), Some((1000, "bye".to_string())));
        assert!(server.released(id));
        assert_eq!(server.protocols(id), vec!["v1".to_string()]);
        assert!(server.live().is_empty());
    }
}
