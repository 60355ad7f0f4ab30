use std::time::Duration;

use bytes::Bytes;
use resilient_ws::core::{
    ClientConfig, ConnectionState, Event, OverflowPolicy, Priority, RateLimitConfig,
    RejectReason, SendOutcome,
};
use resilient_ws::testing::MachineHarness;

const URL: &str = "ws://feed.test/orders";

fn harness(config: ClientConfig) -> MachineHarness {
    MachineHarness::new(config.with_jitter(Duration::ZERO, Some(1))).unwrap()
}

fn send(h: &mut MachineHarness, data: &'static str, priority: Priority) -> Option<SendOutcome> {
    h.dispatch(Event::send(data, priority)).outcome
}

fn bytes(items: &[&'static str]) -> Vec<Bytes> {
    items.iter().map(|item| Bytes::from_static(item.as_bytes())).collect()
}

#[test]
fn held_messages_drain_by_priority_then_arrival() {
    let mut h = harness(ClientConfig::default());
    h.connect(URL);

    send(&mut h, "m1", Priority::Normal);
    h.advance(Duration::from_millis(1));
    send(&mut h, "m2", Priority::Normal);
    h.advance(Duration::from_millis(1));
    send(&mut h, "low", Priority::Low);
    send(&mut h, "m3", Priority::High);

    let id = h.open_latest().unwrap();
    assert_eq!(h.server().sent(id), bytes(&["m3", "m1", "m2", "low"]));
}

#[test]
fn rate_limited_messages_go_out_when_the_window_rolls() {
    let config = ClientConfig::default()
        .with_rate_limit(RateLimitConfig::new(Duration::from_secs(1), 2));
    let mut h = harness(config);
    h.connect(URL);
    let id = h.open_latest().unwrap();

    assert_eq!(send(&mut h, "a", Priority::Normal), Some(SendOutcome::Accepted));
    assert_eq!(send(&mut h, "b", Priority::Normal), Some(SendOutcome::Accepted));
    assert_eq!(send(&mut h, "c", Priority::Normal), Some(SendOutcome::Queued));
    assert_eq!(send(&mut h, "d", Priority::Normal), Some(SendOutcome::Queued));
    assert_eq!(h.server().sent(id), bytes(&["a", "b"]));
    assert!(h.context().timing.window_start.is_some());

    h.advance(Duration::from_millis(999));
    assert_eq!(h.server().sent(id).len(), 2);

    h.advance(Duration::from_millis(1));
    assert_eq!(h.server().sent(id), bytes(&["a", "b", "c", "d"]));
    assert_eq!(h.machine().queued(), 0);
    assert_eq!(h.context().metrics.messages_sent, 4);
}

#[test]
fn high_priority_uses_the_burst_allowance() {
    let config = ClientConfig::default().with_rate_limit(
        RateLimitConfig::new(Duration::from_secs(1), 1).with_burst_limit(2),
    );
    let mut h = harness(config);
    h.connect(URL);
    let id = h.open_latest().unwrap();

    assert_eq!(send(&mut h, "n1", Priority::Normal), Some(SendOutcome::Accepted));
    assert_eq!(send(&mut h, "n2", Priority::Normal), Some(SendOutcome::Queued));
    assert_eq!(send(&mut h, "urgent", Priority::High), Some(SendOutcome::Accepted));
    assert_eq!(h.server().sent(id), bytes(&["n1", "urgent"]));
}

#[test]
fn reject_new_reports_a_full_queue() {
    let config = ClientConfig::default().with_queue(2, OverflowPolicy::RejectNew);
    let mut h = harness(config);
    h.connect(URL);

    assert_eq!(send(&mut h, "a", Priority::Normal), Some(SendOutcome::Queued));
    assert_eq!(send(&mut h, "b", Priority::Normal), Some(SendOutcome::Queued));
    assert_eq!(
        send(&mut h, "c", Priority::High),
        Some(SendOutcome::Rejected(RejectReason::QueueFull))
    );
    assert_eq!(h.machine().queued(), 2);
    assert_eq!(h.state(), ConnectionState::Connecting);
}

#[test]
fn drop_newest_discards_the_incoming_message() {
    let config = ClientConfig::default().with_queue(1, OverflowPolicy::DropNewest);
    let mut h = harness(config);
    h.connect(URL);

    assert_eq!(send(&mut h, "kept", Priority::Normal), Some(SendOutcome::Queued));
    assert_eq!(
        send(&mut h, "dropped", Priority::Normal),
        Some(SendOutcome::Rejected(RejectReason::Dropped))
    );

    let id = h.open_latest().unwrap();
    assert_eq!(h.server().sent(id), bytes(&["kept"]));
}

#[test]
fn drop_oldest_evicts_the_longest_waiting_message() {
    let config = ClientConfig::default().with_queue(2, OverflowPolicy::DropOldest);
    let mut h = harness(config);
    h.connect(URL);

    send(&mut h, "first", Priority::High);
    h.advance(Duration::from_millis(1));
    send(&mut h, "second", Priority::Normal);
    h.advance(Duration::from_millis(1));
    assert_eq!(send(&mut h, "third", Priority::Low), Some(SendOutcome::Queued));
    assert_eq!(h.machine().queued(), 2);

    let id = h.open_latest().unwrap();
    assert_eq!(h.server().sent(id), bytes(&["second", "third"]));
}
