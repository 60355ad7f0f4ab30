use std::time::Duration;

use proptest::prelude::*;
use resilient_ws::core::{
    ClientConfig, ConnectionState, ErrorCategory, ErrorCause, Event, HealthConfig, Priority,
    RateLimitConfig,
};
use resilient_ws::testing::MachineHarness;

#[derive(Debug, Clone)]
enum Op {
    Connect,
    Disconnect { clear_queue: bool },
    Terminate,
    Open,
    /// Open reported by the oldest connection, usually long released.
    OpenOldest,
    Fail(ErrorCategory),
    Close { code: u16, was_clean: bool },
    Message,
    Pong,
    Send(Priority),
    Advance(u64),
}

fn category() -> impl Strategy<Value = ErrorCategory> {
    prop::sample::select(vec![
        ErrorCategory::Network,
        ErrorCategory::Timeout,
        ErrorCategory::Protocol,
        ErrorCategory::Application,
        ErrorCategory::Resource,
    ])
}

fn priority() -> impl Strategy<Value = Priority> {
    prop::sample::select(vec![Priority::Low, Priority::Normal, Priority::High])
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Connect),
        2 => any::<bool>().prop_map(|clear_queue| Op::Disconnect { clear_queue }),
        1 => Just(Op::Terminate),
        4 => Just(Op::Open),
        1 => Just(Op::OpenOldest),
        3 => category().prop_map(Op::Fail),
        2 => (prop::sample::select(vec![1000u16, 1001, 1002, 1006, 1008, 1011, 1013]), any::<bool>())
            .prop_map(|(code, was_clean)| Op::Close { code, was_clean }),
        2 => Just(Op::Message),
        1 => Just(Op::Pong),
        3 => priority().prop_map(Op::Send),
        4 => (0u64..2_500).prop_map(Op::Advance),
    ]
}

fn config() -> ClientConfig {
    ClientConfig::default()
        .with_max_retries(3)
        .with_backoff(Duration::from_millis(50), Duration::from_millis(400), 2.0)
        .with_jitter(Duration::from_millis(20), Some(42))
        .with_rate_limit(RateLimitConfig::new(Duration::from_millis(200), 2).with_burst_limit(3))
        .with_queue(4, resilient_ws::core::OverflowPolicy::DropOldest)
        .with_close_timeout(Duration::from_millis(300))
        .with_health(HealthConfig {
            ping_interval: Duration::from_millis(250),
            pong_timeout: Duration::from_millis(100),
            failure_threshold: 2,
            ..HealthConfig::default()
        })
}

fn apply(h: &mut MachineHarness, op: &Op) {
    let server = h.server().clone();
    match op {
        Op::Connect => {
            h.connect("ws://prop.test/feed");
        }
        Op::Disconnect { clear_queue } => {
            h.dispatch(Event::Disconnect {
                code: None,
                reason: None,
                clear_queue: *clear_queue,
            });
        }
        Op::Terminate => {
            h.dispatch(Event::terminate());
        }
        Op::Open => {
            h.open_latest();
        }
        Op::OpenOldest => {
            if server.connections() > 0 {
                server.open(resilient_ws::core::ConnectionId(1));
                h.process();
            }
        }
        Op::Fail(category) => {
            h.fail_latest(ErrorCause::new(*category, "injected"));
        }
        Op::Close { code, was_clean } => {
            if let Some(id) = server.latest() {
                server.close(id, *code, "", *was_clean);
                h.process();
            }
        }
        Op::Message => {
            if let Some(id) = server.latest() {
                server.message(id, "payload");
                h.process();
            }
        }
        Op::Pong => {
            if let Some(id) = server.latest() {
                server.pong(id, Duration::from_millis(5));
                h.process();
            }
        }
        Op::Send(priority) => {
            h.dispatch(Event::send("out", *priority));
        }
        Op::Advance(ms) => h.advance(Duration::from_millis(*ms)),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn invariants_hold_for_random_event_sequences(ops in prop::collection::vec(op(), 1..80)) {
        let mut h = MachineHarness::new(config()).unwrap();
        let mut terminated = false;

        for op in &ops {
            apply(&mut h, op);

            prop_assert!(h.machine().check_invariants().is_ok(), "after {op:?}: {:?}", h.machine().check_invariants());
            // At most one connection is ever held, live or closing.
            prop_assert!(h.server().live().len() <= 1, "after {op:?}: live {:?}", h.server().live());
            prop_assert_eq!(
                h.context().connection.transport.is_some(),
                h.state().holds_transport()
            );

            if terminated {
                prop_assert_eq!(h.state(), ConnectionState::Terminated);
            }
            terminated = h.state() == ConnectionState::Terminated;
        }
    }

    #[test]
    fn retry_budget_is_never_exceeded(failures in 1usize..12, max_retries in 0u32..5) {
        let mut h = MachineHarness::new(config().with_max_retries(max_retries)).unwrap();
        h.connect("ws://prop.test/feed");

        for _ in 0..failures {
            h.fail_latest(ErrorCause::network("refused"));
            prop_assert!(h.context().metrics.reconnect_attempts <= max_retries);
            h.advance(Duration::from_secs(1));
        }

        let opened = h.server().connections();
        prop_assert!(opened <= max_retries as usize + 1);
        if failures > max_retries as usize {
            prop_assert_eq!(h.state(), ConnectionState::Disconnected);
        }
    }
}
