use std::time::{Duration, Instant};

use bytes::Bytes;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

use resilient_ws::core::{
    OutboundMessage, OutboundQueue, OverflowPolicy, Priority, RateLimitConfig,
    SlidingWindowLimiter,
};

fn priority_for(i: usize) -> Priority {
    match i % 4 {
        0 => Priority::High,
        1 | 2 => Priority::Normal,
        _ => Priority::Low,
    }
}

fn bench_admit_and_drain(c: &mut Criterion) {
    let payload = Bytes::from(vec![b'{'; 256]);

    c.bench_function("admit_drain_1000_unlimited", |b| {
        b.iter(|| {
            let limiter = SlidingWindowLimiter::new(RateLimitConfig::new(
                Duration::from_secs(1),
                10_000,
            ));
            let mut queue = OutboundQueue::with_limiter(limiter, 4096, OverflowPolicy::RejectNew);
            let now = Instant::now();
            for i in 0..1000 {
                let msg = OutboundMessage::new(payload.clone(), priority_for(i), now);
                black_box(queue.try_send(msg, now));
            }
            black_box(queue.drain().count());
        })
    });

    c.bench_function("hold_then_release_1000_mixed_priority", |b| {
        b.iter(|| {
            let limiter =
                SlidingWindowLimiter::new(RateLimitConfig::new(Duration::from_millis(100), 100));
            let mut queue = OutboundQueue::with_limiter(limiter, 4096, OverflowPolicy::DropOldest);
            let start = Instant::now();
            for i in 0..1000 {
                let at = start + Duration::from_micros(i as u64);
                black_box(queue.hold(OutboundMessage::new(payload.clone(), priority_for(i), at)));
            }
            let mut now = start;
            let mut sent = 0;
            while !queue.is_empty() {
                queue.on_window_tick(now);
                sent += queue.drain().count();
                now += Duration::from_millis(100);
            }
            black_box(sent);
        })
    });
}

criterion_group!(benches, bench_admit_and_drain);
criterion_main!(benches);
