//! Bounded outbound queue in front of the sliding-window rate limiter.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use super::config::{ClientConfig, OverflowPolicy};
use super::rate_limit::SlidingWindowLimiter;
use super::types::{Priority, RejectReason, SendOutcome};

/// One outbound payload plus the ordering metadata the queue needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub data: Bytes,
    pub priority: Priority,
    /// Enqueue time; orders messages within a priority class.
    pub timestamp: Instant,
}

impl OutboundMessage {
    pub fn new(data: impl Into<Bytes>, priority: Priority, timestamp: Instant) -> Self {
        Self {
            data: data.into(),
            priority,
            timestamp,
        }
    }
}

/// Dequeue order: priority descending, then timestamp ascending, then arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    timestamp: Instant,
    seq: u64,
}

#[derive(Debug)]
pub struct OutboundQueue {
    limiter: SlidingWindowLimiter,
    pending: BTreeMap<QueueKey, OutboundMessage>,
    ready: VecDeque<OutboundMessage>,
    capacity: usize,
    policy: OverflowPolicy,
    next_seq: u64,
}

impl OutboundQueue {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_limiter(
            SlidingWindowLimiter::new(config.rate_limit),
            config.queue_capacity,
            config.overflow_policy,
        )
    }

    pub fn with_limiter(
        limiter: SlidingWindowLimiter,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Self {
        Self {
            limiter,
            pending: BTreeMap::new(),
            ready: VecDeque::new(),
            capacity,
            policy,
            next_seq: 0,
        }
    }

    fn key_for(&mut self, message: &OutboundMessage) -> QueueKey {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        QueueKey {
            priority: Reverse(message.priority),
            timestamp: message.timestamp,
            seq,
        }
    }

    /// Outcome for a message arriving after promotions, given the limiter count and the
    /// highest-priority message still waiting.
    fn decide(
        &self,
        priority: Priority,
        limiter_admits: bool,
        waiting_head: Option<Priority>,
        waiting: usize,
    ) -> SendOutcome {
        let blocked = waiting_head.is_some_and(|head| head >= priority);
        if !blocked && limiter_admits {
            return SendOutcome::Accepted;
        }
        if waiting < self.capacity {
            return SendOutcome::Queued;
        }
        match self.policy {
            OverflowPolicy::RejectNew => SendOutcome::Rejected(RejectReason::QueueFull),
            OverflowPolicy::DropNewest => SendOutcome::Rejected(RejectReason::Dropped),
            OverflowPolicy::DropOldest if waiting > 0 => SendOutcome::Queued,
            OverflowPolicy::DropOldest => SendOutcome::Rejected(RejectReason::Dropped),
        }
    }

    /// What `try_send` would answer at `now`, without touching any state.
    pub fn preview(&self, priority: Priority, now: Instant) -> SendOutcome {
        // Replay the promotions `on_window_tick` would perform at `now`.
        let mut admitted = self.limiter.in_window(now);
        let mut promoted = 0usize;
        let mut head = None;
        for key in self.pending.keys() {
            if admitted < self.limiter.limit_for(key.priority.0) {
                admitted = admitted.saturating_add(1);
                promoted += 1;
            } else {
                head = Some(key.priority.0);
                break;
            }
        }

        let waiting = self.pending.len() - promoted;
        let admits = admitted < self.limiter.limit_for(priority);
        self.decide(priority, admits, head, waiting)
    }

    /// Admit, queue or reject `message` at `now`.
    pub fn try_send(&mut self, message: OutboundMessage, now: Instant) -> SendOutcome {
        self.on_window_tick(now);

        let head = self.pending.keys().next().map(|key| key.priority.0);
        let limiter_admits = self.limiter.would_admit(message.priority, now);
        let outcome = self.decide(message.priority, limiter_admits, head, self.pending.len());

        match outcome {
            SendOutcome::Accepted => {
                if self.limiter.try_acquire(message.priority, now).is_ok() {
                    self.ready.push_back(message);
                    SendOutcome::Accepted
                } else {
                    self.enqueue(message)
                }
            }
            SendOutcome::Queued => self.enqueue(message),
            rejected => {
                debug!(
                    priority = ?message.priority,
                    bytes = message.data.len(),
                    pending = self.pending.len(),
                    outcome = ?rejected,
                    "outbound message not accepted"
                );
                rejected
            }
        }
    }

    /// Buffer `message` without consulting the rate limiter (no connection to send on).
    pub fn hold(&mut self, message: OutboundMessage) -> SendOutcome {
        self.enqueue(message)
    }

    /// Outcome `hold` would report, without touching any state.
    pub fn preview_hold(&self, priority: Priority) -> SendOutcome {
        self.decide(priority, false, None, self.pending.len())
    }

    fn enqueue(&mut self, message: OutboundMessage) -> SendOutcome {
        if self.pending.len() >= self.capacity {
            if self.policy != OverflowPolicy::DropOldest {
                return self.decide(message.priority, false, None, self.pending.len());
            }
            let Some(oldest) = self
                .pending
                .iter()
                .min_by_key(|(key, _)| (key.timestamp, key.seq))
                .map(|(key, _)| *key)
            else {
                return SendOutcome::Rejected(RejectReason::Dropped);
            };
            if let Some(evicted) = self.pending.remove(&oldest) {
                debug!(
                    priority = ?evicted.priority,
                    bytes = evicted.data.len(),
                    "evicted oldest queued message"
                );
            }
        }
        let key = self.key_for(&message);
        self.pending.insert(key, message);
        SendOutcome::Queued
    }

    /// Roll the window and promote waiting messages while the limiter allows.
    /// Returns how many were promoted to the ready list.
    pub fn on_window_tick(&mut self, now: Instant) -> usize {
        self.limiter.roll(now);
        let mut promoted = 0;
        while let Some(entry) = self.pending.first_entry() {
            if self.limiter.try_acquire(entry.key().priority.0, now).is_err() {
                break;
            }
            self.ready.push_back(entry.remove());
            promoted += 1;
        }
        promoted
    }

    /// Messages admitted for transmission, in admission order.
    pub fn drain(&mut self) -> impl Iterator<Item = OutboundMessage> + '_ {
        self.ready.drain(..)
    }

    /// When the next waiting message could be admitted, if any is waiting.
    pub fn next_rollover(&self, now: Instant) -> Option<Duration> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.limiter.time_until_slot(now).unwrap_or(Duration::ZERO))
    }

    pub fn window_start(&self) -> Option<Instant> {
        self.limiter.window_start()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }

    /// Drop everything buffered. Returns how many messages were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len() + self.ready.len();
        self.pending.clear();
        self.ready.clear();
        dropped
    }
}
