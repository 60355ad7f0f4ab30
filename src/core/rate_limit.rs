use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::config::RateLimitConfig;
use super::types::{Priority, StreamError, StreamResult};

/// Sliding-window rate limiter guarding outbound sends.
///
/// Admissions are remembered by timestamp; an admission counts against the limit while
/// it lies inside `(now - window, now]`. High-priority messages may use the larger burst
/// allowance.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    window: Duration,
    max_messages: u32,
    burst_limit: u32,
    admitted: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            window: config.window,
            max_messages: config.max_messages,
            burst_limit: config.burst_limit.max(config.max_messages),
            admitted: VecDeque::with_capacity(config.burst_limit as usize),
        }
    }

    /// Admissions allowed per window for a message of `priority`.
    pub fn limit_for(&self, priority: Priority) -> u32 {
        match priority {
            Priority::High => self.burst_limit,
            Priority::Normal | Priority::Low => self.max_messages,
        }
    }

    fn expired(&self, admitted_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(admitted_at) >= self.window
    }

    /// Forget admissions that slid out of the window. Returns true when any did.
    pub fn roll(&mut self, now: Instant) -> bool {
        let before = self.admitted.len();
        while let Some(&front) = self.admitted.front() {
            if !self.expired(front, now) {
                break;
            }
            self.admitted.pop_front();
        }
        before != self.admitted.len()
    }

    /// Admissions inside the window at `now`, without mutating.
    pub fn in_window(&self, now: Instant) -> u32 {
        let live = self
            .admitted
            .iter()
            .filter(|admitted_at| !self.expired(**admitted_at, now))
            .count();
        u32::try_from(live).unwrap_or(u32::MAX)
    }

    /// Whether a message of `priority` would be admitted at `now`.
    pub fn would_admit(&self, priority: Priority, now: Instant) -> bool {
        self.in_window(now) < self.limit_for(priority)
    }

    /// Record an admission if the window allows it.
    pub fn try_acquire(&mut self, priority: Priority, now: Instant) -> StreamResult<()> {
        self.roll(now);
        let in_window = u32::try_from(self.admitted.len()).unwrap_or(u32::MAX);
        if in_window >= self.limit_for(priority) {
            return Err(StreamError::ResourceExhausted {
                message: "rate limit exceeded".to_string(),
                retry_after: self.time_until_slot(now),
            });
        }
        self.admitted.push_back(now);
        Ok(())
    }

    /// Time until the oldest admission leaves the window.
    pub fn time_until_slot(&self, now: Instant) -> Option<Duration> {
        let oldest = *self.admitted.front()?;
        Some(
            self.window
                .checked_sub(now.saturating_duration_since(oldest))
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Start of the span the current admissions are counted over.
    pub fn window_start(&self) -> Option<Instant> {
        self.admitted.front().copied()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn reset(&mut self) {
        self.admitted.clear();
    }
}
