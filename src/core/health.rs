use hdrhistogram::Histogram;
use std::fmt;
use std::time::{Duration, Instant};

use super::circular_buffer::CircularBuffer;
use super::config::HealthConfig;
use super::state::{ErrorCause, Event};

/// Liveness classification derived from probe outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HealthState {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the monitor, for snapshots and diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStats {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub average_latency: Option<Duration>,
    pub response_rate: f64,
    pub probes_sent: u64,
    pub last_probe: Option<Instant>,
    pub last_ack: Option<Instant>,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
    pub latency_samples: u64,
}

/// Health monitor fed by probe notifications.
///
/// It never changes connection state itself. When enough consecutive probes go
/// unanswered it hands back an `Error{Timeout}` event for the machine's inbox.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    consecutive_failures: u32,
    outstanding: Option<Instant>,
    last_probe: Option<Instant>,
    last_ack: Option<Instant>,
    probes_sent: u64,
    latencies: CircularBuffer<Duration>,
    responses: CircularBuffer<bool>,
    latency_histogram: Histogram<u64>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            outstanding: None,
            last_probe: None,
            last_ack: None,
            probes_sent: 0,
            latencies: CircularBuffer::new(config.latency_samples),
            responses: CircularBuffer::new(config.response_window),
            latency_histogram: Histogram::new_with_bounds(1, 60_000_000, 3)
                .expect("histogram bounds are valid"),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn on_probe_sent(&mut self, timestamp: Instant) {
        self.outstanding = Some(timestamp);
        self.last_probe = Some(timestamp);
        self.probes_sent = self.probes_sent.saturating_add(1);
    }

    /// Send time of the probe still awaiting its ack.
    pub fn outstanding(&self) -> Option<Instant> {
        self.outstanding
    }

    pub fn on_probe_ack(&mut self, timestamp: Instant, latency: Duration) {
        self.outstanding = None;
        self.last_ack = Some(timestamp);
        self.consecutive_failures = 0;
        self.latencies.push(latency);
        self.responses.push(true);
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        let _ = self.latency_histogram.record(micros.max(1));
    }

    /// The deadline for the probe sent at `sent_at` elapsed.
    ///
    /// Returns the timeout error once the failure threshold is reached. A deadline for a
    /// probe that was already acknowledged or superseded is ignored.
    pub fn on_probe_timeout(&mut self, sent_at: Instant, now: Instant) -> Option<Event> {
        if self.outstanding != Some(sent_at) {
            return None;
        }
        self.outstanding = None;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.responses.push(false);

        if self.consecutive_failures < self.config.failure_threshold {
            return None;
        }
        Some(Event::error(
            ErrorCause::timeout(format!(
                "{} consecutive probes unanswered within {:?}",
                self.consecutive_failures, self.config.pong_timeout
            )),
            now,
        ))
    }

    pub fn average_latency(&self) -> Option<Duration> {
        let samples = u32::try_from(self.latencies.len()).ok().filter(|n| *n > 0)?;
        let total: Duration = self.latencies.iter().sum();
        Some(total / samples)
    }

    /// Share of recent probes that were answered; 1.0 before any probe resolves.
    pub fn response_rate(&self) -> f64 {
        if self.responses.is_empty() {
            return 1.0;
        }
        let answered = self.responses.iter().filter(|ok| **ok).count();
        answered as f64 / self.responses.len() as f64
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn tick(&self) -> HealthState {
        let avg = self.average_latency();
        if self.consecutive_failures >= self.config.failure_threshold
            || avg.is_some_and(|avg| avg >= self.config.critical_latency)
        {
            return HealthState::Unhealthy;
        }
        if self.consecutive_failures > 0
            || avg.is_some_and(|avg| avg > self.config.low_latency)
            || self.response_rate() < self.config.min_response_rate
        {
            return HealthState::Degraded;
        }
        HealthState::Healthy
    }

    pub fn stats(&self) -> HealthStats {
        let latency_samples = self.latency_histogram.len();
        let (p50, p99) = if latency_samples == 0 {
            (0, 0)
        } else {
            (
                self.latency_histogram.value_at_percentile(50.0),
                self.latency_histogram.value_at_percentile(99.0),
            )
        };

        HealthStats {
            state: self.tick(),
            consecutive_failures: self.consecutive_failures,
            average_latency: self.average_latency(),
            response_rate: self.response_rate(),
            probes_sent: self.probes_sent,
            last_probe: self.last_probe,
            last_ack: self.last_ack,
            p50_latency_us: p50,
            p99_latency_us: p99,
            latency_samples,
        }
    }

    /// Forget the previous connection's probe history. The latency histogram spans the
    /// client's lifetime and is kept.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.outstanding = None;
        self.latencies.clear();
        self.responses.clear();
    }
}
