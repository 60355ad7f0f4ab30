use std::time::Duration;

use super::types::{StreamError, StreamResult};

/// What to do when the outbound queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the longest-waiting queued message and queue the new one.
    DropOldest,
    /// Discard the incoming message.
    DropNewest,
    /// Refuse the incoming message and report resource exhaustion.
    #[default]
    RejectNew,
}

/// Sliding-window send rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_messages: u32,
    /// Allowance for high-priority messages; never lower than `max_messages`.
    pub burst_limit: u32,
}

impl RateLimitConfig {
    pub fn new(window: Duration, max_messages: u32) -> Self {
        Self {
            window,
            max_messages,
            burst_limit: max_messages,
        }
    }

    pub fn with_burst_limit(mut self, burst_limit: u32) -> Self {
        self.burst_limit = burst_limit;
        self
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            max_messages: 100,
            burst_limit: 150,
        }
    }
}

/// Probe cadence and the thresholds used to classify connection health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub failure_threshold: u32,
    /// Rolling latency average is taken over this many samples.
    pub latency_samples: usize,
    /// Response rate is measured over this many recent probes.
    pub response_window: usize,
    pub low_latency: Duration,
    pub critical_latency: Duration,
    pub min_response_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            failure_threshold: 3,
            latency_samples: 10,
            response_window: 20,
            low_latency: Duration::from_millis(250),
            critical_latency: Duration::from_secs(2),
            min_response_rate: 0.8,
        }
    }
}

/// Per-client configuration. Each client owns its own copy; nothing is process-wide.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_max: Duration,
    /// Fixed seed for reconnect jitter; `None` draws from entropy.
    pub jitter_seed: Option<u64>,
    pub rate_limit: RateLimitConfig,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub health: HealthConfig,
    /// How long a graceful close may take before the machine gives up waiting.
    pub close_timeout: Duration,
    /// Received messages retained for inspection after delivery to observers.
    pub inbound_buffer_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_max: Duration::from_millis(500),
            jitter_seed: None,
            rate_limit: RateLimitConfig::default(),
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::default(),
            health: HealthConfig::default(),
            close_timeout: Duration::from_secs(5),
            inbound_buffer_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_retry_delay = initial;
        self.max_retry_delay = max;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter_max: Duration, seed: Option<u64>) -> Self {
        self.jitter_max = jitter_max;
        self.jitter_seed = seed;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_queue(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.queue_capacity = capacity;
        self.overflow_policy = policy;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Reject option combinations the engine cannot honour.
    pub fn validate(&self) -> StreamResult<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(StreamError::Configuration(format!(
                "backoff_multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_retry_delay < self.initial_retry_delay {
            return Err(StreamError::Configuration(format!(
                "max_retry_delay {:?} is below initial_retry_delay {:?}",
                self.max_retry_delay, self.initial_retry_delay
            )));
        }
        if self.rate_limit.window.is_zero() {
            return Err(StreamError::Configuration(
                "rate_limit.window must be non-zero".to_string(),
            ));
        }
        if self.rate_limit.max_messages == 0 {
            return Err(StreamError::Configuration(
                "rate_limit.max_messages must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.burst_limit < self.rate_limit.max_messages {
            return Err(StreamError::Configuration(format!(
                "rate_limit.burst_limit {} is below max_messages {}",
                self.rate_limit.burst_limit, self.rate_limit.max_messages
            )));
        }
        if self.health.ping_interval.is_zero() || self.health.pong_timeout.is_zero() {
            return Err(StreamError::Configuration(
                "ping_interval and pong_timeout must be non-zero".to_string(),
            ));
        }
        if self.health.failure_threshold == 0 {
            return Err(StreamError::Configuration(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.health.latency_samples == 0 || self.health.response_window == 0 {
            return Err(StreamError::Configuration(
                "latency_samples and response_window must be at least 1".to_string(),
            ));
        }
        if self.health.critical_latency <= self.health.low_latency {
            return Err(StreamError::Configuration(
                "critical_latency must exceed low_latency".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.health.min_response_rate) {
            return Err(StreamError::Configuration(format!(
                "min_response_rate must be within [0, 1], got {}",
                self.health.min_response_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(ClientConfig::default().validate(), Ok(()));
        assert_eq!(ClientConfig::default().overflow_policy, OverflowPolicy::RejectNew);
    }

    #[test]
    fn validate_rejects_bad_backoff_and_limits() {
        let cfg = ClientConfig::default().with_backoff(
            Duration::from_secs(5),
            Duration::from_secs(1),
            2.0,
        );
        assert!(matches!(cfg.validate(), Err(StreamError::Configuration(_))));

        let cfg = ClientConfig::default().with_backoff(
            Duration::from_secs(1),
            Duration::from_secs(5),
            f64::NAN,
        );
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig::default()
            .with_rate_limit(RateLimitConfig::new(Duration::from_secs(1), 10).with_burst_limit(5));
        assert!(cfg.validate().is_err());
    }
}
