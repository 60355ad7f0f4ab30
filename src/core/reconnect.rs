use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

use super::config::ClientConfig;

/// Reconnect delay policy consulted when the machine enters `Reconnecting`.
pub trait ReconnectStrategy: Send + 'static {
    /// Delay before reconnect attempt number `attempt`, counted from 1.
    fn delay(&mut self, attempt: u32) -> Duration;
    fn should_retry(&self) -> bool;
}

/// Exponential backoff with bounded additive jitter:
/// `min(initial * multiplier^n, max) + U[0, jitter_max]`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter_max: Duration,
    rng: SmallRng,
    retry: bool,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            2.0
        };
        Self {
            initial,
            max,
            multiplier,
            jitter_max: Duration::ZERO,
            rng: SmallRng::from_entropy(),
            retry: true,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        let backoff = Self::new(
            config.initial_retry_delay,
            config.max_retry_delay,
            config.backoff_multiplier,
        );
        let backoff = backoff.with_jitter(config.jitter_max);
        match config.jitter_seed {
            Some(seed) => backoff.with_seed(seed),
            None => backoff,
        }
    }

    pub fn with_jitter(mut self, jitter_max: Duration) -> Self {
        self.jitter_max = jitter_max;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Stop scheduling retries; the machine reports `MaxRetries` instead.
    pub fn abort(mut self) -> Self {
        self.retry = false;
        self
    }

    /// Deterministic part of the schedule.
    pub fn base_delay(&self, n: u32) -> Duration {
        let exponent = i32::try_from(n).unwrap_or(i32::MAX);
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped)
        } else {
            self.max
        }
    }

    fn jitter(&mut self) -> Duration {
        if self.jitter_max.is_zero() {
            return Duration::ZERO;
        }
        let nanos = self.jitter_max.as_nanos().min(u64::MAX as u128) as u64;
        Duration::from_nanos(self.rng.gen_range(0..=nanos))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl ReconnectStrategy for ExponentialBackoff {
    fn delay(&mut self, attempt: u32) -> Duration {
        self.base_delay(attempt) + self.jitter()
    }

    fn should_retry(&self) -> bool {
        self.retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_capped_at_max() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(1000),
            Duration::from_millis(30_000),
            2.0,
        );
        assert_eq!(backoff.base_delay(0), Duration::from_millis(1000));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(8000));
        // 1000 * 2^5 = 32000, capped.
        assert_eq!(backoff.base_delay(5), Duration::from_millis(30_000));
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let jitter_max = Duration::from_millis(250);
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(1000),
            Duration::from_millis(30_000),
            2.0,
        )
        .with_jitter(jitter_max)
        .with_seed(7);

        for _ in 0..200 {
            let delay = backoff.delay(5);
            assert!(delay >= Duration::from_millis(30_000));
            assert!(delay <= Duration::from_millis(30_000) + jitter_max);
        }
    }

    #[test]
    fn seeded_jitter_is_reproducible() {
        let make = || {
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5), 2.0)
                .with_jitter(Duration::from_millis(100))
                .with_seed(42)
        };
        let (mut a, mut b) = (make(), make());
        for n in 0..10 {
            assert_eq!(a.delay(n), b.delay(n));
        }
    }

    #[test]
    fn abort_disables_retries() {
        assert!(ExponentialBackoff::default().should_retry());
        assert!(!ExponentialBackoff::default().abort().should_retry());
    }
}
