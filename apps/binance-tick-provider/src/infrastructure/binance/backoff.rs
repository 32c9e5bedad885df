//! Retry Backoff
//!
//! Exponential backoff with jitter for retrying transient REST failures.
//! An exchange-provided `Retry-After` takes precedence over the computed
//! delay for that attempt.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::RestSettings;

/// Retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Growth factor applied after each retry.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_retries: 3,
        }
    }
}

impl RetryConfig {
    /// Derive retry behavior from REST settings.
    #[must_use]
    pub fn from_rest_settings(settings: &RestSettings) -> Self {
        Self {
            initial_delay: settings.retry_delay_initial,
            max_delay: settings.retry_delay_max,
            max_retries: settings.max_retries,
            ..Self::default()
        }
    }
}

/// Tracks retries for one logical request.
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    current_delay: Duration,
    retries: u32,
}

impl RetryPolicy {
    /// Start a fresh policy.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            retries: 0,
        }
    }

    /// Delay before the next retry, or `None` once retries are exhausted.
    ///
    /// `retry_after` replaces the computed delay when the server sent one,
    /// still capped at the configured maximum.
    #[must_use]
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Option<Duration> {
        if self.retries >= self.config.max_retries {
            return None;
        }
        self.retries += 1;

        let delay = retry_after.map_or_else(
            || self.apply_jitter(self.current_delay),
            |server| server.min(self.config.max_delay),
        );

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay)
    }

    /// Retries used so far.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted = adjusted_millis as u64;
        Duration::from_millis(adjusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_retries: u32) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_retries,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut policy = RetryPolicy::new(no_jitter(5));
        assert_eq!(policy.next_delay(None), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(None), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(None), Some(Duration::from_millis(350)));
        assert_eq!(policy.next_delay(None), Some(Duration::from_millis(350)));
    }

    #[test]
    fn retries_are_bounded() {
        let mut policy = RetryPolicy::new(no_jitter(2));
        assert!(policy.next_delay(None).is_some());
        assert!(policy.next_delay(None).is_some());
        assert!(policy.next_delay(None).is_none());
        assert_eq!(policy.retries(), 2);
    }

    #[test]
    fn zero_retries_never_waits() {
        let mut policy = RetryPolicy::new(no_jitter(0));
        assert!(policy.next_delay(None).is_none());
    }

    #[test]
    fn retry_after_overrides_and_is_capped() {
        let mut policy = RetryPolicy::new(no_jitter(3));
        assert_eq!(
            policy.next_delay(Some(Duration::from_millis(250))),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            policy.next_delay(Some(Duration::from_secs(60))),
            Some(Duration::from_millis(350))
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let mut policy = RetryPolicy::new(RetryConfig {
                initial_delay: Duration::from_millis(1000),
                jitter_factor: 0.1,
                ..RetryConfig::default()
            });
            let millis = policy.next_delay(None).unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[test]
    fn settings_map_onto_config() {
        let settings = RestSettings {
            max_retries: 7,
            retry_delay_initial: Duration::from_millis(20),
            retry_delay_max: Duration::from_secs(2),
            ..RestSettings::default()
        };
        let config = RetryConfig::from_rest_settings(&settings);
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.initial_delay, Duration::from_millis(20));
        assert_eq!(config.max_delay, Duration::from_secs(2));
    }
}
