//! Retry cadences.
//!
//! The socket transport reconnects on a linear schedule; operations that
//! hit SESSION_LOST or NEED_TO_LOGIN back off exponentially with jitter.

use std::time::Duration;

use rand::RngExt;

/// Delay before socket retry number `attempt` (1-based): `interval * attempt`.
pub fn linear_delay(interval: Duration, attempt: u32) -> Duration {
    interval.saturating_mul(attempt)
}

/// Exponential backoff settings for operation retries.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BackoffConfig {
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) factor: f64,
    pub(crate) jitter: f64,
}

impl BackoffConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("Initial retry delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("Max retry delay must be >= initial retry delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

/// Delay before the retry following zero-based `attempt`.
pub(crate) fn calculate_backoff(config: BackoffConfig, attempt: u32) -> Duration {
    let initial = config.initial_delay.as_secs_f64();
    let max = config.max_delay.as_secs_f64();
    let exponent = config.factor.powf(f64::from(attempt));
    let base = (initial * exponent).min(max);

    if config.jitter == 0.0 {
        return Duration::from_secs_f64(base);
    }

    let mut rng = rand::rng();
    let randomized = rng.random_range(0.0..=base);
    let blended = base * (1.0 - config.jitter) + randomized * config.jitter;
    Duration::from_secs_f64(blended)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_delay_grows_with_attempt() {
        let interval = Duration::from_millis(2000);
        assert_eq!(linear_delay(interval, 1), Duration::from_secs(2));
        assert_eq!(linear_delay(interval, 3), Duration::from_secs(6));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            factor: 2.0,
            jitter: 0.0,
        };
        assert_eq!(calculate_backoff(config, 0), Duration::from_millis(100));
        assert_eq!(calculate_backoff(config, 1), Duration::from_millis(200));
        assert_eq!(calculate_backoff(config, 10), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_within_base() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.5,
        };
        for _ in 0..100 {
            let delay = calculate_backoff(config, 1);
            assert!(delay >= Duration::from_millis(99));
            assert!(delay <= Duration::from_millis(201));
        }
    }
}
