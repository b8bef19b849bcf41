//! Exponential backoff with jitter for connect and reconnect loops

use rand::Rng;
use std::time::Duration;

use super::errors::{ExchangeError, ExchangeResult};

/// How randomness is applied on top of the exponential delay
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Jitter {
    None,
    /// Multiplies the delay by a factor drawn from `[1 - f, 1 + f]`
    Proportional(f64),
    /// Adds a delay drawn from `[0, d]`
    Additive(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: Jitter,
}

impl BackoffPolicy {
    pub fn validate(&self) -> ExchangeResult<()> {
        let invalid = |details: &str| {
            Err(ExchangeError::InvalidConfig {
                details: details.to_string(),
            })
        };

        if self.initial_delay.is_zero() {
            return invalid("initial backoff delay must be > 0");
        }
        if self.max_delay < self.initial_delay {
            return invalid("max backoff delay must be >= initial delay");
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return invalid("backoff factor must be >= 1.0");
        }
        if let Jitter::Proportional(f) = self.jitter {
            if !f.is_finite() || !(0.0..1.0).contains(&f) {
                return invalid("proportional jitter must be in [0.0, 1.0)");
            }
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exponent = self.factor.powi(attempt.min(64) as i32);
        Duration::from_secs_f64((initial * exponent).min(max))
    }

    /// Delay before retry number `attempt` (0-based), jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        match self.jitter {
            Jitter::None => base,
            Jitter::Proportional(f) if f > 0.0 => {
                let factor = rand::thread_rng().gen_range((1.0 - f)..=(1.0 + f));
                base.mul_f64(factor)
            }
            Jitter::Proportional(_) => base,
            Jitter::Additive(extra) if !extra.is_zero() => {
                let extra = rand::thread_rng().gen_range(0.0..=extra.as_secs_f64());
                base + Duration::from_secs_f64(extra)
            }
            Jitter::Additive(_) => base,
        }
    }

    /// The computed delay, never shorter than a server-provided retry-after hint.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.delay(attempt);
        match retry_after {
            Some(hint) => computed.max(hint),
            None => computed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: Jitter) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let p = policy(Jitter::None);
        assert_eq!(p.delay(0), Duration::from_millis(500));
        assert_eq!(p.delay(1), Duration::from_secs(1));
        assert_eq!(p.delay(3), Duration::from_secs(4));
        assert_eq!(p.delay(10), Duration::from_secs(30));
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_proportional_jitter_bounds() {
        let p = policy(Jitter::Proportional(0.2));
        for _ in 0..200 {
            let d = p.delay(2);
            assert!(d >= Duration::from_millis(1599), "{d:?}");
            assert!(d <= Duration::from_millis(2401), "{d:?}");
        }
    }

    #[test]
    fn test_additive_jitter_bounds() {
        let p = BackoffPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            factor: 2.0,
            jitter: Jitter::Additive(Duration::from_millis(500)),
        };
        for _ in 0..200 {
            let d = p.delay(5);
            assert!(d >= Duration::from_secs(8));
            assert!(d <= Duration::from_millis(8501));
        }
    }

    #[test]
    fn test_retry_after_hint_is_a_floor() {
        let p = policy(Jitter::Proportional(0.2));
        assert_eq!(
            p.delay_with_hint(0, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );

        // A short hint does not cut the exponential delay
        for _ in 0..50 {
            let d = p.delay_with_hint(2, Some(Duration::from_millis(10)));
            assert!(d >= Duration::from_millis(1599), "{d:?}");
        }
        assert_eq!(
            policy(Jitter::None).delay_with_hint(1, None),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_validate() {
        assert!(policy(Jitter::None).validate().is_ok());
        assert!(policy(Jitter::Proportional(1.5)).validate().is_err());

        let mut p = policy(Jitter::None);
        p.max_delay = Duration::from_millis(100);
        assert!(p.validate().is_err());
    }
}
