//! Exponential backoff with jitter.
//!
//! Shared by the reconcile queue (transient-error requeues) and the
//! notification dispatcher (delivery retries).

use std::time::Duration;

use rand::Rng;

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    /// Delay for the first retry.
    pub initial: Duration,
    /// Ceiling on the computed delay.
    pub max: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter fraction in `0.0..=1.0`; the final delay is scaled by a
    /// random factor in `1 ± jitter`.
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl ExponentialBackoff {
    /// Delay for a 1-based attempt number, without jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = self.initial.as_secs_f64() * exp;
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Delay for a 1-based attempt number, with jitter applied.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_secs_f64((base.as_secs_f64() * factor).min(self.max.as_secs_f64()))
    }
}
