use std::time::Duration;

use rand::Rng;

use crate::settings::SignalingConfig;

/// Exponential reconnect backoff with symmetric jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn from_config(config: &SignalingConfig) -> Self {
        Self::new(
            config.reconnect_base(),
            config.reconnect_cap(),
            config.reconnect_jitter,
        )
    }

    /// Delay before the next attempt, without jitter.
    pub fn nominal(&self) -> Duration {
        let factor = 1u32 << self.attempt.min(20);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let nominal = self.nominal();
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter <= f64::EPSILON {
            return nominal;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        nominal.mul_f64(factor)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
