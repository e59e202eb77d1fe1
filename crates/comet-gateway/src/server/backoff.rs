//! Capped exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    attempt: u32,
}

impl Default for Backoff {
    /// Reconnect schedule: 100ms growing by 1.6x up to a minute, +-20%
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(60), 1.6, 0.2)
    }
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            base,
            max,
            factor,
            jitter,
            attempt: 0,
        }
    }

    /// Accept retry schedule: 5ms doubling up to one second
    #[must_use]
    pub fn accept() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1), 2.0, 0.0)
    }

    /// Delay for the given retry number, before jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay for the next retry
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + spread).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
