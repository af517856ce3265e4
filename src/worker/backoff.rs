use std::time::Duration;

use rand::Rng;

/// Delay between reconnect attempts.
///
/// Attempt `n` waits `first × factor^n`, capped at `max`. With jitter the
/// delay is drawn uniformly from the upper half of that base, so it never
/// exceeds the cap.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl ReconnectBackoff {
    /// 1s doubling up to `max`, jittered.
    pub fn new(max: Duration) -> Self {
        Self {
            first: Duration::from_secs(1),
            max,
            factor: 2.0,
            jitter: true,
        }
    }

    /// Base delay for `attempt` (0-indexed), before jitter.
    pub fn base(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let base_ms = base.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(base_ms / 2..=base_ms);
        Duration::from_millis(ms)
    }
}
