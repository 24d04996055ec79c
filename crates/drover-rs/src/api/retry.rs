//! Exponential backoff with deterministic jitter.
//!
//! One [`RetryConfig`] serves three consumers: the work queue (requeue delay
//! after a failed attempt), the feedback loop (pause between ACT retries),
//! and resource-contention requeues (jittered so contending loops don't
//! stampede the same resource in lockstep).

use std::time::Duration;

/// Configuration for backoff behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (2.0 gives `base * 2^attempt`).
    pub multiplier: f64,
    /// Whether to apply jitter to spread contending retries.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// A config with the given base delay and defaults elsewhere.
    pub fn with_base(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Default::default()
        }
    }

    /// Enable jitter.
    pub fn jittered(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay for a given attempt number (0-indexed): `base * multiplier^attempt`,
    /// capped at `max_delay`.
    ///
    /// Jitter is deterministic, keyed on the attempt number — the engine
    /// avoids a random source so replayed schedules stay reproducible, and a
    /// fixed spread table is enough to keep contending loops out of lockstep.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());

        if self.jitter {
            let factor = match attempt % 4 {
                0 => 0.70,
                1 => 0.95,
                2 => 0.55,
                _ => 0.85,
            };
            Duration::from_secs_f64(capped * factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}
