//! Reconnect delay strategies for the firehose loop.

use std::time::Duration;

use rand::Rng;

/// How long to wait between firehose reconnect attempts.
pub trait Backoff: Send + Sync {
    /// Delay before reconnect attempt `attempt` (0 for the first retry).
    fn delay(&self, attempt: u32) -> Duration;
}

/// The same delay before every attempt, optionally plus random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    delay: Duration,
    jitter: Duration,
}

impl FixedBackoff {
    /// Create a new backoff waiting `delay` before every attempt.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    /// Retry without waiting. Intended for tests.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Add up to `jitter` of random extra delay per attempt.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Backoff for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let max = self.jitter.as_millis().min(u128::from(u64::MAX)) as u64;
        self.delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}
