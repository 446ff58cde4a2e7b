//! Exponential backoff for short connect-retry loops.

use std::time::Duration;

/// Doubling delay sequence, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    /// Returns the delay to sleep now and advances the sequence.
    ///
    /// The returned delay never exceeds `remaining`, so a caller bounded by a
    /// deadline wakes up no later than that deadline.
    pub fn next_delay(&mut self, remaining: Duration) -> Duration {
        let delay = self.current.min(remaining);
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(2))
    }
}
