//! Exponential backoff for broker reconnection.
//!
//! Each failed connect doubles the delay up to a configured cap; any
//! successful establishment resets the schedule to the initial interval.
//! The tunnel never gives up: a broker outage of any length just keeps
//! the loop at the capped interval.

use std::time::Duration;

/// Backoff controller. Not shared: owned by the connection kernel.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            current: initial,
            max,
            attempt: 0,
        }
    }

    /// Returns the delay before the next attempt and advances the
    /// schedule: the following delay is doubled, capped at the maximum.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to the initial interval. Call on every successful
    /// establishment.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    /// Failed attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
