//! Bounded exponential reconnection backoff

use std::time::Duration;

use crate::config::ReconnectSection;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
    /// Delay handed out before the current connection attempt
    last: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
            last: initial,
        }
    }

    pub fn from_config(reconnect: &ReconnectSection) -> Self {
        Self::new(
            Duration::from_millis(reconnect.initial_delay_ms),
            Duration::from_millis(reconnect.max_delay_ms),
        )
    }

    /// Delay before the next attempt: initial, then doubling up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.last = delay;
        self.next = std::cmp::min(delay.saturating_mul(2), self.max);
        delay
    }

    /// Record how long an established connection lasted. A connection that
    /// outlived the delay preceding it resets the sequence.
    pub fn connection_ended(&mut self, uptime: Duration) -> bool {
        if uptime > self.last {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
        self.last = self.initial;
    }
}
