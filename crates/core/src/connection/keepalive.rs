use std::time::Duration;

use tokio::time::Instant;

/// Recurring keepalive deadline for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    interval: Duration,
    next_fire: Instant,
}

impl Keepalive {
    pub fn start(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next_fire: now + interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_fire(&self) -> Instant {
        self.next_fire
    }

    /// Push the next fire time to `now + interval`, whatever it was before.
    pub fn reschedule(&mut self, now: Instant) {
        self.next_fire = now + self.interval;
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_fire
    }
}
