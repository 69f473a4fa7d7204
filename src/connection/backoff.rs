//! Reconnect backoff schedule.

use std::time::Duration;

/// Default reconnect delays, in seconds.
pub const DEFAULT_RECONNECT_SCHEDULE_SECS: [u64; 7] = [0, 1, 2, 4, 7, 11, 16];

/// Walks a fixed ascending delay schedule, repeating the last entry forever.
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: Vec<Duration>,
    index: usize,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_RECONNECT_SCHEDULE_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }
}

impl Backoff {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule, index: 0 }
    }

    /// Delay before the next reconnect attempt. Advances the schedule,
    /// clamping the index at the last entry.
    pub fn next_delay(&mut self) -> Duration {
        let Some(last) = self.schedule.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let delay = self.schedule[self.index.min(last)];
        self.index = (self.index + 1).min(last);
        delay
    }

    /// Back to the start of the schedule (called on a successful open).
    pub fn reset(&mut self) {
        self.index = 0;
    }

    pub fn index(&self) -> usize {
        self.index
    }
}
