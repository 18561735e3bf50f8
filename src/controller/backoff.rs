//! # Fibonacci Backoff
//!
//! Retry intervals that grow along the Fibonacci sequence, scaled by a minimum
//! and capped at a maximum. The sequence with `min = 5` is 5s, 5s, 10s, 15s,
//! 25s, 40s and so on up to `max`.

#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_secs: u64,
    max_secs: u64,
    previous: u64,
    current: u64,
}

impl FibonacciBackoff {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        let min_secs = min_secs.max(1);
        Self {
            min_secs,
            max_secs: max_secs.max(min_secs),
            previous: 0,
            current: 1,
        }
    }

    /// Next interval in seconds; advances the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let value = self.current.saturating_mul(self.min_secs).min(self.max_secs);
        if value < self.max_secs {
            let next = self.previous.saturating_add(self.current);
            self.previous = self.current;
            self.current = next;
        }
        value
    }
}
