//! # Fibonacci Backoff
//!
//! Progressive retry delays that grow more slowly than exponential backoff.
//!
//! Used for Pod events whose endpoint lookup failed and for lease election
//! attempts that keep erroring while this replica is not the holder.
//! Sequence with `min = 1s, max = 30s`: 1s, 1s, 2s, 3s, 5s, 8s, 13s, 21s, 30s (max).

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff value in seconds (for reset)
    min_seconds: u64,
    /// Previous backoff value in seconds
    prev_seconds: u64,
    /// Current backoff value in seconds
    current_seconds: u64,
    /// Maximum backoff value in seconds
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with specified minimum and maximum values in seconds
    ///
    /// # Arguments
    ///
    /// * `min_seconds` - Minimum backoff duration (used for the first two values, typically 1)
    /// * `max_seconds` - Maximum backoff duration (caps the sequence)
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_seconds;

        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        result
    }

    /// Get the next backoff duration as a `Duration` and advance the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }

    /// Calculate the Fibonacci backoff duration for a given error count (stateless)
    ///
    /// The sequence starts at `min_seconds` for error_count 0 and 1, then follows
    /// min, min, min*2, min*3, min*5, min*8, etc., capped at `max_seconds`.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, min_seconds: u64, max_seconds: u64) -> Duration {
        if error_count <= 1 {
            return Duration::from_secs(min_seconds);
        }

        let mut prev = min_seconds;
        let mut current = min_seconds;
        for _ in 2..=error_count {
            let next = prev + current;
            prev = current;
            current = std::cmp::min(next, max_seconds);

            if current >= max_seconds {
                break;
            }
        }

        Duration::from_secs(current)
    }
}
