//! # Exponential Backoff
//!
//! Retry delays for failed reconciles, shared by the controllers' error
//! policies. Delays start small and double on every consecutive failure of
//! the same resource, so a transient hiccup retries almost immediately
//! while a persistently failing resource backs away to the order of
//! minutes.
//!
//! Sequence with the defaults: 5ms, 10ms, 20ms, 40ms, ... capped at 1000s.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Delay for the first retry.
const BASE_DELAY: Duration = Duration::from_millis(5);

/// Upper bound on the delay between retries.
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator
///
/// Each delay is double the previous one, capped at a maximum.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay handed out first (for reset)
    base: Duration,
    /// Delay handed out next
    current: Duration,
    /// Maximum delay
    max: Duration,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            current: base,
            max,
        }
    }

    /// Get the next delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Per-resource backoff state, keyed by `namespace/name`.
///
/// The error policy consults this on every failure; a successful reconcile
/// forgets the resource's history so the next failure starts small again.
#[derive(Debug, Default)]
pub struct BackoffTracker {
    states: Mutex<HashMap<String, ExponentialBackoff>>,
}

impl BackoffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next delay for the resource, advancing its sequence.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut states = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        states
            .entry(key.to_string())
            .or_insert_with(|| ExponentialBackoff::new(BASE_DELAY, MAX_DELAY))
            .next_backoff()
    }

    /// Forget the resource's error history after a successful reconcile.
    pub fn reset(&self, key: &str) {
        let mut states = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        states.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double() {
        let mut backoff = ExponentialBackoff::new(BASE_DELAY, MAX_DELAY);

        assert_eq!(backoff.next_backoff(), Duration::from_millis(5));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(10));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(20));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(40));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(80));
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(400), Duration::from_secs(1000));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(400));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(800));
        // next would be 1600s, capped at 1000s
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1000));
        // stays at max
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1000));
    }

    #[test]
    fn test_reset_restarts_the_sequence() {
        let mut backoff = ExponentialBackoff::new(BASE_DELAY, MAX_DELAY);

        assert_eq!(backoff.next_backoff(), Duration::from_millis(5));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(10));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(20));

        backoff.reset();

        assert_eq!(backoff.next_backoff(), Duration::from_millis(5));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(10));
    }

    #[test]
    fn test_tracker_keys_are_independent() {
        let tracker = BackoffTracker::new();

        assert_eq!(tracker.next_delay("ns/a"), Duration::from_millis(5));
        assert_eq!(tracker.next_delay("ns/a"), Duration::from_millis(10));
        assert_eq!(tracker.next_delay("ns/a"), Duration::from_millis(20));
        // a different resource starts from the beginning
        assert_eq!(tracker.next_delay("ns/b"), Duration::from_millis(5));

        tracker.reset("ns/a");
        assert_eq!(tracker.next_delay("ns/a"), Duration::from_millis(5));
        // resetting one key leaves the other advancing
        assert_eq!(tracker.next_delay("ns/b"), Duration::from_millis(10));
    }
}
