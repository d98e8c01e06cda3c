//! # Exponential Backoff
//!
//! Per-item exponential backoff for failed reconciliations.
//!
//! The delay after the n-th consecutive failure of an item is `base * 2^n`,
//! capped at `max`. The defaults (5ms base, 1000s cap) let a flapping target
//! retry quickly at first and settle at one attempt every ~16 minutes.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Default delay for the first retry
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default cap on the retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` and never exceeding `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the first retry
    #[must_use]
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Upper bound on any delay
    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay to wait after `failures` previous consecutive failures
    ///
    /// Returns `base` for 0, `2 * base` for 1, and so on, capped at `max`.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// Tracks consecutive failures per item and turns them into delays
#[derive(Debug, Clone)]
pub struct ItemBackoff<T> {
    backoff: ExponentialBackoff,
    failures: HashMap<T, u32>,
}

impl<T: Eq + Hash + Clone> ItemBackoff<T> {
    /// Create an empty tracker using `backoff`
    #[must_use]
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            backoff,
            failures: HashMap::new(),
        }
    }

    /// Record one more failure of `item` and return the delay before its retry
    pub fn next_delay(&mut self, item: &T) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let delay = self.backoff.delay_for(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Reset the failure count of `item`
    pub fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }

    /// Number of consecutive failures recorded for `item`
    #[must_use]
    pub fn failures(&self, item: &T) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));

        assert_eq!(backoff.delay_for(0), Duration::from_millis(5));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(20));
        assert_eq!(backoff.delay_for(10), Duration::from_millis(5120));
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let backoff = ExponentialBackoff::default();

        // 5ms * 2^18 = 1310.72s, above the 1000s cap
        assert_eq!(backoff.delay_for(18), DEFAULT_MAX_DELAY);
        // 2^40 overflows u32 and must still cap instead of wrapping
        assert_eq!(backoff.delay_for(40), DEFAULT_MAX_DELAY);
        assert_eq!(backoff.delay_for(u32::MAX), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn test_item_backoff_is_per_item_and_resets() {
        let mut backoff = ItemBackoff::new(ExponentialBackoff::default());
        let europe = "europe".to_string();
        let asia = "asia".to_string();

        assert_eq!(backoff.next_delay(&europe), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(&europe), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(&europe), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(&asia), Duration::from_millis(5));
        assert_eq!(backoff.failures(&europe), 3);

        backoff.forget(&europe);

        // Should restart from the base delay after success
        assert_eq!(backoff.failures(&europe), 0);
        assert_eq!(backoff.next_delay(&europe), Duration::from_millis(5));
        assert_eq!(backoff.failures(&asia), 1);
    }
}
