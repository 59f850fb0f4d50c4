//! Wall-Clock Port
//!
//! The cache and the session registry measure staleness and idle time
//! against an injected clock so expiry can be driven deterministically.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock reference.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use market_fanout::domain::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(301));
/// assert_eq!((clock.now() - start).num_seconds(), 301);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Create a clock frozen at the current system time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a clock frozen at `start`.
    #[must_use]
    pub const fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.write();
        *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// True iff strictly more than `window` has elapsed between `since` and `now`.
///
/// A `since` in the future counts as zero age.
#[must_use]
pub fn age_exceeds(now: DateTime<Utc>, since: DateTime<Utc>, window: Duration) -> bool {
    (now - since).to_std().is_ok_and(|age| age > window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.advance(Duration::from_millis(1500));

        assert_eq!((clock.now() - start).num_milliseconds(), 1500);
    }

    #[test]
    fn age_exceeds_is_strict() {
        let clock = ManualClock::new();
        let since = clock.now();

        clock.advance(Duration::from_secs(300));
        assert!(!age_exceeds(clock.now(), since, Duration::from_secs(300)));

        clock.advance(Duration::from_millis(1));
        assert!(age_exceeds(clock.now(), since, Duration::from_secs(300)));
    }

    #[test]
    fn future_timestamp_is_not_aged() {
        let clock = ManualClock::new();
        let now = clock.now();
        clock.advance(Duration::from_secs(10));

        assert!(!age_exceeds(now, clock.now(), Duration::ZERO));
    }
}
