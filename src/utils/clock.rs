//! Clock abstractions for code that reasons about elapsed time (health
//! tracker backoffs, circuit breaker cooldowns, token bucket refills) without
//! being at the mercy of the wall clock in tests.

use std::time::Duration;

/// A manually-advanced clock for deterministic time-based tests.
#[derive(Debug, Clone, Copy)]
pub struct MockClock {
    now_secs: u64,
}

impl MockClock {
    #[must_use]
    pub fn new(start_secs: u64) -> Self {
        Self { now_secs: start_secs }
    }

    #[must_use]
    pub fn now(&self) -> u64 {
        self.now_secs
    }

    pub fn advance_secs(&mut self, secs: u64) {
        self.now_secs += secs;
    }

    /// `true` if at least `duration` has passed since `since`.
    #[must_use]
    pub fn has_elapsed(&self, since: u64, duration: Duration) -> bool {
        self.now_secs.saturating_sub(since) >= duration.as_secs()
    }
}

/// Formatting helpers shared by diagnostics, drop metadata, and logs.
pub mod time_utils {
    use chrono::{DateTime, Utc};

    /// Formats a Unix timestamp (seconds) as RFC 3339, falling back to the
    /// Unix epoch if the timestamp is out of chrono's representable range.
    #[must_use]
    pub fn format_timestamp(epoch_secs: i64) -> String {
        DateTime::<Utc>::from_timestamp(epoch_secs, 0)
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).expect("epoch is valid"))
            .to_rfc3339()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances() {
        let mut clock = MockClock::new(0);
        assert_eq!(clock.now(), 0);
        clock.advance_secs(5);
        assert_eq!(clock.now(), 5);
        assert!(clock.has_elapsed(0, Duration::from_secs(5)));
        assert!(!clock.has_elapsed(0, Duration::from_secs(6)));
    }
}
