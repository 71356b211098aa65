//! Health and quota guards: per-provider rate limiter, token bucket, and
//! health tracker.
//!
//! Each guard is a small object behind its own lock, the same
//! per-resource-mutex idiom [`crate::event_bus::bus::EventBus`] uses — one
//! giant lock across all providers would serialize unrelated providers.

use std::time::Duration;

use parking_lot::Mutex;

/// Non-blocking/blocking-with-deadline rate limiter: `N` requests per
/// rolling window.
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    inner: Mutex<RateLimiterState>,
}

struct RateLimiterState {
    window_start_secs: u64,
    count_in_window: u32,
}

impl RateLimiter {
    #[must_use]
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            inner: Mutex::new(RateLimiterState {
                window_start_secs: 0,
                count_in_window: 0,
            }),
        }
    }

    /// Non-blocking check: does this provider have capacity right now, as of
    /// `now_secs`? Rolls the window forward if it has elapsed.
    pub fn allow(&self, now_secs: u64) -> bool {
        let mut state = self.inner.lock();
        if now_secs.saturating_sub(state.window_start_secs) >= self.window.as_secs() {
            state.window_start_secs = now_secs;
            state.count_in_window = 0;
        }
        if state.count_in_window < self.max_per_window {
            state.count_in_window += 1;
            true
        } else {
            false
        }
    }

    /// Non-mutating peek: would `allow` succeed right now, without consuming
    /// a window slot? Used by eligibility checks that must not deplete quota
    /// for a candidate that ends up never being dispatched to.
    #[must_use]
    pub fn would_allow(&self, now_secs: u64) -> bool {
        let state = self.inner.lock();
        let count_in_window = if now_secs.saturating_sub(state.window_start_secs) >= self.window.as_secs() {
            0
        } else {
            state.count_in_window
        };
        count_in_window < self.max_per_window
    }

    /// Blocking-with-deadline variant: polls `allow` until it succeeds or
    /// `deadline_secs` passes, sleeping in small increments.
    pub async fn wait(&self, clock_now: impl Fn() -> u64, deadline_secs: u64) -> Result<(), ()> {
        loop {
            let now = clock_now();
            if self.allow(now) {
                return Ok(());
            }
            if now >= deadline_secs {
                return Err(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Token bucket quota: tokens refill at
/// `floor(elapsed / period)`, capped at `capacity`; `take` either consumes
/// atomically or returns `false` without side effects.
pub struct TokenBucket {
    capacity: u64,
    refill_period: Duration,
    inner: Mutex<TokenBucketState>,
}

struct TokenBucketState {
    tokens: u64,
    last_refill_secs: u64,
}

impl TokenBucket {
    #[must_use]
    pub fn new(capacity: u64, refill_period: Duration) -> Self {
        Self {
            capacity,
            refill_period,
            inner: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill_secs: 0,
            }),
        }
    }

    fn refill_locked(&self, state: &mut TokenBucketState, now_secs: u64) {
        let period_secs = self.refill_period.as_secs().max(1);
        let elapsed = now_secs.saturating_sub(state.last_refill_secs);
        let periods = elapsed / period_secs;
        if periods > 0 {
            state.tokens = state.tokens.saturating_add(periods).min(self.capacity);
            state.last_refill_secs = state.last_refill_secs.saturating_add(periods * period_secs);
        }
    }

    /// Attempts to consume `n` tokens atomically. Returns `false` (and
    /// leaves the bucket untouched) if `n` exceeds capacity or the current
    /// balance — a rejected take never consumes tokens.
    pub fn take(&self, n: u64, now_secs: u64) -> bool {
        if n > self.capacity {
            return false;
        }
        let mut state = self.inner.lock();
        self.refill_locked(&mut state, now_secs);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn current_tokens(&self, now_secs: u64) -> u64 {
        let mut state = self.inner.lock();
        self.refill_locked(&mut state, now_secs);
        state.tokens
    }
}

/// Consecutive-failure health tracker with exponential backoff.
pub struct HealthTracker {
    inner: Mutex<HealthState>,
}

#[derive(Clone, Copy, Debug)]
struct HealthState {
    consecutive_failures: u32,
    healthy: bool,
    backoff_until_secs: u64,
    last_check_secs: u64,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HealthState {
                consecutive_failures: 0,
                healthy: true,
                backoff_until_secs: 0,
                last_check_secs: 0,
            }),
        }
    }

    /// At `failures >= 3`, `healthy` becomes false and
    /// `backoff_until = now + 2^min(failures-3, 6)` seconds.
    pub fn record_failure(&self, now_secs: u64) {
        let mut state = self.inner.lock();
        state.consecutive_failures += 1;
        state.last_check_secs = now_secs;
        if state.consecutive_failures >= 3 {
            state.healthy = false;
            let exponent = (state.consecutive_failures - 3).min(6);
            let backoff_secs = 1u64 << exponent;
            state.backoff_until_secs = now_secs + backoff_secs;
        }
    }

    pub fn record_success(&self, now_secs: u64) {
        let mut state = self.inner.lock();
        state.consecutive_failures = 0;
        state.healthy = true;
        state.backoff_until_secs = 0;
        state.last_check_secs = now_secs;
    }

    /// A check past `backoff_until` resets the tracker to healthy
    ///.
    pub fn is_healthy(&self, now_secs: u64) -> bool {
        let mut state = self.inner.lock();
        if !state.healthy && now_secs >= state.backoff_until_secs {
            state.healthy = true;
            state.consecutive_failures = 0;
            state.backoff_until_secs = 0;
        }
        state.healthy
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_stays_within_bounds() {
        let bucket = TokenBucket::new(100, Duration::from_secs(60));
        assert!(bucket.take(50, 0));
        assert_eq!(bucket.current_tokens(0), 50);
        assert!(!bucket.take(60, 0));
        assert_eq!(bucket.current_tokens(0), 50, "rejected take must not consume");
        assert!(bucket.take(50, 0));
        assert_eq!(bucket.current_tokens(0), 0);
    }

    #[test]
    fn token_bucket_refills_by_elapsed_periods_capped_at_capacity() {
        let bucket = TokenBucket::new(10, Duration::from_secs(1));
        assert!(bucket.take(10, 0));
        assert_eq!(bucket.current_tokens(0), 0);
        assert_eq!(bucket.current_tokens(3), 3);
        assert_eq!(bucket.current_tokens(100), 10, "must cap at capacity");
    }

    #[test]
    fn token_bucket_rejects_n_over_capacity() {
        let bucket = TokenBucket::new(5, Duration::from_secs(1));
        assert!(!bucket.take(6, 0));
        assert_eq!(bucket.current_tokens(0), 5);
    }

    #[test]
    fn rate_limiter_resets_each_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        assert!(limiter.allow(0));
        assert!(limiter.allow(0));
        assert!(!limiter.allow(0));
        assert!(limiter.allow(11), "new window should reset the count");
    }

    #[test]
    fn rate_limiter_would_allow_does_not_consume() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        assert!(limiter.would_allow(0));
        assert!(limiter.would_allow(0), "peeking must not consume the slot");
        assert!(limiter.allow(0));
        assert!(!limiter.would_allow(0));
        assert!(limiter.would_allow(11), "new window should be visible to a peek too");
    }

    #[test]
    fn health_tracker_trips_after_three_failures() {
        let tracker = HealthTracker::new();
        assert!(tracker.is_healthy(0));
        tracker.record_failure(0);
        tracker.record_failure(0);
        assert!(tracker.is_healthy(0), "only unhealthy at >= 3 failures");
        tracker.record_failure(0);
        assert!(!tracker.is_healthy(0));
    }

    #[test]
    fn health_tracker_auto_heals_past_backoff() {
        let tracker = HealthTracker::new();
        tracker.record_failure(0);
        tracker.record_failure(0);
        tracker.record_failure(0); // backoff_until = 0 + 2^0 = 1
        assert!(!tracker.is_healthy(0));
        assert!(tracker.is_healthy(1));
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn health_tracker_success_clears_failures() {
        let tracker = HealthTracker::new();
        tracker.record_failure(0);
        tracker.record_failure(0);
        tracker.record_success(0);
        assert!(tracker.is_healthy(0));
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn health_tracker_backoff_grows_exponentially_and_caps() {
        let tracker = HealthTracker::new();
        for _ in 0..9 {
            tracker.record_failure(0);
        }
        // failures=9 -> exponent = min(9-3,6) = 6 -> 64s backoff
        assert!(!tracker.is_healthy(63));
        assert!(tracker.is_healthy(64));
    }
}
