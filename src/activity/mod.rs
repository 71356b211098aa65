//! Activity runtime: a named, retryable, timed, cancellable unit of work.
//!
//! Generalizes [`crate::node::NodeContext`]'s role (the thing a stage calls
//! out through) with retry/backoff machinery callers would otherwise have to
//! hand-roll: exponential backoff with jitter via
//! [`crate::utils::deterministic_rng::DeterministicRng`], a start-to-close
//! timeout via `tokio::time::timeout`, and a transient/permanent error split
//! so permanent errors (e.g. `InvalidRequest`) never get retried.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::instrument;

use crate::utils::deterministic_rng::DeterministicRng;

/// Retry policy for one activity invocation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(200),
            backoff_coefficient: 2.0,
            max_interval: Some(Duration::from_secs(10)),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Interval before the `attempt`-th retry (1-indexed: the delay before
    /// the *second* attempt is `delay_for(1)`), with jitter in `[0.5, 1.5)x`
    /// applied via a per-call deterministic RNG seeded from the attempt
    /// number and a caller-supplied salt, so replays of the same activity
    /// name/attempt sequence produce the same jittered delay.
    fn delay_for(&self, attempt: u32, jitter_seed: u64) -> Duration {
        let exp = self.backoff_coefficient.powi(attempt.saturating_sub(1) as i32);
        let base_ms = (self.initial_interval.as_millis() as f64 * exp) as u64;
        let capped_ms = match self.max_interval {
            Some(max) => base_ms.min(max.as_millis() as u64),
            None => base_ms,
        };
        let mut rng = DeterministicRng::new(jitter_seed ^ u64::from(attempt));
        let jitter_permille = 500 + rng.random_below(1000); // [500, 1500)
        Duration::from_millis(capped_ms.saturating_mul(jitter_permille) / 1000)
    }
}

/// Options for one `execute_activity` call.
#[derive(Clone, Debug)]
pub struct ActivityOptions {
    pub name: String,
    pub start_to_close_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// An attempt id an idempotent-unaware collaborator can use for
    /// deduplication.
    pub attempt_id: String,
}

impl ActivityOptions {
    #[must_use]
    pub fn new(name: impl Into<String>, timeout: Duration, retry_policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            start_to_close_timeout: timeout,
            retry_policy,
            attempt_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Errors surfaced by the activity runtime.
#[derive(Debug, Error)]
pub enum ActivityError {
    /// A transient failure (transport error, 5xx, rate limit) that the
    /// runtime retries per the activity's [`RetryPolicy`].
    #[error("activity '{name}' transient failure: {message}")]
    Transient { name: String, message: String },

    /// A permanent failure (e.g. `InvalidRequest`) — never retried.
    #[error("activity '{name}' permanent failure: {message}")]
    Permanent { name: String, message: String },

    /// The activity's start-to-close timeout elapsed on every attempt.
    #[error("activity '{name}' timed out after {attempts} attempt(s)")]
    TimedOut { name: String, attempts: u32 },

    /// Retries were exhausted without success.
    #[error("activity '{name}' exhausted {attempts} attempt(s): {last}")]
    Exhausted {
        name: String,
        attempts: u32,
        last: Box<ActivityError>,
    },
}

impl ActivityError {
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, ActivityError::Permanent { .. })
    }
}

/// A result an activity closure can return: `Ok` on success, or an error
/// tagged transient/permanent so the runtime knows whether to retry.
pub type ActivityOutcome<T> = Result<T, ActivityError>;

/// Runs `f` under the given [`ActivityOptions`]: each attempt is bounded by
/// the start-to-close timeout; transient failures are retried with
/// exponential backoff and jitter up to `max_attempts`; permanent failures
/// and timeouts on every attempt surface immediately as the terminal error.
#[instrument(skip(options, f), fields(activity = %options.name, attempt_id = %options.attempt_id))]
pub async fn execute_activity<T, F, Fut>(options: &ActivityOptions, mut f: F) -> ActivityOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ActivityOutcome<T>>,
{
    let jitter_seed = seed_from_name(&options.name, &options.attempt_id);
    let mut last_err: Option<ActivityError> = None;
    let started = tokio::time::Instant::now();

    for attempt in 1..=options.retry_policy.max_attempts.max(1) {
        let attempt_result = tokio::time::timeout(options.start_to_close_timeout, f()).await;

        match attempt_result {
            Ok(Ok(value)) => {
                record_outcome(&options.name, "success", started.elapsed());
                return Ok(value);
            }
            Ok(Err(err)) if err.is_permanent() => {
                tracing::warn!(activity = %options.name, %err, "activity failed permanently");
                record_outcome(&options.name, "permanent_failure", started.elapsed());
                return Err(err);
            }
            Ok(Err(err)) => {
                tracing::warn!(activity = %options.name, attempt, %err, "activity attempt failed transiently");
                last_err = Some(err);
            }
            Err(_elapsed) => {
                tracing::warn!(activity = %options.name, attempt, "activity attempt timed out");
                last_err = Some(ActivityError::TimedOut {
                    name: options.name.clone(),
                    attempts: attempt,
                });
            }
        }

        if attempt < options.retry_policy.max_attempts {
            let delay = options.retry_policy.delay_for(attempt, jitter_seed);
            tokio::time::sleep(delay).await;
        }
    }

    record_outcome(&options.name, "exhausted", started.elapsed());
    Err(ActivityError::Exhausted {
        name: options.name.clone(),
        attempts: options.retry_policy.max_attempts,
        last: Box::new(last_err.unwrap_or_else(|| ActivityError::Transient {
            name: options.name.clone(),
            message: "no attempts executed".to_string(),
        })),
    })
}

/// Emits the stage-success/failure counter and stage-duration histogram
/// spec.md §4.9 asks for, tagged by activity (stage) name and outcome.
fn record_outcome(activity: &str, outcome: &str, elapsed: Duration) {
    metrics::counter!(
        "weavegraph_activity_result_total",
        "activity" => activity.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    metrics::histogram!("weavegraph_activity_duration_ms", "activity" => activity.to_string())
        .record(elapsed.as_secs_f64() * 1000.0);
}

fn seed_from_name(name: &str, attempt_id: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    name.hash(&mut hasher);
    attempt_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_retry() {
        let calls = AtomicU32::new(0);
        let options = ActivityOptions::new(
            "test-activity",
            Duration::from_millis(50),
            RetryPolicy::default().with_max_attempts(3),
        );
        let result = execute_activity(&options, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ActivityError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let options = ActivityOptions::new(
            "flaky",
            Duration::from_millis(50),
            RetryPolicy {
                max_attempts: 3,
                initial_interval: Duration::from_millis(1),
                backoff_coefficient: 1.0,
                max_interval: None,
            },
        );
        let result = execute_activity(&options, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ActivityError::Transient {
                        name: "flaky".into(),
                        message: "not yet".into(),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_never_retried() {
        let calls = AtomicU32::new(0);
        let options = ActivityOptions::new(
            "bad-input",
            Duration::from_millis(50),
            RetryPolicy::default(),
        );
        let result: ActivityOutcome<()> = execute_activity(&options, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ActivityError::Permanent {
                    name: "bad-input".into(),
                    message: "empty prompt".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_counts_as_a_retryable_attempt() {
        let options = ActivityOptions::new(
            "slow",
            Duration::from_millis(5),
            RetryPolicy {
                max_attempts: 2,
                initial_interval: Duration::from_millis(1),
                backoff_coefficient: 1.0,
                max_interval: None,
            },
        );
        let result: ActivityOutcome<()> = execute_activity(&options, || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(ActivityError::Exhausted { .. })));
    }
}
