//! Multi-provider selection and execution with automatic fallback.
//!
//! The router never talks to a backend directly; it asks the registry which
//! entries are eligible, picks one deterministically, and delegates to that
//! entry's circuit breaker, which in turn invokes the adapter.

use std::sync::Arc;

use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

use crate::provider::circuit_breaker::{BreakerError, CircuitState};
use crate::provider::descriptor::{ProviderEntry, ProviderRegistry};
use crate::provider::types::{CompletionRequest, CompletionResponse, ProviderError};
use crate::utils::deterministic_rng::DeterministicRng;

/// `requests-by-provider-and-status` / `provider-errors-by-type` counters
/// and the `request duration by provider+method` histogram (spec.md §4.9).
fn record_provider_call(provider: &str, status: &str, error_kind: Option<&str>, elapsed_ms: f64) {
    metrics::counter!(
        "weavegraph_provider_requests_total",
        "provider" => provider.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    if let Some(kind) = error_kind {
        metrics::counter!(
            "weavegraph_provider_errors_total",
            "provider" => provider.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }
    metrics::histogram!(
        "weavegraph_provider_request_duration_ms",
        "provider" => provider.to_string(),
        "method" => "complete"
    )
    .record(elapsed_ms);
}

/// `healthy-provider count` and `circuit-breaker state per provider` gauges
/// (spec.md §4.9), refreshed after each routing decision.
fn record_registry_gauges(registry: &ProviderRegistry, now_secs: u64) {
    let entries = registry.all();
    let healthy_count = entries.iter().filter(|e| e.health.is_healthy(now_secs)).count();
    metrics::gauge!("weavegraph_healthy_provider_count").set(healthy_count as f64);
    for entry in &entries {
        let state_value = match entry.breaker.state(now_secs) {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        metrics::gauge!("weavegraph_circuit_breaker_state", "provider" => entry.tag.clone()).set(state_value);
    }
}

/// Selection preferences a caller can apply on top of plain priority order.
#[derive(Clone, Debug, Default)]
pub struct RoutingPreferences {
    pub preferred_provider: Option<String>,
    pub forbidden_providers: Vec<String>,
    pub require_speed: bool,
    pub require_quality: bool,
    pub max_cost_cents: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no eligible provider available")]
    NoProvidersAvailable,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Routes completion requests across the registered providers, applying
/// eligibility, preference, and cost filters, then falling back through the
/// remaining candidates on failure.
pub struct ProviderRouter {
    registry: Arc<ProviderRegistry>,
}

impl ProviderRouter {
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Builds the ordered candidate list for one request: eligible at
    /// `now_secs` for `estimated_tokens`, not explicitly forbidden, matching
    /// any speed/quality/cost constraints, sorted by descending priority with
    /// a deterministic tie-break seeded from the request id among entries
    /// sharing the top priority.
    fn candidates(
        &self,
        preferences: &RoutingPreferences,
        now_secs: u64,
        estimated_tokens: i64,
        tie_break_seed: u64,
    ) -> Vec<Arc<ProviderEntry>> {
        let mut entries: Vec<Arc<ProviderEntry>> = self
            .registry
            .all()
            .into_iter()
            .filter(|e| !preferences.forbidden_providers.contains(&e.tag))
            .filter(|e| !preferences.require_speed || e.speed_optimized)
            .filter(|e| !preferences.require_quality || e.quality_optimized)
            .filter(|e| {
                preferences
                    .max_cost_cents
                    .is_none_or(|cap| e.estimated_cost_cents(estimated_tokens) <= cap)
            })
            .filter(|e| e.is_eligible(now_secs, estimated_tokens))
            .collect();

        entries.sort_by(|a, b| b.priority.cmp(&a.priority));

        if let Some(preferred) = &preferences.preferred_provider {
            if let Some(pos) = entries.iter().position(|e| &e.tag == preferred) {
                let entry = entries.remove(pos);
                entries.insert(0, entry);
                return entries;
            }
        }

        // Deterministically shuffle entries sharing the top priority so
        // repeated calls with the same seed pick the same "random" winner.
        if let Some(top_priority) = entries.first().map(|e| e.priority) {
            let tie_len = entries.iter().take_while(|e| e.priority == top_priority).count();
            if tie_len > 1 {
                let mut rng = DeterministicRng::new(tie_break_seed);
                let winner = rng.choose_index(tie_len).unwrap_or(0);
                entries.swap(0, winner);
            }
        }

        entries
    }

    /// Stable per-request seed so the same request id always resolves the
    /// same tie-break winner, without depending on OS randomness.
    fn seed_for(request_id: &str) -> u64 {
        let mut hasher = FxHasher::default();
        request_id.hash(&mut hasher);
        hasher.finish()
    }

    /// Selects a provider and completes `request`, falling back through the
    /// remaining eligible candidates (in priority order) on failure. Returns
    /// [`RouterError::NoProvidersAvailable`] only once every candidate has
    /// been tried and failed, or none were eligible to begin with.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        preferences: &RoutingPreferences,
        request_id: &str,
        now_secs: u64,
    ) -> Result<CompletionResponse, RouterError> {
        let estimated_tokens = request.estimated_prompt_tokens() + request.max_tokens;
        let seed = Self::seed_for(request_id);
        let candidates = self.candidates(preferences, now_secs, estimated_tokens, seed);

        if candidates.is_empty() {
            return Err(RouterError::NoProvidersAvailable);
        }

        let bucket_tokens = estimated_tokens.max(0) as u64;
        let mut last_err: Option<ProviderError> = None;
        for (attempt, entry) in candidates.iter().enumerate() {
            // Consume one rate-limit token and one bucket token before the call
            // (spec.md §4.4), charged only against the candidate actually
            // dispatched to. `candidates()` only peeked eligibility; a guard
            // can still be freshly exhausted here by a concurrent caller.
            if !entry.rate_limiter.allow(now_secs) || !entry.token_bucket.take(bucket_tokens, now_secs) {
                record_provider_call(&entry.tag, "quota_exceeded", Some("quota_exceeded"), 0.0);
                last_err = Some(ProviderError::QuotaExceeded(format!(
                    "{} rate-limit or token-bucket quota exhausted at dispatch",
                    entry.tag
                )));
                continue;
            }

            let started = tokio::time::Instant::now();
            let result = entry
                .breaker
                .execute(now_secs, || entry.adapter.complete(request))
                .await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            match result {
                Ok(mut response) => {
                    entry.health.record_success(now_secs);
                    response.fallback = attempt > 0;
                    record_provider_call(&entry.tag, "success", None, elapsed_ms);
                    record_registry_gauges(&self.registry, now_secs);
                    return Ok(response);
                }
                Err(BreakerError::CircuitOpen) => {
                    record_provider_call(&entry.tag, "circuit_open", Some("circuit_open"), elapsed_ms);
                    continue;
                }
                Err(BreakerError::Inner(err)) => {
                    entry.health.record_failure(now_secs);
                    let permanent = err.is_permanent();
                    record_provider_call(&entry.tag, "failure", Some(err.kind()), elapsed_ms);
                    last_err = Some(err);
                    if permanent {
                        // Not this provider's fault in a way retrying elsewhere fixes,
                        // but other providers may still accept a corrected request later.
                        continue;
                    }
                }
            }
        }

        record_registry_gauges(&self.registry, now_secs);
        match last_err {
            Some(err) => Err(RouterError::Provider(err)),
            None => Err(RouterError::NoProvidersAvailable),
        }
    }

    /// As [`Self::complete`], but returns a canned degraded response instead
    /// of an error when every candidate is exhausted.
    pub async fn complete_or_degrade(
        &self,
        request: &CompletionRequest,
        preferences: &RoutingPreferences,
        request_id: &str,
        now_secs: u64,
    ) -> CompletionResponse {
        match self.complete(request, preferences, request_id, now_secs).await {
            Ok(response) => response,
            Err(_) => CompletionResponse::degraded(&request.model),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::provider::adapter::ProviderAdapter;
    use crate::provider::circuit_breaker::CircuitBreakerConfig;
    use crate::provider::descriptor::ProviderCapabilities;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubAdapter {
        tag: String,
        available: bool,
        fail_times: AtomicU32,
        capabilities: ProviderCapabilities,
    }

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(ProviderError::ProviderUnavailable("down".into()));
            }
            Ok(CompletionResponse {
                id: "resp-1".into(),
                created_at: chrono::Utc::now(),
                model: "test-model".into(),
                provider: self.tag.clone(),
                choices: vec![],
                usage: crate::provider::types::Usage::zero(),
                fallback: false,
                error: None,
            })
        }

        async fn stream(
            &self,
            _ctx: &tokio_util::sync::CancellationToken,
            _request: &CompletionRequest,
        ) -> Result<crate::provider::adapter::ChunkStream, ProviderError> {
            unimplemented!("not exercised in these tests")
        }

        fn name(&self) -> &str {
            &self.tag
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn capabilities(&self) -> &ProviderCapabilities {
            &self.capabilities
        }
    }

    fn registry_with(entries: Vec<(&str, i32, bool, u32)>) -> Arc<ProviderRegistry> {
        let registry = ProviderRegistry::new();
        for (tag, priority, available, fail_times) in entries {
            let adapter = Arc::new(StubAdapter {
                tag: tag.to_string(),
                available,
                fail_times: AtomicU32::new(fail_times),
                capabilities: ProviderCapabilities::default(),
            });
            let settings = crate::config::ProviderSettings {
                tag: tag.to_string(),
                api_key: Some("test-key".to_string()),
                base_url: "https://example.invalid".to_string(),
                model: "test-model".to_string(),
                priority,
                speed_optimized: false,
                quality_optimized: false,
                cost_per_million: 1.0,
                timeout: std::time::Duration::from_secs(5),
                retry_count: 1,
                rate_limit_per_window: 1000,
                rate_limit_window: std::time::Duration::from_secs(60),
                bucket_capacity: 1_000_000,
                bucket_refill_period: std::time::Duration::from_secs(1),
                capabilities: ProviderCapabilities::default(),
            };
            registry.register(ProviderEntry::from_settings(
                &settings,
                adapter,
                CircuitBreakerConfig::default(),
            ));
        }
        Arc::new(registry)
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("test-model", vec![Message::user("hi")]).unwrap()
    }

    #[tokio::test]
    async fn picks_highest_priority_eligible_provider() {
        let registry = registry_with(vec![("low", 1, true, 0), ("high", 10, true, 0)]);
        let router = ProviderRouter::new(registry);
        let response = router
            .complete(&request(), &RoutingPreferences::default(), "req-1", 0)
            .await
            .unwrap();
        assert_eq!(response.provider, "high");
        assert!(!response.fallback);
    }

    #[tokio::test]
    async fn falls_back_when_preferred_provider_fails() {
        let registry = registry_with(vec![("primary", 10, true, 100), ("backup", 5, true, 0)]);
        let router = ProviderRouter::new(registry);
        let mut preferences = RoutingPreferences::default();
        preferences.preferred_provider = Some("primary".to_string());
        let response = router
            .complete(&request(), &preferences, "req-1", 0)
            .await
            .unwrap();
        assert_eq!(response.provider, "backup");
        assert!(response.fallback);
    }

    #[tokio::test]
    async fn unavailable_provider_excluded_from_candidates() {
        let registry = registry_with(vec![("down", 10, false, 0), ("up", 5, true, 0)]);
        let router = ProviderRouter::new(registry);
        let response = router
            .complete(&request(), &RoutingPreferences::default(), "req-1", 0)
            .await
            .unwrap();
        assert_eq!(response.provider, "up");
    }

    #[tokio::test]
    async fn no_candidates_yields_no_providers_available() {
        let registry = registry_with(vec![]);
        let router = ProviderRouter::new(registry);
        let result = router
            .complete(&request(), &RoutingPreferences::default(), "req-1", 0)
            .await;
        assert!(matches!(result, Err(RouterError::NoProvidersAvailable)));
    }

    #[tokio::test]
    async fn same_seed_picks_same_tied_provider_deterministically() {
        let registry = registry_with(vec![("a", 10, true, 0), ("b", 10, true, 0)]);
        let router = ProviderRouter::new(registry);
        let first = router
            .complete(&request(), &RoutingPreferences::default(), "stable-id", 0)
            .await
            .unwrap();
        let second = router
            .complete(&request(), &RoutingPreferences::default(), "stable-id", 0)
            .await
            .unwrap();
        assert_eq!(first.provider, second.provider);
    }

    #[tokio::test]
    async fn exhausted_candidates_degrade_gracefully() {
        let registry = registry_with(vec![("only", 10, false, 0)]);
        let router = ProviderRouter::new(registry);
        let response = router
            .complete_or_degrade(&request(), &RoutingPreferences::default(), "req-1", 0)
            .await;
        assert_eq!(response.provider, "none");
        assert!(response.error.is_some());
    }
}
