//! Provider descriptors and the process-global registry.
//!
//! The registry itself is read-mostly (an `RwLock` over an `FxHashMap`); the
//! mutable per-provider state (rate limiter, token bucket, health tracker,
//! circuit breaker) lives behind its own lock inside each entry, so unrelated
//! providers never contend with each other.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::config::ProviderSettings;
use crate::provider::adapter::ProviderAdapter;
use crate::provider::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::provider::guards::{HealthTracker, RateLimiter, TokenBucket};

/// Capability record for a provider.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub max_context: u32,
    pub supports_streaming: bool,
    pub supports_functions: bool,
    pub supports_vision: bool,
    pub available_models: Vec<String>,
}

/// Static, read-mostly description of a provider plus its mutable guards.
pub struct ProviderEntry {
    pub tag: String,
    pub priority: i32,
    pub speed_optimized: bool,
    pub quality_optimized: bool,
    pub cost_per_million: f64,
    pub timeout: Duration,
    pub retry_count: u32,
    pub capabilities: ProviderCapabilities,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub rate_limiter: RateLimiter,
    pub token_bucket: TokenBucket,
    pub health: HealthTracker,
    pub breaker: CircuitBreaker,
}

impl ProviderEntry {
    #[must_use]
    pub fn from_settings(
        settings: &ProviderSettings,
        adapter: Arc<dyn ProviderAdapter>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            tag: settings.tag.clone(),
            priority: settings.priority,
            speed_optimized: settings.speed_optimized,
            quality_optimized: settings.quality_optimized,
            cost_per_million: settings.cost_per_million,
            timeout: settings.timeout,
            retry_count: settings.retry_count,
            capabilities: settings.capabilities.clone(),
            adapter,
            rate_limiter: RateLimiter::new(
                settings.rate_limit_per_window,
                settings.rate_limit_window,
            ),
            token_bucket: TokenBucket::new(settings.bucket_capacity, settings.bucket_refill_period),
            health: HealthTracker::new(),
            breaker: CircuitBreaker::new(breaker_config),
        }
    }

    /// Estimated cost in cents for a request of `estimated_tokens` against
    /// this provider's per-million-token rate.
    #[must_use]
    pub fn estimated_cost_cents(&self, estimated_tokens: i64) -> f64 {
        (estimated_tokens as f64 / 1_000_000.0) * self.cost_per_million * 100.0
    }

    /// Eligibility order: registered (implicit, it's in the registry) ∧
    /// available ∧ healthy ∧ rate limiter would allow ∧ bucket has capacity
    /// for `estimated_tokens`. A non-mutating peek on both guards — a
    /// candidate considered here but never dispatched to (e.g. a higher
    /// priority entry wins instead) must not have its quota spent.
    /// [`ProviderRouter::complete`](crate::provider::router::ProviderRouter::complete)
    /// is the one place that actually consumes a rate-limit slot and bucket
    /// tokens, against the candidate it dispatches to.
    #[must_use]
    pub fn is_eligible(&self, now_secs: u64, estimated_tokens: i64) -> bool {
        self.adapter.is_available()
            && self.health.is_healthy(now_secs)
            && self.rate_limiter.would_allow(now_secs)
            && self
                .token_bucket
                .current_tokens(now_secs)
                .checked_sub(estimated_tokens.max(0) as u64)
                .is_some()
    }
}

/// Process-global, read-mostly registry of provider entries.
pub struct ProviderRegistry {
    entries: RwLock<FxHashMap<String, Arc<ProviderEntry>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn register(&self, entry: ProviderEntry) {
        self.entries
            .write()
            .insert(entry.tag.clone(), Arc::new(entry));
    }

    #[must_use]
    pub fn get(&self, tag: &str) -> Option<Arc<ProviderEntry>> {
        self.entries.read().get(tag).cloned()
    }

    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<ProviderEntry>> {
        self.entries.read().values().cloned().collect()
    }
}
