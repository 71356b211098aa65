//! Multi-provider LLM routing: adapters, health/quota guards, a circuit
//! breaker per provider, and a router that selects and falls back across
//! them.
//!
//! [`descriptor::ProviderRegistry`] is the process-global catalogue;
//! [`router::ProviderRouter`] is the thing pipeline stages actually call.
//! Build one registry at startup from [`crate::config::Settings`], register
//! an [`adapter::ProviderAdapter`] per enabled provider tag, and hand the
//! registry to a router.

pub mod adapter;
pub mod circuit_breaker;
pub mod descriptor;
pub mod guards;
pub mod router;
pub mod types;

pub use adapter::{AuthStyle, HttpProviderAdapter, ProviderAdapter, azure_completions_url};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use descriptor::{ProviderCapabilities, ProviderEntry, ProviderRegistry};
pub use guards::{HealthTracker, RateLimiter, TokenBucket};
pub use router::{ProviderRouter, RouterError, RoutingPreferences};
pub use types::{
    Choice, CompletionChunk, CompletionRequest, CompletionResponse, FunctionDefinition,
    ProviderError, Usage,
};

use std::sync::Arc;

use crate::config::Settings;

/// Builds a provider registry by instantiating one [`HttpProviderAdapter`]
/// per configured provider tag and registering it with default capabilities.
/// Stages that need bespoke capability records (vision, function-calling,
/// context-window size) should register entries directly instead.
#[must_use]
pub fn registry_from_settings(settings: &Settings) -> Arc<ProviderRegistry> {
    let registry = ProviderRegistry::new();
    let client = reqwest::Client::new();

    for provider in &settings.providers {
        let auth_style = if provider.tag.eq_ignore_ascii_case("azure") {
            AuthStyle::ApiKeyHeader
        } else {
            AuthStyle::Bearer
        };
        let url = if provider.tag.eq_ignore_ascii_case("azure") {
            azure_completions_url(&provider.base_url, &provider.model, "2024-02-01")
        } else {
            format!("{}/chat/completions", provider.base_url.trim_end_matches('/'))
        };

        let adapter = Arc::new(HttpProviderAdapter::new(
            provider.tag.clone(),
            client.clone(),
            url,
            provider.api_key.clone(),
            auth_style,
            provider.model.clone(),
            provider.capabilities.clone(),
        ));

        registry.register(ProviderEntry::from_settings(
            provider,
            adapter,
            CircuitBreakerConfig {
                half_open_max: 1,
                ..CircuitBreakerConfig::default()
            },
        ));
    }

    Arc::new(registry)
}
