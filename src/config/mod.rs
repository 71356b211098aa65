//! Environment-driven configuration surface.
//!
//! Mirrors how [`crate::runtimes::RuntimeConfig`] resolves `SQLITE_DB_NAME`:
//! `dotenvy::dotenv()` is attempted once, then every setting is read from
//! `std::env` with a typed default. Nothing here panics on a missing
//! variable; callers get sane defaults and can override per-field for tests.

use std::env;
use std::time::Duration;

use crate::provider::descriptor::ProviderCapabilities;

/// One provider's slice of the config surface.
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    pub tag: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub retry_count: u32,
    pub rate_limit_per_window: u32,
    pub rate_limit_window: Duration,
    pub bucket_capacity: u64,
    pub bucket_refill_period: Duration,
    pub cost_per_million: f64,
    pub priority: i32,
    pub speed_optimized: bool,
    pub quality_optimized: bool,
    pub capabilities: ProviderCapabilities,
}

impl ProviderSettings {
    /// Reads one provider's settings from `<TAG>_<FIELD>` environment
    /// variables (tag upper-cased), falling back to reasonable defaults so a
    /// provider can be enabled with only an API key set.
    #[must_use]
    pub fn from_env(tag: &str) -> Self {
        let prefix = tag.to_uppercase();
        let var = |suffix: &str| env::var(format!("{prefix}_{suffix}")).ok();

        Self {
            tag: tag.to_string(),
            api_key: var("API_KEY"),
            base_url: var("BASE_URL")
                .unwrap_or_else(|| format!("https://api.{}.example.com", tag)),
            model: var("MODEL").unwrap_or_else(|| "default".to_string()),
            timeout: Duration::from_millis(parse_or(var("TIMEOUT_MS"), 30_000)),
            retry_count: parse_or(var("RETRY_COUNT"), 3),
            rate_limit_per_window: parse_or(var("RATE_LIMIT"), 60),
            rate_limit_window: Duration::from_secs(parse_or(var("RATE_LIMIT_WINDOW_SECS"), 60)),
            bucket_capacity: parse_or(var("BUCKET_CAPACITY"), 1_000_000),
            bucket_refill_period: Duration::from_secs(parse_or(var("BUCKET_REFILL_SECS"), 60)),
            cost_per_million: parse_or(var("COST_PER_MILLION"), 0.0),
            priority: parse_or(var("PRIORITY"), 0),
            speed_optimized: parse_or(var("SPEED_OPTIMIZED"), false),
            quality_optimized: parse_or(var("QUALITY_OPTIMIZED"), false),
            capabilities: ProviderCapabilities::default(),
        }
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Process-wide settings resolved once at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Default provider tag used when a request states no preference.
    pub primary_provider: String,
    /// Ordered fallback chain, tried after the primary/preferred provider.
    pub fallback_providers: Vec<String>,
    /// Which provider adapters to instantiate at all.
    pub enabled_providers: Vec<String>,
    /// Per-provider settings, keyed by tag.
    pub providers: Vec<ProviderSettings>,
    /// Default activity start-to-close timeout.
    pub activity_timeout: Duration,
    /// Default per-stage retry attempt cap.
    pub stage_retry_count: u32,
    /// Drop store base URL.
    pub drop_store_url: String,
    /// Base URL shared by the non-LLM collaborator services (parser, test
    /// generator, scanners, container builder, cluster deployer, health
    /// verifier, preview publisher). Each stage appends its own path.
    pub collaborators_base_url: String,
    /// Prometheus exporter listen port (0 disables the listener).
    pub metrics_port: u16,
    /// OTLP/Jaeger-style trace collector endpoint, if any.
    pub trace_endpoint: Option<String>,
    /// Minimum main-source length for the success rule.
    pub min_success_content_len: usize,
    /// Security-score floor for the success rule's OR-branch.
    pub min_success_security_score: u8,
    /// Whether a degraded (canned, zero-token) completion counts toward the
    /// per-workflow LLM-call total.
    pub count_degraded_as_call: bool,
    /// Max probe requests admitted while a circuit breaker is half-open.
    pub breaker_half_open_max: u32,
    /// Minimum observations before a breaker is eligible to trip.
    pub breaker_min_requests: u32,
    /// Failure ratio at/above which a breaker trips.
    pub breaker_trip_ratio: f64,
    /// How long an open breaker waits before allowing half-open probes.
    pub breaker_reset_timeout: Duration,
}

impl Settings {
    /// Loads settings from the process environment, falling back to
    /// defaults suitable for local development and tests.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let primary_provider = env::var("PRIMARY_PROVIDER").unwrap_or_else(|_| "openai".into());
        let fallback_providers = env::var("FALLBACK_PROVIDERS")
            .map(|raw| split_list(&raw))
            .unwrap_or_else(|_| vec!["azure".into(), "groq".into()]);
        let enabled_providers = env::var("ENABLED_PROVIDERS")
            .map(|raw| split_list(&raw))
            .unwrap_or_else(|_| {
                let mut tags = vec![primary_provider.clone()];
                tags.extend(fallback_providers.clone());
                tags.sort();
                tags.dedup();
                tags
            });

        let providers = enabled_providers
            .iter()
            .map(|tag| ProviderSettings::from_env(tag))
            .collect();

        Self {
            primary_provider,
            fallback_providers,
            enabled_providers,
            providers,
            activity_timeout: Duration::from_millis(parse_or(
                env::var("ACTIVITY_TIMEOUT_MS").ok(),
                60_000,
            )),
            stage_retry_count: parse_or(env::var("STAGE_RETRY_COUNT").ok(), 3),
            drop_store_url: env::var("DROP_STORE_URL")
                .unwrap_or_else(|_| "http://localhost:8090/drops".into()),
            collaborators_base_url: env::var("COLLABORATORS_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8091".into()),
            metrics_port: parse_or(env::var("METRICS_PORT").ok(), 9100),
            trace_endpoint: env::var("TRACE_ENDPOINT").ok(),
            min_success_content_len: parse_or(env::var("MIN_SUCCESS_CONTENT_LEN").ok(), 100),
            min_success_security_score: parse_or(
                env::var("MIN_SUCCESS_SECURITY_SCORE").ok(),
                50,
            ),
            count_degraded_as_call: parse_or(env::var("COUNT_DEGRADED_AS_CALL").ok(), false),
            breaker_half_open_max: parse_or(env::var("BREAKER_HALF_OPEN_MAX").ok(), 1),
            breaker_min_requests: parse_or(env::var("BREAKER_MIN_REQUESTS").ok(), 10),
            breaker_trip_ratio: parse_or(env::var("BREAKER_TRIP_RATIO").ok(), 0.5),
            breaker_reset_timeout: Duration::from_secs(parse_or(
                env::var("BREAKER_RESET_TIMEOUT_SECS").ok(),
                30,
            )),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Initializes the global `tracing` subscriber from `RUST_LOG`, matching the
/// env-filter/fmt/ansi stack already in `Cargo.toml`. Safe to call more than
/// once; subsequent calls are no-ops. When `settings.trace_endpoint` is set,
/// switches the formatter to newline-delimited JSON so a sidecar collector
/// can ship spans onward, instead of ANSI-colored text meant for a terminal.
pub fn init_tracing(settings: &Settings) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if let Some(endpoint) = settings.trace_endpoint.as_deref() {
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_ansi(false))
                .try_init();
            tracing::info!(endpoint, "tracing configured for structured export");
        } else {
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_ansi(true))
                .try_init();
        }
    });
}

/// Installs the Prometheus metrics recorder/exporter on `settings.metrics_port`.
/// A port of `0` disables the listener entirely (metrics calls become no-ops
/// via the `metrics` crate's default no-op recorder).
pub fn init_metrics(settings: &Settings) {
    if settings.metrics_port == 0 {
        return;
    }
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
        if let Err(err) = metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            tracing::warn!(%err, "failed to install prometheus metrics exporter");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_settings_fall_back_to_defaults() {
        let settings = ProviderSettings::from_env("nonexistent_test_provider_xyz");
        assert_eq!(settings.tag, "nonexistent_test_provider_xyz");
        assert_eq!(settings.retry_count, 3);
        assert_eq!(settings.priority, 0);
        assert!(!settings.speed_optimized);
    }

    #[test]
    fn split_list_trims_and_drops_empties() {
        assert_eq!(
            split_list(" azure, groq ,,openai"),
            vec!["azure", "groq", "openai"]
        );
    }
}
