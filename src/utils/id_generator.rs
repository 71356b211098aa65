//! Identifier generation for runs, sessions, and ad-hoc attempt ids.

use std::sync::atomic::{AtomicU64, Ordering};

/// Configuration for a reproducible [`IdGenerator`].
///
/// With `seed` unset, [`IdGenerator::generate_id`] mints a fresh UUID every
/// call. With `seed` set, ids become deterministic across runs; `use_counter`
/// additionally folds in a monotonic counter so repeated calls on the same
/// generator still produce distinct ids.
#[derive(Debug, Clone)]
pub struct IdConfig {
    pub seed: Option<u64>,
    pub use_counter: bool,
    pub prefix: String,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            seed: None,
            use_counter: false,
            prefix: "id".to_string(),
        }
    }
}

/// Generates run, session, and attempt identifiers.
#[derive(Debug)]
pub struct IdGenerator {
    config: IdConfig,
    counter: AtomicU64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(IdConfig::default())
    }

    #[must_use]
    pub fn with_config(config: IdConfig) -> Self {
        Self {
            config,
            counter: AtomicU64::new(0),
        }
    }

    /// Generates an id for a new workflow run, e.g. `"run-<uuid>"`.
    #[must_use]
    pub fn generate_run_id(&self) -> String {
        format!("run-{}", uuid::Uuid::new_v4())
    }

    /// Generates a general-purpose id honoring this generator's [`IdConfig`].
    #[must_use]
    pub fn generate_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        match self.config.seed {
            Some(seed) if self.config.use_counter => {
                format!("{}-{seed:016x}-{seq}", self.config.prefix)
            }
            Some(seed) => format!("{}-{seed:016x}", self.config.prefix),
            None => format!("{}-{}", self.config.prefix, uuid::Uuid::new_v4()),
        }
    }
}
