//! Inbound request types: the caller-supplied generation request and the
//! routing/behavior preferences attached to it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::RoutingPreferences;

/// Caller-supplied knobs that steer provider selection and stage behavior.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPreferences {
    /// Ordered; the first entry the router can still reach wins.
    pub preferred_providers: Vec<String>,
    pub forbidden_providers: Vec<String>,
    pub require_speed: bool,
    pub require_quality: bool,
    pub max_cost_cents: Option<f64>,
    pub tests_required: bool,
}

impl RequestPreferences {
    /// Adapts the request's ordered preference list to the router's
    /// single-`preferred_provider` shape, keeping just the first entry.
    #[must_use]
    pub fn routing_preferences(&self) -> RoutingPreferences {
        RoutingPreferences {
            preferred_provider: self.preferred_providers.first().cloned(),
            forbidden_providers: self.forbidden_providers.clone(),
            require_speed: self.require_speed,
            require_quality: self.require_quality,
            max_cost_cents: self.max_cost_cents,
        }
    }
}

/// A generation request. The Pipeline Coordinator treats this as immutable
/// once a run starts — the request id is stable for the life of the run and
/// is what every drop id and error event is keyed on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub prompt: String,
    pub language: String,
    pub framework: String,
    pub kind: String,
    pub context: HashMap<String, String>,
    pub preferences: RequestPreferences,
    pub created_at: DateTime<Utc>,
}

impl Request {
    #[must_use]
    pub fn new(id: impl Into<String>, prompt: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            language: language.into(),
            framework: String::new(),
            kind: "function".to_string(),
            context: HashMap::new(),
            preferences: RequestPreferences::default(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = framework.into();
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_preferences(mut self, preferences: RequestPreferences) -> Self {
        self.preferences = preferences;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_preferences_takes_first_provider() {
        let preferences = RequestPreferences {
            preferred_providers: vec!["azure".to_string(), "groq".to_string()],
            ..RequestPreferences::default()
        };
        let routing = preferences.routing_preferences();
        assert_eq!(routing.preferred_provider, Some("azure".to_string()));
    }

    #[test]
    fn routing_preferences_empty_without_any_preferred() {
        let routing = RequestPreferences::default().routing_preferences();
        assert_eq!(routing.preferred_provider, None);
    }

    #[test]
    fn builder_methods_set_expected_fields() {
        let request = Request::new("req-1", "build a function", "python")
            .with_framework("fastapi")
            .with_kind("api_endpoint")
            .with_context("tests_required", "true");
        assert_eq!(request.framework, "fastapi");
        assert_eq!(request.kind, "api_endpoint");
        assert_eq!(request.context.get("tests_required"), Some(&"true".to_string()));
    }
}
