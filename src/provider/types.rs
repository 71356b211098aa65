//! Wire-level types for the unified LLM completion request/response
//! shared by every provider adapter.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::Message;

/// A function/tool definition a completion request can offer the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A unified chat-completion request, translated per-adapter to the vendor
/// wire shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: i64,
    pub temperature: f64,
    pub top_p: f64,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub presence_penalty: f64,
    #[serde(default)]
    pub frequency_penalty: f64,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<FunctionDefinition>>,
}

impl CompletionRequest {
    /// Builds a request, clamping numeric fields to their valid ranges:
    /// `temperature` outside `[0,2]` → `0.7`, `max_tokens <= 0` → `2048`,
    /// `max_tokens > 128000` → `128000`, `top_p` outside `[0,1]` → `1.0`.
    /// Returns `None` if `messages` is empty (caller maps this to
    /// `ProviderError::InvalidRequest`).
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Option<Self> {
        if messages.is_empty() {
            return None;
        }
        Some(Self {
            model: model.into(),
            messages,
            max_tokens: 2048,
            temperature: 0.7,
            top_p: 1.0,
            stop: Vec::new(),
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            stream: false,
            functions: None,
        })
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: i64) -> Self {
        self.max_tokens = clamp_max_tokens(max_tokens);
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = clamp_temperature(temperature);
        self
    }

    #[must_use]
    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = clamp_top_p(top_p);
        self
    }

    #[must_use]
    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    #[must_use]
    pub fn with_functions(mut self, functions: Vec<FunctionDefinition>) -> Self {
        self.functions = Some(functions);
        self
    }

    /// `chars_in_messages/4 + max_tokens` token-count heuristic used for the
    /// cost-cap check and as a fallback when a provider doesn't report
    /// `usage`.
    #[must_use]
    pub fn estimated_prompt_tokens(&self) -> i64 {
        let chars: usize = self.messages.iter().map(|m| m.content.len()).sum();
        (chars / 4) as i64
    }
}

#[must_use]
pub fn clamp_temperature(value: f64) -> f64 {
    if (0.0..=2.0).contains(&value) { value } else { 0.7 }
}

#[must_use]
pub fn clamp_top_p(value: f64) -> f64 {
    if (0.0..=1.0).contains(&value) { value } else { 1.0 }
}

#[must_use]
pub fn clamp_max_tokens(value: i64) -> i64 {
    if value <= 0 {
        2048
    } else if value > 128_000 {
        128_000
    } else {
        value
    }
}

/// Token usage reported by (or estimated for) a completion: `total` always
/// equals `prompt + completion`, and both are zero for a degraded fallback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl Usage {
    #[must_use]
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }
}

/// One returned completion choice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: String,
}

/// The unified completion response every adapter produces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub model: String,
    pub provider: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    /// Set by the router when this response came from a fallback provider
    /// rather than the first-choice candidate.
    #[serde(default)]
    pub fallback: bool,
    /// Present only for the degraded "service unavailable" response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletionResponse {
    #[must_use]
    pub fn first_message_content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default()
    }

    /// A canned, zero-token "service temporarily unavailable" response used
    /// by callers that cannot surface errors.
    /// Never cached, never counted as a provider success.
    #[must_use]
    pub fn degraded(model: impl Into<String>) -> Self {
        Self {
            id: format!("degraded-{}", uuid::Uuid::new_v4()),
            created_at: chrono::Utc::now(),
            model: model.into(),
            provider: "none".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(
                    "Service temporarily unavailable. Please try again shortly.",
                ),
                finish_reason: "error".to_string(),
            }],
            usage: Usage::zero(),
            fallback: false,
            error: Some("service_unavailable".to_string()),
        }
    }
}

/// A streamed completion chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub id: String,
    pub delta: String,
    pub finish_reason: Option<String>,
}

/// Errors an adapter translates vendor responses into.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("authentication failed: {0}")]
    AuthError(String),
    /// The router's rate-limit slot or token-bucket quota was refused for
    /// this provider at dispatch time; the router tries the next candidate.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Permanent errors must never be retried by the activity runtime or
    /// counted as an eligibility-guard rejection against health.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderError::InvalidRequest(_))
    }

    /// Short tag for the `provider-errors-by-type` metric (spec.md §4.9).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::RateLimit(_) => "rate_limit",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::ProviderUnavailable(_) => "provider_unavailable",
            ProviderError::AuthError(_) => "auth_error",
            ProviderError::QuotaExceeded(_) => "quota_exceeded",
            ProviderError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_clamps_out_of_range_values() {
        assert_eq!(clamp_temperature(-1.0), 0.7);
        assert_eq!(clamp_temperature(3.0), 0.7);
        assert_eq!(clamp_temperature(1.2), 1.2);
    }

    #[test]
    fn top_p_clamps_out_of_range_values() {
        assert_eq!(clamp_top_p(-0.1), 1.0);
        assert_eq!(clamp_top_p(1.5), 1.0);
        assert_eq!(clamp_top_p(0.9), 0.9);
    }

    #[test]
    fn max_tokens_clamps_non_positive_and_overflow() {
        assert_eq!(clamp_max_tokens(0), 2048);
        assert_eq!(clamp_max_tokens(-5), 2048);
        assert_eq!(clamp_max_tokens(200_000), 128_000);
        assert_eq!(clamp_max_tokens(500), 500);
    }

    #[test]
    fn new_rejects_empty_messages() {
        assert!(CompletionRequest::new("gpt", vec![]).is_none());
    }

    #[test]
    fn usage_total_matches_components() {
        let usage = Usage::new(100, 50);
        assert_eq!(usage.total_tokens, 150);
        assert_eq!(Usage::zero().total_tokens, 0);
    }
}
