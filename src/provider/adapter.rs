//! Provider adapters: one per LLM backend.
//!
//! Dynamic dispatch over a small trait and a registry, rather than an
//! inheritance hierarchy. [`HttpProviderAdapter`] implements the
//! OpenAI-shaped wire contract and is reused for every OpenAI-compatible
//! backend (groq, together, local vLLM, ...); the Azure variant reuses it
//! with [`azure_completions_url`] to build the deployment-path/api-version
//! URL shape.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::message::{FunctionCall, Message};
use crate::provider::descriptor::ProviderCapabilities;
use crate::provider::types::{
    Choice, CompletionChunk, CompletionRequest, CompletionResponse, ProviderError, Usage,
};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk, ProviderError>> + Send>>;

/// Contract every LLM backend must satisfy.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    /// `ctx` cancels the in-flight request: a cancellation before the
    /// response arrives aborts the connection attempt, and one observed
    /// while chunks are still arriving terminates the upstream connection
    /// and closes the output stream early.
    async fn stream(
        &self,
        ctx: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ProviderError>;

    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    fn capabilities(&self) -> &ProviderCapabilities;
}

/// Which wire dialect a [`HttpProviderAdapter`] speaks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `api-key: <key>`
    ApiKeyHeader,
}

/// Generic OpenAI-chat-shaped HTTP adapter, reused across providers that
/// speak the same dialect.
pub struct HttpProviderAdapter {
    tag: String,
    client: reqwest::Client,
    /// Fully-formed completions URL (already includes any Azure-style
    /// deployment/api-version path+query).
    url: String,
    api_key: Option<String>,
    auth_style: AuthStyle,
    model: String,
    capabilities: ProviderCapabilities,
}

impl HttpProviderAdapter {
    #[must_use]
    pub fn new(
        tag: impl Into<String>,
        client: reqwest::Client,
        url: impl Into<String>,
        api_key: Option<String>,
        auth_style: AuthStyle,
        model: impl Into<String>,
        capabilities: ProviderCapabilities,
    ) -> Self {
        Self {
            tag: tag.into(),
            client,
            url: url.into(),
            api_key,
            auth_style,
            model: model.into(),
            capabilities,
        }
    }

    /// `POST {provider-url}/chat/completions`-shaped request body
    ///.
    fn build_request(&self) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(&self.url);
        if let Some(key) = &self.api_key {
            builder = match self.auth_style {
                AuthStyle::Bearer => builder.bearer_auth(key),
                AuthStyle::ApiKeyHeader => builder.header("api-key", key),
            };
        }
        builder
    }

    fn to_wire_body(&self, request: &CompletionRequest) -> Value {
        json!({
            "model": self.model,
            "messages": request.messages.iter().map(message_to_wire).collect::<Vec<_>>(),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "top_p": request.top_p,
            "stop": request.stop,
            "presence_penalty": request.presence_penalty,
            "frequency_penalty": request.frequency_penalty,
            "stream": request.stream,
        })
    }
}

fn message_to_wire(message: &Message) -> Value {
    let mut value = json!({
        "role": message.role,
        "content": message.content,
    });
    if let Some(name) = &message.name {
        value["name"] = json!(name);
    }
    if let Some(call) = &message.function_call {
        value["function_call"] = json!({"name": call.name, "arguments": call.arguments});
    }
    value
}

#[derive(Deserialize)]
struct WireResponse {
    id: String,
    model: String,
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    index: u32,
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    role: String,
    content: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    function_call: Option<WireFunctionCall>,
}

#[derive(Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
}

#[derive(Deserialize)]
struct WireErrorEnvelope {
    error: WireErrorBody,
}

#[derive(Deserialize)]
struct WireErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

fn translate_error(status: reqwest::StatusCode, body: &str) -> ProviderError {
    let message = serde_json::from_str::<WireErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());
    match status.as_u16() {
        400 => ProviderError::InvalidRequest(message),
        401 | 403 => ProviderError::AuthError(message),
        408 => ProviderError::Timeout(message),
        429 => ProviderError::RateLimit(message),
        503 => ProviderError::ProviderUnavailable(message),
        code if code >= 500 => ProviderError::ProviderUnavailable(message),
        _ => ProviderError::Other(message),
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        if request.messages.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "messages must not be empty".to_string(),
            ));
        }

        let body = self.to_wire_body(request);
        let response = self
            .build_request()
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProviderError::Timeout(err.to_string())
                } else {
                    ProviderError::ProviderUnavailable(err.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ProviderError::Other(err.to_string()))?;

        if !status.is_success() {
            return Err(translate_error(status, &text));
        }

        let wire: WireResponse = serde_json::from_str(&text)
            .map_err(|err| ProviderError::Other(format!("malformed response body: {err}")))?;

        let usage = wire
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_else(|| {
                let completion_chars: usize = wire
                    .choices
                    .iter()
                    .filter_map(|c| c.message.content.as_ref())
                    .map(|c| c.len())
                    .sum();
                Usage::new(
                    request.estimated_prompt_tokens(),
                    (completion_chars / 4) as i64,
                )
            });

        let choices = wire
            .choices
            .into_iter()
            .map(|c| Choice {
                index: c.index,
                message: {
                    let mut message = Message::new(&c.message.role, &c.message.content.unwrap_or_default());
                    if let Some(name) = c.message.name {
                        message = message.with_name(name);
                    }
                    if let Some(call) = c.message.function_call {
                        message = message.with_function_call(FunctionCall {
                            name: call.name,
                            arguments: call.arguments,
                        });
                    }
                    message
                },
                finish_reason: c.finish_reason.unwrap_or_else(|| "stop".to_string()),
            })
            .collect();

        Ok(CompletionResponse {
            id: wire.id,
            created_at: chrono::Utc::now(),
            model: wire.model,
            provider: self.tag.clone(),
            choices,
            usage,
            fallback: false,
            error: None,
        })
    }

    async fn stream(
        &self,
        ctx: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        if request.messages.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "messages must not be empty".to_string(),
            ));
        }
        let mut body = self.to_wire_body(request);
        body["stream"] = json!(true);

        let response = tokio::select! {
            result = self.build_request().json(&body).send() => {
                result.map_err(|err| ProviderError::ProviderUnavailable(err.to_string()))?
            }
            () = ctx.cancelled() => {
                return Err(ProviderError::ProviderUnavailable(
                    "stream request cancelled before a response arrived".to_string(),
                ));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(translate_error(status, &text));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let byte_stream = response.bytes_stream().map(move |chunk| {
            chunk
                .map_err(|err| ProviderError::ProviderUnavailable(err.to_string()))
                .map(|bytes| CompletionChunk {
                    id: id.clone(),
                    delta: String::from_utf8_lossy(&bytes).into_owned(),
                    finish_reason: None,
                })
        });
        // `take_until` drops the underlying byte stream (and with it the
        // open connection) as soon as `ctx` is cancelled, instead of
        // draining it to completion.
        let stream = byte_stream.take_until(ctx.clone().cancelled_owned());
        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        &self.tag
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }
}

/// Builds the Azure-flavored completions URL:
/// `/openai/deployments/{deployment}/chat/completions?api-version={v}`
///.
#[must_use]
pub fn azure_completions_url(
    resource_base: &str,
    deployment: &str,
    api_version: &str,
) -> String {
    format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        resource_base.trim_end_matches('/'),
        deployment,
        api_version
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn azure_url_matches_documented_shape() {
        let url = azure_completions_url("https://res.openai.azure.com", "gpt4", "2024-02-01");
        assert_eq!(
            url,
            "https://res.openai.azure.com/openai/deployments/gpt4/chat/completions?api-version=2024-02-01"
        );
    }

    #[test]
    fn translate_error_maps_status_codes() {
        assert!(matches!(
            translate_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "{}"),
            ProviderError::RateLimit(_)
        ));
        assert!(matches!(
            translate_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, "{}"),
            ProviderError::ProviderUnavailable(_)
        ));
        assert!(matches!(
            translate_error(reqwest::StatusCode::BAD_REQUEST, "{}"),
            ProviderError::InvalidRequest(_)
        ));
        assert!(matches!(
            translate_error(reqwest::StatusCode::UNAUTHORIZED, "{}"),
            ProviderError::AuthError(_)
        ));
    }

    #[test]
    fn translate_error_extracts_structured_message() {
        let body = r#"{"error": {"code": "rate_limit_exceeded", "message": "slow down"}}"#;
        match translate_error(reqwest::StatusCode::TOO_MANY_REQUESTS, body) {
            ProviderError::RateLimit(message) => assert_eq!(message, "slow down"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
