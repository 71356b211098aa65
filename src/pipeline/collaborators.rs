//! HTTP client for the non-LLM collaborator services (requirements parser,
//! project scaffolder, dependency resolver, test planner, security/
//! performance scanners, container builder, cluster deployer, health
//! verifier, preview publisher) plus the per-stage request/response envelopes
//! they exchange.
//!
//! Transport concerns (timeout, retry, transient/permanent split) live in
//! [`crate::activity::execute_activity`]; this module only owns the POST and
//! the `{code, message}` error envelope collaborators are expected to return.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::activity::{ActivityError, ActivityOutcome};
use crate::pipeline::result::{DeploymentCoordinates, FileKind, GeneratedFile};

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Thin HTTP client shared by every collaborator-backed stage node.
#[derive(Clone)]
pub struct CollaboratorClient {
    client: reqwest::Client,
    base_url: String,
}

impl CollaboratorClient {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// POSTs `body` to `{base_url}{path}`, tagged with `attempt_id` so the
    /// collaborator can dedup retried attempts, and decodes the JSON
    /// response. Transport errors, 5xx, and 429 are transient; any other
    /// non-2xx is permanent.
    pub async fn call<Req, Resp>(
        &self,
        activity_name: &str,
        path: &str,
        attempt_id: &str,
        body: &Req,
    ) -> ActivityOutcome<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .header("X-Attempt-Id", attempt_id)
            .json(body)
            .send()
            .await
            .map_err(|err| ActivityError::Transient {
                name: activity_name.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            response.json::<Resp>().await.map_err(|err| ActivityError::Permanent {
                name: activity_name.to_string(),
                message: format!("malformed response body: {err}"),
            })
        } else {
            let transient = status.is_server_error() || status.as_u16() == 429;
            let envelope = response.json::<ErrorEnvelope>().await.unwrap_or_else(|_| ErrorEnvelope {
                code: status.as_str().to_string(),
                message: "no error envelope in response body".to_string(),
            });
            let message = format!("{}: {}", envelope.code, envelope.message);
            if transient {
                Err(ActivityError::Transient { name: activity_name.to_string(), message })
            } else {
                Err(ActivityError::Permanent { name: activity_name.to_string(), message })
            }
        }
    }
}

// ---------------------------------------------------------------------
// parse-requirements (stage 3, critical)
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ParseRequirementsRequest<'a> {
    pub prompt: &'a str,
    pub language: &'a str,
    pub framework: &'a str,
    pub kind: &'a str,
    pub context: &'a std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParseRequirementsResponse {
    pub main_file_path: String,
    pub test_framework: String,
    pub entry_point: String,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub document: String,
}

// ---------------------------------------------------------------------
// project-structure (stage 4)
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ProjectStructureRequest<'a> {
    pub language: &'a str,
    pub framework: &'a str,
    pub kind: &'a str,
    pub main_file_path: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectStructureResponse {
    pub directories: Vec<String>,
    pub files: Vec<String>,
}

// ---------------------------------------------------------------------
// dependency-resolve (stage 7)
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DependencyResolveRequest<'a> {
    pub content: &'a str,
    pub language: &'a str,
    pub framework: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependencyResolveResponse {
    pub dependencies: Vec<String>,
    pub package_file_name: String,
    pub package_file_content: String,
}

// ---------------------------------------------------------------------
// security-scan (stage 10)
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct SecurityScanRequest<'a> {
    pub content: &'a str,
    pub language: &'a str,
    pub dependencies: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityScanResponse {
    pub score: u8,
    #[serde(default)]
    pub issues: Vec<String>,
}

// ---------------------------------------------------------------------
// performance-analyze (stage 11)
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PerformanceAnalyzeRequest<'a> {
    pub content: &'a str,
    pub language: &'a str,
    pub kind: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceAnalyzeResponse {
    pub score: u8,
    #[serde(default)]
    pub notes: Vec<String>,
}

// ---------------------------------------------------------------------
// container-build (stage 14)
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ContainerBuildRequest<'a> {
    pub files: &'a [GeneratedFile],
    pub dependencies: &'a [String],
    pub language: &'a str,
    pub framework: &'a str,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerBuildResponse {
    pub image_ref: String,
    #[serde(default)]
    pub build_time_ms: u64,
    #[serde(default)]
    pub image_size_bytes: u64,
}

// ---------------------------------------------------------------------
// cluster-deploy (stage 15, runs only if stage 14 succeeded)
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ClusterDeployRequest<'a> {
    pub image_ref: &'a str,
    pub namespace: &'a str,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterDeployResponse {
    pub live_url: String,
    #[serde(default)]
    pub dashboard_url: Option<String>,
    pub deployment_id: String,
    #[serde(default)]
    pub expiry: Option<chrono::DateTime<chrono::Utc>>,
}

impl ClusterDeployResponse {
    #[must_use]
    pub fn into_coordinates(self, image_ref: String, namespace: String) -> DeploymentCoordinates {
        DeploymentCoordinates {
            image_ref: Some(image_ref),
            namespace: Some(namespace),
            live_url: Some(self.live_url),
            dashboard_url: self.dashboard_url,
            deployment_id: Some(self.deployment_id),
            expiry: self.expiry,
            healthy: None,
        }
    }
}

// ---------------------------------------------------------------------
// health-verify (stage 16, runs only if stage 15 succeeded)
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthVerifyRequest<'a> {
    pub live_url: &'a str,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthVerifyResponse {
    pub healthy: bool,
    #[serde(default)]
    pub attempts: u32,
}

// ---------------------------------------------------------------------
// preview-publish (stage 17)
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PreviewPublishRequest<'a> {
    pub workflow_id: &'a str,
    pub request_id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewPublishResponse {
    pub preview_url: String,
}

/// Deterministic fallback used when the preview publisher activity is
/// unavailable or exhausted — never blocks a run on an external service.
#[must_use]
pub fn fallback_preview_url(workflow_id: &str) -> String {
    format!("https://preview.internal.example/w/{workflow_id}")
}

#[must_use]
pub fn default_file_kind(path: &str) -> FileKind {
    if path.starts_with("tests/") || path.contains("test_") || path.contains("_test.") {
        FileKind::Test
    } else if path.ends_with(".md") || path.starts_with("docs/") {
        FileKind::Documentation
    } else if path.ends_with(".toml")
        || path.ends_with(".yaml")
        || path.ends_with(".yml")
        || path.ends_with(".json")
        || path.ends_with(".cfg")
        || path.starts_with("requirements")
    {
        FileKind::Config
    } else {
        FileKind::Source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_test_files() {
        assert_eq!(default_file_kind("tests/test_main.py"), FileKind::Test);
    }

    #[test]
    fn classifies_docs() {
        assert_eq!(default_file_kind("README.md"), FileKind::Documentation);
    }

    #[test]
    fn classifies_config() {
        assert_eq!(default_file_kind("requirements.txt"), FileKind::Config);
    }

    #[test]
    fn classifies_source_by_default() {
        assert_eq!(default_file_kind("src/main.py"), FileKind::Source);
    }

    #[test]
    fn fallback_preview_url_is_deterministic_per_workflow() {
        assert_eq!(fallback_preview_url("wf-1"), fallback_preview_url("wf-1"));
        assert_ne!(fallback_preview_url("wf-1"), fallback_preview_url("wf-2"));
    }
}
