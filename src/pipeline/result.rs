//! Terminal result types: generated files, validation/deployment/metrics
//! records, the aggregate [`PipelineResult`], and the success-rule
//! computation the `summary` stage runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::drops::Drop;

/// The kind of a generated file, assigned by the project-structure stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Source,
    Test,
    Documentation,
    Config,
}

/// One file produced anywhere in the pipeline. Merged by `path` at the
/// barrier via [`crate::reducers::AppendFiles`] — a later write for the same
/// path replaces an earlier one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
    pub language: String,
    pub kind: FileKind,
}

impl GeneratedFile {
    #[must_use]
    pub fn new(
        path: impl Into<String>,
        content: impl Into<String>,
        language: impl Into<String>,
        kind: FileKind,
    ) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            language: language.into(),
            kind,
        }
    }
}

/// Outputs of the semantic-validate, security-scan, and performance-analyze
/// stages, accumulated onto one record as each stage completes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub semantic_valid: bool,
    pub semantic_issues: Vec<String>,
    pub repair_attempts: u32,
    pub security_score: Option<u8>,
    pub security_issues: Vec<String>,
    pub performance_score: Option<u8>,
    pub performance_notes: Vec<String>,
}

/// Where (if anywhere) the generated project ended up running. All fields
/// stay `None` unless stage 14 (container-build) succeeded.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentCoordinates {
    pub image_ref: Option<String>,
    pub namespace: Option<String>,
    pub live_url: Option<String>,
    pub dashboard_url: Option<String>,
    pub deployment_id: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub healthy: Option<bool>,
}

/// Terminal accounting the summary stage assembles: duration, LLM call
/// count, last provider/model used, tokens, and estimated cost.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub duration_ms: i64,
    pub llm_call_count: u32,
    pub last_provider: Option<String>,
    pub last_model: Option<String>,
    pub total_tokens: i64,
    pub estimated_cost_cents: f64,
}

/// The Pipeline Coordinator's terminal output. Encoded into the `extra`
/// channel's `pipeline_result` key by the `summary` stage and decoded back
/// out by [`crate::pipeline::run`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub request_id: String,
    pub workflow_id: String,
    pub files: Vec<GeneratedFile>,
    pub drops: Vec<Drop>,
    pub dependencies: Vec<String>,
    pub validation: ValidationRecord,
    pub documentation: String,
    pub deployment: DeploymentCoordinates,
    pub preview_url: Option<String>,
    pub metrics: MetricsRecord,
    pub success: bool,
    pub masked_semantic_error: bool,
    pub completed_at: DateTime<Utc>,
    pub failed_stage: Option<String>,
}

/// The success rule (spec testable property #7):
/// `success = (len(main) >= min_len) AND (no semantic error OR security_score
/// >= min_security_score OR live_url present)`.
#[must_use]
pub fn compute_success(
    main_len: usize,
    min_len: usize,
    has_semantic_error: bool,
    security_score: Option<u8>,
    min_security_score: u8,
    live_url: Option<&str>,
) -> bool {
    let content_ok = main_len >= min_len;
    let quality_ok = !has_semantic_error
        || security_score.is_some_and(|score| score >= min_security_score)
        || live_url.is_some_and(|url| !url.is_empty());
    content_ok && quality_ok
}

/// True when [`compute_success`] reported success only because the
/// security-score or live-url branch carried it, despite an outstanding
/// semantic error — the masking the open question about this rule warns
/// about. Recorded on the summary drop rather than silently inverted.
#[must_use]
pub fn masks_semantic_error(
    has_semantic_error: bool,
    security_score: Option<u8>,
    min_security_score: u8,
    live_url: Option<&str>,
) -> bool {
    has_semantic_error
        && (security_score.is_some_and(|score| score >= min_security_score)
            || live_url.is_some_and(|url| !url.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_main_file_always_fails() {
        assert!(!compute_success(10, 100, false, None, 50, None));
    }

    #[test]
    fn clean_semantic_result_succeeds_on_content_alone() {
        assert!(compute_success(200, 100, false, None, 50, None));
    }

    #[test]
    fn semantic_error_without_security_or_url_fails() {
        assert!(!compute_success(200, 100, true, Some(10), 50, None));
    }

    #[test]
    fn semantic_error_rescued_by_security_score() {
        assert!(compute_success(200, 100, true, Some(80), 50, None));
        assert!(masks_semantic_error(true, Some(80), 50, None));
    }

    #[test]
    fn semantic_error_rescued_by_live_url() {
        assert!(compute_success(200, 100, true, None, 50, Some("https://preview.example/app")));
        assert!(masks_semantic_error(true, None, 50, Some("https://preview.example/app")));
    }

    #[test]
    fn security_score_exactly_at_floor_counts() {
        assert!(compute_success(200, 100, true, Some(50), 50, None));
    }

    #[test]
    fn masking_flag_is_false_without_a_semantic_error() {
        assert!(!masks_semantic_error(false, Some(90), 50, Some("https://preview.example")));
    }
}
