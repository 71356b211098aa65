//! The ~17 pipeline stage nodes, split by what they talk to:
//! [`generation`] (prompt/FRD/requirements/structure/code — LLM and the
//! requirements parser), [`quality`] (semantic validation with its bounded
//! repair loop, dependency resolution, test planning, security/performance
//! scanning, documentation), and [`delivery`] (file compilation, container
//! build, cluster deploy, health verify, preview publish, summary).
//!
//! Shared plumbing — reading the seeded request back out of the `extra`
//! channel, building per-stage [`ActivityOptions`], and the critical-failure
//! abort-to-summary jump — lives here so every stage node reads the same way.

pub mod delivery;
pub mod generation;
pub mod quality;

use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::activity::{ActivityOptions, RetryPolicy};
use crate::channels::errors::{ErrorEvent, LadderError};
use crate::node::{NodeError, NodePartial};
use crate::pipeline::request::Request;
use crate::pipeline::PipelineServices;
use crate::state::StateSnapshot;
use crate::types::NodeKind;
use crate::utils::collections::ExtraMapExt;

/// Reads the request seeded into the `extra` channel at `build_initial_state`
/// time. Every stage needs it; missing means the graph was invoked without
/// going through [`crate::pipeline::build_initial_state`].
pub fn extract_request(snapshot: &StateSnapshot) -> Result<Request, NodeError> {
    let raw = snapshot
        .extra
        .get("request")
        .ok_or(NodeError::MissingInput { what: "request" })?;
    serde_json::from_value(raw.clone()).map_err(NodeError::Serde)
}

pub fn extract_workflow_id(snapshot: &StateSnapshot) -> Result<String, NodeError> {
    snapshot
        .extra
        .get_string("workflow_id")
        .map(str::to_string)
        .ok_or(NodeError::MissingInput { what: "workflow_id" })
}

/// Builds this stage's [`ActivityOptions`] from the shared settings: default
/// timeout and retry count, overridable per call site for stages with their
/// own cadence (e.g. health-verify's polling loop).
pub fn activity_options(services: &PipelineServices, stage: &str) -> ActivityOptions {
    ActivityOptions::new(
        stage.to_string(),
        services.settings.activity_timeout,
        RetryPolicy::default().with_max_attempts(services.settings.stage_retry_count.max(1)),
    )
}

pub fn activity_options_with_timeout(
    services: &PipelineServices,
    stage: &str,
    timeout: Duration,
) -> ActivityOptions {
    ActivityOptions::new(
        stage.to_string(),
        timeout,
        RetryPolicy::default().with_max_attempts(services.settings.stage_retry_count.max(1)),
    )
}

/// Builds a non-critical-failure [`NodePartial`]: an error event logged
/// against this stage and whatever fallback extras the caller supplies, with
/// no frontier override — the default edges carry the run forward.
pub fn non_critical_failure(
    stage: &str,
    step: u64,
    message: impl Into<String>,
    fallback_extra: FxHashMap<String, Value>,
) -> NodePartial {
    let error = ErrorEvent::node(stage, step, LadderError::msg(message)).with_tag("non_critical");
    NodePartial::new().with_errors(vec![error]).with_extra(fallback_extra)
}

/// Builds a critical-failure [`NodePartial`]: logs the error, records the
/// failing stage tag for the summary, and replaces this node's frontier with
/// a direct jump to `summary` — stages 4 through the rest of the chain never
/// run (spec scenario S3).
pub fn critical_failure(stage: &str, step: u64, message: impl Into<String>) -> NodePartial {
    let error = ErrorEvent::node(stage, step, LadderError::msg(message)).with_tag("critical");
    let mut extra = crate::utils::collections::new_extra_map();
    extra.insert_string("failed_stage", stage);
    NodePartial::new()
        .with_errors(vec![error])
        .with_extra(extra)
        .with_frontier_replace(vec![NodeKind::Custom("summary".to_string())])
}

/// Builds a non-critical-failure [`NodePartial`] that also jumps the
/// frontier straight to `target`, skipping every stage in between. Used by
/// `container-build` and `cluster-deploy`: a failure there means the stages
/// gated on their success (`cluster-deploy`, `health-verify`) must not run at
/// all, not merely continue with a fallback value.
pub fn skip_to(
    stage: &str,
    step: u64,
    message: impl Into<String>,
    fallback_extra: FxHashMap<String, Value>,
    target: &str,
) -> NodePartial {
    let error = ErrorEvent::node(stage, step, LadderError::msg(message)).with_tag("non_critical");
    NodePartial::new()
        .with_errors(vec![error])
        .with_extra(fallback_extra)
        .with_frontier_replace(vec![NodeKind::Custom(target.to_string())])
}

/// Reads the accumulated validation record (semantic/security/performance)
/// out of the `extra` channel, defaulting to an empty record before
/// `semantic-validate` has run.
pub fn read_validation(snapshot: &StateSnapshot) -> crate::pipeline::result::ValidationRecord {
    snapshot
        .extra
        .get("validation")
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default()
}

/// The model configured for the settings' primary provider, used to seed
/// [`crate::provider::types::CompletionRequest`] — the router dispatches to
/// whichever provider it selects, which substitutes its own configured
/// model, but the request still needs a value to construct.
pub fn default_model(services: &PipelineServices) -> String {
    services
        .settings
        .providers
        .iter()
        .find(|provider| provider.tag == services.settings.primary_provider)
        .map(|provider| provider.model.clone())
        .unwrap_or_else(|| "default".to_string())
}

/// Adds `tokens` to the cumulative token total carried in the `extra`
/// channel, returning the updated total.
pub fn bump_total_tokens(snapshot: &StateSnapshot, tokens: i64) -> i64 {
    let previous = snapshot.extra.get_number("total_tokens").and_then(|n| n.as_i64()).unwrap_or(0);
    previous + tokens
}

/// Derives `tests/test_<main file name>` from a main file path — e.g.
/// `src/main.py` → `tests/test_main.py`, matching spec scenario S1.
#[must_use]
pub fn test_file_path(main_file_path: &str) -> String {
    let file_name = main_file_path.rsplit('/').next().unwrap_or(main_file_path);
    format!("tests/test_{file_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VersionedState;
    use serde_json::json;

    #[test]
    fn extract_request_round_trips_through_json() {
        let request = Request::new("req-1", "build a thing", "python");
        let mut state = VersionedState::new_with_user_message("start");
        state.add_extra("request", serde_json::to_value(&request).unwrap());
        let snapshot = state.snapshot();
        let decoded = extract_request(&snapshot).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn missing_request_is_a_missing_input_error() {
        let state = VersionedState::new_with_user_message("start");
        let err = extract_request(&state.snapshot()).unwrap_err();
        assert!(matches!(err, NodeError::MissingInput { what: "request" }));
    }

    #[test]
    fn total_tokens_accumulates_across_stages() {
        let mut state = VersionedState::new_with_user_message("start");
        state.add_extra("total_tokens", json!(120));
        let total = bump_total_tokens(&state.snapshot(), 80);
        assert_eq!(total, 200);
    }

    #[test]
    fn test_file_path_derives_from_main_file_name() {
        assert_eq!(test_file_path("src/main.py"), "tests/test_main.py");
        assert_eq!(test_file_path("main.py"), "tests/test_main.py");
    }
}
