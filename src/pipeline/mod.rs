//! The Pipeline Coordinator: wires the stage nodes into a graph, seeds the
//! initial state from an inbound [`Request`], runs it to completion, and
//! hands back the assembled [`PipelineResult`].
//!
//! This is the crate's top-level entry point for turning a natural-language
//! request into a deployed (or best-effort) preview — everything else
//! (the graph engine, the provider router, the activity runtime) is
//! plumbing this module assembles into one fixed stage order.

pub mod collaborators;
pub mod request;
pub mod result;
pub mod stages;

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

use crate::app::App;
use crate::config::Settings;
use crate::drops::{DropSink, HttpDropSink};
use crate::graphs::GraphBuilder;
use crate::node::NodeError;
use crate::pipeline::collaborators::CollaboratorClient;
use crate::pipeline::request::Request;
use crate::pipeline::result::PipelineResult;
use crate::pipeline::stages::delivery::{
    ClusterDeployNode, ContainerBuildNode, FilesCompileNode, HealthVerifyNode, PreviewPublishNode,
    SummaryNode,
};
use crate::pipeline::stages::generation::{
    CodeGenerateNode, FrdNode, ParseRequirementsNode, ProjectStructureNode, PromptEnhanceNode,
};
use crate::pipeline::stages::quality::{
    DependencyResolveNode, DocumentationNode, PerformanceAnalyzeNode, SecurityScanNode,
    SemanticValidateNode, TestPlanNode, TestsGenerateNode,
};
use crate::provider::{registry_from_settings, ProviderRouter};
use crate::runtimes::runner::RunnerError;
use crate::state::VersionedState;
use crate::types::NodeKind;
use crate::utils::collections::ExtraMapExt;
use crate::utils::id_generator::IdGenerator;

/// Handles shared by every stage node: the provider router, the HTTP client
/// for collaborator services, the drop sink, and the resolved settings.
/// Cheap to clone — everything inside is an `Arc` or a pooled client.
#[derive(Clone)]
pub struct PipelineServices {
    pub router: Arc<ProviderRouter>,
    pub collaborators: CollaboratorClient,
    pub drop_sink: Arc<dyn DropSink>,
    pub settings: Arc<Settings>,
}

impl PipelineServices {
    /// Builds every collaborator from a resolved [`Settings`]: one HTTP
    /// client shared between the collaborator client and the drop sink, one
    /// provider registry entry per configured provider tag.
    #[must_use]
    pub fn from_settings(settings: Settings) -> Self {
        let client = reqwest::Client::new();
        let registry = registry_from_settings(&settings);
        let router = Arc::new(ProviderRouter::new(registry));
        let collaborators = CollaboratorClient::new(client.clone(), settings.collaborators_base_url.clone());
        let drop_sink: Arc<dyn DropSink> = Arc::new(HttpDropSink::new(client, settings.drop_store_url.clone()));
        Self { router, collaborators, drop_sink, settings: Arc::new(settings) }
    }
}

/// Errors surfaced by running a request through the pipeline.
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Runner(#[from] RunnerError),

    #[error("graph run completed without a pipeline_result in the extra channel")]
    #[diagnostic(code(weavegraph::pipeline::missing_result))]
    MissingResult,

    #[error("failed to decode the terminal pipeline result: {0}")]
    #[diagnostic(code(weavegraph::pipeline::decode))]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Node(#[from] NodeError),
}

/// The fixed stage order: each entry is the `NodeKind::Custom` tag every
/// stage node emits its drops and error events under. `Start` feeds the
/// first entry; the last entry (`summary`) feeds `End`.
const STAGE_ORDER: &[&str] = &[
    "prompt-enhance",
    "frd",
    "parse-requirements",
    "project-structure",
    "code-generate",
    "semantic-validate",
    "dependency-resolve",
    "test-plan",
    "tests-generate",
    "security-scan",
    "performance-analyze",
    "documentation",
    "files-compile",
    "container-build",
    "cluster-deploy",
    "health-verify",
    "preview-publish",
    "summary",
];

fn custom(stage: &str) -> NodeKind {
    NodeKind::Custom(stage.to_string())
}

/// Assembles the full pipeline graph: one node per [`STAGE_ORDER`] entry,
/// wired start-to-end in sequence. Stages that need to skip ahead on
/// failure (critical aborts, `container-build`/`cluster-deploy` fallthrough)
/// do so at runtime via frontier overrides, not via conditional edges —
/// the static graph is a straight line.
#[must_use]
pub fn build_app(services: PipelineServices) -> App {
    let mut builder = GraphBuilder::new()
        .add_node(custom("prompt-enhance"), PromptEnhanceNode { services: services.clone() })
        .add_node(custom("frd"), FrdNode { services: services.clone() })
        .add_node(custom("parse-requirements"), ParseRequirementsNode { services: services.clone() })
        .add_node(custom("project-structure"), ProjectStructureNode { services: services.clone() })
        .add_node(custom("code-generate"), CodeGenerateNode { services: services.clone() })
        .add_node(custom("semantic-validate"), SemanticValidateNode { services: services.clone() })
        .add_node(custom("dependency-resolve"), DependencyResolveNode { services: services.clone() })
        .add_node(custom("test-plan"), TestPlanNode { services: services.clone() })
        .add_node(custom("tests-generate"), TestsGenerateNode { services: services.clone() })
        .add_node(custom("security-scan"), SecurityScanNode { services: services.clone() })
        .add_node(custom("performance-analyze"), PerformanceAnalyzeNode { services: services.clone() })
        .add_node(custom("documentation"), DocumentationNode { services: services.clone() })
        .add_node(custom("files-compile"), FilesCompileNode { services: services.clone() })
        .add_node(custom("container-build"), ContainerBuildNode { services: services.clone() })
        .add_node(custom("cluster-deploy"), ClusterDeployNode { services: services.clone() })
        .add_node(custom("health-verify"), HealthVerifyNode { services: services.clone() })
        .add_node(custom("preview-publish"), PreviewPublishNode { services: services.clone() })
        .add_node(custom("summary"), SummaryNode { services: services.clone() })
        .add_edge(NodeKind::Start, custom(STAGE_ORDER[0]))
        .add_edge(custom("summary"), NodeKind::End);

    for pair in STAGE_ORDER.windows(2) {
        builder = builder.add_edge(custom(pair[0]), custom(pair[1]));
    }

    builder.compile()
}

/// Seeds a fresh [`VersionedState`] for a run: the request's prompt becomes
/// the first user message, and the request itself plus a freshly-minted
/// workflow id are stored in the `extra` channel for every stage to read
/// back via [`stages::extract_request`]/[`stages::extract_workflow_id`].
#[must_use]
pub fn build_initial_state(request: &Request) -> VersionedState {
    let mut state = VersionedState::new_with_user_message(&request.prompt);
    state.add_extra("request", serde_json::to_value(request).expect("Request always serializes"));
    let workflow_id = IdGenerator::new().generate_run_id();
    state.add_extra("workflow_id", serde_json::Value::String(workflow_id));
    state
}

/// Runs one request through the full pipeline: builds the graph, seeds the
/// state, invokes it to completion, persists every drop the run produced,
/// and decodes the terminal [`PipelineResult`] the summary stage leaves in
/// the `extra` channel.
#[tracing::instrument(skip(services, request), fields(request_id = %request.id))]
pub async fn run(services: PipelineServices, request: Request) -> Result<PipelineResult, PipelineError> {
    let app = build_app(services.clone());
    let initial_state = build_initial_state(&request);
    let final_state = app.invoke(initial_state).await?;
    let snapshot = final_state.snapshot();

    for drop in &snapshot.drops {
        if let Err(err) = services.drop_sink.store(drop).await {
            tracing::warn!(drop_id = %drop.id, error = %err, "failed to persist drop");
        }
    }

    let raw = snapshot.extra.get("pipeline_result").ok_or(PipelineError::MissingResult)?;
    let mut result: PipelineResult = serde_json::from_value(raw.clone())?;
    result.drops = snapshot.drops.clone();
    result.files = snapshot.files.clone();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_starts_and_ends_where_expected() {
        assert_eq!(STAGE_ORDER.first(), Some(&"prompt-enhance"));
        assert_eq!(STAGE_ORDER.last(), Some(&"summary"));
        assert_eq!(STAGE_ORDER.len(), 18);
    }

    #[test]
    fn build_initial_state_seeds_request_and_workflow_id() {
        let request = Request::new("req-1", "build a thing", "python");
        let state = build_initial_state(&request);
        let snapshot = state.snapshot();
        assert!(snapshot.extra.contains_key("request"));
        assert!(snapshot.extra.contains_key("workflow_id"));
        assert_eq!(snapshot.messages.len(), 1);
    }
}
