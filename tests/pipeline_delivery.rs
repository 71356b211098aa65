//! Integration tests for the delivery stages (files-compile through
//! summary): the container-build/cluster-deploy skip-ahead behavior, the
//! preview-publish fallback, and the summary stage's success-rule wiring.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use rustc_hash::FxHashMap;
use serde_json::json;

use weavegraph::config::Settings;
use weavegraph::control::FrontierCommand;
use weavegraph::drops::InMemoryDropSink;
use weavegraph::event_bus::EventBus;
use weavegraph::node::{Node, NodeContext};
use weavegraph::pipeline::collaborators::CollaboratorClient;
use weavegraph::pipeline::request::Request;
use weavegraph::pipeline::stages::delivery::{
    ContainerBuildNode, FilesCompileNode, PreviewPublishNode, SummaryNode,
};
use weavegraph::pipeline::PipelineServices;
use weavegraph::provider::{registry_from_settings, ProviderRouter};
use weavegraph::state::{StateSnapshot, VersionedState};
use weavegraph::types::NodeKind;
use weavegraph::utils::collections::ExtraMapExt;

fn test_settings(collaborators_base_url: String) -> Settings {
    Settings {
        primary_provider: "openai".to_string(),
        fallback_providers: vec![],
        enabled_providers: vec![],
        providers: vec![],
        activity_timeout: Duration::from_secs(2),
        stage_retry_count: 1,
        drop_store_url: "http://localhost:0/drops".to_string(),
        collaborators_base_url,
        metrics_port: 0,
        trace_endpoint: None,
        min_success_content_len: 100,
        min_success_security_score: 50,
        count_degraded_as_call: false,
        breaker_half_open_max: 1,
        breaker_min_requests: 10,
        breaker_trip_ratio: 0.5,
        breaker_reset_timeout: Duration::from_secs(30),
    }
}

fn test_services(collaborators_base_url: String) -> PipelineServices {
    let settings = test_settings(collaborators_base_url.clone());
    let registry = registry_from_settings(&settings);
    let client = reqwest::Client::new();
    PipelineServices {
        router: Arc::new(ProviderRouter::new(registry)),
        collaborators: CollaboratorClient::new(client, collaborators_base_url),
        drop_sink: Arc::new(InMemoryDropSink::new()),
        settings: Arc::new(settings),
    }
}

fn test_ctx(node_id: &str, step: u64) -> NodeContext {
    let bus = EventBus::default();
    NodeContext { node_id: node_id.to_string(), step, event_emitter: bus.get_emitter() }
}

fn snapshot_with_extra(extra: FxHashMap<String, serde_json::Value>) -> StateSnapshot {
    let mut state = VersionedState::new_with_user_message("build a thing");
    for (key, value) in extra {
        let _ = state.add_extra(&key, value);
    }
    state.snapshot()
}

fn seeded_extra(request: &Request, workflow_id: &str) -> FxHashMap<String, serde_json::Value> {
    let mut extra = FxHashMap::default();
    extra.insert("request".to_string(), serde_json::to_value(request).unwrap());
    extra.insert("workflow_id".to_string(), json!(workflow_id));
    extra
}

#[tokio::test]
async fn files_compile_fails_non_critically_when_nothing_was_generated() {
    let services = test_services("http://localhost:0".to_string());
    let request = Request::new("req-1", "build a thing", "python");
    let snapshot = snapshot_with_extra(seeded_extra(&request, "run-1"));
    let node = FilesCompileNode { services };

    let partial = node.run(snapshot, test_ctx("files-compile", 1)).await.unwrap();
    assert!(partial.errors.is_some(), "empty file set should log a non-critical error");
    assert_eq!(partial.drops.as_ref().unwrap().len(), 1);
    assert_eq!(partial.drops.unwrap()[0].stage, "files-compile");
}

#[tokio::test]
async fn container_build_failure_skips_straight_to_preview_publish() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/container-build");
        then.status(500).json_body(json!({"code": "internal_error", "message": "builder unavailable"}));
    });

    let services = test_services(server.base_url());
    let request = Request::new("req-2", "build a thing", "python");
    let mut extra = seeded_extra(&request, "run-2");
    extra.insert("dependencies".to_string(), json!([]));
    let snapshot = snapshot_with_extra(extra);
    let node = ContainerBuildNode { services };

    let partial = node.run(snapshot, test_ctx("container-build", 14)).await.unwrap();
    mock.assert_hits(1);
    assert!(partial.errors.is_some());

    let frontier = partial.frontier.expect("a failed container-build must override the frontier");
    match frontier {
        FrontierCommand::Replace(routes) => {
            assert_eq!(routes.len(), 1);
            assert_eq!(routes[0].to_node_kind(), NodeKind::Custom("preview-publish".to_string()));
        }
        FrontierCommand::Append(_) => panic!("expected a frontier replace, not an append"),
    }
}

#[tokio::test]
async fn preview_publish_falls_back_when_the_publisher_is_unreachable() {
    // Port 1 is reserved and never listens locally, so every attempt fails fast.
    let services = test_services("http://127.0.0.1:1".to_string());
    let request = Request::new("req-3", "build a thing", "python");
    let snapshot = snapshot_with_extra(seeded_extra(&request, "run-3"));
    let node = PreviewPublishNode { services };

    let partial = node.run(snapshot, test_ctx("preview-publish", 17)).await.unwrap();
    let extra = partial.extra.expect("preview-publish always stores a preview_url");
    let preview_url = extra.get_string("preview_url").unwrap();
    assert_eq!(preview_url, "https://preview.internal.example/w/run-3");
    assert!(partial.drops.is_none(), "preview-publish does not emit a drop");
}

#[tokio::test]
async fn summary_marks_success_when_content_is_long_enough_and_clean() {
    let services = test_services("http://localhost:0".to_string());
    let request = Request::new("req-4", "build a thing", "python");
    let mut extra = seeded_extra(&request, "run-4");
    extra.insert("main_file_content".to_string(), json!("x".repeat(200)));
    extra.insert(
        "validation".to_string(),
        json!({
            "semantic_valid": true,
            "semantic_issues": [],
            "repair_attempts": 0,
            "security_score": 90,
            "security_issues": [],
            "performance_score": 80,
            "performance_notes": [],
        }),
    );
    extra.insert("code_path".to_string(), json!("intelligent"));
    extra.insert("generated_file_count".to_string(), json!(2));
    extra.insert("total_tokens".to_string(), json!(1000));
    let snapshot = snapshot_with_extra(extra);
    let node = SummaryNode { services };

    let partial = node.run(snapshot, test_ctx("summary", 18)).await.unwrap();
    let extra = partial.extra.unwrap();
    let raw_result = extra.get("pipeline_result").unwrap();
    let result: weavegraph::pipeline::result::PipelineResult = serde_json::from_value(raw_result.clone()).unwrap();

    assert!(result.success);
    assert!(!result.masked_semantic_error);
    assert_eq!(result.metrics.llm_call_count, 5); // 2 generated files + 3
    assert_eq!(result.metrics.total_tokens, 1000);

    let drop = partial.drops.unwrap();
    assert_eq!(drop.len(), 1);
    assert_eq!(drop[0].stage, "summary");
}

#[tokio::test]
async fn summary_reports_masked_semantic_error_when_live_url_rescues_success() {
    let services = test_services("http://localhost:0".to_string());
    let request = Request::new("req-5", "build a thing", "python");
    let mut extra = seeded_extra(&request, "run-5");
    extra.insert("main_file_content".to_string(), json!("x".repeat(200)));
    extra.insert(
        "validation".to_string(),
        json!({
            "semantic_valid": false,
            "semantic_issues": ["unresolved import"],
            "repair_attempts": 3,
            "security_score": null,
            "security_issues": [],
            "performance_score": null,
            "performance_notes": [],
        }),
    );
    extra.insert(
        "deployment".to_string(),
        json!({
            "image_ref": "registry/app:run-5",
            "namespace": "preview-run-5",
            "live_url": "https://preview.internal.example/app",
            "dashboard_url": null,
            "deployment_id": "deploy-1",
            "expiry": null,
            "healthy": true,
        }),
    );
    let snapshot = snapshot_with_extra(extra);
    let node = SummaryNode { services };

    let partial = node.run(snapshot, test_ctx("summary", 18)).await.unwrap();
    let extra = partial.extra.unwrap();
    let raw_result = extra.get("pipeline_result").unwrap();
    let result: weavegraph::pipeline::result::PipelineResult = serde_json::from_value(raw_result.clone()).unwrap();

    assert!(result.success, "a live deployment should rescue success despite the semantic error");
    assert!(result.masked_semantic_error);
    assert_eq!(result.metrics.llm_call_count, 5); // fallback path, no code_path set
}
