//! Stages 6 through 12: semantic validation (with its bounded feedback-repair
//! loop), dependency resolution, test planning, test generation, security
//! scanning, performance analysis, and documentation.
//!
//! All seven stages are non-critical: a failure in any of them is logged and
//! the pipeline continues with whatever partial result that stage leaves
//! behind (spec scenario S4).

use async_trait::async_trait;
use chrono::Utc;

use crate::activity::{execute_activity, ActivityError};
use crate::drops::{Drop, DropType};
use crate::message::Message;
use crate::node::{Node, NodeContext, NodeError, NodePartial};
use crate::pipeline::collaborators::{
    DependencyResolveRequest, DependencyResolveResponse, PerformanceAnalyzeRequest,
    PerformanceAnalyzeResponse, SecurityScanRequest, SecurityScanResponse,
};
use crate::pipeline::result::{FileKind, GeneratedFile};
use crate::pipeline::stages::{
    activity_options, bump_total_tokens, default_model, extract_request, extract_workflow_id,
    non_critical_failure, read_validation, test_file_path,
};
use crate::pipeline::PipelineServices;
use crate::provider::types::CompletionRequest;
use crate::state::StateSnapshot;
use crate::utils::collections::{new_extra_map, ExtraMapExt};

/// Bound on the semantic-validate/feedback-repair cycle (spec design note:
/// "implement as a bounded-iteration counter, not recursion, to keep replay
/// deterministic").
const MAX_REPAIR_ITERATIONS: u32 = 3;

fn estimated_tokens(text: &str) -> i64 {
    (text.len() as i64) / 4
}

/// Stages 6 + 6.1 combined: validates the main generated file and, on
/// failure, asks the LLM to repair it and re-validates — bounded to
/// [`MAX_REPAIR_ITERATIONS`] rounds rather than looping the graph itself.
pub struct SemanticValidateNode {
    pub services: PipelineServices,
}

impl SemanticValidateNode {
    async fn validate(&self, content: &str, language: &str) -> Result<(bool, Vec<String>), ActivityError> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            content: &'a str,
            language: &'a str,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            valid: bool,
            #[serde(default)]
            issues: Vec<String>,
        }

        let options = activity_options(&self.services, "semantic-validate");
        let body = Req { content, language };
        let response: Resp = execute_activity(&options, || {
            self.services
                .collaborators
                .call::<_, Resp>("semantic-validate", "/semantic-validate", &options.attempt_id, &body)
        })
        .await?;
        Ok((response.valid, response.issues))
    }

    async fn repair(&self, content: &str, issues: &[String], language: &str) -> Result<(String, i64), ActivityError> {
        let options = activity_options(&self.services, "feedback-repair");
        let model = default_model(&self.services);
        let system_prompt = format!(
            "Fix the following {language} source so it addresses every listed issue. Return only the corrected source.\nIssues:\n{}",
            issues.join("\n")
        );
        let messages = vec![Message::system(&system_prompt), Message::user(content)];
        let completion = CompletionRequest::new(model, messages).ok_or_else(|| ActivityError::Permanent {
            name: "feedback-repair".to_string(),
            message: "empty content".to_string(),
        })?;

        let response = execute_activity(&options, || async {
            self.services
                .router
                .complete(&completion, &crate::provider::RoutingPreferences::default(), "feedback-repair", Utc::now().timestamp() as u64)
                .await
                .map_err(|err| ActivityError::Transient { name: "feedback-repair".to_string(), message: err.to_string() })
        })
        .await?;

        let repaired = response.first_message_content();
        let repaired = if repaired.is_empty() { content.to_string() } else { repaired.to_string() };
        let tokens = response.usage.total_tokens.max(estimated_tokens(&repaired));
        Ok((repaired, tokens))
    }
}

#[async_trait]
impl Node for SemanticValidateNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let request = extract_request(&snapshot)?;
        let main_file_path = snapshot
            .extra
            .get_string("main_file_path")
            .ok_or(NodeError::MissingInput { what: "main_file_path" })?
            .to_string();
        let mut content = snapshot
            .extra
            .get_string("main_file_content")
            .ok_or(NodeError::MissingInput { what: "main_file_content" })?
            .to_string();

        let mut validation = read_validation(&snapshot);
        let mut total_tokens = 0i64;
        let mut repair_attempts = 0u32;

        for _ in 0..MAX_REPAIR_ITERATIONS {
            match self.validate(&content, &request.language).await {
                Ok((true, _)) => {
                    validation.semantic_valid = true;
                    validation.semantic_issues.clear();
                    break;
                }
                Ok((false, issues)) => {
                    validation.semantic_valid = false;
                    validation.semantic_issues = issues.clone();
                    if repair_attempts >= MAX_REPAIR_ITERATIONS - 1 {
                        break;
                    }
                    match self.repair(&content, &issues, &request.language).await {
                        Ok((repaired, tokens)) => {
                            content = repaired;
                            total_tokens += tokens;
                            repair_attempts += 1;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "feedback-repair failed, keeping last validated content");
                            break;
                        }
                    }
                }
                Err(err) => {
                    let mut fallback = new_extra_map();
                    fallback.insert("validation".to_string(), serde_json::to_value(&validation).unwrap_or_default());
                    return Ok(non_critical_failure("semantic-validate", ctx.step, err.to_string(), fallback));
                }
            }
        }
        validation.repair_attempts = repair_attempts;

        ctx.emit(
            "semantic-validate",
            format!("semantic_valid={} after {repair_attempts} repair attempt(s)", validation.semantic_valid),
        )?;

        let mut extra = new_extra_map();
        extra
            .insert("validation".to_string(), serde_json::to_value(&validation).map_err(NodeError::Serde)?)
            .insert_string("main_file_content", content.clone())
            .insert_number("total_tokens", bump_total_tokens(&snapshot, total_tokens));

        let mut partial = NodePartial::new().with_extra(extra);
        if repair_attempts > 0 {
            let file = GeneratedFile::new(main_file_path, content, request.language, FileKind::Source);
            partial = partial.with_files(vec![file]);
        }
        Ok(partial)
    }
}

/// Stage 7: resolves a dependency manifest for the generated code.
pub struct DependencyResolveNode {
    pub services: PipelineServices,
}

#[async_trait]
impl Node for DependencyResolveNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let request = extract_request(&snapshot)?;
        let content = snapshot.extra.get_string("main_file_content").unwrap_or_default().to_string();

        let options = activity_options(&self.services, "dependency-resolve");
        let body = DependencyResolveRequest {
            content: &content,
            language: &request.language,
            framework: &request.framework,
        };
        let outcome = execute_activity(&options, || {
            self.services.collaborators.call::<_, DependencyResolveResponse>(
                "dependency-resolve",
                "/dependency-resolve",
                &options.attempt_id,
                &body,
            )
        })
        .await;

        match outcome {
            Ok(response) => {
                ctx.emit("dependency-resolve", format!("resolved {} dependencies", response.dependencies.len()))?;
                let mut extra = new_extra_map();
                extra.insert(
                    "dependencies".to_string(),
                    serde_json::to_value(&response.dependencies).map_err(NodeError::Serde)?,
                );
                let manifest = GeneratedFile::new(
                    response.package_file_name,
                    response.package_file_content,
                    request.language.clone(),
                    FileKind::Config,
                );
                Ok(NodePartial::new().with_extra(extra).with_files(vec![manifest]))
            }
            Err(err) => {
                let mut fallback = new_extra_map();
                fallback.insert("dependencies".to_string(), serde_json::json!([]));
                Ok(non_critical_failure("dependency-resolve", ctx.step, err.to_string(), fallback))
            }
        }
    }
}

/// Stage 8: drafts a test plan describing what the generated tests should
/// cover. Always runs, regardless of `tests_required`.
pub struct TestPlanNode {
    pub services: PipelineServices,
}

#[async_trait]
impl Node for TestPlanNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let request = extract_request(&snapshot)?;
        let workflow_id = extract_workflow_id(&snapshot)?;
        let content = snapshot.extra.get_string("main_file_content").unwrap_or_default().to_string();

        let options = activity_options(&self.services, "test-plan");
        let model = default_model(&self.services);
        let system_prompt = format!("Draft a test plan (markdown) for the following {} source.", request.language);
        let messages = vec![Message::system(&system_prompt), Message::user(&content)];
        let completion = CompletionRequest::new(model, messages)
            .ok_or_else(|| NodeError::Provider { provider: "router", message: "empty content".to_string() })?;

        let outcome = execute_activity(&options, || async {
            self.services
                .router
                .complete(&completion, &request.preferences.routing_preferences(), &request.id, Utc::now().timestamp() as u64)
                .await
                .map_err(|err| ActivityError::Transient { name: "test-plan".to_string(), message: err.to_string() })
        })
        .await;

        match outcome {
            Ok(response) => {
                let plan = response.first_message_content().to_string();
                let tokens = response.usage.total_tokens.max(estimated_tokens(&plan));
                let drop = Drop::new(&request.id, &workflow_id, "test-plan", plan.clone(), DropType::TestPlan);
                ctx.emit("test-plan", "test plan drafted")?;

                let mut extra = new_extra_map();
                extra
                    .insert_string("test_plan", plan)
                    .insert_number("total_tokens", bump_total_tokens(&snapshot, tokens));
                Ok(NodePartial::new().with_drops(vec![drop]).with_extra(extra))
            }
            Err(err) => Ok(non_critical_failure("test-plan", ctx.step, err.to_string(), new_extra_map())),
        }
    }
}

/// Stage 9: generates tests from the test plan, only when the request asked
/// for them.
pub struct TestsGenerateNode {
    pub services: PipelineServices,
}

#[async_trait]
impl Node for TestsGenerateNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let request = extract_request(&snapshot)?;
        if !request.preferences.tests_required {
            ctx.emit("tests-generate", "tests not requested, skipping")?;
            return Ok(NodePartial::new());
        }

        let workflow_id = extract_workflow_id(&snapshot)?;
        let content = snapshot.extra.get_string("main_file_content").unwrap_or_default().to_string();
        let plan = snapshot.extra.get_string("test_plan").unwrap_or_default().to_string();
        let main_file_path = snapshot.extra.get_string("main_file_path").unwrap_or("main").to_string();

        let options = activity_options(&self.services, "tests-generate");
        let model = default_model(&self.services);
        let system_prompt = format!(
            "Write tests for the following {} source, following this test plan. Return only the test file's source code.\nTest plan:\n{plan}",
            request.language
        );
        let messages = vec![Message::system(&system_prompt), Message::user(&content)];
        let completion = CompletionRequest::new(model, messages)
            .ok_or_else(|| NodeError::Provider { provider: "router", message: "empty content".to_string() })?;

        let outcome = execute_activity(&options, || async {
            self.services
                .router
                .complete(&completion, &request.preferences.routing_preferences(), &request.id, Utc::now().timestamp() as u64)
                .await
                .map_err(|err| ActivityError::Transient { name: "tests-generate".to_string(), message: err.to_string() })
        })
        .await;

        match outcome {
            Ok(response) => {
                let tests_source = response.first_message_content().to_string();
                let tokens = response.usage.total_tokens.max(estimated_tokens(&tests_source));
                let path = test_file_path(&main_file_path);
                let drop = Drop::new(&request.id, &workflow_id, "tests-generate", path.clone(), DropType::Tests);
                ctx.emit("tests-generate", "tests generated")?;

                let file = GeneratedFile::new(path, tests_source, request.language.clone(), FileKind::Test);
                let mut extra = new_extra_map();
                extra.insert_number("total_tokens", bump_total_tokens(&snapshot, tokens));
                Ok(NodePartial::new().with_drops(vec![drop]).with_files(vec![file]).with_extra(extra))
            }
            Err(err) => Ok(non_critical_failure("tests-generate", ctx.step, err.to_string(), new_extra_map())),
        }
    }
}

/// Stage 10: scans the generated code for security issues.
pub struct SecurityScanNode {
    pub services: PipelineServices,
}

#[async_trait]
impl Node for SecurityScanNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let request = extract_request(&snapshot)?;
        let content = snapshot.extra.get_string("main_file_content").unwrap_or_default().to_string();
        let dependencies: Vec<String> = snapshot
            .extra
            .get("dependencies")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();

        let options = activity_options(&self.services, "security-scan");
        let body = SecurityScanRequest { content: &content, language: &request.language, dependencies: &dependencies };
        let outcome = execute_activity(&options, || {
            self.services
                .collaborators
                .call::<_, SecurityScanResponse>("security-scan", "/security-scan", &options.attempt_id, &body)
        })
        .await;

        let mut validation = read_validation(&snapshot);
        match outcome {
            Ok(response) => {
                validation.security_score = Some(response.score);
                validation.security_issues = response.issues;
                ctx.emit("security-scan", format!("security score {}", response.score))?;
                let mut extra = new_extra_map();
                extra.insert("validation".to_string(), serde_json::to_value(&validation).map_err(NodeError::Serde)?);
                Ok(NodePartial::new().with_extra(extra))
            }
            Err(err) => {
                let mut fallback = new_extra_map();
                fallback.insert("validation".to_string(), serde_json::to_value(&validation).unwrap_or_default());
                Ok(non_critical_failure("security-scan", ctx.step, err.to_string(), fallback))
            }
        }
    }
}

/// Stage 11: analyzes the generated code for performance concerns.
pub struct PerformanceAnalyzeNode {
    pub services: PipelineServices,
}

#[async_trait]
impl Node for PerformanceAnalyzeNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let request = extract_request(&snapshot)?;
        let content = snapshot.extra.get_string("main_file_content").unwrap_or_default().to_string();

        let options = activity_options(&self.services, "performance-analyze");
        let body = PerformanceAnalyzeRequest { content: &content, language: &request.language, kind: &request.kind };
        let outcome = execute_activity(&options, || {
            self.services.collaborators.call::<_, PerformanceAnalyzeResponse>(
                "performance-analyze",
                "/performance-analyze",
                &options.attempt_id,
                &body,
            )
        })
        .await;

        let mut validation = read_validation(&snapshot);
        match outcome {
            Ok(response) => {
                validation.performance_score = Some(response.score);
                validation.performance_notes = response.notes;
                ctx.emit("performance-analyze", format!("performance score {}", response.score))?;
                let mut extra = new_extra_map();
                extra.insert("validation".to_string(), serde_json::to_value(&validation).map_err(NodeError::Serde)?);
                Ok(NodePartial::new().with_extra(extra))
            }
            Err(err) => {
                let mut fallback = new_extra_map();
                fallback.insert("validation".to_string(), serde_json::to_value(&validation).unwrap_or_default());
                Ok(non_critical_failure("performance-analyze", ctx.step, err.to_string(), fallback))
            }
        }
    }
}

/// Stage 12: writes the project's README.
pub struct DocumentationNode {
    pub services: PipelineServices,
}

#[async_trait]
impl Node for DocumentationNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let request = extract_request(&snapshot)?;
        let workflow_id = extract_workflow_id(&snapshot)?;
        let content = snapshot.extra.get_string("main_file_content").unwrap_or_default().to_string();
        let dependencies: Vec<String> = snapshot
            .extra
            .get("dependencies")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();

        let model = default_model(&self.services);
        let system_prompt = format!(
            "Write a README.md for this {} project. Dependencies: {}. Describe what it does and how to run it.",
            request.language,
            dependencies.join(", ")
        );
        let messages = vec![Message::system(&system_prompt), Message::user(&content)];
        let completion = CompletionRequest::new(model, messages)
            .ok_or_else(|| NodeError::Provider { provider: "router", message: "empty content".to_string() })?;

        // `complete_or_degrade` never returns an Err, so documentation is the one
        // LLM-routed stage that doesn't need `non_critical_failure`: a provider
        // outage still produces a file, just a canned one.
        let response = self
            .services
            .router
            .complete_or_degrade(&completion, &request.preferences.routing_preferences(), &request.id, Utc::now().timestamp() as u64)
            .await;

        let degraded = response.error.is_some();
        let readme = response.first_message_content().to_string();
        let tokens = response.usage.total_tokens.max(estimated_tokens(&readme));
        let drop = Drop::new(&request.id, &workflow_id, "documentation", readme.clone(), DropType::Documentation)
            .with_metadata(std::collections::HashMap::from([("degraded".to_string(), serde_json::json!(degraded))]));
        ctx.emit("documentation", if degraded { "README generation degraded to a canned response" } else { "README drafted" })?;

        let file = GeneratedFile::new("README.md", readme.clone(), "markdown", FileKind::Documentation);
        let mut extra = new_extra_map();
        extra
            .insert_string("documentation", readme)
            .insert_number("total_tokens", bump_total_tokens(&snapshot, tokens))
            .insert_bool("documentation_degraded", degraded);
        Ok(NodePartial::new().with_drops(vec![drop]).with_files(vec![file]).with_extra(extra))
    }
}
