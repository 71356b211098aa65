//! Stages 1–5: prompt enhancement, FRD drafting, requirements parsing,
//! project scaffolding, and code generation.
//!
//! `parse-requirements` is the pipeline's first critical stage — a failure
//! here means there is nothing coherent to build, so it aborts straight to
//! `summary` (spec scenario S3). `code-generate` is critical in a softer
//! sense: the intelligent multi-file path must fall back to a single-call
//! path before the run gives up, so *some* code is produced whenever
//! humanly (well, LLM-ly) possible.

use async_trait::async_trait;
use chrono::Utc;

use crate::activity::{execute_activity, ActivityError};
use crate::channels::errors::{ErrorEvent, LadderError};
use crate::drops::{Drop, DropType};
use crate::message::Message;
use crate::node::{Node, NodeContext, NodeError, NodePartial};
use crate::pipeline::collaborators::{
    default_file_kind, ParseRequirementsRequest, ParseRequirementsResponse, ProjectStructureRequest,
    ProjectStructureResponse,
};
use crate::pipeline::result::{FileKind, GeneratedFile};
use crate::pipeline::stages::{
    activity_options, bump_total_tokens, critical_failure, default_model, extract_request,
    extract_workflow_id, non_critical_failure,
};
use crate::pipeline::PipelineServices;
use crate::provider::types::CompletionRequest;
use crate::state::StateSnapshot;
use crate::utils::collections::{new_extra_map, ExtraMapExt};

fn estimated_tokens(text: &str) -> i64 {
    (text.len() as i64) / 4
}

/// Stage 1: rewrites the caller's raw prompt into a clearer, more specific
/// engineering brief. Non-critical — on failure the pipeline just proceeds
/// with the original prompt.
pub struct PromptEnhanceNode {
    pub services: PipelineServices,
}

#[async_trait]
impl Node for PromptEnhanceNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let request = extract_request(&snapshot)?;
        let workflow_id = extract_workflow_id(&snapshot)?;

        let options = activity_options(&self.services, "prompt-enhance");
        let model = default_model(&self.services);
        let messages = vec![
            Message::system(
                "Rewrite the user's software request into a precise, unambiguous engineering brief. Return only the rewritten brief.",
            ),
            Message::user(&request.prompt),
        ];
        let completion = CompletionRequest::new(model, messages)
            .ok_or_else(|| NodeError::Provider { provider: "router", message: "empty prompt".to_string() })?;

        let outcome = execute_activity(&options, || async {
            let preferences = request.preferences.routing_preferences();
            self.services
                .router
                .complete(&completion, &preferences, &request.id, Utc::now().timestamp() as u64)
                .await
                .map_err(|err| ActivityError::Transient { name: "prompt-enhance".to_string(), message: err.to_string() })
        })
        .await;

        match outcome {
            Ok(response) => {
                let content = response.first_message_content();
                let enhanced = if content.is_empty() { request.prompt.clone() } else { content.to_string() };
                let tokens = response
                    .usage
                    .total_tokens
                    .max(estimated_tokens(&enhanced) + estimated_tokens(&request.prompt));
                let drop = Drop::new(&request.id, &workflow_id, "prompt-enhance", enhanced.clone(), DropType::Prompt);
                ctx.emit("prompt-enhance", "prompt rewritten")?;

                let mut extra = new_extra_map();
                extra
                    .insert_string("enhanced_prompt", enhanced)
                    .insert_number("total_tokens", bump_total_tokens(&snapshot, tokens))
                    .insert_string("last_provider", response.provider.clone())
                    .insert_string("last_model", response.model.clone());
                Ok(NodePartial::new().with_drops(vec![drop]).with_extra(extra))
            }
            Err(err) => {
                let mut fallback = new_extra_map();
                fallback.insert_string("enhanced_prompt", request.prompt.clone());
                Ok(non_critical_failure("prompt-enhance", ctx.step, err.to_string(), fallback))
            }
        }
    }
}

/// Stage 2: drafts a functional requirements document. Non-critical.
pub struct FrdNode {
    pub services: PipelineServices,
}

#[async_trait]
impl Node for FrdNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let request = extract_request(&snapshot)?;
        let workflow_id = extract_workflow_id(&snapshot)?;
        let prompt = snapshot.extra.get_string("enhanced_prompt").unwrap_or(&request.prompt).to_string();

        let options = activity_options(&self.services, "frd");
        let model = default_model(&self.services);
        let messages = vec![
            Message::system("Draft a concise functional requirements document (markdown) for the described software."),
            Message::user(&prompt),
        ];
        let completion = CompletionRequest::new(model, messages)
            .ok_or_else(|| NodeError::Provider { provider: "router", message: "empty prompt".to_string() })?;

        let outcome = execute_activity(&options, || async {
            let preferences = request.preferences.routing_preferences();
            self.services
                .router
                .complete(&completion, &preferences, &request.id, Utc::now().timestamp() as u64)
                .await
                .map_err(|err| ActivityError::Transient { name: "frd".to_string(), message: err.to_string() })
        })
        .await;

        match outcome {
            Ok(response) => {
                let document = response.first_message_content().to_string();
                let tokens = response.usage.total_tokens.max(estimated_tokens(&document));
                let drop = Drop::new(&request.id, &workflow_id, "frd", document.clone(), DropType::Frd);
                ctx.emit("frd", "requirements document drafted")?;

                let mut extra = new_extra_map();
                extra
                    .insert_string("frd_document", document)
                    .insert_number("total_tokens", bump_total_tokens(&snapshot, tokens))
                    .insert_string("last_provider", response.provider.clone())
                    .insert_string("last_model", response.model.clone());
                Ok(NodePartial::new().with_drops(vec![drop]).with_extra(extra))
            }
            Err(err) => Ok(non_critical_failure("frd", ctx.step, err.to_string(), new_extra_map())),
        }
    }
}

/// Stage 3: parses the engineering brief into a structured requirements
/// record (main file path, test framework, entry point). **Critical** — a
/// failure here aborts the run (spec scenario S3); there is no dedicated
/// drop type for this stage.
pub struct ParseRequirementsNode {
    pub services: PipelineServices,
}

#[async_trait]
impl Node for ParseRequirementsNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let request = extract_request(&snapshot)?;
        let prompt = snapshot.extra.get_string("enhanced_prompt").unwrap_or(&request.prompt).to_string();

        let options = activity_options(&self.services, "parse-requirements");
        let body = ParseRequirementsRequest {
            prompt: &prompt,
            language: &request.language,
            framework: &request.framework,
            kind: &request.kind,
            context: &request.context,
        };

        let outcome = execute_activity(&options, || {
            self.services.collaborators.call::<_, ParseRequirementsResponse>(
                "parse-requirements",
                "/parse-requirements",
                &options.attempt_id,
                &body,
            )
        })
        .await;

        match outcome {
            Ok(response) => {
                ctx.emit("parse-requirements", "requirements parsed")?;
                let mut extra = new_extra_map();
                extra
                    .insert_string("main_file_path", response.main_file_path)
                    .insert_string("test_framework", response.test_framework)
                    .insert_string("entry_point", response.entry_point);
                Ok(NodePartial::new().with_extra(extra))
            }
            Err(err) => Ok(critical_failure("parse-requirements", ctx.step, err.to_string())),
        }
    }
}

/// Stage 4: scaffolds the project's file/directory layout. Non-critical;
/// failure leaves only the main file path known from stage 3.
pub struct ProjectStructureNode {
    pub services: PipelineServices,
}

#[async_trait]
impl Node for ProjectStructureNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let request = extract_request(&snapshot)?;
        let workflow_id = extract_workflow_id(&snapshot)?;
        let main_file_path = snapshot
            .extra
            .get_string("main_file_path")
            .ok_or(NodeError::MissingInput { what: "main_file_path" })?
            .to_string();

        let options = activity_options(&self.services, "project-structure");
        let body = ProjectStructureRequest {
            language: &request.language,
            framework: &request.framework,
            kind: &request.kind,
            main_file_path: &main_file_path,
        };

        let outcome = execute_activity(&options, || {
            self.services.collaborators.call::<_, ProjectStructureResponse>(
                "project-structure",
                "/project-structure",
                &options.attempt_id,
                &body,
            )
        })
        .await;

        match outcome {
            Ok(response) => {
                let artifact = serde_json::to_string(&response).map_err(NodeError::Serde)?;
                let drop = Drop::new(&request.id, &workflow_id, "project-structure", artifact, DropType::Structure);
                ctx.emit("project-structure", "project layout scaffolded")?;

                let mut extra = new_extra_map();
                extra.insert("structure_files".to_string(), serde_json::to_value(&response.files).map_err(NodeError::Serde)?);
                Ok(NodePartial::new().with_drops(vec![drop]).with_extra(extra))
            }
            Err(err) => {
                let mut fallback = new_extra_map();
                fallback.insert(
                    "structure_files".to_string(),
                    serde_json::to_value(vec![main_file_path]).expect("Vec<String> always serializes"),
                );
                Ok(non_critical_failure("project-structure", ctx.step, err.to_string(), fallback))
            }
        }
    }
}

/// Stage 5: generates source code. Tries the intelligent path — one LLM
/// call per scaffolded source file — first; if that path fails outright, it
/// falls back to a single call that generates just the main file. The run
/// only aborts (`critical_failure`) if both paths fail.
pub struct CodeGenerateNode {
    pub services: PipelineServices,
}

impl CodeGenerateNode {
    async fn generate_file(
        &self,
        request: &crate::pipeline::request::Request,
        path: &str,
        brief: &str,
    ) -> Result<(GeneratedFile, i64, String, String), ActivityError> {
        let options = activity_options(&self.services, "code-generate-file");
        let model = default_model(&self.services);
        let system_prompt = format!(
            "Generate the complete contents of `{path}` in {} for: {brief}. Return only the file's source code, no commentary.",
            request.language
        );
        let messages = vec![Message::system(&system_prompt), Message::user(&request.prompt)];
        let completion = CompletionRequest::new(model, messages)
            .ok_or_else(|| ActivityError::Permanent { name: "code-generate-file".to_string(), message: "empty prompt".to_string() })?;

        let response = execute_activity(&options, || async {
            let preferences = request.preferences.routing_preferences();
            self.services
                .router
                .complete(&completion, &preferences, &request.id, Utc::now().timestamp() as u64)
                .await
                .map_err(|err| ActivityError::Transient { name: "code-generate-file".to_string(), message: err.to_string() })
        })
        .await?;

        let content = response.first_message_content().to_string();
        let tokens = response.usage.total_tokens.max(estimated_tokens(&content));
        let file = GeneratedFile::new(path, content, request.language.clone(), default_file_kind(path));
        Ok((file, tokens, response.provider.clone(), response.model.clone()))
    }

    async fn generate_intelligent(
        &self,
        request: &crate::pipeline::request::Request,
        structure_files: &[String],
        brief: &str,
    ) -> Result<(Vec<GeneratedFile>, i64, String, String), ActivityError> {
        let source_paths: Vec<&String> = structure_files
            .iter()
            .filter(|path| default_file_kind(path) == FileKind::Source)
            .collect();
        if source_paths.is_empty() {
            return Err(ActivityError::Permanent {
                name: "code-generate".to_string(),
                message: "no source files in scaffolded structure".to_string(),
            });
        }

        let mut files = Vec::with_capacity(source_paths.len());
        let mut total_tokens = 0i64;
        let mut provider = String::new();
        let mut model = String::new();
        for path in source_paths {
            let (file, tokens, used_provider, used_model) = self.generate_file(request, path, brief).await?;
            total_tokens += tokens;
            provider = used_provider;
            model = used_model;
            files.push(file);
        }
        Ok((files, total_tokens, provider, model))
    }
}

#[async_trait]
impl Node for CodeGenerateNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<NodePartial, NodeError> {
        let request = extract_request(&snapshot)?;
        let workflow_id = extract_workflow_id(&snapshot)?;
        let main_file_path = snapshot
            .extra
            .get_string("main_file_path")
            .ok_or(NodeError::MissingInput { what: "main_file_path" })?
            .to_string();
        let brief = snapshot.extra.get_string("frd_document").unwrap_or(&request.prompt).to_string();
        let structure_files: Vec<String> = snapshot
            .extra
            .get("structure_files")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_else(|| vec![main_file_path.clone()]);

        let intelligent = self.generate_intelligent(&request, &structure_files, &brief).await;

        let (files, tokens, provider, model, path_taken) = match intelligent {
            Ok((files, tokens, provider, model)) => (files, tokens, provider, model, "intelligent"),
            Err(intelligent_err) => {
                tracing::warn!(error = %intelligent_err, "intelligent code generation failed, falling back to single-call path");
                match self.generate_file(&request, &main_file_path, &brief).await {
                    Ok((file, tokens, provider, model)) => (vec![file], tokens, provider, model, "fallback"),
                    Err(fallback_err) => {
                        return Ok(critical_failure(
                            "code-generate",
                            ctx.step,
                            format!("intelligent path: {intelligent_err}; fallback path: {fallback_err}"),
                        ));
                    }
                }
            }
        };

        let main_content = files
            .iter()
            .find(|file| file.path == main_file_path)
            .or_else(|| files.first())
            .map(|file| file.content.clone())
            .unwrap_or_default();

        let artifact = serde_json::to_string(&files.iter().map(|f| &f.path).collect::<Vec<_>>()).map_err(NodeError::Serde)?;
        let drop = Drop::new(&request.id, &workflow_id, "code-generate", artifact, DropType::Code)
            .with_metadata(std::collections::HashMap::from([
                ("provider".to_string(), serde_json::json!(provider)),
                ("path".to_string(), serde_json::json!(path_taken)),
                ("file_count".to_string(), serde_json::json!(files.len())),
            ]));
        ctx.emit("code-generate", format!("generated {} file(s) via the {path_taken} path", files.len()))?;

        let mut extra = new_extra_map();
        extra
            .insert_string("main_file_content", main_content)
            .insert_string("code_path", path_taken)
            .insert_number("generated_file_count", files.len() as u64)
            .insert_number("total_tokens", bump_total_tokens(&snapshot, tokens))
            .insert_string("last_provider", provider)
            .insert_string("last_model", model);

        Ok(NodePartial::new().with_files(files).with_drops(vec![drop]).with_extra(extra))
    }
}
