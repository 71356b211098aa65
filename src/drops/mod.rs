//! Drops: immutable per-stage artifacts written to an append-only store.
//!
//! Generalizes the shape of [`crate::runtimes::checkpointer::Checkpointer`]
//! (a narrow save/load/list surface behind a trait, with an in-memory and an
//! HTTP-backed implementation) into a write-only sink: drops are never
//! updated once stored, so the trait offers no `load`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// The kind of artifact a [`Drop`] carries, one per pipeline stage family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropType {
    Prompt,
    Frd,
    Structure,
    Code,
    Tests,
    TestPlan,
    Documentation,
    Container,
    Deployment,
    Health,
    Files,
    Summary,
}

impl DropType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DropType::Prompt => "prompt",
            DropType::Frd => "frd",
            DropType::Structure => "structure",
            DropType::Code => "code",
            DropType::Tests => "tests",
            DropType::TestPlan => "test_plan",
            DropType::Documentation => "documentation",
            DropType::Container => "container",
            DropType::Deployment => "deployment",
            DropType::Health => "health",
            DropType::Files => "files",
            DropType::Summary => "summary",
        }
    }
}

/// Immutable record emitted at the end of a pipeline stage.
///
/// Drop ids are deterministic: `"drop-{request_id}-{stage_tag}"`, which makes
/// [`DropSink::store`] naturally idempotent — storing the same drop twice is
/// a no-op from the caller's perspective.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Drop {
    pub id: String,
    pub workflow_id: String,
    pub stage: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub artifact: String,
    #[serde(rename = "type")]
    pub drop_type: DropType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl Drop {
    /// Builds the deterministic id for a `(request_id, stage_tag)` pair.
    #[must_use]
    pub fn make_id(request_id: &str, stage_tag: &str) -> String {
        format!("drop-{request_id}-{stage_tag}")
    }

    #[must_use]
    pub fn new(
        request_id: &str,
        workflow_id: impl Into<String>,
        stage_tag: &str,
        artifact: impl Into<String>,
        drop_type: DropType,
    ) -> Self {
        Self {
            id: Self::make_id(request_id, stage_tag),
            workflow_id: workflow_id.into(),
            stage: stage_tag.to_string(),
            timestamp: chrono::Utc::now(),
            artifact: artifact.into(),
            drop_type,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Error)]
pub enum DropSinkError {
    #[error("drop store returned an error response: {0}")]
    Rejected(String),
    #[error("transport error talking to the drop store: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Write-only sink for [`Drop`] records. `store` is a fire-and-forget
/// activity from the Pipeline Coordinator's point of view:
/// a failed store is logged by the caller and never aborts the pipeline.
#[async_trait]
pub trait DropSink: Send + Sync {
    async fn store(&self, drop: &Drop) -> Result<(), DropSinkError>;
}

/// Posts each drop to the external drop store as `POST {base_url}` with the
/// drop serialized as a JSON envelope.
pub struct HttpDropSink {
    client: reqwest::Client,
    url: String,
}

impl HttpDropSink {
    #[must_use]
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl DropSink for HttpDropSink {
    async fn store(&self, drop: &Drop) -> Result<(), DropSinkError> {
        let response = self.client.post(&self.url).json(drop).send().await?;
        if !response.status().is_success() {
            return Err(DropSinkError::Rejected(format!(
                "status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// In-memory sink for tests and for callers that want to inspect drops
/// directly instead of (or in addition to) the external store.
#[derive(Default)]
pub struct InMemoryDropSink {
    stored: parking_lot::Mutex<Vec<Drop>>,
}

impl InMemoryDropSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Drop> {
        self.stored.lock().clone()
    }
}

#[async_trait]
impl DropSink for InMemoryDropSink {
    async fn store(&self, drop: &Drop) -> Result<(), DropSinkError> {
        let mut stored = self.stored.lock();
        if !stored.iter().any(|d| d.id == drop.id) {
            stored.push(drop.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_id_is_deterministic() {
        assert_eq!(
            Drop::make_id("r1", "code-generate"),
            "drop-r1-code-generate"
        );
        assert_eq!(
            Drop::make_id("r1", "code-generate"),
            Drop::make_id("r1", "code-generate")
        );
    }

    #[tokio::test]
    async fn in_memory_sink_store_is_idempotent_by_id() {
        let sink = InMemoryDropSink::new();
        let drop = Drop::new("r1", "wf-1", "frd", "# FRD", DropType::Frd);
        sink.store(&drop).await.unwrap();
        sink.store(&drop).await.unwrap();
        assert_eq!(sink.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn in_memory_sink_keeps_distinct_drops() {
        let sink = InMemoryDropSink::new();
        sink.store(&Drop::new("r1", "wf-1", "frd", "a", DropType::Frd))
            .await
            .unwrap();
        sink.store(&Drop::new("r1", "wf-1", "code", "b", DropType::Code))
            .await
            .unwrap();
        assert_eq!(sink.snapshot().len(), 2);
    }
}
