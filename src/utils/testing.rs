//! Minimal node fixtures and state builders shared by the crate's own test
//! suites. Public (rather than `#[cfg(test)]`) so integration tests in
//! `tests/` can build scheduler/graph fixtures without duplicating them.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::message::Message;
use crate::node::{Node, NodeContext, NodeError, NodePartial};
use crate::state::StateSnapshot;
use crate::types::NodeKind;

/// Emits a single assistant message naming itself and the current step.
#[derive(Debug, Clone)]
pub struct TestNode {
    pub name: &'static str,
}

#[async_trait]
impl Node for TestNode {
    async fn run(
        &self,
        _snapshot: StateSnapshot,
        ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        Ok(NodePartial {
            messages: Some(vec![Message::assistant(&format!(
                "ran:{}:step:{}",
                self.name, ctx.step
            ))]),
            extra: None,
            errors: None,
            frontier: None,
            drops: None,
            files: None,
        })
    }
}

/// Like [`TestNode`], but sleeps `delay_ms` before returning, for exercising
/// scheduler concurrency.
#[derive(Debug, Clone)]
pub struct DelayedNode {
    pub name: &'static str,
    pub delay_ms: u64,
}

#[async_trait]
impl Node for DelayedNode {
    async fn run(
        &self,
        _snapshot: StateSnapshot,
        ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(NodePartial {
            messages: Some(vec![Message::assistant(&format!(
                "ran:{}:step:{}",
                self.name, ctx.step
            ))]),
            extra: None,
            errors: None,
            frontier: None,
            drops: None,
            files: None,
        })
    }
}

/// Always fails with [`NodeError::MissingInput`], for exercising error
/// propagation through the scheduler and runner.
#[derive(Debug, Clone)]
pub struct FailingNode {
    pub error_message: &'static str,
}

impl Default for FailingNode {
    fn default() -> Self {
        Self {
            error_message: "test_key",
        }
    }
}

#[async_trait]
impl Node for FailingNode {
    async fn run(
        &self,
        _snapshot: StateSnapshot,
        _ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        Err(NodeError::MissingInput {
            what: self.error_message,
        })
    }
}

/// Registers `TestNode`s at `Custom("A")`, `Custom("B")`, and `End`.
#[must_use]
pub fn make_test_registry() -> FxHashMap<NodeKind, Arc<dyn Node>> {
    let mut registry = FxHashMap::default();
    registry.insert(
        NodeKind::Custom("A".into()),
        Arc::new(TestNode { name: "A" }) as Arc<dyn Node>,
    );
    registry.insert(
        NodeKind::Custom("B".into()),
        Arc::new(TestNode { name: "B" }) as Arc<dyn Node>,
    );
    registry.insert(
        NodeKind::End,
        Arc::new(TestNode { name: "END" }) as Arc<dyn Node>,
    );
    registry
}

/// Registers `DelayedNode`s at `Custom("A")` (30ms) and `Custom("B")` (1ms),
/// for tests that need to observe out-of-order completion under concurrency.
#[must_use]
pub fn make_delayed_registry() -> FxHashMap<NodeKind, Arc<dyn Node>> {
    let mut registry = FxHashMap::default();
    registry.insert(
        NodeKind::Custom("A".into()),
        Arc::new(DelayedNode {
            name: "A",
            delay_ms: 30,
        }) as Arc<dyn Node>,
    );
    registry.insert(
        NodeKind::Custom("B".into()),
        Arc::new(DelayedNode {
            name: "B",
            delay_ms: 1,
        }) as Arc<dyn Node>,
    );
    registry
}

/// A bare `StateSnapshot` with only the message/extra versions set, and every
/// other channel empty at version 1.
#[must_use]
pub fn create_test_snapshot(messages_version: u32, extra_version: u32) -> StateSnapshot {
    StateSnapshot {
        messages: vec![],
        messages_version,
        extra: FxHashMap::default(),
        extra_version,
        errors: vec![],
        errors_version: 1,
        drops: vec![],
        drops_version: 1,
        files: vec![],
        files_version: 1,
    }
}
