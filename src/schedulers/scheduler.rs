//! Bounded, version-gated concurrent execution of a single superstep.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::instrument;

use crate::event_bus::EventEmitter;
use crate::node::{Node, NodeContext, NodeError, NodePartial};
use crate::state::StateSnapshot;
use crate::types::NodeKind;

/// Per-node bookkeeping the scheduler uses to decide whether a node has
/// anything new to react to.
///
/// Keyed by a node's encoded identity (see [`NodeKind::encode`]) rather than
/// the `NodeKind` itself so that callers exercising the gating logic in
/// isolation (without a real graph) can supply arbitrary string ids.
#[derive(Debug, Default, Clone)]
pub struct SchedulerState {
    versions_seen: FxHashMap<String, (u32, u32)>,
}

/// Outcome of running one superstep.
///
/// `ran_nodes` preserves frontier order; `outputs` does not, since nodes run
/// concurrently and complete in whatever order the runtime schedules them.
#[derive(Debug, Default)]
pub struct StepRunResult {
    pub ran_nodes: Vec<NodeKind>,
    pub skipped_nodes: Vec<NodeKind>,
    pub outputs: Vec<(NodeKind, NodePartial)>,
}

/// Errors raised while executing a superstep.
#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    /// A node's `run` returned an error.
    #[error("node {kind:?} failed at step {step}")]
    #[diagnostic(code(weavegraph::schedulers::node_run))]
    NodeRun {
        kind: NodeKind,
        step: u64,
        #[source]
        source: NodeError,
    },

    /// The task running a node panicked or was cancelled.
    #[error("node task join failed: {0}")]
    #[diagnostic(code(weavegraph::schedulers::join))]
    Join(#[from] tokio::task::JoinError),
}

/// Runs a bounded pool of concurrent node executions per superstep.
///
/// The pool's size is fixed at construction, mirroring the Activity Runtime's
/// worker-pool model: a superstep fans out to every eligible node in the
/// frontier, but only `concurrency_limit` of them are in flight at once.
#[derive(Debug, Clone)]
pub struct Scheduler {
    concurrency_limit: usize,
}

impl Scheduler {
    /// Creates a scheduler that runs at most `concurrency_limit` nodes at
    /// once. A limit of `0` is treated as `1`.
    #[must_use]
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    /// Returns `true` if `id` has no recorded versions, or if either the
    /// messages or extra channel has advanced past what was last recorded
    /// for it.
    #[must_use]
    pub fn should_run(&self, state: &SchedulerState, id: &str, snapshot: &StateSnapshot) -> bool {
        match state.versions_seen.get(id) {
            None => true,
            Some((messages_seen, extra_seen)) => {
                snapshot.messages_version != *messages_seen || snapshot.extra_version != *extra_seen
            }
        }
    }

    /// Records the channel versions `id` has now observed.
    pub fn record_seen(&self, state: &mut SchedulerState, id: &str, snapshot: &StateSnapshot) {
        state.versions_seen.insert(
            id.to_string(),
            (snapshot.messages_version, snapshot.extra_version),
        );
    }

    /// Runs one superstep over `frontier`.
    ///
    /// `Start`/`End` are virtual nodes and are always skipped. Every other
    /// node in the frontier is gated through [`Scheduler::should_run`]; nodes
    /// that pass the gate run concurrently, bounded by this scheduler's
    /// concurrency limit, and have their seen-versions recorded before they
    /// are spawned so a node can't be scheduled twice for the same snapshot.
    #[instrument(skip(self, state, nodes, frontier, snapshot, event_emitter))]
    pub async fn superstep(
        &self,
        state: &mut SchedulerState,
        nodes: &FxHashMap<NodeKind, Arc<dyn Node>>,
        frontier: Vec<NodeKind>,
        snapshot: StateSnapshot,
        step: u64,
        event_emitter: Arc<dyn EventEmitter>,
    ) -> Result<StepRunResult, SchedulerError> {
        let mut ran_nodes = Vec::new();
        let mut skipped_nodes = Vec::new();
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut join_set: JoinSet<(NodeKind, Result<NodePartial, NodeError>)> = JoinSet::new();

        for kind in frontier {
            if kind.is_start() || kind.is_end() {
                skipped_nodes.push(kind);
                continue;
            }

            let id = kind.encode();
            if !self.should_run(state, &id, &snapshot) {
                skipped_nodes.push(kind);
                continue;
            }

            let Some(node) = nodes.get(&kind).cloned() else {
                tracing::warn!(node = %id, "no node registered for frontier entry, skipping");
                skipped_nodes.push(kind);
                continue;
            };

            self.record_seen(state, &id, &snapshot);
            ran_nodes.push(kind.clone());

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("scheduler semaphore is never closed while superstep runs");
            let ctx = NodeContext {
                node_id: id,
                step,
                event_emitter: event_emitter.clone(),
            };
            let snapshot_for_node = snapshot.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let result = node.run(snapshot_for_node, ctx).await;
                (kind, result)
            });
        }

        let mut outputs = Vec::with_capacity(ran_nodes.len());
        while let Some(joined) = join_set.join_next().await {
            let (kind, result) = joined?;
            let partial = result.map_err(|source| SchedulerError::NodeRun {
                kind: kind.clone(),
                step,
                source,
            })?;
            outputs.push((kind, partial));
        }

        Ok(StepRunResult {
            ran_nodes,
            skipped_nodes,
            outputs,
        })
    }
}
