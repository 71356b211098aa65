//! Superstep scheduling for workflow execution.
//!
//! The scheduler is responsible for deciding, given a frontier of
//! [`NodeKind`](crate::types::NodeKind)s, which nodes actually need to run in
//! a given superstep (gating on whether the channels a node depends on have
//! changed since it last ran) and for running the eligible set concurrently,
//! bounded by a configurable worker limit.

pub mod scheduler;

pub use scheduler::{Scheduler, SchedulerError, SchedulerState, StepRunResult};
