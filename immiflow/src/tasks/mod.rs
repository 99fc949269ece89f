//! Task trait and the pipeline's task implementations.
//!
//! Tasks are the units of work a [`TaskGraph`](crate::pipeline::TaskGraph)
//! schedules. Each one is parameterized by the execution period carried in
//! its [`TaskContext`] and holds only injected collaborators, never
//! orchestration state.

pub mod aggregate;
pub mod analysis;
pub mod immigration;
pub mod loader;
pub mod provision;
pub mod quality;
pub mod reference;
pub mod temperature;

use crate::core::{ExecutionPeriod, TaskKind, TaskOutput};
use crate::errors::TaskError;
use async_trait::async_trait;
use std::fmt::Debug;
use uuid::Uuid;

/// Per-invocation context handed to a task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    period: ExecutionPeriod,
    run_id: Uuid,
    node: String,
    attempt: u32,
}

impl TaskContext {
    /// Creates a context for the first attempt of a node.
    #[must_use]
    pub fn new(period: ExecutionPeriod, run_id: Uuid, node: impl Into<String>) -> Self {
        Self {
            period,
            run_id,
            node: node.into(),
            attempt: 1,
        }
    }

    /// Creates a standalone context with a fresh run id, for direct invocations.
    #[must_use]
    pub fn for_period(period: ExecutionPeriod, node: impl Into<String>) -> Self {
        Self::new(period, Uuid::now_v7(), node)
    }

    /// Sets the attempt number (1-based).
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// The execution period.
    #[must_use]
    pub fn period(&self) -> ExecutionPeriod {
        self.period
    }

    /// The graph run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The node identifier.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// The attempt number, starting at 1.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// A unit of work in the pipeline graph.
///
/// Implementations return `Err` for failures; the executor turns the error
/// into a failed [`TaskOutput`] and uses [`TaskError::is_retryable`] to
/// decide whether another attempt is allowed.
#[async_trait]
pub trait Task: Send + Sync + Debug {
    /// The kind of work this task performs.
    fn kind(&self) -> TaskKind {
        TaskKind::Work
    }

    /// Executes the task for the context's period.
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError>;
}

/// A task backed by a synchronous closure.
pub struct FnTask<F>
where
    F: Fn(&TaskContext) -> Result<TaskOutput, TaskError> + Send + Sync,
{
    label: String,
    func: F,
}

impl<F> FnTask<F>
where
    F: Fn(&TaskContext) -> Result<TaskOutput, TaskError> + Send + Sync,
{
    /// Creates a new function-based task.
    pub fn new(label: impl Into<String>, func: F) -> Self {
        Self {
            label: label.into(),
            func,
        }
    }
}

impl<F> Debug for FnTask<F>
where
    F: Fn(&TaskContext) -> Result<TaskOutput, TaskError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTask").field("label", &self.label).finish()
    }
}

#[async_trait]
impl<F> Task for FnTask<F>
where
    F: Fn(&TaskContext) -> Result<TaskOutput, TaskError> + Send + Sync,
{
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        (self.func)(ctx)
    }
}

/// A task that does nothing and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTask;

#[async_trait]
impl Task for NoOpTask {
    async fn execute(&self, _ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        Ok(TaskOutput::ok_empty())
    }
}
