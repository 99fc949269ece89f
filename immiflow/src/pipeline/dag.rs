//! Task graph execution engine.
//!
//! Nodes start as soon as every predecessor has succeeded. Ready siblings
//! run concurrently as tokio tasks, bounded by `max_parallel`; a node that
//! is not parallel-safe waits until nothing else runs and blocks dispatch
//! while it runs. A failed node marks its descendants `UpstreamFailed`,
//! and independent branches keep going.

use super::ledger::{NodeRun, RunLedger};
use super::retry::{should_retry, RetryDecision, RetryState};
use super::NodeSpec;
use crate::core::{ExecutionPeriod, TaskOutput, TaskStatus};
use crate::errors::PipelineError;
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::tasks::TaskContext;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Options for one graph execution.
#[derive(Clone)]
pub struct ExecutionOptions {
    /// Maximum number of nodes running at once.
    pub max_parallel: usize,
    /// Skip nodes the ledger already records as succeeded for the period.
    pub resume: bool,
    /// Receives lifecycle events.
    pub sink: Arc<dyn EventSink>,
    /// Records node outcomes.
    pub ledger: Option<Arc<dyn RunLedger>>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            resume: false,
            sink: Arc::new(NoOpEventSink),
            ledger: None,
        }
    }
}

impl fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("max_parallel", &self.max_parallel)
            .field("resume", &self.resume)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl ExecutionOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency bound (values below 1 are treated as 1).
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Enables or disables resuming from the ledger.
    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the run ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn RunLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }
}

/// Outcome of one node in a graph run.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    /// Final status.
    pub status: TaskStatus,
    /// Number of attempts made (0 for nodes that never ran).
    pub attempts: u32,
    /// Wall time across all attempts in milliseconds.
    pub duration_ms: f64,
    /// The final output.
    pub output: TaskOutput,
}

impl NodeOutcome {
    fn not_run(output: TaskOutput) -> Self {
        Self {
            status: output.status,
            attempts: 0,
            duration_ms: 0.0,
            output,
        }
    }
}

/// Result of executing a task graph for one period.
#[derive(Debug, Clone, Serialize)]
pub struct GraphRunReport {
    /// The run identifier.
    pub run_id: Uuid,
    /// The period processed.
    pub period: ExecutionPeriod,
    /// Per-node outcomes.
    pub outcomes: BTreeMap<String, NodeOutcome>,
    /// Nodes in the order they reached a final state.
    pub completion_order: Vec<String>,
    /// Total execution time in milliseconds.
    pub duration_ms: f64,
    /// Whether every node succeeded or was skipped.
    pub success: bool,
}

impl GraphRunReport {
    /// Returns the final status of a node.
    #[must_use]
    pub fn status_of(&self, node: &str) -> Option<TaskStatus> {
        self.outcomes.get(node).map(|o| o.status)
    }

    /// Returns the nodes that failed themselves, sorted.
    #[must_use]
    pub fn failed_nodes(&self) -> Vec<&str> {
        self.nodes_with(TaskStatus::Fail)
    }

    /// Returns the nodes that were not run because a predecessor failed, sorted.
    #[must_use]
    pub fn blocked_nodes(&self) -> Vec<&str> {
        self.nodes_with(TaskStatus::UpstreamFailed)
    }

    fn nodes_with(&self, status: TaskStatus) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.status == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// A validated directed acyclic graph of tasks.
#[derive(Debug)]
pub struct TaskGraph {
    name: String,
    nodes: HashMap<String, NodeSpec>,
    upstream: HashMap<String, BTreeSet<String>>,
    downstream: HashMap<String, BTreeSet<String>>,
    execution_order: Vec<String>,
}

impl TaskGraph {
    /// Creates a graph from validated parts. Use [`GraphBuilder`](super::GraphBuilder).
    pub(crate) fn new(
        name: String,
        nodes: HashMap<String, NodeSpec>,
        node_order: Vec<String>,
        upstream: HashMap<String, BTreeSet<String>>,
    ) -> Self {
        let mut downstream: HashMap<String, BTreeSet<String>> =
            node_order.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
        for (to, froms) in &upstream {
            for from in froms {
                downstream.entry(from.clone()).or_default().insert(to.clone());
            }
        }
        let execution_order = topological_sort(&upstream, &node_order);

        Self {
            name,
            nodes,
            upstream,
            downstream,
            execution_order,
        }
    }

    /// Returns the graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns a topological order, stable with respect to insertion order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Returns a node specification.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    /// Returns the direct predecessors of a node, sorted.
    #[must_use]
    pub fn upstream_of(&self, name: &str) -> Vec<String> {
        self.upstream
            .get(name)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns every edge as `(from, to)`, in execution order of `from`.
    #[must_use]
    pub fn edges(&self) -> Vec<(String, String)> {
        self.execution_order
            .iter()
            .flat_map(|from| {
                self.downstream
                    .get(from)
                    .into_iter()
                    .flatten()
                    .map(move |to| (from.clone(), to.clone()))
            })
            .collect()
    }

    /// Returns every node reachable from `name`, excluding itself.
    #[must_use]
    pub fn descendants(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        while let Some(current) = queue.pop_front() {
            for child in self.downstream.get(current).into_iter().flatten() {
                if seen.insert(child.clone()) {
                    queue.push_back(child);
                }
            }
        }
        seen
    }

    /// Executes the graph for one period.
    ///
    /// Node failures are reported in the returned [`GraphRunReport`], not as
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read when resuming, or if
    /// the scheduler reaches an inconsistent state.
    pub async fn execute(
        &self,
        period: ExecutionPeriod,
        options: &ExecutionOptions,
    ) -> Result<GraphRunReport, PipelineError> {
        let start = Instant::now();
        let run_id = Uuid::now_v7();
        let sink = options.sink.clone();
        let max_parallel = options.max_parallel.max(1);

        let already_done: HashSet<String> = match (&options.ledger, options.resume) {
            (Some(ledger), true) => ledger
                .runs_for(period)
                .await?
                .into_iter()
                .filter(|run| run.status.is_success())
                .map(|run| run.node)
                .collect(),
            _ => HashSet::new(),
        };

        info!(graph = %self.name, period = %period, run_id = %run_id, "Graph run started");
        sink.emit(&PipelineEvent::graph("graph.started", period).with_data(serde_json::json!({
            "graph": &self.name,
            "run_id": run_id.to_string(),
            "nodes": self.nodes.len(),
        })));

        let mut outcomes: BTreeMap<String, NodeOutcome> = BTreeMap::new();
        let mut completion_order = Vec::new();
        let mut pending_deps: HashMap<&str, usize> = self
            .upstream
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();
        let mut ready: VecDeque<String> = self
            .execution_order
            .iter()
            .filter(|n| pending_deps.get(n.as_str()).copied() == Some(0))
            .cloned()
            .collect();

        let mut active = FuturesUnordered::new();
        let mut exclusive_running = false;

        loop {
            // dispatch in FIFO order; an exclusive node at the front holds the queue
            while let Some(next) = ready.front() {
                let Some(spec) = self.nodes.get(next) else {
                    return Err(PipelineError::Internal(format!("unknown node '{next}'")));
                };

                if already_done.contains(next) {
                    let name = next.clone();
                    ready.pop_front();
                    info!(node = %name, period = %period, "Node already succeeded, skipping");
                    sink.emit(
                        &PipelineEvent::node("node.skipped", period, &name)
                            .with_data(serde_json::json!({"reason": "already succeeded"})),
                    );
                    let outcome = NodeOutcome::not_run(TaskOutput::skip(
                        "already succeeded for this period",
                    ));
                    self.finish(&name, outcome, &mut outcomes, &mut completion_order);
                    self.release_children(&name, &mut pending_deps, &mut ready);
                    continue;
                }

                let can_start = if spec.parallel_safe {
                    !exclusive_running && active.len() < max_parallel
                } else {
                    active.is_empty()
                };
                if !can_start {
                    break;
                }

                if !spec.parallel_safe {
                    exclusive_running = true;
                }
                let name = next.clone();
                ready.pop_front();
                active.push(run_node(spec.clone(), period, run_id, sink.clone()));
                tracing::debug!(node = %name, running = active.len(), "Node dispatched");
            }

            let Some((name, outcome)) = active.next().await else {
                break;
            };

            if self
                .nodes
                .get(&name)
                .is_some_and(|spec| !spec.parallel_safe)
            {
                exclusive_running = false;
            }

            self.record(&options.ledger, period, run_id, &name, &outcome).await;
            let succeeded = outcome.status.is_success();
            self.finish(&name, outcome, &mut outcomes, &mut completion_order);

            if succeeded {
                self.release_children(&name, &mut pending_deps, &mut ready);
            } else {
                for blocked in self.descendants(&name) {
                    if outcomes.contains_key(&blocked) {
                        continue;
                    }
                    warn!(node = %blocked, failed = %name, period = %period, "Node blocked by upstream failure");
                    sink.emit(
                        &PipelineEvent::node("node.skipped", period, &blocked).with_data(
                            serde_json::json!({"reason": "upstream_failed", "upstream": &name}),
                        ),
                    );
                    let outcome = NodeOutcome::not_run(TaskOutput::upstream_failed(&name));
                    self.record(&options.ledger, period, run_id, &blocked, &outcome)
                        .await;
                    self.finish(&blocked, outcome, &mut outcomes, &mut completion_order);
                }
            }
        }

        if outcomes.len() != self.nodes.len() {
            let stuck: Vec<&String> = self
                .nodes
                .keys()
                .filter(|n| !outcomes.contains_key(*n))
                .collect();
            return Err(PipelineError::Internal(format!(
                "task graph stalled; unfinished nodes: {stuck:?}"
            )));
        }

        let success = outcomes.values().all(|o| o.status.is_success());
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        if success {
            info!(graph = %self.name, period = %period, duration_ms, "Graph run completed");
        } else {
            error!(graph = %self.name, period = %period, duration_ms, "Graph run finished with failures");
        }
        sink.emit(&PipelineEvent::graph("graph.completed", period).with_data(serde_json::json!({
            "graph": &self.name,
            "run_id": run_id.to_string(),
            "success": success,
            "duration_ms": duration_ms,
        })));

        Ok(GraphRunReport {
            run_id,
            period,
            outcomes,
            completion_order,
            duration_ms,
            success,
        })
    }

    fn finish(
        &self,
        name: &str,
        outcome: NodeOutcome,
        outcomes: &mut BTreeMap<String, NodeOutcome>,
        completion_order: &mut Vec<String>,
    ) {
        completion_order.push(name.to_string());
        outcomes.insert(name.to_string(), outcome);
    }

    fn release_children<'a>(
        &'a self,
        name: &str,
        pending_deps: &mut HashMap<&'a str, usize>,
        ready: &mut VecDeque<String>,
    ) {
        for child in self.downstream.get(name).into_iter().flatten() {
            if let Some(count) = pending_deps.get_mut(child.as_str()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push_back(child.clone());
                }
            }
        }
    }

    async fn record(
        &self,
        ledger: &Option<Arc<dyn RunLedger>>,
        period: ExecutionPeriod,
        run_id: Uuid,
        node: &str,
        outcome: &NodeOutcome,
    ) {
        let Some(ledger) = ledger else {
            return;
        };
        let run = NodeRun {
            period,
            node: node.to_string(),
            status: outcome.status,
            attempts: outcome.attempts,
            error: outcome.output.error.clone(),
            run_id,
            finished_at: Utc::now(),
        };
        if let Err(e) = ledger.record(run).await {
            warn!(node = %node, period = %period, error = %e, "Failed to record node outcome");
        }
    }
}

/// Runs one node to a final state, retrying per its policy.
///
/// The task body runs in its own tokio task so a panic becomes a node
/// failure instead of tearing down the executor.
async fn run_node(
    spec: NodeSpec,
    period: ExecutionPeriod,
    run_id: Uuid,
    sink: Arc<dyn EventSink>,
) -> (String, NodeOutcome) {
    let name = spec.name.clone();
    let handle = tokio::spawn(attempt_loop(spec, period, run_id, sink.clone()));

    let outcome = match handle.await {
        Ok(outcome) => outcome,
        Err(join_error) => {
            let message = format!("task panicked or was aborted: {join_error}");
            error!(node = %name, period = %period, "{message}");
            sink.emit(
                &PipelineEvent::node("node.failed", period, &name)
                    .with_data(serde_json::json!({"error": &message})),
            );
            NodeOutcome {
                status: TaskStatus::Fail,
                attempts: 1,
                duration_ms: 0.0,
                output: TaskOutput::fail(message),
            }
        }
    };
    (name, outcome)
}

async fn attempt_loop(
    spec: NodeSpec,
    period: ExecutionPeriod,
    run_id: Uuid,
    sink: Arc<dyn EventSink>,
) -> NodeOutcome {
    let start = Instant::now();
    let mut state = RetryState::new();

    sink.emit(
        &PipelineEvent::node("node.started", period, &spec.name)
            .with_data(serde_json::json!({"kind": spec.kind.to_string()})),
    );

    loop {
        let ctx = TaskContext::new(period, run_id, &spec.name).with_attempt(state.attempt());
        let output = match spec.task.execute(&ctx).await {
            Ok(output) => output,
            Err(e) => TaskOutput::from_error(&e),
        };

        if !output.is_failure() {
            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
            let event_type = if output.status == TaskStatus::Skip {
                "node.skipped"
            } else {
                "node.completed"
            };
            info!(node = %spec.name, period = %period, attempt = state.attempt(), duration_ms, "Node finished: {}", output.status);
            sink.emit(
                &PipelineEvent::node(event_type, period, &spec.name).with_data(serde_json::json!({
                    "attempts": state.attempt(),
                    "duration_ms": duration_ms,
                    "reason": output.skip_reason,
                })),
            );
            return NodeOutcome {
                status: output.status,
                attempts: state.attempt(),
                duration_ms,
                output,
            };
        }

        let error_message = output.error.clone().unwrap_or_default();
        match should_retry(&mut state, &spec.retry, output.is_retryable()) {
            RetryDecision::Retry(delay) => {
                warn!(
                    node = %spec.name,
                    period = %period,
                    attempt = state.retries(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error_message,
                    "Node attempt failed, retrying"
                );
                sink.emit(
                    &PipelineEvent::node("node.retrying", period, &spec.name).with_data(
                        serde_json::json!({
                            "attempt": state.retries(),
                            "next_attempt": state.attempt(),
                            "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "error": &error_message,
                        }),
                    ),
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
                error!(node = %spec.name, period = %period, attempts = state.attempt(), error = %error_message, "Node failed");
                sink.emit(
                    &PipelineEvent::node("node.failed", period, &spec.name).with_data(
                        serde_json::json!({
                            "attempts": state.attempt(),
                            "retryable": output.is_retryable(),
                            "error": &error_message,
                            "duration_ms": duration_ms,
                        }),
                    ),
                );
                return NodeOutcome {
                    status: TaskStatus::Fail,
                    attempts: state.attempt(),
                    duration_ms,
                    output,
                };
            }
        }
    }
}

/// Topological sort by depth-first search over dependencies, visiting
/// nodes in insertion order for determinism.
fn topological_sort(
    upstream: &HashMap<String, BTreeSet<String>>,
    node_order: &[String],
) -> Vec<String> {
    fn visit(
        node: &str,
        upstream: &HashMap<String, BTreeSet<String>>,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(node.to_string()) {
            return;
        }
        for dep in upstream.get(node).into_iter().flatten() {
            visit(dep, upstream, visited, result);
        }
        result.push(node.to_string());
    }

    let mut result = Vec::with_capacity(node_order.len());
    let mut visited = HashSet::new();
    for name in node_order {
        visit(name, upstream, &mut visited, &mut result);
    }
    result
}
