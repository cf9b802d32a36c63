//! Vertex implementations for workflow nodes
//!
//! Each node kind has its own vertex; [`NodeStrategy`] closes the set so the
//! compiler and runtime handle every kind explicitly. [`CompiledNode`] wraps
//! a strategy with the node's policies: skip-if-exists, declared
//! dependencies, per-attempt timeout, and the `on_error` policy.
//!
//! # Available Vertices
//!
//! - [`transform::TransformVertex`]: one task or tool call
//! - [`router::RouterVertex`]: classification value for route selection
//! - [`agent::AgentVertex`]: tool-calling loop
//! - [`map::MapVertex`]: ordered fan-out over a list
//! - [`interrupt::InterruptVertex`]: suspend until the caller resumes
//! - [`subgraph::SubgraphVertex`]: nested graph with field mappings
//! - [`passthrough::PassthroughVertex`]: pure state transformation

pub mod agent;
pub mod interrupt;
pub mod map;
pub mod passthrough;
pub mod router;
pub mod subgraph;
pub mod transform;

pub use agent::AgentVertex;
pub use interrupt::{InterruptVertex, MessageSource};
pub use map::MapVertex;
pub use passthrough::PassthroughVertex;
pub use router::{RouteSource, RouterVertex};
pub use subgraph::SubgraphVertex;
pub use transform::{TransformAction, TransformVertex};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::definition::ErrorPolicy;
use crate::engine::vertex::{ComputeContext, NodeOutcome, RunScope, Vertex};
use crate::error::{RunError, TaskError};
use crate::executor::{DynExecutor, TaskRequest};
use crate::state::{resolve_path, ErrorRecord, ExecutionState, StateMap};

/// A task name bound to its resolved executors.
#[derive(Clone)]
pub struct TaskBinding {
    pub task: String,
    primary: DynExecutor,
    fallback: Option<DynExecutor>,
}

impl TaskBinding {
    pub fn new(task: impl Into<String>, primary: DynExecutor, fallback: Option<DynExecutor>) -> Self {
        Self {
            task: task.into(),
            primary,
            fallback,
        }
    }

    /// Executor for the current attempt; a missing fallback reuses the primary
    pub fn executor(&self, fallback: bool) -> &DynExecutor {
        match (&self.fallback, fallback) {
            (Some(executor), true) => executor,
            _ => &self.primary,
        }
    }

    pub async fn call(&self, ctx: &ComputeContext<'_>, request: TaskRequest) -> Result<Value, TaskError> {
        self.executor(ctx.fallback).execute(request).await
    }
}

impl std::fmt::Debug for TaskBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskBinding")
            .field("task", &self.task)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Variables for a task request.
///
/// Without `inputs` the whole state is passed; `args` are layered on top and
/// `inputs` win over both. Unresolved input paths become `null`.
pub(crate) fn build_variables(
    inputs: &BTreeMap<String, String>,
    args: &BTreeMap<String, Value>,
    values: &StateMap,
) -> StateMap {
    let mut variables = if inputs.is_empty() {
        values.clone()
    } else {
        StateMap::new()
    };
    for (name, value) in args {
        variables.insert(name.clone(), value.clone());
    }
    for (name, path) in inputs {
        let value = resolve_path(values, path).cloned().unwrap_or(Value::Null);
        variables.insert(name.clone(), value);
    }
    variables
}

/// The closed set of node strategies.
pub enum NodeStrategy {
    Transform(TransformVertex),
    Router(RouterVertex),
    Agent(AgentVertex),
    Map(MapVertex),
    Interrupt(InterruptVertex),
    Subgraph(SubgraphVertex),
    Passthrough(PassthroughVertex),
}

impl NodeStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeStrategy::Transform(_) => "transform",
            NodeStrategy::Router(_) => "router",
            NodeStrategy::Agent(_) => "agent",
            NodeStrategy::Map(_) => "map",
            NodeStrategy::Interrupt(_) => "interrupt",
            NodeStrategy::Subgraph(_) => "subgraph",
            NodeStrategy::Passthrough(_) => "passthrough",
        }
    }

    fn vertex(&self) -> &dyn Vertex {
        match self {
            NodeStrategy::Transform(v) => v,
            NodeStrategy::Router(v) => v,
            NodeStrategy::Agent(v) => v,
            NodeStrategy::Map(v) => v,
            NodeStrategy::Interrupt(v) => v,
            NodeStrategy::Subgraph(v) => v,
            NodeStrategy::Passthrough(v) => v,
        }
    }
}

#[async_trait]
impl Vertex for NodeStrategy {
    fn id(&self) -> &str {
        self.vertex().id()
    }

    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<NodeOutcome, TaskError> {
        self.vertex().compute(ctx).await
    }
}

/// Policies applied around a node's strategy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePolicy {
    pub on_error: ErrorPolicy,
    /// Retries for `on_error: retry`; `None` defers to the runtime's retry policy
    pub max_retries: Option<usize>,
    /// Per-attempt timeout; falls back to the runtime's node timeout
    pub timeout: Option<Duration>,
    /// Fields that must all be populated for the node to be skipped; empty disables skipping
    pub skip_fields: Vec<String>,
    /// Declared dependencies
    pub requires: Vec<String>,
}

impl NodePolicy {
    /// Attempts allowed, with `default_retries` for nodes without their own bound
    pub fn max_attempts(&self, default_retries: usize) -> usize {
        match self.on_error {
            ErrorPolicy::Retry => self.max_retries.unwrap_or(default_retries) + 1,
            ErrorPolicy::Fallback => 2,
            ErrorPolicy::Fail | ErrorPolicy::Skip => 1,
        }
    }
}

/// Outcome of executing a node with its policies applied.
#[derive(Debug)]
pub struct NodeRun {
    pub result: Result<NodeOutcome, RunError>,
    /// Errors recovered along the way, in order
    pub errors: Vec<ErrorRecord>,
    pub attempts: usize,
    pub skipped: bool,
}

impl NodeRun {
    fn skipped() -> Self {
        Self {
            result: Ok(NodeOutcome::empty()),
            errors: Vec::new(),
            attempts: 0,
            skipped: true,
        }
    }
}

/// A node ready to execute.
pub struct CompiledNode {
    id: String,
    output: Option<String>,
    strategy: NodeStrategy,
    policy: NodePolicy,
}

impl CompiledNode {
    pub fn new(
        id: impl Into<String>,
        output: Option<String>,
        strategy: NodeStrategy,
        policy: NodePolicy,
    ) -> Self {
        Self {
            id: id.into(),
            output,
            strategy,
            policy,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &'static str {
        self.strategy.kind()
    }

    /// Field holding the node's primary result
    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn policy(&self) -> &NodePolicy {
        &self.policy
    }

    /// Whether every declared output is already present and non-null
    pub fn should_skip(&self, state: &ExecutionState) -> bool {
        !self.policy.skip_fields.is_empty()
            && self
                .policy
                .skip_fields
                .iter()
                .all(|field| matches!(state.get(field), Some(v) if !v.is_null()))
    }

    /// Execute the node once, applying skip, dependency, timeout, and error
    /// policies. `resume` is set when re-entering a suspended node.
    pub async fn execute(
        &self,
        state: &ExecutionState,
        scope: &Arc<RunScope>,
        resume: Option<&Value>,
    ) -> NodeRun {
        if resume.is_none() && self.should_skip(state) {
            debug!(node_id = %self.id, "outputs already populated, skipping");
            return NodeRun::skipped();
        }

        let mut errors = Vec::new();

        let missing = self
            .policy
            .requires
            .iter()
            .find(|field| !matches!(state.get(field), Some(v) if !v.is_null()));
        if let Some(field) = missing {
            let error = TaskError::failed(&self.id, format!("required field `{field}` is not populated"));
            return self.fail(error, 0, state, errors);
        }

        let max_attempts = self.policy.max_attempts(scope.config.retry_policy.max_retries);
        let limit = self.policy.timeout.or(scope.config.node_timeout);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let fallback = self.policy.on_error == ErrorPolicy::Fallback && attempt > 1;
            let ctx = ComputeContext::new(state, scope)
                .with_resume(resume)
                .with_fallback(fallback);

            let result = match limit {
                Some(limit) => tokio::time::timeout(limit, self.strategy.compute(&ctx))
                    .await
                    .unwrap_or_else(|_| {
                        Err(TaskError::Timeout {
                            task: self.id.clone(),
                            after: limit,
                        })
                    }),
                None => self.strategy.compute(&ctx).await,
            };
            errors.extend(ctx.into_errors());

            let error = match result {
                Ok(outcome) => {
                    debug!(node_id = %self.id, attempt, "node finished");
                    return NodeRun {
                        result: Ok(outcome),
                        errors,
                        attempts: attempt,
                        skipped: false,
                    };
                }
                Err(error) => error,
            };

            if attempt >= max_attempts {
                return self.fail(error, attempt, state, errors);
            }

            warn!(
                node_id = %self.id,
                attempt,
                max_attempts,
                error = %error,
                "node attempt failed, retrying"
            );
            errors.push(ErrorRecord::recovered(&self.id, error.to_string(), state.step));
            if self.policy.on_error == ErrorPolicy::Retry {
                let delay = scope.config.retry_policy.delay_for_attempt(attempt - 1);
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn fail(
        &self,
        error: TaskError,
        attempts: usize,
        state: &ExecutionState,
        mut errors: Vec<ErrorRecord>,
    ) -> NodeRun {
        if self.policy.on_error == ErrorPolicy::Skip {
            warn!(node_id = %self.id, error = %error, "node failed, continuing with an empty update");
            errors.push(ErrorRecord::recovered(&self.id, error.to_string(), state.step));
            return NodeRun {
                result: Ok(NodeOutcome::empty()),
                errors,
                attempts,
                skipped: false,
            };
        }
        NodeRun {
            result: Err(RunError::NodeExecution {
                node: self.id.clone(),
                attempts,
                source: error,
            }),
            errors,
            attempts,
            skipped: false,
        }
    }
}

impl std::fmt::Debug for CompiledNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledNode")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("policy", &self.policy)
            .finish()
    }
}
