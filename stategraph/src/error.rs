//! Error types for compiling and running workflow graphs
//!
//! Compile-time problems ([`ConfigError`], [`CompileError`]) are collected and
//! reported together before any node executes. Run-time problems ([`RunError`])
//! either resolve through a node's error policy or end the run with a
//! [`RunFailure`] that carries the last good state.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::state::ExecutionState;

/// A malformed or inconsistent workflow definition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Definition text could not be parsed at all
    #[error("failed to parse workflow definition: {0}")]
    Parse(String),

    /// A required top-level key is absent
    #[error("missing required top-level key `{0}`")]
    MissingKey(&'static str),

    /// Top-level `version` is not one this compiler understands
    #[error("unsupported definition version `{0}`")]
    UnsupportedVersion(String),

    /// A top-level section has the wrong shape
    #[error("invalid `{section}` section: {message}")]
    InvalidSection { section: String, message: String },

    /// Node declares a type outside the closed set
    #[error("node `{node}`: unknown node type `{kind}`")]
    UnknownNodeType { node: String, kind: String },

    /// Node config is malformed
    #[error("node `{node}`: {message}")]
    InvalidNode { node: String, message: String },

    /// Node id collides with a reserved marker
    #[error("node id `{0}` is reserved")]
    ReservedNodeId(String),

    /// Edge endpoint names a node that does not exist
    #[error("edge #{index} ({from} -> {to}): unknown node `{node}`")]
    UnknownEdgeEndpoint {
        index: usize,
        from: String,
        to: String,
        node: String,
    },

    /// Edge is malformed
    #[error("edge #{index} from `{from}`: {message}")]
    InvalidEdge {
        index: usize,
        from: String,
        message: String,
    },

    /// Entry point names a node that does not exist
    #[error("unknown entry node `{0}`")]
    UnknownEntry(String),

    /// Node references a tool not declared under `tools`
    #[error("node `{node}`: unknown tool `{tool}`")]
    UnknownTool { node: String, tool: String },

    /// Declared tool has no binding in the tool registry
    #[error("tool `{tool}`: binding `{binding}` is not registered")]
    UnresolvedToolBinding { tool: String, binding: String },

    /// Node references a task the executor cannot run
    #[error("node `{node}`: task `{task}` is not provided by the executor")]
    UnresolvedTask { node: String, task: String },

    /// Executor for a backend configuration could not be created
    #[error("node `{node}`: executor unavailable: {message}")]
    ExecutorUnavailable { node: String, message: String },

    /// Router route points at a node that does not exist
    #[error("router `{node}`: route `{route}` targets unknown node `{target}`")]
    UnknownRouteTarget {
        node: String,
        route: String,
        target: String,
    },

    /// Non-terminal node has nowhere to go
    #[error("node `{node}` has no outgoing transition (add an edge to END)")]
    MissingTransition { node: String },

    /// Node has more than one unconditional successor
    #[error("node `{node}` has more than one unconditional transition")]
    AmbiguousTransition { node: String },

    /// Node cannot be reached from the entry point
    #[error("node `{node}` is unreachable from entry `{entry}`")]
    UnreachableNode { node: String, entry: String },

    /// Two writers disagree on how a field merges
    #[error(
        "field `{field}` has conflicting merge strategies: {first} (from `{first_writer}`) vs {second} (from `{second_writer}`)"
    )]
    ConflictingMergeStrategy {
        field: String,
        first: String,
        first_writer: String,
        second: String,
        second_writer: String,
    },

    /// `loop_limits` names a node that does not exist
    #[error("loop limit declared for unknown node `{0}`")]
    UnknownLoopLimit(String),

    /// Subgraph transitively embeds itself
    #[error("circular subgraph reference: {}", chain.join(" -> "))]
    CircularSubgraph { chain: Vec<String> },

    /// Subgraph source could not be loaded
    #[error("node `{node}`: failed to load subgraph `{reference}`: {message}")]
    SubgraphSource {
        node: String,
        reference: String,
        message: String,
    },
}

impl ConfigError {
    /// Create an invalid-node error
    pub fn invalid_node(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidNode {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-section error
    pub fn invalid_section(section: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::InvalidSection {
            section: section.into(),
            message: message.to_string(),
        }
    }
}

/// A routing condition that uses syntax outside the restricted grammar.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid expression `{expression}` at offset {position}: {message}")]
pub struct ExpressionError {
    pub expression: String,
    pub position: usize,
    pub message: String,
}

impl ExpressionError {
    pub fn new(expression: impl Into<String>, position: usize, message: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            position,
            message: message.into(),
        }
    }
}

/// Any error raised while turning definition text into a runnable graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Cycle members without an iteration limit
    #[error("cycle without loop limit: {}", nodes.join(", "))]
    CycleWithoutLimit { nodes: Vec<String> },

    /// Condition failed to parse
    #[error("{context}: {source}")]
    Expression {
        context: String,
        #[source]
        source: ExpressionError,
    },

    /// Interrupt node present but nothing to persist the suspension
    #[error("node `{node}` interrupts but the graph has no checkpointer")]
    InterruptWithoutCheckpointer { node: String },

    /// Nested definition failed to compile
    #[error("subgraph `{node}`: {errors}")]
    Subgraph { node: String, errors: CompileErrors },

    /// Definition file could not be read
    #[error("failed to read `{path}`: {message}")]
    Source { path: String, message: String },
}

impl CompileError {
    /// Config errors nested anywhere below this error, subgraphs included
    pub fn config_errors(&self) -> Vec<&ConfigError> {
        match self {
            CompileError::Config(e) => vec![e],
            CompileError::Subgraph { errors, .. } => {
                errors.iter().flat_map(|e| e.config_errors()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// The non-empty list of problems returned by a failed compile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileErrors(Vec<CompileError>);

impl CompileErrors {
    pub fn new(errors: Vec<CompileError>) -> Self {
        Self(errors)
    }

    pub fn single(error: impl Into<CompileError>) -> Self {
        Self(vec![error.into()])
    }

    pub fn push(&mut self, error: impl Into<CompileError>) {
        self.0.push(error.into());
    }

    pub fn extend(&mut self, errors: impl IntoIterator<Item = CompileError>) {
        self.0.extend(errors);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CompileError> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<CompileError> {
        self.0
    }

    /// `Ok(value)` when no error was collected
    pub fn into_result<T>(self, value: T) -> Result<T, CompileErrors> {
        if self.0.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for CompileErrors {}

impl IntoIterator for CompileErrors {
    type Item = CompileError;
    type IntoIter = std::vec::IntoIter<CompileError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Vec<ConfigError>> for CompileErrors {
    fn from(errors: Vec<ConfigError>) -> Self {
        Self(errors.into_iter().map(CompileError::Config).collect())
    }
}

impl From<ConfigError> for CompileErrors {
    fn from(error: ConfigError) -> Self {
        Self::single(error)
    }
}

/// Failure reported by a unit-of-work executor or a tool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Task ran and failed
    #[error("task `{task}` failed: {message}")]
    Failed { task: String, message: String },

    /// Backend could not be reached or refused the call
    #[error("task `{task}` unavailable: {message}")]
    Unavailable { task: String, message: String },

    /// Task returned something the node cannot use
    #[error("task `{task}` returned an invalid result: {message}")]
    InvalidResult { task: String, message: String },

    /// Tool invocation failed
    #[error("tool `{tool}` failed: {message}")]
    Tool { tool: String, message: String },

    /// Attempt exceeded the node timeout
    #[error("task `{task}` timed out after {after:?}")]
    Timeout { task: String, after: Duration },
}

impl TaskError {
    pub fn failed(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            task: task.into(),
            message: message.into(),
        }
    }

    pub fn invalid_result(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResult {
            task: task.into(),
            message: message.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Transient failures that a retry may clear
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::Unavailable { .. } | TaskError::Timeout { .. })
    }
}

/// Errors that terminate a run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Node failed and its error policy did not resolve the failure
    #[error("node `{node}` failed after {attempts} attempt(s): {source}")]
    NodeExecution {
        node: String,
        attempts: usize,
        #[source]
        source: TaskError,
    },

    /// Cyclic node visited more often than its limit allows
    #[error("node `{node}` exceeded its loop limit of {limit}")]
    LoopLimitExceeded { node: String, limit: usize },

    /// Router value matched no route and no default exists
    #[error("router `{node}`: value `{value}` matches no route and no default_route is configured")]
    UnmatchedRoute { node: String, value: String },

    /// No conditional edge matched and there is no fallback edge
    #[error("node `{node}`: no outgoing condition matched")]
    NoMatchingTransition { node: String },

    /// Whole run exceeded the workflow timeout
    #[error("workflow timed out after {0:?}")]
    WorkflowTimeout(Duration),

    /// Global step guard tripped
    #[error("max steps exceeded: {0}")]
    MaxStepsExceeded(usize),

    /// Checkpoint backend failure
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// `resume` called on a thread that is not suspended
    #[error("thread `{0}` has no pending interrupt")]
    NoPendingInterrupt(String),

    /// Persisted or supplied state is unusable
    #[error("state error: {0}")]
    State(String),
}

impl RunError {
    /// Create a checkpoint error
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    /// Create a state error
    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    /// Node the error is attributed to, when there is one
    pub fn node(&self) -> Option<&str> {
        match self {
            RunError::NodeExecution { node, .. }
            | RunError::LoopLimitExceeded { node, .. }
            | RunError::UnmatchedRoute { node, .. }
            | RunError::NoMatchingTransition { node } => Some(node),
            _ => None,
        }
    }
}

/// A fatal run termination together with the last good state.
///
/// `state.errors` holds every error recorded during the run, including the
/// fatal one.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: RunError,
    pub state: Box<ExecutionState>,
}

impl RunFailure {
    pub fn new(error: RunError, state: ExecutionState) -> Self {
        Self {
            error,
            state: Box::new(state),
        }
    }

    /// Failure before any state was loaded or created
    pub fn without_state(error: RunError) -> Self {
        Self::new(error, ExecutionState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(ConfigError: Send, Sync);
    assert_impl_all!(CompileErrors: Send, Sync, std::error::Error);
    assert_impl_all!(TaskError: Send, Sync);
    assert_impl_all!(RunError: Send, Sync);
    assert_impl_all!(RunFailure: Send, Sync);

    #[test]
    fn test_config_error_display_includes_context() {
        let err = ConfigError::UnknownEdgeEndpoint {
            index: 2,
            from: "a".into(),
            to: "ghost".into(),
            node: "ghost".into(),
        };
        assert_eq!(err.to_string(), "edge #2 (a -> ghost): unknown node `ghost`");

        let err = ConfigError::CircularSubgraph {
            chain: vec!["a.yaml".into(), "b.yaml".into(), "a.yaml".into()],
        };
        assert!(err.to_string().contains("a.yaml -> b.yaml -> a.yaml"));
    }

    #[test]
    fn test_compile_errors_collects_nested_config_errors() {
        let inner = CompileErrors::single(ConfigError::UnknownEntry("x".into()));
        let mut errors = CompileErrors::default();
        errors.push(ConfigError::MissingKey("name"));
        errors.push(CompileError::Subgraph {
            node: "child".into(),
            errors: inner,
        });

        let configs: Vec<&ConfigError> = errors.iter().flat_map(|e| e.config_errors()).collect();
        assert_eq!(configs.len(), 2);
        assert!(errors.to_string().contains("missing required top-level key `name`"));
        assert!(errors.into_result(()).is_err());
    }

    #[test]
    fn test_run_error_node_attribution() {
        let err = RunError::LoopLimitExceeded {
            node: "a".into(),
            limit: 3,
        };
        assert_eq!(err.node(), Some("a"));
        assert_eq!(RunError::MaxStepsExceeded(10).node(), None);
    }

    #[test]
    fn test_task_error_transient() {
        assert!(TaskError::Unavailable {
            task: "t".into(),
            message: "down".into()
        }
        .is_transient());
        assert!(!TaskError::failed("t", "boom").is_transient());
    }
}
