//! Vertex abstractions for the graph runtime
//!
//! A vertex is the executable form of one node. The runtime hands it a
//! read-only [`ComputeContext`] and receives a [`NodeOutcome`]: either a
//! partial [`StateUpdate`] to merge, or a [`Suspension`] that halts the walk.
//! Vertices never mutate the execution state themselves.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use super::config::RuntimeConfig;
use crate::error::TaskError;
use crate::state::{ErrorRecord, ExecutionState, StateMap, StateUpdate};

/// Per-run data shared by every vertex of one walk.
#[derive(Debug, Clone)]
pub struct RunScope {
    /// Thread the run belongs to; nested runs derive theirs from it
    pub thread_id: String,
    pub config: Arc<RuntimeConfig>,
}

impl RunScope {
    pub fn new(thread_id: impl Into<String>, config: Arc<RuntimeConfig>) -> Self {
        Self {
            thread_id: thread_id.into(),
            config,
        }
    }

    /// Thread id of a nested run started by `segment`
    pub fn child_thread(&self, segment: &str) -> String {
        format!("{}/{}", self.thread_id, segment)
    }

    /// Scope for a nested run started by `segment`
    pub fn child(&self, segment: &str) -> Self {
        Self {
            thread_id: self.child_thread(segment),
            config: Arc::clone(&self.config),
        }
    }
}

/// Context provided to a vertex for one attempt.
///
/// Provides access to:
/// - the execution state (read-only)
/// - the run scope (thread id, runtime configuration)
/// - the resume value when the node is re-entered after a suspension
/// - an error sink for failures the vertex recovers from itself
pub struct ComputeContext<'a> {
    pub state: &'a ExecutionState,
    pub scope: &'a Arc<RunScope>,
    /// Value supplied by the caller when resuming this node
    pub resume: Option<&'a Value>,
    /// Set on the second attempt of a node with `on_error: fallback`
    pub fallback: bool,
    errors: Mutex<Vec<ErrorRecord>>,
}

impl<'a> ComputeContext<'a> {
    pub fn new(state: &'a ExecutionState, scope: &'a Arc<RunScope>) -> Self {
        Self {
            state,
            scope,
            resume: None,
            fallback: false,
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn with_resume(mut self, resume: Option<&'a Value>) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn values(&self) -> &StateMap {
        &self.state.values
    }

    pub fn thread_id(&self) -> &str {
        &self.scope.thread_id
    }

    pub fn is_resuming(&self) -> bool {
        self.resume.is_some()
    }

    /// Record an error the vertex recovered from
    pub fn record(&self, record: ErrorRecord) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    /// Errors recorded so far, in order
    pub fn into_errors(self) -> Vec<ErrorRecord> {
        self.errors.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

/// A suspension raised by an interrupt node or forwarded from a subgraph.
#[derive(Debug, Clone, PartialEq)]
pub struct Suspension {
    /// Merged into the state before the suspension is checkpointed
    pub update: StateUpdate,
    pub payload: Value,
    pub resume_key: String,
    /// Raised inside a nested graph rather than by this node
    pub nested: bool,
}

/// Result of a vertex computation
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// Merge the update and follow the outgoing transition
    Continue(StateUpdate),
    /// Halt the whole walk until the caller resumes
    Suspend(Suspension),
}

impl NodeOutcome {
    pub fn update(update: StateUpdate) -> Self {
        NodeOutcome::Continue(update)
    }

    pub fn empty() -> Self {
        NodeOutcome::Continue(StateUpdate::empty())
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, NodeOutcome::Suspend(_))
    }

    /// The update carried by either variant
    pub fn state_update(&self) -> &StateUpdate {
        match self {
            NodeOutcome::Continue(update) => update,
            NodeOutcome::Suspend(suspension) => &suspension.update,
        }
    }
}

/// The executable form of a node.
///
/// Implemented by each node kind; the node compiler wraps them in a closed
/// enum so dispatch is exhaustive.
#[async_trait]
pub trait Vertex: Send + Sync {
    fn id(&self) -> &str;

    /// Execute one attempt
    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<NodeOutcome, TaskError>;
}

pub type BoxedVertex = Arc<dyn Vertex>;
