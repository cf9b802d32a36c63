//! Graph runtime: walks compiled nodes one step at a time
//!
//! Each step executes the current node, merges its update into the state
//! using the shape's merge strategies, and asks the transition table for the
//! next node. The walk ends at `END`, at a suspension, or at the first fatal
//! error.
//!
//! # Threads
//!
//! Every run belongs to a thread. With a checkpointer configured the state is
//! saved after steps (per `checkpoint_interval`), always on suspension and on
//! completion, so a later call with the same thread id picks up where the
//! previous one stopped:
//!
//! - suspended thread: resumed when the input carries the resume key,
//!   otherwise the pending suspension is returned again
//! - thread stopped mid-run: continues from the saved next node
//! - completed thread: restarts from the entry with the saved state
//!
//! History grows by one checkpoint per saved step. Set
//! `checkpoint_retention` to prune each thread after every save; otherwise
//! pruning is left to the caller through [`Checkpointer::prune`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::checkpoint::{Checkpoint, Checkpointer};
use super::config::RuntimeConfig;
use super::vertex::{NodeOutcome, RunScope};
use crate::error::{RunError, RunFailure};
use crate::shape::StateShape;
use crate::state::{type_name, ErrorRecord, ExecutionState, PendingInterrupt, StateMap};
use crate::workflow::graph::TransitionTable;
use crate::workflow::vertices::CompiledNode;

/// Result of a run that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    /// The walk reached `END`
    Complete {
        state: ExecutionState,
        thread_id: String,
    },
    /// The walk is waiting for caller input
    Suspended {
        payload: Value,
        resume_key: String,
        thread_id: String,
        state: ExecutionState,
    },
}

impl RunResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunResult::Complete { .. })
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, RunResult::Suspended { .. })
    }

    pub fn state(&self) -> &ExecutionState {
        match self {
            RunResult::Complete { state, .. } | RunResult::Suspended { state, .. } => state,
        }
    }

    pub fn into_state(self) -> ExecutionState {
        match self {
            RunResult::Complete { state, .. } | RunResult::Suspended { state, .. } => state,
        }
    }

    pub fn thread_id(&self) -> &str {
        match self {
            RunResult::Complete { thread_id, .. } | RunResult::Suspended { thread_id, .. } => thread_id,
        }
    }

    /// Suspension payload, if suspended
    pub fn payload(&self) -> Option<&Value> {
        match self {
            RunResult::Suspended { payload, .. } => Some(payload),
            RunResult::Complete { .. } => None,
        }
    }

    /// Shortcut for a field of the resulting state
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.state().get(path)
    }

    fn suspended(pending: &PendingInterrupt, thread_id: &str, state: ExecutionState) -> Self {
        RunResult::Suspended {
            payload: pending.payload.clone(),
            resume_key: pending.resume_key.clone(),
            thread_id: thread_id.to_string(),
            state,
        }
    }
}

/// How a walk stopped without failing
enum WalkEnd {
    Complete,
    Suspended(PendingInterrupt),
}

/// Executes a compiled graph.
pub struct GraphRuntime {
    name: String,
    nodes: HashMap<String, Arc<CompiledNode>>,
    transitions: TransitionTable,
    shape: Arc<StateShape>,
    config: Arc<RuntimeConfig>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
}

impl GraphRuntime {
    pub fn new(
        name: impl Into<String>,
        nodes: HashMap<String, Arc<CompiledNode>>,
        transitions: TransitionTable,
        shape: StateShape,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            name: name.into(),
            nodes,
            transitions,
            shape: Arc::new(shape),
            config: Arc::new(config),
            checkpointer: None,
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn shape(&self) -> &StateShape {
        &self.shape
    }

    pub fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }

    pub fn node(&self, id: &str) -> Option<&Arc<CompiledNode>> {
        self.nodes.get(id)
    }

    pub fn checkpointer(&self) -> Option<&Arc<dyn Checkpointer>> {
        self.checkpointer.as_ref()
    }

    /// Run the graph on `thread_id` (a fresh id when `None`).
    ///
    /// `input` must be a JSON object or `null`; its fields overwrite the
    /// saved state of an existing thread.
    pub async fn run(&self, input: Value, thread_id: Option<&str>) -> Result<RunResult, RunFailure> {
        let thread_id = thread_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut input = match input {
            Value::Object(map) => map,
            Value::Null => StateMap::new(),
            other => {
                return Err(RunFailure::without_state(RunError::state(format!(
                    "run input must be an object, got {}",
                    type_name(&other)
                ))))
            }
        };

        let Some(checkpoint) = self.load(&thread_id).await.map_err(RunFailure::without_state)? else {
            info!(graph = %self.name, thread_id = %thread_id, "starting run");
            let state = ExecutionState::new(input);
            let entry = self.transitions.entry().to_string();
            return self.walk(state, entry, &thread_id, None).await;
        };

        let mut state = checkpoint.state;

        if let Some(pending) = state.interrupt.clone() {
            let Some(value) = input.remove(&pending.resume_key) else {
                info!(
                    graph = %self.name,
                    thread_id = %thread_id,
                    node_id = %pending.node,
                    "thread is suspended, returning the pending interrupt"
                );
                return Ok(RunResult::suspended(&pending, &thread_id, state));
            };
            state.merge_input(input);
            return self.resume_state(state, value, &thread_id).await;
        }

        state.merge_input(input);
        match checkpoint.next_node {
            Some(next) => {
                info!(graph = %self.name, thread_id = %thread_id, node_id = %next, "continuing unfinished run");
                self.walk(state, next, &thread_id, None).await
            }
            None => {
                info!(graph = %self.name, thread_id = %thread_id, "restarting completed thread");
                state.loop_counters.clear();
                let entry = self.transitions.entry().to_string();
                self.walk(state, entry, &thread_id, None).await
            }
        }
    }

    /// Resume a suspended thread with the caller's value
    pub async fn resume(&self, thread_id: &str, value: Value) -> Result<RunResult, RunFailure> {
        let checkpoint = self.load(thread_id).await.map_err(RunFailure::without_state)?;
        match checkpoint {
            Some(checkpoint) if checkpoint.state.is_suspended() => {
                self.resume_state(checkpoint.state, value, thread_id).await
            }
            Some(checkpoint) => Err(RunFailure::new(
                RunError::NoPendingInterrupt(thread_id.to_string()),
                checkpoint.state,
            )),
            None => Err(RunFailure::without_state(RunError::NoPendingInterrupt(
                thread_id.to_string(),
            ))),
        }
    }

    /// Discard every checkpoint of `thread_id`
    pub async fn reset(&self, thread_id: &str) -> Result<(), RunError> {
        if let Some(checkpointer) = &self.checkpointer {
            checkpointer.delete(thread_id).await?;
            debug!(graph = %self.name, thread_id = %thread_id, "thread reset");
        }
        Ok(())
    }

    /// Latest saved state of `thread_id`
    pub async fn state(&self, thread_id: &str) -> Result<Option<ExecutionState>, RunError> {
        Ok(self.load(thread_id).await?.map(|checkpoint| checkpoint.state))
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, RunError> {
        match &self.checkpointer {
            Some(checkpointer) => checkpointer.load(thread_id).await,
            None => Ok(None),
        }
    }

    async fn save(&self, thread_id: &str, state: &ExecutionState, next: Option<String>) -> Result<(), RunError> {
        let Some(checkpointer) = &self.checkpointer else {
            return Ok(());
        };
        let checkpoint = Checkpoint::new(thread_id, state.clone(), next).with_metadata("graph", &self.name);
        checkpointer.save(&checkpoint).await?;
        debug!(graph = %self.name, thread_id = %thread_id, step = state.step, "checkpoint saved");

        if let Some(keep) = self.config.checkpoint_retention {
            let pruned = checkpointer.prune(thread_id, keep.max(1)).await?;
            if pruned > 0 {
                debug!(graph = %self.name, thread_id = %thread_id, pruned, "old checkpoints pruned");
            }
        }
        Ok(())
    }

    async fn resume_state(&self, mut state: ExecutionState, value: Value, thread_id: &str) -> Result<RunResult, RunFailure> {
        let Some(pending) = state.interrupt.take() else {
            return Err(RunFailure::new(RunError::NoPendingInterrupt(thread_id.to_string()), state));
        };
        info!(graph = %self.name, thread_id = %thread_id, node_id = %pending.node, "resuming");
        self.walk(state, pending.node, thread_id, Some(value)).await
    }

    /// Walk from `start`, enforcing the workflow timeout
    async fn walk(
        &self,
        mut state: ExecutionState,
        start: String,
        thread_id: &str,
        resume: Option<Value>,
    ) -> Result<RunResult, RunFailure> {
        let scope = Arc::new(RunScope::new(thread_id, Arc::clone(&self.config)));

        let outcome = match self.config.workflow_timeout {
            Some(limit) => match timeout(limit, self.walk_inner(&mut state, start, &scope, resume)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RunError::WorkflowTimeout(limit)),
            },
            None => self.walk_inner(&mut state, start, &scope, resume).await,
        };

        match outcome {
            Ok(WalkEnd::Complete) => Ok(RunResult::Complete {
                state,
                thread_id: thread_id.to_string(),
            }),
            Ok(WalkEnd::Suspended(pending)) => Ok(RunResult::suspended(&pending, thread_id, state)),
            Err(err) => {
                let node = err.node().unwrap_or(self.name.as_str()).to_string();
                error!(graph = %self.name, thread_id = %thread_id, error = %err, "run failed");
                let step = state.step;
                state.record_error(ErrorRecord::fatal(node, err.to_string(), step));
                Err(RunFailure::new(err, state))
            }
        }
    }

    async fn walk_inner(
        &self,
        state: &mut ExecutionState,
        start: String,
        scope: &Arc<RunScope>,
        mut resume: Option<Value>,
    ) -> Result<WalkEnd, RunError> {
        let mut current = start;
        let mut steps = 0usize;

        loop {
            if steps >= self.config.max_steps {
                warn!(graph = %self.name, max_steps = self.config.max_steps, "step limit reached");
                return Err(RunError::MaxStepsExceeded(self.config.max_steps));
            }

            let node = self
                .nodes
                .get(&current)
                .cloned()
                .ok_or_else(|| RunError::state(format!("unknown node `{current}`")))?;

            // Re-entering a suspended node does not count as a new visit
            if resume.is_none() {
                if let Some(limit) = self.transitions.loop_limit(&current) {
                    let visits = state.loop_counters.entry(current.clone()).or_insert(0);
                    *visits += 1;
                    if *visits > limit {
                        return Err(RunError::LoopLimitExceeded {
                            node: current,
                            limit,
                        });
                    }
                }
            }

            debug!(graph = %self.name, node_id = %current, kind = node.kind(), step = state.step, "executing node");
            let run = node.execute(state, scope, resume.as_ref()).await;
            resume = None;
            steps += 1;
            state.step += 1;

            for record in run.errors {
                state.record_error(record);
            }

            match run.result? {
                NodeOutcome::Continue(update) => state.apply(update, &self.shape),
                NodeOutcome::Suspend(suspension) => {
                    state.apply(suspension.update, &self.shape);
                    let pending = PendingInterrupt {
                        node: current.clone(),
                        resume_key: suspension.resume_key,
                        payload: suspension.payload,
                        nested: suspension.nested,
                    };
                    state.interrupt = Some(pending.clone());
                    self.save(&scope.thread_id, state, Some(current.clone())).await?;
                    info!(
                        graph = %self.name,
                        thread_id = %scope.thread_id,
                        node_id = %current,
                        nested = pending.nested,
                        "run suspended"
                    );
                    return Ok(WalkEnd::Suspended(pending));
                }
            }

            match self.transitions.next(&current, &state.values)? {
                Some(next) => {
                    if self.config.should_checkpoint(state.step) {
                        self.save(&scope.thread_id, state, Some(next.clone())).await?;
                    }
                    current = next;
                }
                None => {
                    self.save(&scope.thread_id, state, None).await?;
                    info!(graph = %self.name, thread_id = %scope.thread_id, steps, "run complete");
                    return Ok(WalkEnd::Complete);
                }
            }
        }
    }
}

impl std::fmt::Debug for GraphRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRuntime")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .field("config", &self.config)
            .field("checkpointer", &self.checkpointer.is_some())
            .finish()
    }
}
