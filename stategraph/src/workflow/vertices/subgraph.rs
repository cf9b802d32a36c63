//! Subgraph vertex: runs a nested compiled graph on a derived thread
//!
//! The child runs on `<parent thread>/<node id>` so its checkpoints live
//! beside the parent's. A suspension inside the child suspends the parent
//! too; resuming the parent forwards the value to the child.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::engine::runtime::{GraphRuntime, RunResult};
use crate::engine::vertex::{ComputeContext, NodeOutcome, Suspension, Vertex};
use crate::error::TaskError;
use crate::state::{ExecutionState, StateMap, StateUpdate};

#[derive(Debug)]
pub struct SubgraphVertex {
    id: String,
    graph: Arc<GraphRuntime>,
    input_mapping: BTreeMap<String, String>,
    output_mapping: BTreeMap<String, String>,
    interrupt_output_mapping: BTreeMap<String, String>,
}

impl SubgraphVertex {
    pub fn new(
        id: impl Into<String>,
        graph: Arc<GraphRuntime>,
        input_mapping: BTreeMap<String, String>,
        output_mapping: BTreeMap<String, String>,
        interrupt_output_mapping: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            graph,
            input_mapping,
            output_mapping,
            interrupt_output_mapping,
        }
    }

    pub fn graph(&self) -> &Arc<GraphRuntime> {
        &self.graph
    }

    /// Parent fields handed to the child; absent fields are left out
    fn child_input(&self, parent: &ExecutionState) -> StateMap {
        let mut input = StateMap::new();
        for (parent_field, child_field) in &self.input_mapping {
            if let Some(value) = parent.get(parent_field) {
                input.insert(child_field.clone(), value.clone());
            }
        }
        input
    }

    /// Child fields copied back through `mapping` (child -> parent)
    fn map_back(mapping: &BTreeMap<String, String>, child: &ExecutionState) -> StateUpdate {
        let mut update = StateUpdate::empty();
        for (child_field, parent_field) in mapping {
            if let Some(value) = child.get(child_field) {
                update.push(parent_field, value.clone());
            }
        }
        update
    }
}

#[async_trait]
impl Vertex for SubgraphVertex {
    fn id(&self) -> &str {
        &self.id
    }

    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<NodeOutcome, TaskError> {
        let child_thread = ctx.scope.child_thread(&self.id);

        let result = match ctx.resume {
            Some(value) => {
                debug!(node_id = %self.id, thread_id = %child_thread, "forwarding resume value to subgraph");
                self.graph.resume(&child_thread, value.clone()).await
            }
            None => {
                // A fresh entry never continues an older child run
                self.graph
                    .reset(&child_thread)
                    .await
                    .map_err(|e| TaskError::failed(&self.id, e.to_string()))?;
                let input = self.child_input(ctx.state);
                debug!(node_id = %self.id, thread_id = %child_thread, fields = input.len(), "starting subgraph");
                self.graph
                    .run(serde_json::Value::Object(input), Some(&child_thread))
                    .await
            }
        };

        match result {
            Ok(RunResult::Complete { state, .. }) => Ok(NodeOutcome::update(Self::map_back(
                &self.output_mapping,
                &state,
            ))),
            Ok(RunResult::Suspended {
                payload,
                resume_key,
                state,
                ..
            }) => {
                info!(node_id = %self.id, thread_id = %child_thread, "subgraph suspended");
                Ok(NodeOutcome::Suspend(Suspension {
                    update: Self::map_back(&self.interrupt_output_mapping, &state),
                    payload,
                    resume_key,
                    nested: true,
                }))
            }
            Err(failure) => Err(TaskError::failed(
                &self.id,
                format!("subgraph `{}` failed: {}", self.graph.name(), failure.error),
            )),
        }
    }
}
