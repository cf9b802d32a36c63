//! Interrupt vertex: suspends the run until the caller supplies input
//!
//! On first entry the vertex produces a message, writes it to its output
//! field and suspends. When the run is resumed the same vertex is re-entered
//! with the resume value, which it writes to `resume_key`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{build_variables, TaskBinding};
use crate::engine::vertex::{ComputeContext, NodeOutcome, Suspension, Vertex};
use crate::error::TaskError;
use crate::executor::TaskRequest;
use crate::state::StateUpdate;
use crate::template;

/// Where the suspension message comes from
#[derive(Debug, Clone)]
pub enum MessageSource {
    /// `{field}` placeholders are filled from state
    Template(String),
    Task(TaskBinding),
}

#[derive(Debug)]
pub struct InterruptVertex {
    id: String,
    source: MessageSource,
    inputs: BTreeMap<String, String>,
    output: String,
    resume_key: String,
    /// Reuse a message already in state instead of producing a new one
    reuse_message: bool,
}

impl InterruptVertex {
    pub fn new(
        id: impl Into<String>,
        source: MessageSource,
        inputs: BTreeMap<String, String>,
        output: impl Into<String>,
        resume_key: impl Into<String>,
        reuse_message: bool,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            inputs,
            output: output.into(),
            resume_key: resume_key.into(),
            reuse_message,
        }
    }

    async fn message(&self, ctx: &ComputeContext<'_>) -> Result<Value, TaskError> {
        if self.reuse_message {
            if let Some(existing) = ctx.values().get(&self.output).filter(|v| !v.is_null()) {
                return Ok(existing.clone());
            }
        }
        match &self.source {
            MessageSource::Template(text) => Ok(Value::String(template::render(text, ctx.values()))),
            MessageSource::Task(binding) => {
                let variables = build_variables(&self.inputs, &BTreeMap::new(), ctx.values());
                let request = TaskRequest::new(&binding.task, &self.id, variables);
                binding.call(ctx, request).await
            }
        }
    }
}

#[async_trait]
impl Vertex for InterruptVertex {
    fn id(&self) -> &str {
        &self.id
    }

    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<NodeOutcome, TaskError> {
        if let Some(value) = ctx.resume {
            info!(node_id = %self.id, resume_key = %self.resume_key, "resumed with caller input");
            return Ok(NodeOutcome::update(
                StateUpdate::empty().set(&self.resume_key, value.clone()),
            ));
        }

        let message = self.message(ctx).await?;
        info!(node_id = %self.id, thread_id = %ctx.thread_id(), "suspending for caller input");

        Ok(NodeOutcome::Suspend(Suspension {
            update: StateUpdate::empty().set(&self.output, message.clone()),
            payload: message,
            resume_key: self.resume_key.clone(),
            nested: false,
        }))
    }
}
