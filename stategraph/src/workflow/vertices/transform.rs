//! Transform vertex: one task or tool call whose result lands in `output`

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{build_variables, TaskBinding};
use crate::engine::vertex::{ComputeContext, NodeOutcome, Vertex};
use crate::error::TaskError;
use crate::executor::TaskRequest;
use crate::state::StateUpdate;
use crate::tools::{BoundTool, Tool};

/// What a transform node invokes
#[derive(Debug, Clone)]
pub enum TransformAction {
    Task(TaskBinding),
    Tool(BoundTool),
}

#[derive(Debug)]
pub struct TransformVertex {
    id: String,
    action: TransformAction,
    inputs: BTreeMap<String, String>,
    args: BTreeMap<String, Value>,
    output: String,
    output_schema: Option<Value>,
}

impl TransformVertex {
    pub fn new(
        id: impl Into<String>,
        action: TransformAction,
        inputs: BTreeMap<String, String>,
        args: BTreeMap<String, Value>,
        output: impl Into<String>,
        output_schema: Option<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            action,
            inputs,
            args,
            output: output.into(),
            output_schema,
        }
    }
}

#[async_trait]
impl Vertex for TransformVertex {
    fn id(&self) -> &str {
        &self.id
    }

    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<NodeOutcome, TaskError> {
        let variables = build_variables(&self.inputs, &self.args, ctx.values());

        let value = match &self.action {
            TransformAction::Task(binding) => {
                debug!(node_id = %self.id, task = %binding.task, "invoking task");
                let request = TaskRequest::new(&binding.task, &self.id, variables)
                    .with_output_schema(self.output_schema.clone());
                binding.call(ctx, request).await?
            }
            TransformAction::Tool(tool) => {
                debug!(node_id = %self.id, tool = %tool.name(), "invoking tool");
                tool.call(Value::Object(variables)).await?
            }
        };

        Ok(NodeOutcome::update(StateUpdate::empty().set(&self.output, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::RuntimeConfig;
    use crate::engine::vertex::RunScope;
    use crate::executor::FnExecutor;
    use crate::state::ExecutionState;
    use crate::tools::FnTool;
    use serde_json::json;
    use std::sync::Arc;

    fn scope() -> Arc<RunScope> {
        Arc::new(RunScope::new("t", Arc::new(RuntimeConfig::default())))
    }

    #[tokio::test]
    async fn test_task_receives_mapped_inputs() {
        let executor = FnExecutor::new(|req: TaskRequest| async move {
            Ok(json!(format!("{}:{}", req.task, req.variables["text"])))
        });
        let mut inputs = BTreeMap::new();
        inputs.insert("text".to_string(), "doc".to_string());
        let vertex = TransformVertex::new(
            "summarize",
            TransformAction::Task(TaskBinding::new("summarize", Arc::new(executor), None)),
            inputs,
            BTreeMap::new(),
            "summary",
            None,
        );

        let state = ExecutionState::from_value(json!({"doc": "hello"})).unwrap();
        let scope = scope();
        let ctx = ComputeContext::new(&state, &scope);
        let outcome = vertex.compute(&ctx).await.unwrap();
        assert_eq!(
            outcome.state_update().get("summary"),
            Some(&json!("summarize:\"hello\""))
        );
    }

    #[tokio::test]
    async fn test_fallback_attempt_uses_fallback_executor() {
        let primary = FnExecutor::new(|_req: TaskRequest| async { Ok(json!("primary")) });
        let backup = FnExecutor::new(|_req: TaskRequest| async { Ok(json!("backup")) });
        let vertex = TransformVertex::new(
            "work",
            TransformAction::Task(TaskBinding::new(
                "work",
                Arc::new(primary),
                Some(Arc::new(backup)),
            )),
            BTreeMap::new(),
            BTreeMap::new(),
            "out",
            None,
        );

        let state = ExecutionState::default();
        let scope = scope();
        let ctx = ComputeContext::new(&state, &scope).with_fallback(true);
        let outcome = vertex.compute(&ctx).await.unwrap();
        assert_eq!(outcome.state_update().get("out"), Some(&json!("backup")));
    }

    #[tokio::test]
    async fn test_tool_action() {
        let add = FnTool::new("add", "Add", json!({}), |args| async move {
            Ok(json!(args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0)))
        });
        let mut args = BTreeMap::new();
        args.insert("b".to_string(), json!(2));
        let mut inputs = BTreeMap::new();
        inputs.insert("a".to_string(), "count".to_string());
        let vertex = TransformVertex::new(
            "sum",
            TransformAction::Tool(BoundTool::new("calculator", Arc::new(add), None, None)),
            inputs,
            args,
            "total",
            None,
        );

        let state = ExecutionState::from_value(json!({"count": 40})).unwrap();
        let scope = scope();
        let ctx = ComputeContext::new(&state, &scope);
        let outcome = vertex.compute(&ctx).await.unwrap();
        assert_eq!(outcome.state_update().get("total"), Some(&json!(42)));
    }
}
