//! Router vertex: produces the classification value that selects the next node
//!
//! The vertex only writes the value to its route field; the transition table
//! maps it to a target.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{build_variables, TaskBinding};
use crate::engine::vertex::{ComputeContext, NodeOutcome, Vertex};
use crate::error::TaskError;
use crate::executor::TaskRequest;
use crate::state::{resolve_path, StateUpdate};

/// Where the classification value comes from
#[derive(Debug, Clone)]
pub enum RouteSource {
    Task(TaskBinding),
    /// Read from a state path, no external call
    Field(String),
}

#[derive(Debug)]
pub struct RouterVertex {
    id: String,
    source: RouteSource,
    inputs: BTreeMap<String, String>,
    route_field: String,
    classification_key: String,
    output_schema: Option<Value>,
}

impl RouterVertex {
    pub fn new(
        id: impl Into<String>,
        source: RouteSource,
        inputs: BTreeMap<String, String>,
        route_field: impl Into<String>,
        classification_key: impl Into<String>,
        output_schema: Option<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            inputs,
            route_field: route_field.into(),
            classification_key: classification_key.into(),
            output_schema,
        }
    }

    /// Pull the classification out of a task result
    fn classify(&self, result: Value) -> Value {
        match result {
            Value::String(s) => Value::String(s.trim().to_string()),
            Value::Object(mut map) => match map.remove(&self.classification_key) {
                Some(Value::String(s)) => Value::String(s.trim().to_string()),
                Some(other) => other,
                None => Value::Null,
            },
            other => other,
        }
    }
}

#[async_trait]
impl Vertex for RouterVertex {
    fn id(&self) -> &str {
        &self.id
    }

    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<NodeOutcome, TaskError> {
        let value = match &self.source {
            RouteSource::Field(path) => resolve_path(ctx.values(), path)
                .cloned()
                .unwrap_or(Value::Null),
            RouteSource::Task(binding) => {
                let variables = build_variables(&self.inputs, &BTreeMap::new(), ctx.values());
                let request = TaskRequest::new(&binding.task, &self.id, variables)
                    .with_output_schema(self.output_schema.clone());
                self.classify(binding.call(ctx, request).await?)
            }
        };

        debug!(node_id = %self.id, route = %value, "classified");
        Ok(NodeOutcome::update(
            StateUpdate::empty().set(&self.route_field, value),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::RuntimeConfig;
    use crate::engine::vertex::RunScope;
    use crate::executor::FnExecutor;
    use crate::state::ExecutionState;
    use serde_json::json;
    use std::sync::Arc;

    async fn route_with(source: RouteSource, state: ExecutionState) -> Value {
        let vertex = RouterVertex::new("triage", source, BTreeMap::new(), "triage_route", "route", None);
        let scope = Arc::new(RunScope::new("t", Arc::new(RuntimeConfig::default())));
        let ctx = ComputeContext::new(&state, &scope);
        let outcome = vertex.compute(&ctx).await.unwrap();
        outcome.state_update().get("triage_route").cloned().unwrap()
    }

    #[tokio::test]
    async fn test_route_from_field() {
        let state = ExecutionState::from_value(json!({"ticket": {"kind": "bug"}})).unwrap();
        let value = route_with(RouteSource::Field("ticket.kind".into()), state).await;
        assert_eq!(value, json!("bug"));
    }

    #[tokio::test]
    async fn test_route_from_structured_task_result() {
        let executor = FnExecutor::new(|_req: TaskRequest| async {
            Ok(json!({"route": " billing\n", "confidence": 0.9}))
        });
        let binding = TaskBinding::new("classify", Arc::new(executor), None);
        let value = route_with(RouteSource::Task(binding), ExecutionState::default()).await;
        assert_eq!(value, json!("billing"));
    }

    #[tokio::test]
    async fn test_missing_classification_key_is_null() {
        let executor = FnExecutor::new(|_req: TaskRequest| async { Ok(json!({"label": "x"})) });
        let binding = TaskBinding::new("classify", Arc::new(executor), None);
        let value = route_with(RouteSource::Task(binding), ExecutionState::default()).await;
        assert_eq!(value, Value::Null);
    }
}
