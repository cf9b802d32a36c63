//! Agent vertex: a bounded tool-calling loop
//!
//! Each turn sends the conversation so far to the task executor. A reply
//! with tool calls is answered with one tool message per call and the loop
//! continues; a reply without tool calls ends it.
//!
//! # Conversation state
//!
//! Only the messages produced by this node are written back. The messages
//! field is append-ordered, so they land after the existing history.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{build_variables, TaskBinding};
use crate::engine::vertex::{ComputeContext, NodeOutcome, Vertex};
use crate::error::TaskError;
use crate::executor::{AgentReply, TaskRequest};
use crate::message::{Message, ToolCall};
use crate::state::StateUpdate;
use crate::tools::{BoundTool, Tool, ToolDefinition};

#[derive(Debug)]
pub struct AgentVertex {
    id: String,
    binding: TaskBinding,
    tools: Vec<BoundTool>,
    inputs: BTreeMap<String, String>,
    max_iterations: usize,
    messages_field: String,
    output: Option<String>,
}

impl AgentVertex {
    pub fn new(
        id: impl Into<String>,
        binding: TaskBinding,
        tools: Vec<BoundTool>,
        inputs: BTreeMap<String, String>,
        max_iterations: usize,
        messages_field: impl Into<String>,
        output: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            binding,
            tools,
            inputs,
            max_iterations,
            messages_field: messages_field.into(),
            output,
        }
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|tool| tool.definition()).collect()
    }

    /// Execute one tool call; failures become error text for the conversation
    async fn call_tool(&self, call: &ToolCall) -> String {
        let Some(tool) = self.tools.iter().find(|tool| tool.name() == call.name) else {
            let available: Vec<&str> = self.tools.iter().map(|t| t.name()).collect();
            warn!(node_id = %self.id, tool = %call.name, "agent requested an unknown tool");
            return format!(
                "Error: Tool '{}' is not available. Available tools: {:?}",
                call.name, available
            );
        };

        debug!(node_id = %self.id, tool = %call.name, "executing tool call");
        match tool.call(call.arguments.clone()).await {
            Ok(Value::String(text)) => text,
            Ok(other) => other.to_string(),
            Err(e) => format!("Error: {e}"),
        }
    }
}

#[async_trait]
impl Vertex for AgentVertex {
    fn id(&self) -> &str {
        &self.id
    }

    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<NodeOutcome, TaskError> {
        let history = Message::list_from_value(ctx.values().get(&self.messages_field));
        let variables = build_variables(&self.inputs, &BTreeMap::new(), ctx.values());
        let definitions = self.definitions();

        let mut produced: Vec<Message> = Vec::new();
        let mut content = String::new();
        let mut finished = false;

        for iteration in 0..self.max_iterations {
            debug!(node_id = %self.id, iteration, "agent turn");

            let conversation: Vec<Message> = history.iter().chain(&produced).cloned().collect();
            let request = TaskRequest::new(&self.binding.task, &self.id, variables.clone())
                .with_conversation(conversation, definitions.clone());
            let reply = AgentReply::from_value(&self.binding.task, self.binding.call(ctx, request).await?)?;
            content = reply.content.clone();

            if reply.is_final() {
                produced.push(Message::assistant(reply.content));
                finished = true;
                break;
            }

            produced.push(Message::assistant_with_tool_calls(
                reply.content,
                reply.tool_calls.clone(),
            ));
            for call in &reply.tool_calls {
                let result = self.call_tool(call).await;
                produced.push(Message::tool(result, &call.id));
            }
        }

        if !finished {
            warn!(
                node_id = %self.id,
                max_iterations = self.max_iterations,
                "agent reached its iteration limit, keeping the last reply"
            );
        }

        let messages = serde_json::to_value(&produced)
            .map_err(|e| TaskError::invalid_result(&self.binding.task, e.to_string()))?;
        let mut update = StateUpdate::empty().set(&self.messages_field, messages);
        if let Some(output) = &self.output {
            update.push(output, Value::String(content));
        }
        Ok(NodeOutcome::update(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::RuntimeConfig;
    use crate::engine::vertex::RunScope;
    use crate::executor::FnExecutor;
    use crate::message::Role;
    use crate::state::ExecutionState;
    use crate::tools::FnTool;
    use serde_json::json;
    use std::sync::Arc;

    fn search_tool() -> BoundTool {
        let tool = FnTool::new("search", "Search", json!({}), |args| async move {
            Ok(json!(format!("results for {}", args["q"].as_str().unwrap_or(""))))
        });
        BoundTool::new("search", Arc::new(tool), None, None)
    }

    /// Executor that asks for `tool` until it sees a tool message, then answers
    fn scripted(tool: &'static str) -> FnExecutor {
        FnExecutor::new(move |req: TaskRequest| async move {
            let answered = req.messages.iter().any(|m| m.role == Role::Tool);
            if answered {
                let last = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
                Ok(json!(format!("final: {last}")))
            } else {
                Ok(json!({
                    "content": "",
                    "tool_calls": [{"id": "c1", "name": tool, "arguments": {"q": "rust"}}]
                }))
            }
        })
    }

    async fn run(vertex: &AgentVertex, state: ExecutionState) -> StateUpdate {
        let scope = Arc::new(RunScope::new("t", Arc::new(RuntimeConfig::default())));
        let ctx = ComputeContext::new(&state, &scope);
        vertex.compute(&ctx).await.unwrap().state_update().clone()
    }

    #[tokio::test]
    async fn test_tool_loop_appends_messages() {
        let vertex = AgentVertex::new(
            "researcher",
            TaskBinding::new("research", Arc::new(scripted("search")), None),
            vec![search_tool()],
            BTreeMap::new(),
            5,
            "messages",
            Some("answer".into()),
        );
        let state = ExecutionState::from_value(json!({
            "messages": [{"role": "user", "content": "find rust"}]
        }))
        .unwrap();

        let update = run(&vertex, state).await;
        assert_eq!(update.get("answer"), Some(&json!("final: results for rust")));

        let produced = Message::list_from_value(update.get("messages"));
        assert_eq!(produced.len(), 3);
        assert!(produced[0].has_tool_calls());
        assert_eq!(produced[1].role, Role::Tool);
        assert_eq!(produced[1].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(produced[2].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_message() {
        let vertex = AgentVertex::new(
            "researcher",
            TaskBinding::new("research", Arc::new(scripted("fetch")), None),
            vec![search_tool()],
            BTreeMap::new(),
            5,
            "messages",
            Some("answer".into()),
        );

        let update = run(&vertex, ExecutionState::default()).await;
        let produced = Message::list_from_value(update.get("messages"));
        assert!(produced[1].content.starts_with("Error: Tool 'fetch' is not available"));
    }

    #[tokio::test]
    async fn test_iteration_limit_keeps_partial_result() {
        let looping = FnExecutor::new(|_req: TaskRequest| async {
            Ok(json!({
                "content": "still thinking",
                "tool_calls": [{"id": "c", "name": "search", "arguments": {"q": "more"}}]
            }))
        });
        let vertex = AgentVertex::new(
            "researcher",
            TaskBinding::new("research", Arc::new(looping), None),
            vec![search_tool()],
            BTreeMap::new(),
            2,
            "conversation",
            Some("answer".into()),
        );

        let update = run(&vertex, ExecutionState::default()).await;
        assert_eq!(update.get("answer"), Some(&json!("still thinking")));
        assert_eq!(Message::list_from_value(update.get("conversation")).len(), 4);
    }
}
