//! Conversation messages exchanged by agent nodes
//!
//! An agent node keeps its conversation in an append-ordered state field as
//! a list of serialized [`Message`]s, so checkpoints stay plain JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message author
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A tool invocation requested by the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// One conversation entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(tool_calls),
            ..Self::with_role(Role::Assistant, content)
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }

    /// Parse a conversation field, dropping entries that are not messages
    pub fn list_from_value(value: Option<&Value>) -> Vec<Message> {
        match value {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_message_roundtrip_shape() {
        let msg = Message::tool("42", "call-1");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"role": "tool", "content": "42", "tool_call_id": "call-1"}));
    }

    #[test]
    fn test_list_from_value_skips_foreign_entries() {
        let value = json!([
            {"role": "user", "content": "hi"},
            "not a message",
            {"role": "assistant", "content": "", "tool_calls": [{"id": "1", "name": "search"}]}
        ]);
        let messages = Message::list_from_value(Some(&value));
        assert_eq!(messages.len(), 2);
        assert!(messages[1].has_tool_calls());
        assert_eq!(messages[1].tool_calls.as_ref().unwrap()[0].arguments, Value::Null);
        assert!(Message::list_from_value(None).is_empty());
    }
}
