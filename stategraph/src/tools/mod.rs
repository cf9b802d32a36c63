//! Tool bindings for transform and agent nodes
//!
//! Definitions declare tools by name under `tools:`; each declaration binds
//! to an implementation in the caller's [`ToolRegistry`]. Bindings are
//! resolved once at compile time into [`BoundTool`]s, which present the
//! declared name and schema to executors while delegating calls to the
//! registered implementation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;

/// Tool schema handed to executors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, args: Value) -> Result<Value, TaskError>;
}

pub type DynTool = Arc<dyn Tool>;

type ToolFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value, TaskError>> + Send + Sync;

/// Tool backed by an async closure.
///
/// ```ignore
/// let echo = FnTool::new("echo", "Echo the arguments", json!({"type": "object"}), |args| async move {
///     Ok(args)
/// });
/// ```
#[derive(Clone)]
pub struct FnTool {
    definition: ToolDefinition,
    func: Arc<ToolFn>,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        func: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            definition: ToolDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            func: Arc::new(move |args| Box::pin(func(args))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn call(&self, args: Value) -> Result<Value, TaskError> {
        (self.func)(args).await
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.definition.name)
            .finish()
    }
}

/// Tool implementations by registered name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, DynTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its definition name
    pub fn register(&mut self, tool: DynTool) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }

    pub fn register_all(&mut self, tools: Vec<DynTool>) {
        for tool in tools {
            self.register(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<&DynTool> {
        self.tools.get(name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A declared tool resolved against the registry.
#[derive(Clone)]
pub struct BoundTool {
    definition: ToolDefinition,
    tool: DynTool,
}

impl BoundTool {
    /// Bind `tool` under the declared `name`, overriding description and
    /// parameters when the declaration provides them
    pub fn new(
        name: impl Into<String>,
        tool: DynTool,
        description: Option<&str>,
        parameters: Option<&Value>,
    ) -> Self {
        let registered = tool.definition();
        Self {
            definition: ToolDefinition {
                name: name.into(),
                description: description
                    .map(str::to_string)
                    .unwrap_or(registered.description),
                parameters: parameters.cloned().unwrap_or(registered.parameters),
            },
            tool,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

#[async_trait]
impl Tool for BoundTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn call(&self, args: Value) -> Result<Value, TaskError> {
        self.tool.call(args).await
    }
}

impl std::fmt::Debug for BoundTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundTool")
            .field("name", &self.definition.name)
            .finish()
    }
}
