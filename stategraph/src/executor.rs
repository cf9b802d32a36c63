//! Unit-of-work executors
//!
//! Transform, router, agent, and dynamic interrupt nodes delegate their
//! external work to a [`UnitOfWork`] implementation supplied by the caller.
//! The compiler never talks to a model or an API itself; it only builds a
//! [`TaskRequest`] and interprets the structured result.
//!
//! Executors are created per backend configuration by an [`ExecutorFactory`]
//! and reused through an [`ExecutorCache`] owned by the caller, so two nodes
//! with the same `backend` block share one executor instance.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::TaskError;
use crate::message::{Message, ToolCall};
use crate::state::StateMap;
use crate::tools::ToolDefinition;

/// One call to an executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Task (prompt) name declared by the node
    pub task: String,
    /// Node issuing the call; map tasks use the nested node id
    pub node: String,
    /// Named inputs resolved from state
    pub variables: StateMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Conversation so far (agent nodes only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    /// Tools the executor may request (agent nodes only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>, node: impl Into<String>, variables: StateMap) -> Self {
        Self {
            task: task.into(),
            node: node.into(),
            variables,
            ..Default::default()
        }
    }

    pub fn with_output_schema(mut self, schema: Option<Value>) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_conversation(mut self, messages: Vec<Message>, tools: Vec<ToolDefinition>) -> Self {
        self.messages = messages;
        self.tools = tools;
        self
    }
}

/// External unit-of-work executor.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Run one task and return its structured result
    async fn execute(&self, request: TaskRequest) -> Result<Value, TaskError>;

    /// Whether `task` can be executed; checked once at compile time
    fn supports(&self, task: &str) -> bool {
        let _ = task;
        true
    }
}

pub type DynExecutor = Arc<dyn UnitOfWork>;

type ExecuteFn = dyn Fn(TaskRequest) -> BoxFuture<'static, Result<Value, TaskError>> + Send + Sync;

/// Executor backed by an async closure.
#[derive(Clone)]
pub struct FnExecutor {
    func: Arc<ExecuteFn>,
    tasks: Option<Vec<String>>,
}

impl FnExecutor {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |request| Box::pin(func(request))),
            tasks: None,
        }
    }

    /// Restrict the executor to the given task names
    pub fn with_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tasks = Some(tasks.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl UnitOfWork for FnExecutor {
    async fn execute(&self, request: TaskRequest) -> Result<Value, TaskError> {
        (self.func)(request).await
    }

    fn supports(&self, task: &str) -> bool {
        self.tasks
            .as_ref()
            .map_or(true, |tasks| tasks.iter().any(|t| t == task))
    }
}

impl std::fmt::Debug for FnExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExecutor").field("tasks", &self.tasks).finish()
    }
}

/// Creates executors from backend configuration blocks.
pub trait ExecutorFactory: Send + Sync {
    /// `backend` is the node's `backend`/`fallback` block, else `defaults.backend`
    fn create(&self, backend: Option<&Value>) -> Result<DynExecutor, String>;
}

impl<F> ExecutorFactory for F
where
    F: Fn(Option<&Value>) -> Result<DynExecutor, String> + Send + Sync,
{
    fn create(&self, backend: Option<&Value>) -> Result<DynExecutor, String> {
        self(backend)
    }
}

/// Factory that hands out one executor regardless of backend configuration.
struct SingleExecutor(DynExecutor);

impl ExecutorFactory for SingleExecutor {
    fn create(&self, _backend: Option<&Value>) -> Result<DynExecutor, String> {
        Ok(Arc::clone(&self.0))
    }
}

/// Caller-owned cache of executor instances keyed by backend configuration.
///
/// Cloning the cache shares the underlying instances.
#[derive(Clone)]
pub struct ExecutorCache {
    factory: Arc<dyn ExecutorFactory>,
    instances: Arc<Mutex<HashMap<String, DynExecutor>>>,
}

impl ExecutorCache {
    pub fn new(factory: impl ExecutorFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cache that resolves every backend to `executor`
    pub fn single(executor: impl UnitOfWork + 'static) -> Self {
        Self::new(SingleExecutor(Arc::new(executor)))
    }

    /// Executor for `backend`, created on first use
    pub fn resolve(&self, backend: Option<&Value>) -> Result<DynExecutor, String> {
        let key = backend.map_or_else(|| "default".to_string(), Value::to_string);
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(executor) = instances.get(&key) {
            return Ok(Arc::clone(executor));
        }
        debug!(backend = %key, "creating executor");
        let executor = self.factory.create(backend)?;
        instances.insert(key, Arc::clone(&executor));
        Ok(executor)
    }

    /// Number of distinct executors created so far
    pub fn len(&self) -> usize {
        self.instances.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ExecutorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorCache")
            .field("instances", &self.len())
            .finish()
    }
}

/// One agent turn as returned by an executor.
///
/// Executors answer an agent request either with a plain string (final
/// answer) or with `{"content": ..., "tool_calls": [{id, name, arguments}]}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl AgentReply {
    pub fn from_value(task: &str, value: Value) -> Result<Self, TaskError> {
        match value {
            Value::String(content) => Ok(Self {
                content,
                tool_calls: Vec::new(),
            }),
            Value::Object(mut map) => {
                let content = match map.remove("content") {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                };
                let tool_calls = match map.remove("tool_calls") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(calls) => serde_json::from_value(calls)
                        .map_err(|e| TaskError::invalid_result(task, format!("tool_calls: {e}")))?,
                };
                Ok(Self { content, tool_calls })
            }
            other => Err(TaskError::invalid_result(
                task,
                format!("expected a string or an object, got {other}"),
            )),
        }
    }

    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}
