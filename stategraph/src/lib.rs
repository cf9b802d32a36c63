//! stategraph: declarative workflow compiler and execution control
//!
//! Workflows are written as YAML: named nodes of a fixed set of kinds, edges
//! between them (plain, conditional, or routed), and defaults for retries,
//! loop limits and timeouts. The compiler validates the whole definition,
//! infers the state shape, and produces a [`CompiledGraph`] that walks the
//! nodes over a shared state, one step at a time.
//!
//! The crate never calls a model itself. Tasks are delegated to a caller
//! supplied [`UnitOfWork`] and tools to a [`ToolRegistry`]; the engine owns
//! control flow only: routing, loops, fan-out, retries, suspension for human
//! input, and checkpoints.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use stategraph::{Compiler, ExecutorCache, FnExecutor, MemoryCheckpointer, RunResult};
//!
//! let executor = FnExecutor::new(|req| async move { Ok(json!(format!("ran {}", req.task))) })
//!     .with_tasks(["draft"]);
//!
//! let graph = Compiler::new(ExecutorCache::single(executor))
//!     .with_checkpointer(Arc::new(MemoryCheckpointer::new()))
//!     .compile_file("review.yaml")
//!     .await?;
//!
//! match graph.run(json!({"topic": "rust"}), Some("thread-1")).await? {
//!     RunResult::Suspended { payload, .. } => println!("needs input: {payload}"),
//!     RunResult::Complete { state, .. } => println!("{:?}", state.values),
//! }
//! ```
//!
//! # Node Kinds
//!
//! | Kind        | Does                                                   |
//! |-------------|--------------------------------------------------------|
//! | transform   | one task or tool call, result written to `output`      |
//! | router      | classification value that selects a route              |
//! | agent       | tool-calling loop bounded by `max_iterations`          |
//! | map         | runs a nested node once per list item, order preserved |
//! | interrupt   | suspends until the caller resumes with a value         |
//! | subgraph    | runs another workflow on a derived thread              |
//! | passthrough | state bookkeeping without a task                       |

pub mod definition;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expression;
pub mod message;
pub mod shape;
pub mod state;
pub mod template;
pub mod tools;
pub mod workflow;

// Re-exports for convenience
pub use definition::{parse, Defaults, NodeKind, NodeSpec, WorkflowDefinition, END, START};
pub use definition::{FsLoader, MemoryLoader, SourceLoader};
pub use engine::{
    Checkpoint, Checkpointer, CheckpointerConfig, FileCheckpointer, MemoryCheckpointer,
    RetryPolicy, RunResult, RuntimeConfig,
};
#[cfg(feature = "checkpointer-sqlite")]
pub use engine::SqliteCheckpointer;
pub use error::{CompileError, CompileErrors, ConfigError, RunError, RunFailure, TaskError};
pub use executor::{
    AgentReply, DynExecutor, ExecutorCache, ExecutorFactory, FnExecutor, TaskRequest, UnitOfWork,
};
pub use expression::Condition;
pub use message::{Message, Role, ToolCall};
pub use shape::{FieldType, MergeStrategy, StateShape};
pub use state::{ExecutionState, StateMap, StateUpdate};
pub use tools::{BoundTool, DynTool, FnTool, Tool, ToolDefinition, ToolRegistry};
pub use workflow::{CompiledGraph, Compiler};
