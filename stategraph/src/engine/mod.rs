//! Execution engine
//!
//! The runtime half of the crate: vertices, the step loop that walks them,
//! runtime limits, checkpoint persistence, and diagram rendering.
//!
//! # Module Structure
//!
//! - `vertex`: the [`Vertex`] trait and the context/outcome types it uses
//! - `runtime`: [`GraphRuntime`], which walks a compiled graph per thread
//! - `config`: [`RuntimeConfig`] and [`RetryPolicy`]
//! - `checkpoint`: [`Checkpointer`] trait with memory, file and SQLite backends
//! - `visualization`: Mermaid flowchart output

pub mod checkpoint;
pub mod config;
pub mod runtime;
pub mod vertex;
pub mod visualization;

pub use checkpoint::{
    create_checkpointer, Checkpoint, Checkpointer, CheckpointerConfig, FileCheckpointer,
    MemoryCheckpointer,
};
#[cfg(feature = "checkpointer-sqlite")]
pub use checkpoint::SqliteCheckpointer;
pub use config::{RetryPolicy, RuntimeConfig};
pub use runtime::{GraphRuntime, RunResult};
pub use vertex::{BoxedVertex, ComputeContext, NodeOutcome, RunScope, Suspension, Vertex};
