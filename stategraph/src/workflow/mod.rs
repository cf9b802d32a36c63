//! Workflow compilation
//!
//! This module turns a parsed [`WorkflowDefinition`](crate::definition::WorkflowDefinition)
//! into something the runtime can execute.
//!
//! # Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Compiler                              │
//! │                                                               │
//! │   YAML text ──► definition ──► validate ──► shape + table     │
//! │                                              │                │
//! │                      ┌───────────────────────▼────────────┐   │
//! │                      │          CompiledNode              │   │
//! │                      │  policy (skip, retry, timeout)     │   │
//! │                      │  strategy (transform, router, ...) │   │
//! │                      └───────────────────────┬────────────┘   │
//! │                                              │                │
//! │   CompiledGraph ◄── GraphRuntime ◄───────────┘                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use stategraph::workflow::Compiler;
//!
//! let graph = Compiler::new(ExecutorCache::single(executor))
//!     .with_tools(tools)
//!     .compile_file("workflows/review.yaml")
//!     .await?;
//! println!("{}", graph.to_mermaid());
//! ```

pub mod compiled;
pub mod graph;
pub mod vertices;

pub use compiled::{CompiledGraph, Compiler};
pub use graph::{EdgeView, Target, Transition, TransitionTable};
pub use vertices::{CompiledNode, NodePolicy, NodeRun, NodeStrategy, TaskBinding};
