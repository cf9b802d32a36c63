//! Node declarations
//!
//! Each node in a definition has a `type` drawn from a closed set. The kind is
//! an internally tagged enum so the compiler handles every kind explicitly.
//!
//! # Node Types
//!
//! - **transform**: one external unit-of-work (or tool) call, result written to `output`
//! - **router**: classification value selects the next node through `routes`
//! - **agent**: repeated unit-of-work calls with tool calling
//! - **map**: fan-out of a nested node over a list, ordered collection
//! - **interrupt**: suspend the run until the caller supplies input
//! - **subgraph**: nested workflow with explicit field mappings
//! - **passthrough**: pure state transformation

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::shape::{FieldType, MergeStrategy};

/// Type names accepted in the `type` key
pub const NODE_TYPES: &[&str] = &[
    "transform",
    "router",
    "agent",
    "map",
    "interrupt",
    "subgraph",
    "passthrough",
];

/// A node declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Key under `nodes`; nested map nodes are named `<map>.node`
    #[serde(skip)]
    pub id: String,

    #[serde(flatten)]
    pub kind: NodeKind,

    #[serde(flatten)]
    pub options: NodeOptions,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            options: NodeOptions::default(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Output field for kinds that write a single result
    pub fn output_field(&self) -> Option<String> {
        match &self.kind {
            NodeKind::Router(_) => Some(
                self.options
                    .output
                    .clone()
                    .unwrap_or_else(|| format!("{}_route", self.id)),
            ),
            NodeKind::Interrupt(_) => Some(
                self.options
                    .output
                    .clone()
                    .unwrap_or_else(|| format!("{}_message", self.id)),
            ),
            NodeKind::Map(config) => Some(config.collect.clone()),
            NodeKind::Transform(_) | NodeKind::Agent(_) => self.options.output.clone(),
            NodeKind::Subgraph(_) | NodeKind::Passthrough(_) => None,
        }
    }

    /// Field type declared through `output_type` or `output_schema.type`
    pub fn declared_type(&self) -> Option<FieldType> {
        self.options.output_type.or_else(|| {
            self.options
                .output_schema
                .as_ref()
                .and_then(|schema| schema.get("type"))
                .and_then(Value::as_str)
                .and_then(FieldType::from_schema_name)
        })
    }
}

/// The kind of node, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Transform(TransformConfig),
    Router(RouterConfig),
    Agent(AgentConfig),
    Map(MapConfig),
    Interrupt(InterruptConfig),
    Subgraph(SubgraphConfig),
    Passthrough(PassthroughConfig),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Transform(_) => "transform",
            NodeKind::Router(_) => "router",
            NodeKind::Agent(_) => "agent",
            NodeKind::Map(_) => "map",
            NodeKind::Interrupt(_) => "interrupt",
            NodeKind::Subgraph(_) => "subgraph",
            NodeKind::Passthrough(_) => "passthrough",
        }
    }
}

/// Options shared by every node kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Field the node writes its result to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<FieldType>,

    /// Schema handed to the executor with the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,

    /// Merge strategy for the output field (default overwrite)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeStrategy>,

    #[serde(default)]
    pub on_error: ErrorPolicy,

    /// Retry bound for `on_error: retry` (falls back to the runtime retry policy, seeded from `defaults.max_retries`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<usize>,

    /// Alternate backend configuration for `on_error: fallback`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Value>,

    /// Backend configuration passed to the executor factory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Value>,

    /// Fields that must be populated before the node runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    /// Explicit skip-if-output-exists setting; unset means "decide at compile time"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if_exists: Option<bool>,

    /// Per-attempt timeout
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

/// What to do when a node's external call fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// End the run
    #[default]
    Fail,
    /// Record the error and continue with an empty update
    Skip,
    /// Re-invoke up to `max_retries` times
    Retry,
    /// Retry once against the `fallback` backend
    Fallback,
}

/// Configuration for a transform node.
///
/// Exactly one of `task` and `tool` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Unit-of-work task name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    /// Declared tool to call instead of a task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    /// Variable name -> state path; empty means "pass the whole state"
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,

    /// Static variables (overridden by `inputs`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, Value>,
}

/// Configuration for a router node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Task producing the classification value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    /// State path holding the classification value (no external call)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,

    /// Classification value -> node id (or END)
    #[serde(default)]
    pub routes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_route: Option<String>,

    /// Key read from a structured task result
    #[serde(default = "default_classification_key")]
    pub classification_key: String,
}

fn default_classification_key() -> String {
    "route".to_string()
}

/// Configuration for an agent (tool-using loop) node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub task: String,

    /// Declared tool names the agent may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,

    /// Iteration bound (falls back to `defaults.max_iterations`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,

    /// Append-ordered conversation field (falls back to `defaults.messages_field`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_field: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
}

/// Configuration for a map (fan-out) node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    /// State path resolving to the source list
    pub over: String,

    /// Name the current item is injected under
    #[serde(rename = "as")]
    pub item: String,

    /// Node executed once per item
    pub node: Box<NodeSpec>,

    /// Append-ordered field receiving results in source order
    pub collect: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl MapConfig {
    /// Field the item index is injected under
    pub fn index_field(&self) -> String {
        format!("{}_index", self.item)
    }
}

/// Configuration for an interrupt node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterruptConfig {
    /// Static message; `{field}` placeholders are filled from state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Task producing a dynamic message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,

    /// Field receiving the caller's resume value
    #[serde(default = "default_resume_key")]
    pub resume_key: String,
}

fn default_resume_key() -> String {
    "user_input".to_string()
}

/// Configuration for a subgraph node.
///
/// Exactly one of `graph` and `definition` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubgraphConfig {
    /// Reference resolved by the source loader (usually a file path)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<String>,

    /// Inline nested definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<Value>,

    /// Parent field -> child field
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,

    /// Child field -> parent field, applied on completion
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,

    /// Child field -> parent field, applied when the child suspends
    #[serde(default)]
    pub interrupt_output_mapping: BTreeMap<String, String>,
}

/// Configuration for a passthrough node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassthroughConfig {
    /// Field -> literal value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, Value>,

    /// Target field -> source path
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub copy: BTreeMap<String, String>,

    /// Field -> numeric delta
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub increment: BTreeMap<String, serde_json::Number>,
}

impl PassthroughConfig {
    /// Every field this node writes, in a stable order
    pub fn targets(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .set
            .keys()
            .chain(self.copy.keys())
            .chain(self.increment.keys())
            .cloned()
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(yaml: &str, id: &str) -> NodeSpec {
        let mut spec: NodeSpec = serde_yaml::from_str(yaml).unwrap();
        spec.id = id.to_string();
        spec
    }

    #[test]
    fn test_transform_with_common_options() {
        let spec = parse(
            r#"
type: transform
task: summarize
inputs: { text: doc.body }
output: summary
output_type: string
on_error: retry
max_retries: 2
timeout: 250ms
"#,
            "summarize",
        );

        match &spec.kind {
            NodeKind::Transform(config) => {
                assert_eq!(config.task.as_deref(), Some("summarize"));
                assert_eq!(config.inputs["text"], "doc.body");
            }
            _ => panic!("Wrong variant"),
        }
        assert_eq!(spec.options.on_error, ErrorPolicy::Retry);
        assert_eq!(spec.options.max_retries, Some(2));
        assert_eq!(spec.options.timeout, Some(Duration::from_millis(250)));
        assert_eq!(spec.output_field().as_deref(), Some("summary"));
        assert_eq!(spec.declared_type(), Some(FieldType::String));
    }

    #[test]
    fn test_router_defaults() {
        let spec = parse(
            r#"
type: router
task: classify
routes: { positive: p, negative: n }
"#,
            "triage",
        );

        match &spec.kind {
            NodeKind::Router(config) => {
                assert_eq!(config.routes.len(), 2);
                assert_eq!(config.default_route, None);
                assert_eq!(config.classification_key, "route");
            }
            _ => panic!("Wrong variant"),
        }
        assert_eq!(spec.output_field().as_deref(), Some("triage_route"));
    }

    #[test]
    fn test_map_with_nested_node() {
        let spec = parse(
            r#"
type: map
over: items
as: item
collect: results
node:
  type: transform
  task: score
  output: score
"#,
            "fan",
        );

        match &spec.kind {
            NodeKind::Map(config) => {
                assert_eq!(config.item, "item");
                assert_eq!(config.index_field(), "item_index");
                assert_eq!(config.node.type_name(), "transform");
            }
            _ => panic!("Wrong variant"),
        }
        assert_eq!(spec.output_field().as_deref(), Some("results"));
    }

    #[test]
    fn test_interrupt_defaults() {
        let spec = parse("type: interrupt\nmessage: Approve?", "ask");
        match &spec.kind {
            NodeKind::Interrupt(config) => assert_eq!(config.resume_key, "user_input"),
            _ => panic!("Wrong variant"),
        }
        assert_eq!(spec.output_field().as_deref(), Some("ask_message"));
    }

    #[test]
    fn test_output_schema_type() {
        let spec = parse(
            "type: transform\ntask: t\noutput: o\noutput_schema: { type: object }",
            "t",
        );
        assert_eq!(spec.declared_type(), Some(FieldType::Object));
        assert_eq!(spec.options.output_schema, Some(json!({"type": "object"})));
    }

    #[test]
    fn test_passthrough_targets_sorted() {
        let spec = parse(
            "type: passthrough\nset: { z: 1 }\nincrement: { count: 1 }\ncopy: { a: b }",
            "p",
        );
        match &spec.kind {
            NodeKind::Passthrough(config) => {
                assert_eq!(config.targets(), vec!["a", "count", "z"]);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result: Result<NodeSpec, _> = serde_yaml::from_str("type: teleport");
        assert!(result.is_err());
    }
}
