//! Workflow definitions
//!
//! Parses definition text (YAML, or JSON as a YAML subset) into an immutable
//! [`WorkflowDefinition`] and validates cross references between nodes,
//! edges, and tools. Parsing is pure: on any error the full list of
//! [`ConfigError`]s is returned and nothing is compiled.
//!
//! ```yaml
//! name: review
//! nodes:
//!   draft:  { type: transform, task: draft, output: draft }
//!   ask:    { type: interrupt, message: "Approve {draft}?" }
//! edges:
//!   - { from: START, to: draft }
//!   - { from: draft, to: ask }
//!   - { from: ask, to: END }
//! checkpoint: { type: memory }
//! ```

pub mod edge;
pub mod loader;
pub mod node;
pub mod validate;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_yaml::Value as YamlValue;

use crate::engine::checkpoint::CheckpointerConfig;
use crate::error::ConfigError;

pub use edge::{is_marker, EdgeSpec, EdgeTargets, END, START};
pub use loader::{CompileContext, FsLoader, LoadedSource, MemoryLoader, SourceLoader};
pub use node::{
    AgentConfig, ErrorPolicy, InterruptConfig, MapConfig, NodeKind, NodeOptions, NodeSpec,
    PassthroughConfig, RouterConfig, SubgraphConfig, TransformConfig, NODE_TYPES,
};
pub use validate::validate;

/// A parsed workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Explicit entry node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub tools: BTreeMap<String, ToolSpec>,

    /// Nodes in declaration order
    pub nodes: Vec<NodeSpec>,

    pub edges: Vec<EdgeSpec>,

    #[serde(default)]
    pub loop_limits: BTreeMap<String, usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointerConfig>,
}

impl WorkflowDefinition {
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|node| node.id.as_str())
    }

    /// Entry node: `entry`, else the target of the `START` edge, else the first node
    pub fn entry_point(&self) -> Option<&str> {
        if let Some(entry) = &self.entry {
            return Some(entry);
        }
        self.edges
            .iter()
            .find(|edge| edge.from == START)
            .and_then(|edge| edge.targets().first())
            .map(String::as_str)
            .or_else(|| self.nodes.first().map(|node| node.id.as_str()))
    }

    /// Id of the first interrupt node, looking through map sub-nodes
    pub fn first_interrupt(&self) -> Option<&str> {
        fn find(node: &NodeSpec) -> Option<&str> {
            match &node.kind {
                NodeKind::Interrupt(_) => Some(&node.id),
                NodeKind::Map(config) => find(&config.node),
                _ => None,
            }
        }
        self.nodes.iter().find_map(find)
    }
}

/// The `defaults:` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Retry bound for nodes with `on_error: retry`
    pub max_retries: usize,

    /// Limit given to cycle members when their cycle declares none
    pub loop_limit: Option<usize>,

    /// Skip nodes whose outputs are already populated
    pub skip_if_exists: bool,

    /// Global guard on node steps per run
    pub max_steps: usize,

    /// Concurrent map tasks (default: CPU count)
    pub parallelism: Option<usize>,

    /// Checkpoint every N steps (suspension and completion always checkpoint)
    pub checkpoint_interval: usize,

    /// Checkpoints kept per thread; unset keeps the full history
    pub checkpoint_retention: Option<usize>,

    #[serde(with = "humantime_serde")]
    pub node_timeout: Option<Duration>,

    #[serde(with = "humantime_serde")]
    pub workflow_timeout: Option<Duration>,

    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Backend configuration handed to the executor factory
    pub backend: Option<Value>,

    pub messages_field: String,

    pub max_iterations: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            loop_limit: None,
            skip_if_exists: true,
            max_steps: 100,
            parallelism: None,
            checkpoint_interval: 1,
            checkpoint_retention: None,
            node_timeout: None,
            workflow_timeout: None,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            backend: None,
            messages_field: "messages".to_string(),
            max_iterations: 10,
        }
    }
}

/// A declared tool binding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Registry name (defaults to the declared name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON schema for the arguments, overriding the registered one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Parse definition text.
pub fn parse(text: &str) -> Result<WorkflowDefinition, Vec<ConfigError>> {
    let root: YamlValue =
        serde_yaml::from_str(text).map_err(|e| vec![ConfigError::Parse(e.to_string())])?;
    parse_value(root)
}

/// Parse an already-decoded definition (used for inline subgraphs).
pub fn parse_json(value: &Value) -> Result<WorkflowDefinition, Vec<ConfigError>> {
    let root = serde_yaml::to_value(value).map_err(|e| vec![ConfigError::Parse(e.to_string())])?;
    parse_value(root)
}

fn parse_value(root: YamlValue) -> Result<WorkflowDefinition, Vec<ConfigError>> {
    let YamlValue::Mapping(root) = root else {
        return Err(vec![ConfigError::Parse(
            "top level must be a mapping".to_string(),
        )]);
    };
    let mut errors = Vec::new();

    let name = match root.get("name") {
        Some(YamlValue::String(name)) if !name.trim().is_empty() => name.clone(),
        Some(_) => {
            errors.push(ConfigError::invalid_section("name", "must be a non-empty string"));
            String::new()
        }
        None => {
            errors.push(ConfigError::MissingKey("name"));
            String::new()
        }
    };

    let version = match root.get("version") {
        None => None,
        Some(value) => match scalar_to_string(value) {
            Some(v) if v == "1" || v.starts_with("1.") => Some(v),
            Some(v) => {
                errors.push(ConfigError::UnsupportedVersion(v));
                None
            }
            None => {
                errors.push(ConfigError::invalid_section("version", "must be a scalar"));
                None
            }
        },
    };

    let description = section::<Option<String>>(&root, "description", &mut errors).flatten();
    let entry = section::<Option<String>>(&root, "entry", &mut errors).flatten();
    let defaults = section::<Defaults>(&root, "defaults", &mut errors).unwrap_or_default();
    let tools = section::<BTreeMap<String, ToolSpec>>(&root, "tools", &mut errors).unwrap_or_default();
    let loop_limits =
        section::<BTreeMap<String, usize>>(&root, "loop_limits", &mut errors).unwrap_or_default();
    let checkpoint = section::<Option<CheckpointerConfig>>(&root, "checkpoint", &mut errors).flatten();

    let nodes = match root.get("nodes") {
        Some(YamlValue::Mapping(nodes)) if !nodes.is_empty() => parse_nodes(nodes, &mut errors),
        Some(_) => {
            errors.push(ConfigError::invalid_section("nodes", "must be a non-empty mapping"));
            Vec::new()
        }
        None => {
            errors.push(ConfigError::MissingKey("nodes"));
            Vec::new()
        }
    };

    let edges = match root.get("edges") {
        Some(YamlValue::Sequence(edges)) => parse_edges(edges, &mut errors),
        Some(_) => {
            errors.push(ConfigError::invalid_section("edges", "must be a list"));
            Vec::new()
        }
        None => {
            errors.push(ConfigError::MissingKey("edges"));
            Vec::new()
        }
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(WorkflowDefinition {
        version,
        name,
        description,
        entry,
        defaults,
        tools,
        nodes,
        edges,
        loop_limits,
        checkpoint,
    })
}

/// Deserialize an optional top-level section, recording a contextual error
fn section<T: DeserializeOwned + Default>(
    root: &serde_yaml::Mapping,
    key: &str,
    errors: &mut Vec<ConfigError>,
) -> Option<T> {
    let value = root.get(key)?;
    if value.is_null() {
        return Some(T::default());
    }
    match serde_yaml::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            errors.push(ConfigError::invalid_section(key, e));
            None
        }
    }
}

fn parse_nodes(nodes: &serde_yaml::Mapping, errors: &mut Vec<ConfigError>) -> Vec<NodeSpec> {
    let mut parsed = Vec::with_capacity(nodes.len());
    for (key, body) in nodes {
        let Some(id) = scalar_to_string(key) else {
            errors.push(ConfigError::invalid_section("nodes", "node ids must be strings"));
            continue;
        };
        if is_marker(&id) {
            errors.push(ConfigError::ReservedNodeId(id));
            continue;
        }
        if let Some(node) = parse_node(&id, body, errors) {
            parsed.push(node);
        }
    }
    parsed
}

/// Parse one node body, checking `type` up front for a precise error
fn parse_node(id: &str, body: &YamlValue, errors: &mut Vec<ConfigError>) -> Option<NodeSpec> {
    let kind = match body.get("type") {
        Some(YamlValue::String(kind)) => kind.as_str(),
        Some(_) => {
            errors.push(ConfigError::invalid_node(id, "`type` must be a string"));
            return None;
        }
        None => {
            errors.push(ConfigError::invalid_node(id, "missing `type`"));
            return None;
        }
    };
    if !NODE_TYPES.contains(&kind) {
        errors.push(ConfigError::UnknownNodeType {
            node: id.to_string(),
            kind: kind.to_string(),
        });
        return None;
    }

    // Nested map nodes get their own type check so errors name the inner node
    let nested_id = format!("{id}.node");
    if kind == "map" {
        if let Some(inner) = body.get("node") {
            parse_node(&nested_id, inner, errors)?;
        }
    }

    match serde_yaml::from_value::<NodeSpec>(body.clone()) {
        Ok(mut node) => {
            assign_ids(&mut node, id);
            Some(node)
        }
        Err(e) => {
            errors.push(ConfigError::invalid_node(id, e.to_string()));
            None
        }
    }
}

fn assign_ids(node: &mut NodeSpec, id: &str) {
    node.id = id.to_string();
    if let NodeKind::Map(config) = &mut node.kind {
        assign_ids(&mut config.node, &format!("{id}.node"));
    }
}

fn parse_edges(edges: &[YamlValue], errors: &mut Vec<ConfigError>) -> Vec<EdgeSpec> {
    let mut parsed = Vec::with_capacity(edges.len());
    for (index, edge) in edges.iter().enumerate() {
        match serde_yaml::from_value::<EdgeSpec>(edge.clone()) {
            Ok(edge) => parsed.push(edge),
            Err(e) => errors.push(ConfigError::InvalidEdge {
                index,
                from: edge
                    .get("from")
                    .and_then(scalar_to_string)
                    .unwrap_or_else(|| "?".to_string()),
                message: e.to_string(),
            }),
        }
    }
    parsed
}

fn scalar_to_string(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
