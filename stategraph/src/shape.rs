//! State shape inference
//!
//! One deterministic pass over the node declarations produces the
//! [`StateShape`]: every field the graph writes or reads, its type, and how
//! updates to it merge. Sources, in order:
//!
//! 1. declared outputs (`output`, map `collect`, mapping targets, passthrough targets)
//! 2. implicit fields (agent conversation, router classification, interrupt resume key,
//!    map item and index)
//! 3. inputs referenced by conditions, `inputs` paths, `requires`, and `{field}` templates
//!
//! Two writers that disagree on the merge strategy of a field fail the compile.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::definition::{NodeKind, NodeSpec, WorkflowDefinition};
use crate::error::ConfigError;
use crate::expression::referenced_paths;
use crate::template::placeholders;

/// How a node's write combines with the existing value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Replace the existing value
    #[default]
    Overwrite,
    /// Extend a list in arrival order
    #[serde(alias = "append_ordered")]
    Append,
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStrategy::Overwrite => f.write_str("overwrite"),
            MergeStrategy::Append => f.write_str("append"),
        }
    }
}

/// Coarse field type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Any,
    String,
    Integer,
    Number,
    Boolean,
    List,
    Object,
}

impl FieldType {
    /// Map a JSON-schema type name
    pub fn from_schema_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(FieldType::String),
            "integer" => Some(FieldType::Integer),
            "number" => Some(FieldType::Number),
            "boolean" => Some(FieldType::Boolean),
            "array" | "list" => Some(FieldType::List),
            "object" => Some(FieldType::Object),
            "any" => Some(FieldType::Any),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::Any => "any",
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::List => "list",
            FieldType::Object => "object",
        };
        f.write_str(name)
    }
}

/// Where a field's entry in the shape came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrigin {
    /// Declared output of a node
    Output,
    /// Contributed implicitly by a node kind
    Implicit,
    /// Only read, expected from the caller or another field
    Input,
}

/// One field of the inferred shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub merge: MergeStrategy,
    /// Nodes writing the field, in declaration order
    pub writers: Vec<String>,
    pub origin: FieldOrigin,
}

/// Field name -> type and merge strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateShape {
    fields: BTreeMap<String, FieldSpec>,
}

impl StateShape {
    pub fn get(&self, field: &str) -> Option<&FieldSpec> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Merge strategy for `field`; unknown fields overwrite
    pub fn merge_strategy(&self, field: &str) -> MergeStrategy {
        self.fields
            .get(field)
            .map(|spec| spec.merge)
            .unwrap_or_default()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub(crate) fn insert(&mut self, field: impl Into<String>, spec: FieldSpec) {
        self.fields.insert(field.into(), spec);
    }
}

/// A single write or read found while walking the nodes
struct Declaration {
    field: String,
    field_type: Option<FieldType>,
    merge: MergeStrategy,
    writer: String,
    origin: FieldOrigin,
}

/// Infer the state shape of `def`.
pub fn infer(def: &WorkflowDefinition) -> Result<StateShape, Vec<ConfigError>> {
    let mut declarations = Vec::new();
    for node in &def.nodes {
        declare_node(def, node, &mut declarations);
    }
    for edge in &def.edges {
        if let Some(condition) = &edge.condition {
            for path in referenced_paths(condition) {
                declarations.push(input(&path, &edge.from));
            }
        }
    }

    let mut shape = StateShape::default();
    let mut errors = Vec::new();

    // Writers first so inputs never decide a merge strategy
    declarations.sort_by_key(|d| d.origin == FieldOrigin::Input);
    for decl in declarations {
        match shape.fields.get_mut(&decl.field) {
            None => {
                let writers = if decl.origin == FieldOrigin::Input {
                    Vec::new()
                } else {
                    vec![decl.writer]
                };
                shape.fields.insert(
                    decl.field,
                    FieldSpec {
                        field_type: decl.field_type.unwrap_or_default(),
                        merge: decl.merge,
                        writers,
                        origin: decl.origin,
                    },
                );
            }
            Some(_) if decl.origin == FieldOrigin::Input => {}
            Some(existing) => {
                if existing.merge != decl.merge {
                    errors.push(ConfigError::ConflictingMergeStrategy {
                        field: decl.field.clone(),
                        first: existing.merge.to_string(),
                        first_writer: existing.writers.first().cloned().unwrap_or_default(),
                        second: decl.merge.to_string(),
                        second_writer: decl.writer.clone(),
                    });
                    continue;
                }
                if let Some(declared) = decl.field_type {
                    if existing.field_type == FieldType::Any {
                        existing.field_type = declared;
                    } else if existing.field_type != declared {
                        debug!(field = %decl.field, "conflicting field types, widening to any");
                        existing.field_type = FieldType::Any;
                    }
                }
                if !existing.writers.contains(&decl.writer) {
                    existing.writers.push(decl.writer);
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(shape)
    } else {
        Err(errors)
    }
}

fn output(field: &str, field_type: Option<FieldType>, merge: MergeStrategy, writer: &str) -> Declaration {
    Declaration {
        field: field.to_string(),
        field_type,
        merge,
        writer: writer.to_string(),
        origin: FieldOrigin::Output,
    }
}

fn implicit(field: &str, field_type: FieldType, merge: MergeStrategy, writer: &str) -> Declaration {
    Declaration {
        field: field.to_string(),
        field_type: Some(field_type),
        merge,
        writer: writer.to_string(),
        origin: FieldOrigin::Implicit,
    }
}

/// Top-level field of a dotted read path
fn input(path: &str, reader: &str) -> Declaration {
    let path = path.strip_prefix("state.").unwrap_or(path);
    let root = path.split('.').next().unwrap_or(path);
    Declaration {
        field: root.to_string(),
        field_type: None,
        merge: MergeStrategy::Overwrite,
        writer: reader.to_string(),
        origin: FieldOrigin::Input,
    }
}

fn declare_node(def: &WorkflowDefinition, node: &NodeSpec, out: &mut Vec<Declaration>) {
    let id = node.id.as_str();
    let merge = node.options.merge.unwrap_or_default();
    let declared_type = node.declared_type();

    for path in &node.options.requires {
        out.push(input(path, id));
    }

    match &node.kind {
        NodeKind::Transform(config) => {
            if let Some(field) = &node.options.output {
                out.push(output(field, declared_type, merge, id));
            }
            out.extend(config.inputs.values().map(|path| input(path, id)));
        }
        NodeKind::Router(config) => {
            if let Some(field) = node.output_field() {
                out.push(implicit(&field, FieldType::String, MergeStrategy::Overwrite, id));
            }
            out.extend(config.from.iter().map(|path| input(path, id)));
            out.extend(config.inputs.values().map(|path| input(path, id)));
        }
        NodeKind::Agent(config) => {
            if let Some(field) = &node.options.output {
                out.push(output(field, declared_type, merge, id));
            }
            let messages = config
                .messages_field
                .as_deref()
                .unwrap_or(&def.defaults.messages_field);
            out.push(implicit(messages, FieldType::List, MergeStrategy::Append, id));
            out.extend(config.inputs.values().map(|path| input(path, id)));
        }
        NodeKind::Map(config) => {
            out.push(implicit(&config.collect, FieldType::List, MergeStrategy::Append, id));
            out.push(input(&config.over, id));
            // The item and index only exist inside task snapshots; reads of them are not inputs
            let mut inner = Vec::new();
            declare_node(def, &config.node, &mut inner);
            let index_field = config.index_field();
            out.extend(inner.into_iter().filter(|d| {
                d.origin == FieldOrigin::Input && d.field != config.item && d.field != index_field
            }));
        }
        NodeKind::Interrupt(config) => {
            if let Some(field) = node.output_field() {
                out.push(output(&field, declared_type, merge, id));
            }
            out.push(implicit(&config.resume_key, FieldType::Any, MergeStrategy::Overwrite, id));
            if let Some(message) = &config.message {
                out.extend(placeholders(message).iter().map(|path| input(path, id)));
            }
            out.extend(config.inputs.values().map(|path| input(path, id)));
        }
        NodeKind::Subgraph(config) => {
            out.extend(config.input_mapping.keys().map(|path| input(path, id)));
            for target in config
                .output_mapping
                .values()
                .chain(config.interrupt_output_mapping.values())
            {
                out.push(output(target, None, merge, id));
            }
        }
        NodeKind::Passthrough(config) => {
            for field in config.set.keys() {
                out.push(output(field, None, merge, id));
            }
            for (target, source) in &config.copy {
                out.push(output(target, None, merge, id));
                out.push(input(source, id));
            }
            for field in config.increment.keys() {
                out.push(output(field, Some(FieldType::Number), merge, id));
            }
        }
    }
}
