//! Shared execution state
//!
//! [`ExecutionState`] is the per-invocation data every node reads. Nodes never
//! mutate it; they return a [`StateUpdate`] and the runtime merges it field by
//! field using the merge strategy recorded in the [`StateShape`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::shape::{MergeStrategy, StateShape};

/// User-visible fields of the execution state.
pub type StateMap = serde_json::Map<String, Value>;

/// State shared across nodes of one run, plus reserved bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Fields declared by the definition or supplied by the caller
    #[serde(default)]
    pub values: StateMap,

    /// Number of node steps executed on this thread
    #[serde(default)]
    pub step: usize,

    /// Visits per loop-limited node in the current run
    #[serde(default)]
    pub loop_counters: BTreeMap<String, usize>,

    /// Recovered and fatal errors, in the order they happened
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,

    /// Set while the run is suspended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<PendingInterrupt>,
}

impl ExecutionState {
    pub fn new(values: StateMap) -> Self {
        Self {
            values,
            ..Default::default()
        }
    }

    /// Build from a JSON object; `null` is an empty state
    pub fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Object(values) => Ok(Self::new(values)),
            Value::Null => Ok(Self::default()),
            other => Err(format!("initial state must be an object, got {}", type_name(&other))),
        }
    }

    /// Resolve a dotted field path
    pub fn get(&self, path: &str) -> Option<&Value> {
        resolve_path(&self.values, path)
    }

    /// A field counts as populated when it is present and not null
    pub fn is_populated(&self, field: &str) -> bool {
        matches!(self.values.get(field), Some(v) if !v.is_null())
    }

    /// Whether the run is waiting for external input
    pub fn is_suspended(&self) -> bool {
        self.interrupt.is_some()
    }

    /// Merge a node's partial update using the shape's merge strategies.
    ///
    /// Fields unknown to the shape are overwritten.
    pub fn apply(&mut self, update: StateUpdate, shape: &StateShape) {
        for (field, value) in update.writes {
            match shape.merge_strategy(&field) {
                MergeStrategy::Overwrite => {
                    self.values.insert(field, value);
                }
                MergeStrategy::Append => {
                    let slot = self.values.entry(field).or_insert(Value::Null);
                    append_ordered(slot, value);
                }
            }
        }
    }

    /// Overwrite fields from caller input
    pub fn merge_input(&mut self, input: StateMap) {
        for (field, value) in input {
            self.values.insert(field, value);
        }
    }

    pub fn record_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
    }
}

/// Append `value` to `slot`, keeping arrival order.
///
/// Arrays are spliced element by element; a scalar already in the slot becomes
/// the first element of the resulting list.
fn append_ordered(slot: &mut Value, value: Value) {
    let mut items = match std::mem::take(slot) {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        scalar => vec![scalar],
    };
    match value {
        Value::Array(more) => items.extend(more),
        Value::Null => {}
        single => items.push(single),
    }
    *slot = Value::Array(items);
}

/// Resolve `a.b.c` against a state map. Numeric segments index arrays.
pub fn resolve_path<'a>(values: &'a StateMap, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("state.").unwrap_or(path);
    let mut segments = path.split('.');
    let mut current = values.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Partial update returned by a node.
///
/// Writes are kept in the order the node produced them; the merge strategy is
/// decided by the runtime, not the node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    writes: Vec<(String, Value)>,
}

impl StateUpdate {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Write a single field
    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.writes.push((field.into(), value));
        self
    }

    pub fn push(&mut self, field: impl Into<String>, value: Value) {
        self.writes.push((field.into(), value));
    }

    /// Concatenate another update after this one
    pub fn extend(&mut self, other: StateUpdate) {
        self.writes.extend(other.writes);
    }

    /// Last value written to `field`
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.writes
            .iter()
            .rev()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.writes.iter().map(|(name, _)| name.as_str())
    }

    /// Writes as a JSON object (later writes win)
    pub fn to_object(&self) -> Value {
        let mut map = StateMap::new();
        for (field, value) in &self.writes {
            map.insert(field.clone(), value.clone());
        }
        Value::Object(map)
    }
}

/// An error observed during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub node: String,
    pub message: String,
    pub step: usize,
    /// Whether the error ended the run
    #[serde(default)]
    pub fatal: bool,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn recovered(node: impl Into<String>, message: impl Into<String>, step: usize) -> Self {
        Self {
            node: node.into(),
            message: message.into(),
            step,
            fatal: false,
            timestamp: Utc::now(),
        }
    }

    pub fn fatal(node: impl Into<String>, message: impl Into<String>, step: usize) -> Self {
        Self {
            fatal: true,
            ..Self::recovered(node, message, step)
        }
    }
}

/// Marker for a suspended run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInterrupt {
    /// Node to re-enter on resume
    pub node: String,
    /// Field the resume value is written to
    pub resume_key: String,
    /// Payload surfaced to the caller
    pub payload: Value,
    /// Suspension raised inside a subgraph; the resume value is forwarded to it
    #[serde(default)]
    pub nested: bool,
}
