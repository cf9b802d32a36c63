//! Transition table and cycle detection
//!
//! Compiles the `edges:` list and router `routes:` into one transition per
//! node. Conditional edges keep declaration order and the first match wins;
//! an unconditional edge among them is the fallback. Cycles are the strongly
//! connected components of the table, and every member must end up with an
//! iteration limit.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::definition::{NodeKind, WorkflowDefinition, END, START};
use crate::error::{CompileError, ConfigError, RunError};
use crate::expression::Condition;
use crate::state::{resolve_path, StateMap};

/// Where a transition leads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Node(String),
    End,
}

impl Target {
    pub fn parse(id: &str) -> Self {
        if id == END {
            Target::End
        } else {
            Target::Node(id.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Target::Node(id) => id,
            Target::End => END,
        }
    }

    fn node(&self) -> Option<&str> {
        match self {
            Target::Node(id) => Some(id),
            Target::End => None,
        }
    }
}

/// Outgoing transition of one node.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Single unconditional edge
    Direct(Target),
    /// Ordered conditions, first match wins
    Conditional {
        branches: Vec<(Condition, Target)>,
        fallback: Option<Target>,
    },
    /// Router: the value in `field` selects a route
    Route {
        field: String,
        routes: BTreeMap<String, Target>,
        default: Option<Target>,
    },
}

impl Transition {
    /// Every target this transition can lead to
    pub fn targets(&self) -> Vec<&Target> {
        match self {
            Transition::Direct(target) => vec![target],
            Transition::Conditional { branches, fallback } => branches
                .iter()
                .map(|(_, target)| target)
                .chain(fallback.iter())
                .collect(),
            Transition::Route { routes, default, .. } => {
                routes.values().chain(default.iter()).collect()
            }
        }
    }
}

/// A labelled edge, for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeView {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
}

/// Compiled transitions of a graph.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    entry: String,
    transitions: HashMap<String, Transition>,
    loop_limits: BTreeMap<String, usize>,
    cycles: Vec<Vec<String>>,
}

impl TransitionTable {
    /// Build and check the transitions of `def`.
    ///
    /// Reports ambiguous or missing transitions, invalid conditions,
    /// unreachable nodes, and cycles without an iteration limit.
    pub fn build(def: &WorkflowDefinition) -> Result<Self, Vec<CompileError>> {
        let mut errors: Vec<CompileError> = Vec::new();
        let Some(entry) = def.entry_point().map(str::to_string) else {
            return Err(vec![ConfigError::MissingKey("nodes").into()]);
        };

        let mut transitions = HashMap::new();
        for node in &def.nodes {
            let transition = match &node.kind {
                NodeKind::Router(config) => Some(Transition::Route {
                    field: node.output_field().unwrap_or_else(|| format!("{}_route", node.id)),
                    routes: config
                        .routes
                        .iter()
                        .map(|(value, target)| (value.clone(), Target::parse(target)))
                        .collect(),
                    default: config.default_route.as_deref().map(Target::parse),
                }),
                _ => compile_edges(def, &node.id, &mut errors),
            };
            if let Some(transition) = transition {
                transitions.insert(node.id.clone(), transition);
            }
        }

        let mut table = Self {
            entry,
            transitions,
            loop_limits: BTreeMap::new(),
            cycles: Vec::new(),
        };

        let reachable = table.reachable();
        for id in def.node_ids() {
            if !reachable.contains(id) {
                errors.push(
                    ConfigError::UnreachableNode {
                        node: id.to_string(),
                        entry: table.entry.clone(),
                    }
                    .into(),
                );
            }
        }

        table.cycles = strongly_connected(def, &table);
        match assign_loop_limits(def, &table.cycles) {
            Ok(limits) => table.loop_limits = limits,
            Err(error) => errors.push(error),
        }

        if errors.is_empty() {
            Ok(table)
        } else {
            Err(errors)
        }
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn transition(&self, node: &str) -> Option<&Transition> {
        self.transitions.get(node)
    }

    /// Node ids reachable in one step from `node`
    pub fn successors(&self, node: &str) -> Vec<&str> {
        self.transitions
            .get(node)
            .map(|t| t.targets().into_iter().filter_map(Target::node).collect())
            .unwrap_or_default()
    }

    /// Iteration limit of `node`, if it has one
    pub fn loop_limit(&self, node: &str) -> Option<usize> {
        self.loop_limits.get(node).copied()
    }

    /// Detected cycles, each a sorted list of member ids
    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    pub fn in_cycle(&self, node: &str) -> bool {
        self.cycles.iter().any(|c| c.iter().any(|m| m == node))
    }

    /// Node to run after `node`; `None` means the run reached END
    pub fn next(&self, node: &str, values: &StateMap) -> Result<Option<String>, RunError> {
        let Some(transition) = self.transitions.get(node) else {
            return Err(RunError::NoMatchingTransition {
                node: node.to_string(),
            });
        };

        let target = match transition {
            Transition::Direct(target) => target,
            Transition::Conditional { branches, fallback } => branches
                .iter()
                .find(|(condition, _)| condition.evaluate(values))
                .map(|(_, target)| target)
                .or(fallback.as_ref())
                .ok_or_else(|| RunError::NoMatchingTransition {
                    node: node.to_string(),
                })?,
            Transition::Route {
                field,
                routes,
                default,
            } => {
                let value = route_value(resolve_path(values, field));
                value
                    .as_ref()
                    .and_then(|v| routes.get(v))
                    .or(default.as_ref())
                    .ok_or_else(|| RunError::UnmatchedRoute {
                        node: node.to_string(),
                        value: value.unwrap_or_else(|| "null".to_string()),
                    })?
            }
        };

        Ok(target.node().map(str::to_string))
    }

    /// Every edge, including the entry edge, in a stable order
    pub fn edges(&self) -> Vec<EdgeView> {
        let mut edges = vec![EdgeView {
            from: START.to_string(),
            to: self.entry.clone(),
            label: None,
        }];

        let mut sources: Vec<&String> = self.transitions.keys().collect();
        sources.sort();
        for from in sources {
            let view = |to: &Target, label: Option<String>| EdgeView {
                from: from.clone(),
                to: to.as_str().to_string(),
                label,
            };
            match &self.transitions[from] {
                Transition::Direct(target) => edges.push(view(target, None)),
                Transition::Conditional { branches, fallback } => {
                    for (condition, target) in branches {
                        edges.push(view(target, Some(condition.source().to_string())));
                    }
                    if let Some(target) = fallback {
                        edges.push(view(target, Some("else".to_string())));
                    }
                }
                Transition::Route { routes, default, .. } => {
                    for (value, target) in routes {
                        edges.push(view(target, Some(value.clone())));
                    }
                    if let Some(target) = default {
                        edges.push(view(target, Some("default".to_string())));
                    }
                }
            }
        }
        edges
    }

    fn reachable(&self) -> HashSet<&str> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.entry.as_str()]);
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node) {
                continue;
            }
            queue.extend(self.successors(node));
        }
        seen
    }
}

/// Router values compare as strings; numbers and booleans use their JSON text
fn route_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn compile_edges(
    def: &WorkflowDefinition,
    node: &str,
    errors: &mut Vec<CompileError>,
) -> Option<Transition> {
    let mut branches = Vec::new();
    let mut unconditional = Vec::new();

    for (index, edge) in def.edges.iter().enumerate().filter(|(_, e)| e.from == node) {
        match &edge.condition {
            None => {
                if edge.targets().len() > 1 {
                    errors.push(ConfigError::AmbiguousTransition { node: node.to_string() }.into());
                    return None;
                }
                unconditional.extend(edge.targets().iter().map(|t| Target::parse(t)));
            }
            Some(source) => match Condition::parse(source) {
                Ok(condition) => {
                    for target in edge.targets() {
                        branches.push((condition.clone(), Target::parse(target)));
                    }
                }
                Err(source) => errors.push(CompileError::Expression {
                    context: format!("edge #{index} from `{node}`"),
                    source,
                }),
            },
        }
    }

    if unconditional.len() > 1 {
        errors.push(ConfigError::AmbiguousTransition { node: node.to_string() }.into());
        return None;
    }
    let fallback = unconditional.pop();

    match (branches.is_empty(), fallback) {
        (true, Some(target)) => Some(Transition::Direct(target)),
        (true, None) => {
            // Conditions that failed to parse were already reported
            let has_edges = def.edges.iter().any(|e| e.from == node);
            if !has_edges {
                errors.push(ConfigError::MissingTransition { node: node.to_string() }.into());
            }
            None
        }
        (false, fallback) => Some(Transition::Conditional { branches, fallback }),
    }
}

/// Tarjan's algorithm over the transition table.
///
/// Returns components with more than one member, plus single nodes with a
/// self-loop. Members are sorted; components follow declaration order of
/// their first member.
fn strongly_connected(def: &WorkflowDefinition, table: &TransitionTable) -> Vec<Vec<String>> {
    let mut index = 0;
    let mut indices: HashMap<&str, usize> = HashMap::new();
    let mut lowlink: HashMap<&str, usize> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut on_stack: HashSet<&str> = HashSet::new();
    let mut components: Vec<Vec<&str>> = Vec::new();

    // Explicit call stack: (node, its successors, next successor to visit)
    let mut frames: Vec<(&str, Vec<&str>, usize)> = Vec::new();

    for root in def.node_ids() {
        if indices.contains_key(root) {
            continue;
        }
        frames.push((root, table.successors(root), 0));
        indices.insert(root, index);
        lowlink.insert(root, index);
        index += 1;
        stack.push(root);
        on_stack.insert(root);

        while let Some((node, successors, cursor)) = frames.last_mut() {
            let node = *node;
            if let Some(&next) = successors.get(*cursor) {
                *cursor += 1;
                if !indices.contains_key(next) {
                    indices.insert(next, index);
                    lowlink.insert(next, index);
                    index += 1;
                    stack.push(next);
                    on_stack.insert(next);
                    frames.push((next, table.successors(next), 0));
                } else if on_stack.contains(next) {
                    let low = lowlink[node].min(indices[next]);
                    lowlink.insert(node, low);
                }
                continue;
            }

            frames.pop();
            if let Some((parent, _, _)) = frames.last() {
                let low = lowlink[*parent].min(lowlink[node]);
                lowlink.insert(*parent, low);
            }

            if lowlink[node] == indices[node] {
                let mut component = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack.remove(member);
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                components.push(component);
            }
        }
    }

    let order: HashMap<&str, usize> = def.node_ids().enumerate().map(|(i, id)| (id, i)).collect();
    let mut cycles: Vec<Vec<String>> = components
        .into_iter()
        .filter(|c| c.len() > 1 || table.successors(c[0]).contains(&c[0]))
        .map(|mut c| {
            c.sort_by_key(|id| order.get(id).copied().unwrap_or(usize::MAX));
            c.into_iter().map(str::to_string).collect()
        })
        .collect();
    cycles.sort_by_key(|c| order.get(c[0].as_str()).copied().unwrap_or(usize::MAX));
    cycles
}

/// Resolve the iteration limit of every node that has one
fn assign_loop_limits(
    def: &WorkflowDefinition,
    cycles: &[Vec<String>],
) -> Result<BTreeMap<String, usize>, CompileError> {
    let mut limits = def.loop_limits.clone();
    let mut missing = Vec::new();

    for cycle in cycles {
        let inherited = cycle
            .iter()
            .filter_map(|member| def.loop_limits.get(member))
            .min()
            .copied()
            .or(def.defaults.loop_limit);

        for member in cycle {
            if limits.contains_key(member) {
                continue;
            }
            match inherited {
                Some(limit) => {
                    limits.insert(member.clone(), limit);
                }
                None => missing.push(member.clone()),
            }
        }
    }

    if missing.is_empty() {
        Ok(limits)
    } else {
        Err(CompileError::CycleWithoutLimit { nodes: missing })
    }
}
