//! Cross-reference validation
//!
//! Checks that every identifier a definition mentions exists: edge
//! endpoints, route targets, tool references, loop limits, and the entry
//! point. Transition shape (missing or ambiguous edges, reachability) is
//! checked by the transition compiler, which needs the built table.

use super::{is_marker, NodeKind, NodeSpec, WorkflowDefinition, END, START};
use crate::error::ConfigError;

/// Validate a parsed definition, returning every problem found.
pub fn validate(def: &WorkflowDefinition) -> Vec<ConfigError> {
    let mut errors = Vec::new();

    validate_entry(def, &mut errors);
    for node in &def.nodes {
        validate_node(def, node, false, &mut errors);
    }
    validate_edges(def, &mut errors);

    for (node, limit) in &def.loop_limits {
        if !def.contains_node(node) {
            errors.push(ConfigError::UnknownLoopLimit(node.clone()));
        } else if *limit == 0 {
            errors.push(ConfigError::invalid_section(
                "loop_limits",
                format!("limit for `{node}` must be at least 1"),
            ));
        }
    }

    errors
}

fn validate_entry(def: &WorkflowDefinition, errors: &mut Vec<ConfigError>) {
    let start_edges: Vec<_> = def.edges.iter().filter(|e| e.from == START).collect();
    if start_edges.len() > 1 {
        errors.push(ConfigError::InvalidEdge {
            index: position_of(def, START, 1),
            from: START.to_string(),
            message: "only one edge may leave START".to_string(),
        });
    }
    if let Some(edge) = start_edges.first() {
        if edge.condition.is_some() || edge.targets().len() != 1 {
            errors.push(ConfigError::InvalidEdge {
                index: position_of(def, START, 0),
                from: START.to_string(),
                message: "START needs exactly one unconditional target".to_string(),
            });
        }
    }

    if let Some(entry) = def.entry_point() {
        if !def.contains_node(entry) {
            errors.push(ConfigError::UnknownEntry(entry.to_string()));
        }
    }
}

/// Index of the `nth` edge leaving `from`
fn position_of(def: &WorkflowDefinition, from: &str, nth: usize) -> usize {
    def.edges
        .iter()
        .enumerate()
        .filter(|(_, e)| e.from == from)
        .nth(nth)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn validate_node(
    def: &WorkflowDefinition,
    node: &NodeSpec,
    in_map: bool,
    errors: &mut Vec<ConfigError>,
) {
    let id = node.id.as_str();
    let invalid = |message: &str| ConfigError::invalid_node(id, message);

    match &node.kind {
        NodeKind::Transform(config) => {
            match (&config.task, &config.tool) {
                (Some(_), Some(_)) => errors.push(invalid("set either `task` or `tool`, not both")),
                (None, None) => errors.push(invalid("one of `task` or `tool` is required")),
                (None, Some(tool)) => check_tool(def, id, tool, errors),
                (Some(_), None) => {}
            }
            if node.options.output.is_none() {
                errors.push(invalid("`output` is required"));
            }
        }
        NodeKind::Router(config) => {
            match (&config.task, &config.from) {
                (Some(_), Some(_)) => errors.push(invalid("set either `task` or `from`, not both")),
                (None, None) => errors.push(invalid("one of `task` or `from` is required")),
                _ => {}
            }
            if config.routes.is_empty() && config.default_route.is_none() {
                errors.push(invalid("`routes` must not be empty"));
            }
            let targets = config
                .routes
                .iter()
                .map(|(route, target)| (route.as_str(), target))
                .chain(config.default_route.iter().map(|t| ("default_route", t)));
            for (route, target) in targets {
                if target != END && !def.contains_node(target) {
                    errors.push(ConfigError::UnknownRouteTarget {
                        node: id.to_string(),
                        route: route.to_string(),
                        target: target.clone(),
                    });
                }
            }
            if in_map {
                errors.push(invalid("routers cannot run inside a map"));
            }
        }
        NodeKind::Agent(config) => {
            if config.task.trim().is_empty() {
                errors.push(invalid("`task` is required"));
            }
            for tool in &config.tools {
                check_tool(def, id, tool, errors);
            }
            if config.max_iterations == Some(0) {
                errors.push(invalid("`max_iterations` must be at least 1"));
            }
        }
        NodeKind::Map(config) => {
            if config.over.trim().is_empty() {
                errors.push(invalid("`over` must name a list field"));
            }
            if config.item.trim().is_empty() || config.item.contains('.') {
                errors.push(invalid("`as` must be a plain field name"));
            }
            if config.collect.trim().is_empty() {
                errors.push(invalid("`collect` is required"));
            }
            if config.max_concurrency == Some(0) {
                errors.push(invalid("`max_concurrency` must be at least 1"));
            }
            validate_node(def, &config.node, true, errors);
        }
        NodeKind::Interrupt(config) => {
            if config.message.is_none() && config.task.is_none() {
                errors.push(invalid("one of `message` or `task` is required"));
            }
            if in_map {
                errors.push(invalid("interrupts cannot run inside a map"));
            }
        }
        NodeKind::Subgraph(config) => match (&config.graph, &config.definition) {
            (Some(_), Some(_)) => errors.push(invalid("set either `graph` or `definition`, not both")),
            (None, None) => errors.push(invalid("one of `graph` or `definition` is required")),
            _ => {}
        },
        NodeKind::Passthrough(_) => {}
    }
}

fn check_tool(def: &WorkflowDefinition, node: &str, tool: &str, errors: &mut Vec<ConfigError>) {
    if !def.tools.contains_key(tool) {
        errors.push(ConfigError::UnknownTool {
            node: node.to_string(),
            tool: tool.to_string(),
        });
    }
}

fn validate_edges(def: &WorkflowDefinition, errors: &mut Vec<ConfigError>) {
    for (index, edge) in def.edges.iter().enumerate() {
        let targets = edge.targets();
        let to = targets.join(", ");

        if edge.from == END {
            errors.push(ConfigError::InvalidEdge {
                index,
                from: edge.from.clone(),
                message: "END has no outgoing edges".to_string(),
            });
        } else if !is_marker(&edge.from) && !def.contains_node(&edge.from) {
            errors.push(ConfigError::UnknownEdgeEndpoint {
                index,
                from: edge.from.clone(),
                to: to.clone(),
                node: edge.from.clone(),
            });
        }

        if targets.is_empty() {
            errors.push(ConfigError::InvalidEdge {
                index,
                from: edge.from.clone(),
                message: "`to` must not be empty".to_string(),
            });
        }
        for target in targets {
            if target == START {
                errors.push(ConfigError::InvalidEdge {
                    index,
                    from: edge.from.clone(),
                    message: "START cannot be an edge target".to_string(),
                });
            } else if target != END && !def.contains_node(target) {
                errors.push(ConfigError::UnknownEdgeEndpoint {
                    index,
                    from: edge.from.clone(),
                    to: to.clone(),
                    node: target.clone(),
                });
            }
        }

        if let Some(NodeKind::Router(_)) = def.node(&edge.from).map(|n| &n.kind) {
            errors.push(ConfigError::InvalidEdge {
                index,
                from: edge.from.clone(),
                message: "router transitions come from `routes`, not edges".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parse;

    fn errors_for(yaml: &str) -> Vec<ConfigError> {
        validate(&parse(yaml).unwrap())
    }

    #[test]
    fn test_valid_definition_has_no_errors() {
        let errors = errors_for(
            r#"
name: ok
tools:
  search: {}
nodes:
  research: { type: agent, task: research, tools: [search], output: notes }
  triage: { type: router, from: notes.kind, routes: { short: done } }
  done: { type: passthrough, set: { finished: true } }
edges:
  - { from: START, to: research }
  - { from: research, to: triage }
  - { from: done, to: END }
"#,
        );
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_unknown_edge_endpoints() {
        let errors = errors_for(
            r#"
name: bad
nodes:
  a: { type: passthrough }
edges:
  - { from: a, to: ghost }
  - { from: phantom, to: END }
"#,
        );
        assert!(errors.contains(&ConfigError::UnknownEdgeEndpoint {
            index: 0,
            from: "a".into(),
            to: "ghost".into(),
            node: "ghost".into()
        }));
        assert!(errors.iter().any(
            |e| matches!(e, ConfigError::UnknownEdgeEndpoint { index: 1, node, .. } if node == "phantom")
        ));
    }

    #[test]
    fn test_unknown_tool_reference() {
        let errors = errors_for(
            r#"
name: bad
nodes:
  a: { type: agent, task: t, tools: [missing] }
  b: { type: transform, tool: also_missing, output: out }
edges:
  - { from: a, to: b }
  - { from: b, to: END }
"#,
        );
        assert!(errors.contains(&ConfigError::UnknownTool {
            node: "a".into(),
            tool: "missing".into()
        }));
        assert!(errors.contains(&ConfigError::UnknownTool {
            node: "b".into(),
            tool: "also_missing".into()
        }));
    }

    #[test]
    fn test_router_rules() {
        let errors = errors_for(
            r#"
name: bad
nodes:
  r: { type: router, task: classify, routes: { approve: nowhere } }
  x: { type: passthrough }
edges:
  - { from: r, to: x }
  - { from: x, to: END }
"#,
        );
        assert!(errors.contains(&ConfigError::UnknownRouteTarget {
            node: "r".into(),
            route: "approve".into(),
            target: "nowhere".into()
        }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::InvalidEdge { from, .. } if from == "r")));
    }

    #[test]
    fn test_map_sub_node_restrictions() {
        let errors = errors_for(
            r#"
name: bad
nodes:
  fan:
    type: map
    over: xs
    as: x
    collect: ys
    node: { type: interrupt, message: "hi" }
edges:
  - { from: fan, to: END }
"#,
        );
        assert!(errors.contains(&ConfigError::invalid_node(
            "fan.node",
            "interrupts cannot run inside a map"
        )));
    }

    #[test]
    fn test_loop_limits_and_entry() {
        let errors = errors_for(
            r#"
name: bad
entry: nope
nodes:
  a: { type: passthrough }
edges:
  - { from: a, to: END }
loop_limits: { ghost: 3, a: 0 }
"#,
        );
        assert!(errors.contains(&ConfigError::UnknownEntry("nope".into())));
        assert!(errors.contains(&ConfigError::UnknownLoopLimit("ghost".into())));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::InvalidSection { section, .. } if section == "loop_limits")));
    }

    #[test]
    fn test_transform_requires_exactly_one_source() {
        let errors = errors_for(
            r#"
name: bad
tools: { t: {} }
nodes:
  a: { type: transform, task: x, tool: t, output: o }
  b: { type: transform }
edges:
  - { from: a, to: b }
  - { from: b, to: END }
"#,
        );
        assert!(errors.contains(&ConfigError::invalid_node(
            "a",
            "set either `task` or `tool`, not both"
        )));
        assert!(errors.contains(&ConfigError::invalid_node(
            "b",
            "one of `task` or `tool` is required"
        )));
        assert!(errors.contains(&ConfigError::invalid_node("b", "`output` is required")));
    }
}
