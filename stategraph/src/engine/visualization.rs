//! Mermaid diagram generation for compiled graphs
//!
//! # Node Shapes
//!
//! | Kind        | Shape             | Mermaid Syntax  |
//! |-------------|-------------------|-----------------|
//! | transform   | Rectangle         | `id[label]`     |
//! | agent       | Subroutine        | `id[[label]]`   |
//! | router      | Diamond           | `id{label}`     |
//! | subgraph    | Cylinder          | `id[(label)]`   |
//! | map         | Parallelogram     | `id[/label\]`   |
//! | interrupt   | Hexagon           | `id{{label}}`   |
//! | passthrough | Rounded Rectangle | `id(label)`     |
//! | START/END   | Stadium           | `id([label])`   |

use std::collections::BTreeSet;

use crate::definition::NodeKind;
use crate::state::ExecutionState;
use crate::workflow::graph::EdgeView;

/// Replace characters Mermaid does not accept in node ids
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Labels are quoted, so embedded quotes become entities
fn escape_label(label: &str) -> String {
    label.replace('"', "#quot;")
}

/// Render a node with the shape of its kind; `None` is a marker
pub fn render_node(id: &str, kind: Option<&NodeKind>) -> String {
    let safe_id = sanitize_id(id);
    let label = escape_label(id);

    match kind {
        Some(NodeKind::Transform(_)) => format!("    {}[\"{}\"]", safe_id, label),
        Some(NodeKind::Agent(_)) => format!("    {}[[\"{}\"]]", safe_id, label),
        Some(NodeKind::Router(_)) => format!("    {}{{\"{}\"}}", safe_id, label),
        Some(NodeKind::Subgraph(_)) => format!("    {}[(\"{}\")]", safe_id, label),
        Some(NodeKind::Map(_)) => format!("    {}[/\"{}\"\\]", safe_id, label),
        Some(NodeKind::Interrupt(_)) => format!("    {}{{{{\"{}\"}}}}", safe_id, label),
        Some(NodeKind::Passthrough(_)) => format!("    {}(\"{}\")", safe_id, label),
        None => format!("    {}([\"{}\"])", safe_id, label),
    }
}

/// Render an edge; labelled edges are dotted
pub fn render_edge(edge: &EdgeView) -> String {
    let from = sanitize_id(&edge.from);
    let to = sanitize_id(&edge.to);

    match &edge.label {
        Some(label) => format!("    {} -. \"{}\" .-> {}", from, escape_label(label), to),
        None => format!("    {} --> {}", from, to),
    }
}

/// Class definitions used when a state is overlaid
pub const STYLE_DEFS: &str = r#"
    classDef suspended fill:#FFE4B5,stroke:#FF8C00,stroke-width:2px
    classDef failed fill:#F4A6A6,stroke:#B22222,stroke-width:2px
    classDef recovered fill:#FFFACD,stroke:#DAA520,stroke-width:1px
"#;

/// Render a full flowchart.
///
/// With `state`, the pending interrupt node and nodes with recorded errors
/// are highlighted.
pub fn render_graph<'a>(
    nodes: impl IntoIterator<Item = (&'a str, &'a NodeKind)>,
    edges: &[EdgeView],
    state: Option<&ExecutionState>,
) -> String {
    let mut lines = vec!["flowchart TD".to_string()];

    let mut markers = BTreeSet::new();
    for edge in edges {
        for end in [&edge.from, &edge.to] {
            if crate::definition::is_marker(end) {
                markers.insert(end.as_str());
            }
        }
    }
    for marker in markers {
        lines.push(render_node(marker, None));
    }

    for (id, kind) in nodes {
        let node = render_node(id, Some(kind));
        let class = state.and_then(|state| state_class(id, state));
        lines.push(match class {
            Some(class) => format!("{}:::{}", node, class),
            None => node,
        });
    }

    for edge in edges {
        lines.push(render_edge(edge));
    }

    if state.is_some() {
        lines.push(STYLE_DEFS.trim_end().to_string());
    }

    lines.join("\n")
}

fn state_class(id: &str, state: &ExecutionState) -> Option<&'static str> {
    if state.interrupt.as_ref().is_some_and(|pending| pending.node == id) {
        return Some("suspended");
    }
    let mut class = None;
    for record in state.errors.iter().filter(|record| record.node == id) {
        if record.fatal {
            return Some("failed");
        }
        class = Some("recovered");
    }
    class
}
