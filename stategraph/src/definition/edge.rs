//! Edge declarations

use serde::{Deserialize, Serialize};

/// Marker for the graph entry in `from`
pub const START: &str = "START";

/// Marker for run completion in `to` and router routes
pub const END: &str = "END";

/// A transition declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: EdgeTargets,
    /// Routing condition in the restricted expression grammar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl EdgeSpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: EdgeTargets::One(to.into()),
            condition: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn targets(&self) -> &[String] {
        self.to.as_slice()
    }
}

/// `to: node` or `to: [a, b]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EdgeTargets {
    One(String),
    Many(Vec<String>),
}

impl EdgeTargets {
    pub fn as_slice(&self) -> &[String] {
        match self {
            EdgeTargets::One(target) => std::slice::from_ref(target),
            EdgeTargets::Many(targets) => targets,
        }
    }
}

/// Whether `id` is one of the reserved markers
pub fn is_marker(id: &str) -> bool {
    id == START || id == END
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_and_list_targets() {
        let one: EdgeSpec = serde_yaml::from_str("{from: a, to: b}").unwrap();
        assert_eq!(one.targets(), ["b".to_string()]);

        let many: EdgeSpec =
            serde_yaml::from_str("{from: a, to: [b, c], condition: \"x > 1\"}").unwrap();
        assert_eq!(many.targets().len(), 2);
        assert_eq!(many.condition.as_deref(), Some("x > 1"));
    }

    #[test]
    fn test_markers() {
        assert!(is_marker(START));
        assert!(is_marker(END));
        assert!(!is_marker("end"));
    }
}
