//! `{field}` placeholders in static messages
//!
//! Placeholders name a dotted state path, optionally prefixed with `state.`;
//! `{{ field }}` is accepted as well. Unknown fields render as an empty string.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::state::{resolve_path, StateMap};

fn placeholder_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"\{\{?\s*(?:state\.)?([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}?\}").ok()
        })
        .as_ref()
}

/// Dotted paths referenced by `template`, in order of appearance
pub fn placeholders(template: &str) -> Vec<String> {
    let Some(pattern) = placeholder_pattern() else {
        return Vec::new();
    };
    pattern
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Fill placeholders from `values`
pub fn render(template: &str, values: &StateMap) -> String {
    let Some(pattern) = placeholder_pattern() else {
        return template.to_string();
    };
    pattern
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match resolve_path(values, &caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}
