//! Passthrough vertex: pure state transformation without external calls

use async_trait::async_trait;
use serde_json::{Number, Value};

use crate::definition::PassthroughConfig;
use crate::engine::vertex::{ComputeContext, NodeOutcome, Vertex};
use crate::error::TaskError;
use crate::state::{type_name, StateUpdate};

#[derive(Debug)]
pub struct PassthroughVertex {
    id: String,
    config: PassthroughConfig,
}

impl PassthroughVertex {
    pub fn new(id: impl Into<String>, config: PassthroughConfig) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }

    fn increment(&self, current: Option<&Value>, field: &str, delta: &Number) -> Result<Value, TaskError> {
        let current = match current {
            None | Some(Value::Null) => Number::from(0),
            Some(Value::Number(n)) => n.clone(),
            Some(other) => {
                return Err(TaskError::invalid_result(
                    &self.id,
                    format!("cannot increment `{field}`: it holds a {}", type_name(other)),
                ))
            }
        };

        let sum = match (current.as_i64(), delta.as_i64()) {
            (Some(a), Some(b)) => a.checked_add(b).map(Value::from),
            _ => None,
        };
        let sum = match sum {
            Some(sum) => sum,
            None => {
                let a = current.as_f64().unwrap_or(0.0);
                let b = delta.as_f64().unwrap_or(0.0);
                Number::from_f64(a + b).map(Value::Number).ok_or_else(|| {
                    TaskError::invalid_result(&self.id, format!("`{field}` overflowed"))
                })?
            }
        };
        Ok(sum)
    }
}

#[async_trait]
impl Vertex for PassthroughVertex {
    fn id(&self) -> &str {
        &self.id
    }

    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<NodeOutcome, TaskError> {
        let mut update = StateUpdate::empty();

        for (field, value) in &self.config.set {
            update.push(field, value.clone());
        }
        for (target, source) in &self.config.copy {
            update.push(target, ctx.state.get(source).cloned().unwrap_or(Value::Null));
        }
        for (field, delta) in &self.config.increment {
            let value = self.increment(ctx.state.get(field), field, delta)?;
            update.push(field, value);
        }

        Ok(NodeOutcome::update(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::RuntimeConfig;
    use crate::engine::vertex::RunScope;
    use crate::state::ExecutionState;
    use serde_json::json;
    use std::sync::Arc;

    async fn run(config: PassthroughConfig, state: serde_json::Value) -> Result<NodeOutcome, TaskError> {
        let vertex = PassthroughVertex::new("p", config);
        let state = ExecutionState::from_value(state).unwrap();
        let scope = Arc::new(RunScope::new("t", Arc::new(RuntimeConfig::default())));
        let ctx = ComputeContext::new(&state, &scope);
        vertex.compute(&ctx).await
    }

    #[tokio::test]
    async fn test_set_copy_increment() {
        let mut config = PassthroughConfig::default();
        config.set.insert("status".into(), json!("draft"));
        config.copy.insert("title".into(), "doc.title".into());
        config.increment.insert("revision".into(), Number::from(1));
        config.increment.insert("score".into(), Number::from_f64(0.5).unwrap());

        let outcome = run(config, json!({"doc": {"title": "T"}, "revision": 2, "score": 1})).await.unwrap();
        let update = outcome.state_update();
        assert_eq!(update.get("status"), Some(&json!("draft")));
        assert_eq!(update.get("title"), Some(&json!("T")));
        assert_eq!(update.get("revision"), Some(&json!(3)));
        assert_eq!(update.get("score"), Some(&json!(1.5)));
    }

    #[tokio::test]
    async fn test_increment_absent_field_starts_at_zero() {
        let mut config = PassthroughConfig::default();
        config.increment.insert("attempts".into(), Number::from(1));
        let outcome = run(config, json!({})).await.unwrap();
        assert_eq!(outcome.state_update().get("attempts"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_increment_non_number_fails() {
        let mut config = PassthroughConfig::default();
        config.increment.insert("name".into(), Number::from(1));
        assert!(run(config, json!({"name": "x"})).await.is_err());
    }
}
