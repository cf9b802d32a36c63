//! Map vertex: runs one nested node per list item
//!
//! Tasks run concurrently, bounded by a semaphore, each against its own
//! snapshot of the state with the item and its index injected. Results are
//! collected in source order regardless of completion order. The map waits
//! for every task before reporting, and fails if any task failed.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::CompiledNode;
use crate::engine::vertex::{ComputeContext, NodeOutcome, Vertex};
use crate::error::TaskError;
use crate::state::{type_name, StateUpdate};

#[derive(Debug)]
pub struct MapVertex {
    id: String,
    over: String,
    item: String,
    index_field: String,
    collect: String,
    node: Arc<CompiledNode>,
    max_concurrency: Option<usize>,
}

impl MapVertex {
    pub fn new(
        id: impl Into<String>,
        over: impl Into<String>,
        item: impl Into<String>,
        collect: impl Into<String>,
        node: Arc<CompiledNode>,
        max_concurrency: Option<usize>,
    ) -> Self {
        let item = item.into();
        Self {
            id: id.into(),
            over: over.into(),
            index_field: format!("{item}_index"),
            item,
            collect: collect.into(),
            node,
            max_concurrency,
        }
    }

    /// Result slot for one task's update
    fn slot_value(&self, update: &StateUpdate) -> Value {
        if let Some(value) = self.node.output().and_then(|field| update.get(field)) {
            return value.clone();
        }
        if update.is_empty() {
            Value::Null
        } else {
            update.to_object()
        }
    }
}

#[async_trait]
impl Vertex for MapVertex {
    fn id(&self) -> &str {
        &self.id
    }

    async fn compute(&self, ctx: &ComputeContext<'_>) -> Result<NodeOutcome, TaskError> {
        let items = match ctx.state.get(&self.over) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(TaskError::invalid_result(
                    &self.id,
                    format!("`{}` is a {}, expected a list", self.over, type_name(other)),
                ))
            }
            None => {
                return Err(TaskError::invalid_result(
                    &self.id,
                    format!("`{}` is not set", self.over),
                ))
            }
        };

        if items.is_empty() {
            debug!(node_id = %self.id, "empty source list");
            return Ok(NodeOutcome::update(
                StateUpdate::empty().set(&self.collect, json!([])),
            ));
        }

        let limit = self
            .max_concurrency
            .unwrap_or(ctx.scope.config.parallelism)
            .max(1);
        info!(node_id = %self.id, tasks = items.len(), limit, "fanning out");

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut handles = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            let mut snapshot = ctx.state.clone();
            snapshot.values.insert(self.item.clone(), item);
            snapshot.values.insert(self.index_field.clone(), json!(index));

            let node = Arc::clone(&self.node);
            let scope = Arc::new(ctx.scope.child(&format!("{}[{}]", self.id, index)));
            let semaphore = Arc::clone(&semaphore);

            handles.push(tokio::spawn(async move {
                // Permit held for the whole task
                let _permit = semaphore.acquire_owned().await;
                let run = node.execute(&snapshot, &scope, None).await;
                (index, run)
            }));
        }

        let mut slots: Vec<(usize, Value)> = Vec::with_capacity(handles.len());
        let mut failures = Vec::new();

        for joined in futures::future::join_all(handles).await {
            let (index, run) = match joined {
                Ok(result) => result,
                Err(e) => {
                    failures.push(format!("task aborted: {e}"));
                    continue;
                }
            };
            for record in run.errors {
                ctx.record(record);
            }
            match run.result {
                Ok(NodeOutcome::Continue(update)) => slots.push((index, self.slot_value(&update))),
                Ok(NodeOutcome::Suspend(_)) => {
                    failures.push(format!("item {index}: suspended inside a map task"))
                }
                Err(e) => failures.push(format!("item {index}: {e}")),
            }
        }

        if !failures.is_empty() {
            return Err(TaskError::failed(&self.id, failures.join("; ")));
        }

        slots.sort_by_key(|(index, _)| *index);
        let results: Vec<Value> = slots.into_iter().map(|(_, value)| value).collect();
        debug!(node_id = %self.id, collected = results.len(), "fan-out joined");

        Ok(NodeOutcome::update(
            StateUpdate::empty().set(&self.collect, Value::Array(results)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ErrorPolicy;
    use crate::engine::config::RuntimeConfig;
    use crate::engine::vertex::RunScope;
    use crate::executor::{FnExecutor, TaskRequest};
    use crate::state::ExecutionState;
    use crate::workflow::vertices::{NodePolicy, NodeStrategy, TaskBinding, TransformAction, TransformVertex};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn nested(executor: FnExecutor, policy: NodePolicy) -> Arc<CompiledNode> {
        let mut inputs = BTreeMap::new();
        inputs.insert("n".to_string(), "n".to_string());
        inputs.insert("i".to_string(), "n_index".to_string());
        let vertex = TransformVertex::new(
            "fan.node",
            TransformAction::Task(TaskBinding::new("square", Arc::new(executor), None)),
            inputs,
            BTreeMap::new(),
            "squared",
            None,
        );
        Arc::new(CompiledNode::new(
            "fan.node",
            Some("squared".into()),
            NodeStrategy::Transform(vertex),
            policy,
        ))
    }

    async fn run(vertex: &MapVertex, state: serde_json::Value) -> (Result<NodeOutcome, TaskError>, usize) {
        let state = ExecutionState::from_value(state).unwrap();
        let scope = Arc::new(RunScope::new("t", Arc::new(RuntimeConfig::default())));
        let ctx = ComputeContext::new(&state, &scope);
        let result = vertex.compute(&ctx).await;
        (result, ctx.into_errors().len())
    }

    #[tokio::test]
    async fn test_results_keep_source_order() {
        // Later items finish first
        let executor = FnExecutor::new(|req: TaskRequest| async move {
            let n = req.variables["n"].as_u64().unwrap_or(0);
            let i = req.variables["i"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(40 - 10 * i)).await;
            Ok(json!(n * n))
        });
        let vertex = MapVertex::new("fan", "numbers", "n", "squares", nested(executor, NodePolicy::default()), None);

        let (result, _) = run(&vertex, json!({"numbers": [1, 2, 3, 4]})).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.state_update().get("squares"), Some(&json!([1, 4, 9, 16])));
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let executor = FnExecutor::new(move |_req: TaskRequest| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(0))
            }
        });
        let vertex = MapVertex::new("fan", "numbers", "n", "out", nested(executor, NodePolicy::default()), Some(2));

        let (result, _) = run(&vertex, json!({"numbers": [1, 2, 3, 4, 5, 6]})).await;
        assert!(result.is_ok());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_empty_list_and_non_list() {
        let executor = FnExecutor::new(|_req: TaskRequest| async { Ok(json!(0)) });
        let vertex = MapVertex::new("fan", "numbers", "n", "out", nested(executor, NodePolicy::default()), None);

        let (result, _) = run(&vertex, json!({"numbers": []})).await;
        assert_eq!(result.unwrap().state_update().get("out"), Some(&json!([])));

        let (result, _) = run(&vertex, json!({"numbers": "1,2"})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_task_failure_fails_map_after_join() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let executor = FnExecutor::new(move |req: TaskRequest| {
            let calls = Arc::clone(&counter);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if req.variables["n"] == json!(2) {
                    Err(TaskError::failed("square", "bad item"))
                } else {
                    Ok(json!(1))
                }
            }
        });
        let vertex = MapVertex::new("fan", "numbers", "n", "out", nested(executor, NodePolicy::default()), None);

        let (result, _) = run(&vertex, json!({"numbers": [1, 2, 3]})).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("item 1"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_skipped_failure_leaves_null_slot() {
        let executor = FnExecutor::new(|req: TaskRequest| async move {
            if req.variables["n"] == json!(2) {
                Err(TaskError::failed("square", "bad item"))
            } else {
                Ok(json!("ok"))
            }
        });
        let policy = NodePolicy {
            on_error: ErrorPolicy::Skip,
            ..Default::default()
        };
        let vertex = MapVertex::new("fan", "numbers", "n", "out", nested(executor, policy), None);

        let (result, recorded) = run(&vertex, json!({"numbers": [1, 2, 3]})).await;
        assert_eq!(
            result.unwrap().state_update().get("out"),
            Some(&json!(["ok", null, "ok"]))
        );
        assert_eq!(recorded, 1);
    }
}
