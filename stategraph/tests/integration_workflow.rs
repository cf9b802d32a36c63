//! Integration Tests for compiling and running workflows
//!
//! These tests drive complete definitions through the public API:
//! - Linear runs and input handling
//! - Router selection with and without a default route
//! - Loops bounded by loop limits
//! - Map fan-out ordering and concurrency
//! - Retry, skip and fallback error policies
//! - Compile error reporting

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use stategraph::{
    Checkpointer, CompileError, Compiler, ConfigError, DynExecutor, ExecutorCache, FnExecutor,
    MemoryCheckpointer, RetryPolicy, RunError, RuntimeConfig, TaskError, TaskRequest,
};

/// Executor answering every task with `<task>:done`
fn echo_compiler() -> Compiler {
    let executor =
        FnExecutor::new(|req: TaskRequest| async move { Ok(json!(format!("{}:done", req.task))) });
    Compiler::new(ExecutorCache::single(executor))
}

// =============================================================================
// Linear Runs
// =============================================================================

#[tokio::test]
async fn test_linear_workflow_runs_to_end() {
    let graph = echo_compiler()
        .compile(
            r#"
version: 1
name: publish
nodes:
  outline: { type: transform, task: outline, output: outline }
  draft:   { type: transform, task: draft, output: draft, requires: [outline] }
  stamp:   { type: passthrough, set: { status: published }, copy: { final: draft } }
edges:
  - { from: START, to: outline }
  - { from: outline, to: draft }
  - { from: draft, to: stamp }
  - { from: stamp, to: END }
"#,
        )
        .await
        .expect("definition compiles");

    let result = graph
        .run(json!({"topic": "rust"}), Some("linear-1"))
        .await
        .expect("run succeeds");

    assert!(result.is_complete());
    assert_eq!(result.thread_id(), "linear-1");
    assert_eq!(result.get("outline"), Some(&json!("outline:done")));
    assert_eq!(result.get("final"), Some(&json!("draft:done")));
    assert_eq!(result.get("status"), Some(&json!("published")));
    assert_eq!(result.get("topic"), Some(&json!("rust")));
    assert_eq!(result.state().step, 3);
    assert!(result.state().errors.is_empty());
}

#[tokio::test]
async fn test_non_object_input_is_rejected() {
    let graph = echo_compiler()
        .compile(
            r#"
name: one
nodes:
  a: { type: transform, task: a, output: a }
edges:
  - { from: a, to: END }
"#,
        )
        .await
        .unwrap();

    let failure = graph.run(json!([1, 2, 3]), None).await.unwrap_err();
    assert!(matches!(failure.error, RunError::State(_)));
}

#[tokio::test]
async fn test_populated_outputs_are_skipped() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let executor = FnExecutor::new(move |_req: TaskRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(json!("fresh")) }
    });
    let graph = Compiler::new(ExecutorCache::single(executor))
        .compile(
            r#"
name: cached
nodes:
  research: { type: transform, task: research, output: notes }
edges:
  - { from: research, to: END }
"#,
        )
        .await
        .unwrap();

    let result = graph.run(json!({"notes": "cached"}), None).await.unwrap();
    assert_eq!(result.get("notes"), Some(&json!("cached")));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let result = graph.run(json!({"notes": null}), None).await.unwrap();
    assert_eq!(result.get("notes"), Some(&json!("fresh")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Routing
// =============================================================================

const ROUTED: &str = r#"
name: triage
nodes:
  triage:
    type: router
    from: kind
    routes: { bug: fix, feature: plan }
  fix:  { type: passthrough, set: { lane: fix } }
  plan: { type: passthrough, set: { lane: plan } }
edges:
  - { from: fix, to: END }
  - { from: plan, to: END }
"#;

#[tokio::test]
async fn test_router_selects_route() {
    let graph = echo_compiler().compile(ROUTED).await.unwrap();

    let result = graph.run(json!({"kind": "feature"}), None).await.unwrap();
    assert_eq!(result.get("lane"), Some(&json!("plan")));
    assert_eq!(result.get("triage_route"), Some(&json!("feature")));
}

#[tokio::test]
async fn test_router_without_default_fails_on_unknown_value() {
    let graph = echo_compiler().compile(ROUTED).await.unwrap();

    let failure = graph.run(json!({"kind": "question"}), None).await.unwrap_err();
    match &failure.error {
        RunError::UnmatchedRoute { node, value } => {
            assert_eq!(node, "triage");
            assert_eq!(value, "question");
        }
        other => panic!("expected UnmatchedRoute, got {other:?}"),
    }
    assert!(failure.state.errors.iter().any(|e| e.fatal && e.node == "triage"));
}

#[tokio::test]
async fn test_router_default_route() {
    let text = ROUTED.replace(
        "routes: { bug: fix, feature: plan }",
        "routes: { bug: fix, feature: plan }\n    default_route: plan",
    );
    let graph = echo_compiler().compile(&text).await.unwrap();

    let result = graph.run(json!({"kind": "question"}), None).await.unwrap();
    assert_eq!(result.get("lane"), Some(&json!("plan")));
}

#[tokio::test]
async fn test_conditional_edges_with_fallback() {
    let graph = echo_compiler()
        .compile(
            r#"
name: review
nodes:
  score: { type: passthrough, copy: { grade: input.grade } }
  accept: { type: passthrough, set: { verdict: accepted } }
  reject: { type: passthrough, set: { verdict: rejected } }
edges:
  - { from: score, to: accept, condition: "grade >= 0.8 and not input.flagged" }
  - { from: score, to: reject }
  - { from: accept, to: END }
  - { from: reject, to: END }
"#,
        )
        .await
        .unwrap();

    let accepted = graph
        .run(json!({"input": {"grade": 0.9, "flagged": false}}), None)
        .await
        .unwrap();
    assert_eq!(accepted.get("verdict"), Some(&json!("accepted")));

    let rejected = graph
        .run(json!({"input": {"grade": 0.9, "flagged": true}}), None)
        .await
        .unwrap();
    assert_eq!(rejected.get("verdict"), Some(&json!("rejected")));
}

// =============================================================================
// Loops
// =============================================================================

const LOOP: &str = r#"
name: refine
loop_limits: { draft: 3 }
nodes:
  draft:  { type: passthrough, increment: { revisions: 1 } }
  review: { type: passthrough, set: { reviewed: true } }
edges:
  - { from: START, to: draft }
  - { from: draft, to: review }
  - { from: review, to: draft, condition: "revisions < 10" }
  - { from: review, to: END }
"#;

#[tokio::test]
async fn test_loop_limit_exceeded() {
    let graph = echo_compiler().compile(LOOP).await.unwrap();

    let failure = graph.run(json!({}), None).await.unwrap_err();
    match &failure.error {
        RunError::LoopLimitExceeded { node, limit } => {
            assert_eq!(node, "draft");
            assert_eq!(*limit, 3);
        }
        other => panic!("expected LoopLimitExceeded, got {other:?}"),
    }
    assert_eq!(failure.state.get("revisions"), Some(&json!(3)));
}

#[tokio::test]
async fn test_loop_exits_before_limit() {
    let text = LOOP.replace("revisions < 10", "revisions < 3");
    let graph = echo_compiler().compile(&text).await.unwrap();

    let result = graph.run(json!({}), None).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.get("revisions"), Some(&json!(3)));
}

#[tokio::test]
async fn test_cycle_without_limit_is_rejected() {
    let text = LOOP.replace("loop_limits: { draft: 3 }\n", "");
    let errors = echo_compiler().compile(&text).await.unwrap_err();
    assert!(errors
        .iter()
        .any(|e| matches!(e, CompileError::CycleWithoutLimit { nodes } if nodes.contains(&"draft".to_string()))));

    let with_default = LOOP.replace("loop_limits: { draft: 3 }", "defaults: { loop_limit: 2 }");
    let graph = echo_compiler().compile(&with_default).await.unwrap();
    let failure = graph.run(json!({}), None).await.unwrap_err();
    assert!(matches!(failure.error, RunError::LoopLimitExceeded { limit: 2, .. }));
}

#[tokio::test]
async fn test_max_steps_guard() {
    let text = LOOP.replace("loop_limits: { draft: 3 }", "loop_limits: { draft: 50 }\ndefaults: { max_steps: 5 }");
    let graph = echo_compiler().compile(&text).await.unwrap();

    let failure = graph.run(json!({}), None).await.unwrap_err();
    assert!(matches!(failure.error, RunError::MaxStepsExceeded(5)));
}

// =============================================================================
// Map Fan-out
// =============================================================================

const MAP: &str = r#"
name: digest
nodes:
  summarize_all:
    type: map
    over: docs
    as: doc
    collect: summaries
    node:
      type: transform
      task: summarize
      inputs: { text: doc, position: doc_index }
      output: summary
edges:
  - { from: summarize_all, to: END }
"#;

#[tokio::test]
async fn test_map_preserves_source_order() {
    // Later items finish first
    let executor = FnExecutor::new(|req: TaskRequest| async move {
        let position = req.variables.get("position").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis((4 - position) * 15)).await;
        let text = req
            .variables
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(json!(format!("summary of {text}")))
    });
    let graph = Compiler::new(ExecutorCache::single(executor))
        .compile(MAP)
        .await
        .unwrap();

    let result = graph
        .run(json!({"docs": ["a", "b", "c", "d"]}), None)
        .await
        .unwrap();
    assert_eq!(
        result.get("summaries"),
        Some(&json!(["summary of a", "summary of b", "summary of c", "summary of d"]))
    );
    assert!(result.get("doc").is_none());
}

#[tokio::test]
async fn test_map_over_empty_list() {
    let graph = echo_compiler().compile(MAP).await.unwrap();
    let result = graph.run(json!({"docs": []}), None).await.unwrap();
    assert_eq!(result.get("summaries"), Some(&json!([])));
}

const GRID: &str = r#"
name: grid
nodes:
  scale_rows:
    type: map
    over: rows
    as: row
    collect: table
    max_concurrency: 4
    node:
      type: map
      over: row.cells
      as: cell
      collect: scaled
      max_concurrency: 4
      node:
        type: transform
        task: scale
        inputs: { value: cell, row: row_index, column: cell_index }
        output: scaled_cell
edges:
  - { from: scale_rows, to: END }
"#;

#[tokio::test]
async fn test_map_nested_preserves_order_per_level() {
    // Later rows and later cells finish first
    let executor = FnExecutor::new(|req: TaskRequest| async move {
        let row = req.variables.get("row").and_then(Value::as_u64).unwrap_or(0);
        let column = req.variables.get("column").and_then(Value::as_u64).unwrap_or(0);
        let delay = (3 - row.min(3)) * 20 + (3 - column.min(3)) * 5;
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let value = req.variables.get("value").and_then(Value::as_i64).unwrap_or(0);
        Ok(json!(value * 10))
    });
    let graph = Compiler::new(ExecutorCache::single(executor))
        .compile(GRID)
        .await
        .unwrap();

    let result = graph
        .run(
            json!({"rows": [{"cells": [1, 2, 3]}, {"cells": [4, 5]}, {"cells": [6]}]}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        result.get("table"),
        Some(&json!([[10, 20, 30], [40, 50], [60]]))
    );
    assert!(result.get("row").is_none());
    assert!(result.get("cell").is_none());
    assert!(result.get("row_index").is_none());
}

#[tokio::test]
async fn test_map_failure_fails_the_run() {
    let executor = FnExecutor::new(|req: TaskRequest| async move {
        match req.variables.get("text").and_then(Value::as_str) {
            Some("bad") => Err(TaskError::failed(req.task, "cannot summarize")),
            _ => Ok(json!("ok")),
        }
    });
    let graph = Compiler::new(ExecutorCache::single(executor))
        .compile(MAP)
        .await
        .unwrap();

    let failure = graph
        .run(json!({"docs": ["fine", "bad", "fine"]}), None)
        .await
        .unwrap_err();
    assert!(matches!(
        &failure.error,
        RunError::NodeExecution { node, .. } if node == "summarize_all"
    ));
}

// =============================================================================
// Error Policies
// =============================================================================

fn flaky_compiler(failures: usize, calls: Arc<AtomicUsize>) -> Compiler {
    let executor = FnExecutor::new(move |req: TaskRequest| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if call <= failures {
                Err(TaskError::failed(req.task, format!("attempt {call} failed")))
            } else {
                Ok(json!("page body"))
            }
        }
    });
    Compiler::new(ExecutorCache::single(executor))
}

const FETCH: &str = r#"
name: fetch
defaults: { backoff_base: 1ms }
nodes:
  fetch: { type: transform, task: fetch, output: page, on_error: POLICY, max_retries: 3 }
edges:
  - { from: fetch, to: END }
"#;

#[tokio::test]
async fn test_retry_recovers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = flaky_compiler(2, Arc::clone(&calls))
        .compile(&FETCH.replace("POLICY", "retry"))
        .await
        .unwrap();

    let result = graph.run(json!({}), None).await.unwrap();
    assert_eq!(result.get("page"), Some(&json!("page body")));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.state().errors.len(), 2);
    assert!(result.state().errors.iter().all(|e| !e.fatal));
}

#[tokio::test]
async fn test_retry_exhausted() {
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = flaky_compiler(10, Arc::clone(&calls))
        .compile(&FETCH.replace("POLICY", "retry"))
        .await
        .unwrap();

    let failure = graph.run(json!({}), None).await.unwrap_err();
    assert!(matches!(
        failure.error,
        RunError::NodeExecution { attempts: 4, .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

const FETCH_RUNTIME_BOUND: &str = r#"
name: fetch
defaults: { backoff_base: 1ms, max_retries: 1 }
nodes:
  fetch: { type: transform, task: fetch, output: page, on_error: retry }
edges:
  - { from: fetch, to: END }
"#;

#[tokio::test]
async fn test_retry_bound_from_defaults() {
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = flaky_compiler(10, Arc::clone(&calls))
        .compile(FETCH_RUNTIME_BOUND)
        .await
        .unwrap();

    let failure = graph.run(json!({}), None).await.unwrap_err();
    assert!(matches!(
        failure.error,
        RunError::NodeExecution { attempts: 2, .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_runtime_retry_policy_overrides_defaults() {
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = flaky_compiler(10, Arc::clone(&calls))
        .with_config(RuntimeConfig::default().with_retry_policy(RetryPolicy::new(0)))
        .compile(FETCH_RUNTIME_BOUND)
        .await
        .unwrap();

    let failure = graph.run(json!({}), None).await.unwrap_err();
    assert!(matches!(
        failure.error,
        RunError::NodeExecution { attempts: 1, .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_node_retry_bound_beats_runtime_policy() {
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = flaky_compiler(10, Arc::clone(&calls))
        .with_config(
            RuntimeConfig::default().with_retry_policy(
                RetryPolicy::new(0).with_backoff_base(Duration::from_millis(1)),
            ),
        )
        .compile(&FETCH.replace("POLICY", "retry"))
        .await
        .unwrap();

    graph.run(json!({}), None).await.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_skip_policy_continues() {
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = flaky_compiler(10, Arc::clone(&calls))
        .compile(&FETCH.replace("POLICY", "skip"))
        .await
        .unwrap();

    let result = graph.run(json!({}), None).await.unwrap();
    assert!(result.is_complete());
    assert!(result.get("page").is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.state().errors.len(), 1);
    assert_eq!(result.state().errors[0].node, "fetch");
}

#[tokio::test]
async fn test_fail_policy_stops_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = flaky_compiler(10, Arc::clone(&calls))
        .compile(&FETCH.replace("POLICY", "fail"))
        .await
        .unwrap();

    let failure = graph.run(json!({}), None).await.unwrap_err();
    assert_eq!(failure.error.node(), Some("fetch"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

fn backend_factory(backend: Option<&Value>) -> Result<DynExecutor, String> {
    let model = backend.and_then(|b| b.get("model")).and_then(Value::as_str);
    match model {
        Some("backup") => Ok(Arc::new(FnExecutor::new(|_req: TaskRequest| async {
            Ok(json!("from backup"))
        }))),
        Some("broken") => Err("no credentials for `broken`".to_string()),
        Some("limited") => Ok(Arc::new(
            FnExecutor::new(|_req: TaskRequest| async { Ok(json!("limited")) })
                .with_tasks(["translate"]),
        )),
        _ => Ok(Arc::new(FnExecutor::new(|req: TaskRequest| async move {
            Err(TaskError::failed(req.task, "primary down"))
        }))),
    }
}

#[tokio::test]
async fn test_fallback_executor() {
    let graph = Compiler::new(ExecutorCache::new(backend_factory))
        .compile(
            r#"
name: resilient
nodes:
  fetch:
    type: transform
    task: fetch
    output: page
    on_error: fallback
    fallback: { model: backup }
edges:
  - { from: fetch, to: END }
"#,
        )
        .await
        .unwrap();

    let result = graph.run(json!({}), None).await.unwrap();
    assert_eq!(result.get("page"), Some(&json!("from backup")));
    assert_eq!(result.state().errors.len(), 1);
}

#[tokio::test]
async fn test_fallback_without_task_is_compile_error() {
    let errors = Compiler::new(ExecutorCache::new(backend_factory))
        .compile(
            r#"
name: resilient
nodes:
  fetch:
    type: transform
    task: fetch
    output: page
    on_error: fallback
    fallback: { model: limited }
edges:
  - { from: fetch, to: END }
"#,
        )
        .await
        .unwrap_err();

    assert!(errors.iter().any(|e| matches!(
        e,
        CompileError::Config(ConfigError::UnresolvedTask { node, task }) if node == "fetch" && task == "fetch"
    )));
}

#[tokio::test]
async fn test_unavailable_backend_is_compile_error() {
    let errors = Compiler::new(ExecutorCache::new(backend_factory))
        .compile(
            r#"
name: broken
nodes:
  fetch: { type: transform, task: fetch, output: page, backend: { model: broken } }
edges:
  - { from: fetch, to: END }
"#,
        )
        .await
        .unwrap_err();

    assert!(errors.iter().any(|e| matches!(
        e,
        CompileError::Config(ConfigError::ExecutorUnavailable { node, .. }) if node == "fetch"
    )));
}

// =============================================================================
// Compile Errors
// =============================================================================

#[tokio::test]
async fn test_compile_reports_every_error() {
    let errors = echo_compiler()
        .compile(
            r#"
name: broken
nodes:
  a: { type: transform, task: a }
  pick: { type: router, from: kind, routes: { x: nowhere } }
edges:
  - { from: a, to: ghost }
  - { from: pick, to: END }
"#,
        )
        .await
        .unwrap_err();

    let config: Vec<&ConfigError> = errors.iter().flat_map(|e| e.config_errors()).collect();
    assert!(config.len() >= 4, "got {errors}");
    assert!(config.contains(&&ConfigError::invalid_node("a", "`output` is required")));
    assert!(config
        .iter()
        .any(|e| matches!(e, ConfigError::UnknownEdgeEndpoint { node, .. } if node == "ghost")));
    assert!(config
        .iter()
        .any(|e| matches!(e, ConfigError::UnknownRouteTarget { target, .. } if target == "nowhere")));
    assert!(config
        .iter()
        .any(|e| matches!(e, ConfigError::InvalidEdge { from, .. } if from == "pick")));
}

#[tokio::test]
async fn test_parse_errors_are_reported() {
    let errors = echo_compiler()
        .compile("name: x\nnodes:\n  a: { type: teleport }\nedges: []\n")
        .await
        .unwrap_err();
    assert!(errors.iter().any(|e| matches!(
        e,
        CompileError::Config(ConfigError::UnknownNodeType { kind, .. }) if kind == "teleport"
    )));

    let errors = echo_compiler().compile("version: 2\nname: x\n").await.unwrap_err();
    assert!(errors
        .iter()
        .any(|e| matches!(e, CompileError::Config(ConfigError::UnsupportedVersion(v)) if v == "2")));
}

// =============================================================================
// Checkpoint Retention
// =============================================================================

const STAGES: &str = r#"
name: stages
nodes:
  one:   { type: transform, task: one, output: one }
  two:   { type: transform, task: two, output: two }
  three: { type: transform, task: three, output: three }
  four:  { type: transform, task: four, output: four }
edges:
  - { from: one, to: two }
  - { from: two, to: three }
  - { from: three, to: four }
  - { from: four, to: END }
"#;

#[tokio::test]
async fn test_checkpoint_retention_prunes_history() {
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let graph = echo_compiler()
        .with_checkpointer(checkpointer.clone())
        .with_config(RuntimeConfig::default().with_checkpoint_retention(2))
        .compile(STAGES)
        .await
        .unwrap();

    let result = graph.run(json!({}), Some("kept")).await.unwrap();
    assert!(result.is_complete());

    let history = checkpointer.history("kept").await.unwrap();
    assert_eq!(history.len(), 2);
    let latest = checkpointer.load("kept").await.unwrap().unwrap();
    assert!(latest.is_complete());
    assert_eq!(latest.state.values.get("four"), Some(&json!("four:done")));
}

#[tokio::test]
async fn test_full_history_without_retention() {
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let graph = echo_compiler()
        .with_checkpointer(checkpointer.clone())
        .compile(STAGES)
        .await
        .unwrap();

    graph.run(json!({}), Some("all")).await.unwrap();
    assert!(checkpointer.history("all").await.unwrap().len() > 2);
}
