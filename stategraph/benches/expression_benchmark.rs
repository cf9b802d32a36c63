//! Benchmarks for routing conditions and the graph step loop

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use tokio::runtime::Runtime;

use stategraph::{Compiler, Condition, ExecutorCache, FnExecutor, StateMap, TaskRequest};

fn sample_state() -> StateMap {
    match json!({
        "status": "approved",
        "review": {"score": 0.82, "issues": 3},
        "attempts": 2,
        "draft": "text"
    }) {
        serde_json::Value::Object(map) => map,
        _ => StateMap::new(),
    }
}

fn bench_condition_parse(c: &mut Criterion) {
    c.bench_function("condition_parse", |b| {
        b.iter(|| {
            Condition::parse(black_box(
                "review.score >= 0.8 and status == 'approved' or not draft",
            ))
        })
    });
}

fn bench_condition_evaluate(c: &mut Criterion) {
    let condition = match Condition::parse("review.score >= 0.8 and (review.issues < 5 or attempts > 3)") {
        Ok(condition) => condition,
        Err(e) => panic!("benchmark condition does not parse: {e}"),
    };
    let state = sample_state();

    c.bench_function("condition_evaluate", |b| {
        b.iter(|| condition.evaluate(black_box(&state)))
    });
}

fn bench_linear_run(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let executor = FnExecutor::new(|req: TaskRequest| async move { Ok(json!(req.task)) });
    let graph = rt
        .block_on(Compiler::new(ExecutorCache::single(executor)).compile(
            r#"
name: bench
defaults: { skip_if_exists: false }
nodes:
  a: { type: transform, task: a, output: a }
  b: { type: transform, task: b, output: b }
  c: { type: passthrough, increment: { count: 1 } }
edges:
  - { from: a, to: b }
  - { from: b, to: c }
  - { from: c, to: END }
"#,
        ))
        .unwrap();

    c.bench_function("linear_run_3_nodes", |b| {
        b.to_async(&rt).iter(|| async { graph.run(json!({}), None).await.unwrap() })
    });
}

criterion_group!(
    benches,
    bench_condition_parse,
    bench_condition_evaluate,
    bench_linear_run
);
criterion_main!(benches);
