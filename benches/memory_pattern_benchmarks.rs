use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

use onnx_exec::execution::context::SessionOptions;
use onnx_exec::execution::engine::ExecutionEngine;
use onnx_exec::execution::value::Value;
use onnx_exec::memory::allocator::CpuAllocator;
use onnx_exec::memory::pattern::MemPatternPlanner;
use onnx_exec::model::{Graph, Node, NodeArg};
use onnx_exec::ops::tensor::Tensor;

/// `depth` alternating Relu/Sigmoid layers with a residual Add every third layer
fn layered_graph(depth: usize, width: i64) -> Graph {
    let mut graph = Graph::new("layered");
    graph.add_input(NodeArg::float("x", &[1, width]));
    let mut prev = "x".to_string();
    for i in 0..depth {
        let out = if i + 1 == depth { "y".to_string() } else { format!("h{}", i) };
        let op = if i % 2 == 0 { "Relu" } else { "Sigmoid" };
        if i % 3 == 2 {
            let branch = format!("b{}", i);
            graph.add_node(Node::new(&format!("n{}", i), op, vec![NodeArg::named(&prev)], vec![NodeArg::float(&branch, &[1, width])]));
            graph.add_node(Node::new(
                &format!("add{}", i),
                "Add",
                vec![NodeArg::named(&branch), NodeArg::named(&prev)],
                vec![NodeArg::float(&out, &[1, width])],
            ));
        } else {
            graph.add_node(Node::new(&format!("n{}", i), op, vec![NodeArg::named(&prev)], vec![NodeArg::float(&out, &[1, width])]));
        }
        prev = out;
    }
    graph.add_output(NodeArg::named("y"));
    graph
}

fn feeds(width: i64) -> HashMap<String, Value> {
    let data: Vec<f32> = (0..width).map(|i| (i as f32).sin()).collect();
    let x = Tensor::from_f32([1, width], &data, &CpuAllocator::new(None)).expect("feed tensor");
    HashMap::from([("x".to_string(), Value::from_tensor(x))])
}

fn bench_pattern_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("pattern_planner");
    for events in [64usize, 512, 4096] {
        let mut rng = StdRng::seed_from_u64(7);
        let sizes: Vec<usize> = (0..events).map(|_| rng.gen_range(16..4096)).collect();
        group.bench_function(BenchmarkId::new("trace", events), |b| {
            b.iter(|| {
                let mut planner = MemPatternPlanner::new();
                for (value, &size) in sizes.iter().enumerate() {
                    planner.trace_allocation(value, size).expect("trace");
                    if value >= 4 {
                        planner.trace_free(value - 4);
                    }
                }
                black_box(planner.generate_pattern())
            })
        });
    }
    group.finish();
}

fn bench_frame_runs(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution_frame");
    let width = 1024;
    for (label, enable) in [("with_pattern", true), ("without_pattern", false)] {
        let options = SessionOptions::default().enable_mem_pattern(enable);
        let engine = ExecutionEngine::new(layered_graph(24, width), options).expect("session");
        // first run fills the pattern cache
        engine.run(feeds(width), &["y"]).expect("warmup");
        group.bench_function(BenchmarkId::new("run", label), |b| {
            b.iter(|| black_box(engine.run(feeds(width), &["y"]).expect("run")))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pattern_generation, bench_frame_runs);
criterion_main!(benches);
