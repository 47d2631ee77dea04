//! Performance benchmarks for the planner core
//!
//! Measures raw iteration throughput with a mock oracle, plus the hot
//! in-memory paths: selection scoring, content hashing, and budget checks.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use mcts_planner::budget::{BudgetLimits, TreeBudget};
use mcts_planner::cancel::{CancelConfig, CancelController};
use mcts_planner::engine::{MCTSConfig, MCTSEngine};
use mcts_planner::expander::MockExpander;
use mcts_planner::node::PlanNode;
use mcts_planner::parallel::{MCTSRunner, ParallelMode};
use mcts_planner::policy::{SelectionPolicy, Ucb1Policy};
use mcts_planner::simulator::{Simulator, SimulatorConfig};
use mcts_planner::types::{ActionType, PlannedAction};

fn benchmark_single_threaded_search(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("search_single_50_iterations", |b| {
        b.iter(|| {
            rt.block_on(async {
                let controller = CancelController::new(CancelConfig::default()).unwrap();
                let ctx = controller.new_session(&CancellationToken::new());
                let config = MCTSConfig {
                    max_iterations: 50,
                    ..Default::default()
                };
                let engine = MCTSEngine::new(
                    config,
                    Arc::new(MockExpander::new(3)),
                    Arc::new(Simulator::new(SimulatorConfig::default())),
                )
                .unwrap();
                let runner = MCTSRunner::new(Arc::new(engine), ParallelMode::Single);
                let tree = runner
                    .run(&ctx, "benchmark task", BudgetLimits::unlimited())
                    .await
                    .unwrap();
                controller.close();
                black_box(tree.total_nodes())
            })
        })
    });
}

fn benchmark_root_parallel_search(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("search_root_parallel_4x50", |b| {
        b.iter(|| {
            rt.block_on(async {
                let controller = CancelController::new(CancelConfig::default()).unwrap();
                let ctx = controller.new_session(&CancellationToken::new());
                let config = MCTSConfig {
                    max_iterations: 50,
                    ..Default::default()
                };
                let engine = MCTSEngine::new(
                    config,
                    Arc::new(MockExpander::new(3)),
                    Arc::new(Simulator::new(SimulatorConfig::default())),
                )
                .unwrap();
                let runner =
                    MCTSRunner::new(Arc::new(engine), ParallelMode::RootParallel { workers: 4 });
                let tree = runner
                    .run(&ctx, "benchmark task", BudgetLimits::unlimited())
                    .await
                    .unwrap();
                controller.close();
                black_box(tree.total_nodes())
            })
        })
    });
}

fn benchmark_selection_scoring(c: &mut Criterion) {
    let parent = PlanNode::new_root("bench");
    for i in 0..10 {
        let child = PlanNode::new(format!("c{i}"), "step", None);
        for _ in 0..(i + 1) {
            child.add_visit_and_score(0.5 + i as f64 * 0.04);
        }
        parent.attach_child(child);
    }
    for _ in 0..55 {
        parent.add_visit_and_score(0.5);
    }
    let policy = Ucb1Policy::default();

    c.bench_function("ucb1_select_over_10_children", |b| {
        b.iter(|| black_box(policy.select_child(&parent)))
    });
}

fn benchmark_content_hashing(c: &mut Criterion) {
    let action = PlannedAction::new(
        ActionType::Edit,
        "src/server/handler.go",
        "- return nil\n+ return fmt.Errorf(\"unhandled case: %v\", kind)\n",
        "go",
        "propagate the unhandled case",
    );

    c.bench_function("node_creation_with_hash", |b| {
        b.iter(|| {
            black_box(PlanNode::new(
                "node-1234",
                "propagate the unhandled case",
                Some(action.clone()),
            ))
        })
    });
}

fn benchmark_budget_check(c: &mut Criterion) {
    let budget = TreeBudget::new(BudgetLimits::default());
    budget.record_node();
    budget.record_llm_call(512, 0.004);

    c.bench_function("budget_check_limits", |b| {
        b.iter(|| black_box(budget.check_limits().is_ok()))
    });
}

criterion_group!(
    benches,
    benchmark_single_threaded_search,
    benchmark_root_parallel_search,
    benchmark_selection_scoring,
    benchmark_content_hashing,
    benchmark_budget_check,
);
criterion_main!(benches);
