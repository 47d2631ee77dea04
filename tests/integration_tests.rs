//! End-to-end scenarios over the full planner stack

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mcts_planner::budget::{BudgetAxis, BudgetLimits, TreeBudget};
use mcts_planner::cancel::{
    CancelConfig, CancelContext, CancelController, CancelReason, ContextState,
};
use mcts_planner::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use mcts_planner::degradation::DegradationLevel;
use mcts_planner::engine::{MCTSConfig, MCTSEngine};
use mcts_planner::error::PlannerResult;
use mcts_planner::expander::MockExpander;
use mcts_planner::parallel::{MCTSRunner, ParallelMode};
use mcts_planner::policy::{SelectionPolicy, Ucb1Policy, VirtualLossGuard};
use mcts_planner::node::PlanNode;
use mcts_planner::simulator::{LintResult, LintRunner, Simulator, SimulatorConfig};

fn fast_cancel_config() -> CancelConfig {
    CancelConfig {
        grace_period: Duration::from_millis(50),
        force_kill_timeout: Duration::from_millis(500),
        progress_check_interval: Duration::from_millis(20),
        algorithm_progress_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

async fn session() -> (Arc<CancelController>, Arc<CancelContext>) {
    let controller = CancelController::new(fast_cancel_config()).unwrap();
    let ctx = controller.new_session(&CancellationToken::new());
    (controller, ctx)
}

fn bare_simulator() -> Arc<Simulator> {
    Arc::new(Simulator::new(SimulatorConfig::default()))
}

/// Scenario: a task whose expander always proposes one edit step.
#[tokio::test]
async fn simple_single_child_success() {
    let (controller, ctx) = session().await;
    let config = MCTSConfig {
        max_iterations: 1,
        ..Default::default()
    };
    let engine =
        MCTSEngine::new(config, Arc::new(MockExpander::new(1)), bare_simulator()).unwrap();
    let runner = MCTSRunner::new(Arc::new(engine), ParallelMode::Single);

    let tree = runner
        .run(&ctx, "fix typo", BudgetLimits::unlimited())
        .await
        .unwrap();

    assert_eq!(tree.total_nodes(), 2);
    let path = tree.best_path();
    assert_eq!(path.len(), 2);
    approx::assert_relative_eq!(tree.best_score(), 0.9, epsilon = 1e-6);
    assert_eq!(tree.budget().nodes_explored(), 1);
    assert_eq!(tree.budget().llm_calls(), 1);

    let action = path[1].action().unwrap();
    assert_eq!(action.file_path, "a.go");
    controller.close();
}

/// Scenario: a three-node budget exhausts mid-search and sticks.
#[tokio::test]
async fn budget_exhaustion_mid_search() {
    let (controller, ctx) = session().await;
    let config = MCTSConfig {
        max_iterations: 30,
        ..Default::default()
    };
    let engine =
        MCTSEngine::new(config, Arc::new(MockExpander::new(2)), bare_simulator()).unwrap();
    let runner = MCTSRunner::new(Arc::new(engine), ParallelMode::Single);

    let limits = BudgetLimits {
        max_nodes: 3,
        ..BudgetLimits::unlimited()
    };
    let tree = runner.run(&ctx, "refactor", limits).await.unwrap();

    assert_eq!(tree.budget().nodes_explored(), 3);
    assert_eq!(tree.budget().exhausted_by(), Some(BudgetAxis::Nodes));
    let err = tree.budget().check_limits().unwrap_err();
    assert_eq!(err.error_type(), "NodeLimitExceeded");
    assert!(!tree.best_path().is_empty());
    controller.close();
}

/// Scenario: the oracle fails repeatedly, the circuit opens, degradation
/// pins at linear, and recovery climbs back one level after the circuit
/// closes.
#[tokio::test]
async fn circuit_opens_then_degrades_then_recovers() {
    let (controller, ctx) = session().await;
    let config = MCTSConfig {
        max_iterations: 8,
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_duration: Duration::from_millis(200),
            half_open_max: 1,
        },
        ..Default::default()
    };
    // First call (root expansion) succeeds; the next three fail.
    let expander = MockExpander::new(2).with_failures_from(2, 3);
    let engine = MCTSEngine::new(config, Arc::new(expander), bare_simulator()).unwrap();
    let engine = Arc::new(engine);
    let runner = MCTSRunner::new(Arc::clone(&engine), ParallelMode::Single);

    let tree = runner
        .run(&ctx, "task", BudgetLimits::unlimited())
        .await
        .unwrap();
    assert!(tree.total_nodes() >= 3);

    assert_eq!(engine.breaker().state(), CircuitState::Open);
    assert_eq!(engine.degradation().current_level(), DegradationLevel::Linear);
    let (permitted, release) = engine.breaker().allow();
    assert!(!permitted);
    assert!(release.is_none());

    // After the open duration, one probe plus the success streak closes it.
    tokio::time::sleep(Duration::from_millis(220)).await;
    let (permitted, release) = engine.breaker().allow();
    assert!(permitted);
    engine.breaker().record_success();
    drop(release);
    engine.breaker().record_success();
    assert_eq!(engine.breaker().state(), CircuitState::Closed);

    for _ in 0..3 {
        engine.degradation().record_success();
    }
    assert_eq!(
        engine.degradation().current_level(),
        DegradationLevel::Minimal,
        "recovery climbs exactly one level per success streak",
    );
    controller.close();
}

struct SlowLint(Duration);

#[async_trait]
impl LintRunner for SlowLint {
    async fn lint(
        &self,
        ctx: &CancelContext,
        _content: &str,
        _language: &str,
    ) -> PlannerResult<LintResult> {
        tokio::select! {
            _ = tokio::time::sleep(self.0) => {}
            _ = ctx.done() => {}
        }
        Ok(LintResult {
            valid: true,
            errors: vec![],
            warnings: vec![],
        })
    }
}

/// Scenario: the session is cancelled while a slow scan runs; the engine
/// back-propagates the partial score and returns the tree without error.
#[tokio::test]
async fn cancellation_mid_iteration_returns_partial_tree() {
    let (controller, ctx) = session().await;
    let config = MCTSConfig {
        max_iterations: 10_000,
        ..Default::default()
    };
    let simulator = Arc::new(
        Simulator::new(SimulatorConfig::default())
            .with_lint(Arc::new(SlowLint(Duration::from_millis(200)))),
    );
    let engine =
        MCTSEngine::new(config, Arc::new(MockExpander::new(2)), simulator).unwrap();
    let runner = MCTSRunner::new(Arc::new(engine), ParallelMode::Single);

    let cancel_ctx = Arc::clone(&ctx);
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel_ctx.cancel(CancelReason::User);
    });

    let started = Instant::now();
    let tree = runner
        .run(&ctx, "slow scan", BudgetLimits::unlimited())
        .await
        .expect("cancellation is not an error for the runner");
    canceller.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(tree.total_nodes() >= 2);
    assert!(!tree.best_path().is_empty());
    controller.close();
}

/// Scenario: two workers with virtual loss must diverge on equal children,
/// and the loss is fully released afterwards.
#[tokio::test]
async fn parallel_virtual_loss_divergence() {
    let root = PlanNode::new_root("task");
    for i in 0..3 {
        let child = PlanNode::new(format!("c{i}"), "step", None);
        root.attach_child(child);
    }
    root.add_visit_and_score(0.5);
    let policy = Ucb1Policy::default();

    // Worker A selects a child and holds a virtual loss on it.
    let first = policy.select_child(&root).unwrap();
    let path = vec![Arc::clone(&first)];
    let guard = VirtualLossGuard::apply(&path, 1.0);
    assert_eq!(first.visits(), 1);

    // Worker B, selecting concurrently, must pick a different child.
    let second = policy.select_child(&root).unwrap();
    assert_ne!(first.id(), second.id());

    // Worker A completes its iteration and releases the loss.
    first.add_visit_and_score(0.8);
    drop(guard);
    assert_eq!(first.visits(), 1);
    assert!((first.average_score() - 0.8).abs() < 1e-9);
}

/// Scenario: an algorithm that stops reporting progress is cancelled with a
/// deadlock reason, its Done channel closes, and its collector runs.
#[tokio::test]
async fn deadlock_detection_fires() {
    let controller = CancelController::new(fast_cancel_config()).unwrap();
    let session = controller.new_session(&CancellationToken::new());
    let activity = controller.child(&session, "search").unwrap();
    let algorithm = controller.child(&activity, "pnmcts").unwrap();
    algorithm.register_collector(Box::new(|| serde_json::json!({"expanded": 4})));

    // Interval 100ms, multiplier 3: the monitor fires between 300 and
    // roughly 400ms of silence.
    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(2), algorithm.done())
        .await
        .expect("monitor must cancel the silent algorithm");
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(250), "fired at {elapsed:?}");
    assert!(elapsed < Duration::from_millis(800), "fired at {elapsed:?}");
    assert_eq!(algorithm.reason(), Some(CancelReason::Deadlock));

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(algorithm.state(), ContextState::Cancelled);
    assert_eq!(
        algorithm.collect_partial(),
        Some(serde_json::json!({"expanded": 4}))
    );
    controller.close();
}

/// Root-parallel search over a shared tree leaves consistent statistics.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn root_parallel_consistency() {
    let (controller, ctx) = session().await;
    let config = MCTSConfig {
        max_iterations: 24,
        ..Default::default()
    };
    let engine =
        MCTSEngine::new(config, Arc::new(MockExpander::new(3)), bare_simulator()).unwrap();
    let runner = MCTSRunner::new(Arc::new(engine), ParallelMode::RootParallel { workers: 4 });

    let tree = runner
        .run(&ctx, "wide task", BudgetLimits::unlimited())
        .await
        .unwrap();

    // Tree node accounting matches the actual tree.
    fn count(node: &Arc<PlanNode>) -> u64 {
        1 + node.children().iter().map(count).sum::<u64>()
    }
    assert_eq!(count(tree.root()), tree.total_nodes());

    // All virtual losses were compensated.
    fn scores_consistent(node: &Arc<PlanNode>) -> bool {
        node.total_score() >= -1e-9 && node.children().iter().all(scores_consistent)
    }
    assert!(scores_consistent(tree.root()));
    controller.close();
}

/// The runner surfaces a combined JSON reliability snapshot.
#[tokio::test]
async fn reliability_snapshot_roundtrips() {
    let (controller, ctx) = session().await;
    let config = MCTSConfig {
        max_iterations: 3,
        ..Default::default()
    };
    let engine =
        MCTSEngine::new(config, Arc::new(MockExpander::new(1)), bare_simulator()).unwrap();
    let runner = MCTSRunner::new(Arc::new(engine), ParallelMode::Single);
    let tree = runner
        .run(&ctx, "task", BudgetLimits::default())
        .await
        .unwrap();

    let status = runner.reliability_status(Some(&tree));
    let text = serde_json::to_string(&status).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["circuit_breaker"]["state"], "closed");
    assert_eq!(parsed["degradation"]["circuit_open"], false);
    assert!(parsed["budget"]["elapsed"].is_object() || parsed["budget"]["elapsed"].is_number());
    controller.close();
}

/// Shutdown of a controller with live search contexts stays within bounds.
#[tokio::test]
async fn shutdown_bound_holds() {
    let controller = CancelController::new(fast_cancel_config()).unwrap();
    let session = controller.new_session(&CancellationToken::new());
    let _activity = controller.child(&session, "search").unwrap();

    let started = Instant::now();
    let report = controller.shutdown().await;
    assert!(report.success);
    // force_kill_timeout plus collection slack.
    assert!(started.elapsed() <= Duration::from_millis(600));

    let again = controller.shutdown().await;
    assert_eq!(report.success, again.success);
    controller.close();
}

/// A search driven through a PUCT policy consumes expander priors.
#[tokio::test]
async fn puct_search_uses_priors() {
    let (controller, ctx) = session().await;
    let config = MCTSConfig {
        max_iterations: 6,
        policy: mcts_planner::policy::PolicyKind::Puct,
        ..Default::default()
    };
    let expander = MockExpander::new(3).with_priors(vec![0.2, 0.5, 0.3]);
    let engine = MCTSEngine::new(config, Arc::new(expander), bare_simulator()).unwrap();
    let runner = MCTSRunner::new(Arc::new(engine), ParallelMode::Single);

    let tree = runner
        .run(&ctx, "task", BudgetLimits::unlimited())
        .await
        .unwrap();
    assert!(tree.total_nodes() > 3);
    assert!(!tree.best_path().is_empty());
    controller.close();
}

/// A tree whose budget is reset is reusable without stale exhaustion.
#[tokio::test]
async fn budget_reset_roundtrip() {
    let limits = BudgetLimits {
        max_nodes: 1,
        ..BudgetLimits::unlimited()
    };
    let budget = TreeBudget::new(limits);
    budget.record_node();
    assert!(budget.check_limits().is_err());

    budget.reset();
    assert!(budget.check_limits().is_ok());
    assert_eq!(budget.exhausted_by(), None);
}

/// Trees render a readable dump and expose lookup accessors.
#[tokio::test]
async fn tree_accessors_after_search() {
    let (controller, ctx) = session().await;
    let config = MCTSConfig {
        max_iterations: 4,
        ..Default::default()
    };
    let engine =
        MCTSEngine::new(config, Arc::new(MockExpander::new(2)), bare_simulator()).unwrap();
    let runner = MCTSRunner::new(Arc::new(engine), ParallelMode::Single);
    let tree = runner
        .run(&ctx, "task", BudgetLimits::unlimited())
        .await
        .unwrap();

    let dump = tree.format();
    assert!(dump.contains("task: task"));
    assert!(tree.max_depth() >= 1);

    let some_child = &tree.root().children()[0];
    let found = tree.find_node(some_child.id()).unwrap();
    assert_eq!(found.id(), some_child.id());
    controller.close();
}
