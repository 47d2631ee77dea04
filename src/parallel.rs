//! Search drivers: single-threaded, root-parallel, leaf-parallel
//!
//! Root-parallel runs N workers over one shared tree; virtual loss steers
//! them onto different paths and per-node expansion gates keep integration
//! safe. Leaf-parallel runs one selector with a batch of simulations per
//! leaf and back-propagates the aggregate once. A degradation level of
//! `linear` skips tree search entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::budget::{BudgetLimits, TreeBudget};
use crate::cancel::CancelContext;
use crate::degradation::DegradationLevel;
use crate::engine::{Aggregation, MCTSEngine};
use crate::error::PlannerResult;
use crate::tree::PlanTree;

/// How the runner schedules iterations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelMode {
    Single,
    RootParallel {
        workers: usize,
    },
    LeafParallel {
        simulations_per_leaf: usize,
        aggregation: Aggregation,
    },
}

impl Default for ParallelMode {
    fn default() -> Self {
        Self::Single
    }
}

/// The single entry point for running a plan search
pub struct MCTSRunner {
    engine: Arc<MCTSEngine>,
    mode: ParallelMode,
}

impl MCTSRunner {
    pub fn new(engine: Arc<MCTSEngine>, mode: ParallelMode) -> Self {
        Self { engine, mode }
    }

    pub fn engine(&self) -> &Arc<MCTSEngine> {
        &self.engine
    }

    pub fn mode(&self) -> ParallelMode {
        self.mode
    }

    /// Search a plan tree for a task under the given budget.
    ///
    /// The degradation level decides the effective budget; at `linear` the
    /// tree search is skipped in favour of a single expansion. Determinism
    /// is not guaranteed in the parallel modes.
    pub async fn run(
        &self,
        ctx: &Arc<CancelContext>,
        task: &str,
        limits: BudgetLimits,
    ) -> PlannerResult<Arc<PlanTree>> {
        let level = self.engine.degradation().current_level();
        let limits = if level == DegradationLevel::Normal {
            limits
        } else {
            info!(level = level.as_str(), "applying degraded budget template");
            BudgetLimits::for_level(level)
        };
        if level == DegradationLevel::Linear {
            return self.run_linear(ctx, task, limits).await;
        }

        let tree = Arc::new(PlanTree::new(task, TreeBudget::new(limits)));
        match self.mode {
            ParallelMode::Single => self.engine.search(ctx, &tree).await?,
            ParallelMode::RootParallel { workers } => {
                self.run_root_parallel(ctx, &tree, workers).await?
            }
            ParallelMode::LeafParallel {
                simulations_per_leaf,
                aggregation,
            } => {
                self.run_leaf_parallel(ctx, &tree, simulations_per_leaf, aggregation)
                    .await?
            }
        }
        Ok(tree)
    }

    /// Combined reliability snapshot for observability consumers
    pub fn reliability_status(&self, tree: Option<&PlanTree>) -> serde_json::Value {
        serde_json::json!({
            "circuit_breaker": self.engine.breaker().status(),
            "degradation": self.engine.degradation().status(),
            "budget": tree.map(|t| t.budget().status()),
            "search": self.engine.stats(),
        })
    }

    /// Linear mode: one expansion, best child by score, no iteration loop
    async fn run_linear(
        &self,
        ctx: &Arc<CancelContext>,
        task: &str,
        limits: BudgetLimits,
    ) -> PlannerResult<Arc<PlanTree>> {
        info!("linear planning: tree search skipped");
        let tree = Arc::new(PlanTree::new(task, TreeBudget::new(limits)));
        self.engine.initialize(ctx, &tree).await?;
        tree.extract_best_path();
        Ok(tree)
    }

    /// N workers iterate the shared tree; virtual loss diversifies paths
    async fn run_root_parallel(
        &self,
        ctx: &Arc<CancelContext>,
        tree: &Arc<PlanTree>,
        workers: usize,
    ) -> PlannerResult<()> {
        self.engine.initialize(ctx, tree).await?;

        let remaining = Arc::new(AtomicU64::new(
            self.engine.config().max_iterations as u64,
        ));
        let handles: Vec<_> = (0..workers.max(1))
            .map(|worker| {
                let engine = Arc::clone(&self.engine);
                let tree = Arc::clone(tree);
                let ctx = Arc::clone(ctx);
                let remaining = Arc::clone(&remaining);
                tokio::spawn(async move {
                    loop {
                        if ctx.check().is_err() || tree.budget().check_limits().is_err() {
                            break;
                        }
                        // Claim an iteration from the shared target.
                        let claimed = remaining
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                                n.checked_sub(1)
                            })
                            .is_ok();
                        if !claimed {
                            break;
                        }
                        ctx.report_progress();
                        match engine.run_iteration(&ctx, &tree, true).await {
                            Ok(()) => engine.degradation().record_success(),
                            Err(err) if err.ends_search() => {
                                debug!(worker, error = %err, "worker stopping");
                                engine.record_iteration();
                                break;
                            }
                            Err(err) => engine.note_iteration_failure(&err),
                        }
                        engine.record_iteration();
                    }
                    debug!(worker, "worker finished");
                })
            })
            .collect();

        futures::future::join_all(handles).await;
        tree.extract_best_path();
        Ok(())
    }

    /// One selector; each chosen leaf gets a batch of simulations
    async fn run_leaf_parallel(
        &self,
        ctx: &Arc<CancelContext>,
        tree: &Arc<PlanTree>,
        simulations_per_leaf: usize,
        aggregation: Aggregation,
    ) -> PlannerResult<()> {
        self.engine.initialize(ctx, tree).await?;

        let mut iterations = 0u32;
        while iterations < self.engine.config().max_iterations {
            if ctx.check().is_err() || tree.budget().check_limits().is_err() {
                break;
            }
            ctx.report_progress();
            match self
                .engine
                .run_leaf_parallel_iteration(ctx, tree, simulations_per_leaf, aggregation)
                .await
            {
                Ok(()) => self.engine.degradation().record_success(),
                Err(err) if err.ends_search() => {
                    debug!(error = %err, "leaf-parallel search ended");
                    break;
                }
                Err(err) => self.engine.note_iteration_failure(&err),
            }
            iterations += 1;
            self.engine.record_iteration();
        }

        tree.extract_best_path();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelConfig, CancelController};
    use crate::engine::MCTSConfig;
    use crate::expander::MockExpander;
    use crate::simulator::{Simulator, SimulatorConfig};
    use tokio_util::sync::CancellationToken;

    fn runner(mode: ParallelMode, config: MCTSConfig, expander: MockExpander) -> MCTSRunner {
        let engine = MCTSEngine::new(
            config,
            Arc::new(expander),
            Arc::new(Simulator::new(SimulatorConfig::default())),
        )
        .unwrap();
        MCTSRunner::new(Arc::new(engine), mode)
    }

    async fn session() -> (Arc<CancelController>, Arc<CancelContext>) {
        let controller = CancelController::new(CancelConfig::default()).unwrap();
        let ctx = controller.new_session(&CancellationToken::new());
        (controller, ctx)
    }

    #[tokio::test]
    async fn test_single_mode_run() {
        let (controller, ctx) = session().await;
        let config = MCTSConfig {
            max_iterations: 4,
            ..Default::default()
        };
        let runner = runner(ParallelMode::Single, config, MockExpander::new(1));

        let tree = runner
            .run(&ctx, "fix typo", BudgetLimits::unlimited())
            .await
            .unwrap();
        assert!(tree.total_nodes() >= 2);
        assert!(!tree.best_path().is_empty());
        controller.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_root_parallel_run() {
        let (controller, ctx) = session().await;
        let config = MCTSConfig {
            max_iterations: 20,
            ..Default::default()
        };
        let runner = runner(
            ParallelMode::RootParallel { workers: 4 },
            config,
            MockExpander::new(3),
        );

        let tree = runner
            .run(&ctx, "refactor module", BudgetLimits::unlimited())
            .await
            .unwrap();
        assert!(tree.total_nodes() > 1);
        assert!(!tree.best_path().is_empty());
        // Every worker-claimed iteration was either run or abandoned at a
        // stop condition; the shared target bounds the total.
        assert!(runner.engine().stats().iterations <= 20);

        // Virtual loss fully released: no node ends with a negative total.
        fn no_negative_scores(node: &Arc<crate::node::PlanNode>) -> bool {
            node.total_score() >= -1e-9
                && node.children().iter().all(no_negative_scores)
        }
        assert!(no_negative_scores(tree.root()));
        controller.close();
    }

    #[tokio::test]
    async fn test_leaf_parallel_run() {
        let (controller, ctx) = session().await;
        let config = MCTSConfig {
            max_iterations: 5,
            ..Default::default()
        };
        let runner = runner(
            ParallelMode::LeafParallel {
                simulations_per_leaf: 3,
                aggregation: Aggregation::Weighted,
            },
            config,
            MockExpander::new(2),
        );

        let tree = runner
            .run(&ctx, "add test", BudgetLimits::unlimited())
            .await
            .unwrap();
        assert!(tree.total_nodes() > 1);
        let stats = runner.engine().stats();
        assert!(
            stats.simulations_quick + stats.simulations_standard + stats.simulations_full
                >= 15,
            "each iteration runs a batch of simulations",
        );
        controller.close();
    }

    #[tokio::test]
    async fn test_linear_level_skips_tree_search() {
        let (controller, ctx) = session().await;
        let config = MCTSConfig {
            max_iterations: 50,
            ..Default::default()
        };
        let runner = runner(ParallelMode::Single, config, MockExpander::new(3));

        // Push the degradation manager to linear.
        for _ in 0..6 {
            runner.engine().degradation().record_failure("ExpansionFailed");
        }
        assert_eq!(
            runner.engine().degradation().current_level(),
            DegradationLevel::Linear
        );

        let tree = runner
            .run(&ctx, "fix typo", BudgetLimits::unlimited())
            .await
            .unwrap();
        // Linear template: one node beyond the root, one oracle call.
        assert_eq!(tree.budget().limits().max_nodes, 1);
        assert_eq!(tree.budget().llm_calls(), 1);
        assert_eq!(tree.total_nodes(), 2);
        assert_eq!(tree.best_path().len(), 2);
        controller.close();
    }

    #[tokio::test]
    async fn test_reliability_status_aggregates() {
        let (controller, ctx) = session().await;
        let config = MCTSConfig {
            max_iterations: 2,
            ..Default::default()
        };
        let runner = runner(ParallelMode::Single, config, MockExpander::new(1));
        let tree = runner
            .run(&ctx, "task", BudgetLimits::unlimited())
            .await
            .unwrap();

        let status = runner.reliability_status(Some(&tree));
        assert_eq!(status["circuit_breaker"]["state"], "closed");
        assert_eq!(status["degradation"]["level"], "normal");
        assert!(status["budget"]["llm_calls"].as_u64().unwrap() >= 1);
        assert!(status["search"]["iterations"].as_u64().unwrap() >= 1);
        controller.close();
    }
}
