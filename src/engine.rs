//! The MCTS search engine
//!
//! One iteration runs select → transposition check → expand → simulate →
//! back-propagate. Budget and depth violations end the search and leave a
//! best path behind; oracle failures abandon the iteration, feed the circuit
//! breaker and degradation manager, and the loop continues; cancellation
//! exits cleanly with whatever the tree holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelContext;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::degradation::{DegradationConfig, DegradationManager};
use crate::error::{PlannerError, PlannerResult};
use crate::expander::{ExpandOutcome, ExpansionManager, NodeExpander, WideningConfig};
use crate::node::PlanNode;
use crate::policy::{make_policy, PolicyKind, RaveTracker, SelectionPolicy, VirtualLossGuard};
use crate::simulator::Simulator;
use crate::transposition::TranspositionTable;
use crate::tree::PlanTree;
use crate::types::{NodeState, SimulationTier};

/// How leaf-parallel simulation batches are combined
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Mean,
    Max,
    /// Per-score weights `s + 0.1`, so an all-zero batch still aggregates
    Weighted,
}

/// Engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MCTSConfig {
    pub max_iterations: u32,
    pub exploration_constant: f64,
    pub policy: PolicyKind,
    /// Visits a leaf needs before it becomes eligible for expansion
    pub min_visits_before_expand: u64,
    /// Scores below this mark a thrice-visited node abandoned
    pub abandon_threshold: f64,
    pub virtual_loss_value: f64,
    pub widening: WideningConfig,
    /// Promote through the tiers instead of running a fixed one
    pub progressive_simulation: bool,
    pub simulation_tier: SimulationTier,
    pub enable_rave: bool,
    pub enable_transposition: bool,
    pub circuit_breaker: CircuitBreakerConfig,
    pub degradation: DegradationConfig,
}

impl Default for MCTSConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            exploration_constant: std::f64::consts::SQRT_2,
            policy: PolicyKind::Ucb1,
            min_visits_before_expand: 1,
            abandon_threshold: 0.2,
            virtual_loss_value: 1.0,
            widening: WideningConfig::default(),
            progressive_simulation: true,
            simulation_tier: SimulationTier::Quick,
            enable_rave: false,
            enable_transposition: false,
            circuit_breaker: CircuitBreakerConfig::default(),
            degradation: DegradationConfig::default(),
        }
    }
}

impl MCTSConfig {
    pub fn validate(&self) -> PlannerResult<()> {
        if self.max_iterations == 0 {
            return Err(PlannerError::invalid_config("max_iterations must be positive"));
        }
        if self.exploration_constant <= 0.0 {
            return Err(PlannerError::invalid_config(
                "exploration_constant must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.abandon_threshold) {
            return Err(PlannerError::invalid_config(
                "abandon_threshold must lie in [0, 1]",
            ));
        }
        if self.virtual_loss_value < 0.0 {
            return Err(PlannerError::invalid_config(
                "virtual_loss_value must be non-negative",
            ));
        }
        self.widening.validate()
    }
}

/// JSON-serializable search statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SearchStats {
    pub iterations: u64,
    pub expansions: u64,
    pub simulations_quick: u64,
    pub simulations_standard: u64,
    pub simulations_full: u64,
    pub transposition_hits: u64,
    pub iteration_failures: u64,
    pub search_time: Duration,
}

#[derive(Default)]
struct EngineStats {
    iterations: AtomicU64,
    expansions: AtomicU64,
    simulations_quick: AtomicU64,
    simulations_standard: AtomicU64,
    simulations_full: AtomicU64,
    transposition_hits: AtomicU64,
    iteration_failures: AtomicU64,
    search_time: Mutex<Duration>,
}

impl EngineStats {
    fn record_simulation(&self, tier: SimulationTier) {
        let counter = match tier {
            SimulationTier::Quick => &self.simulations_quick,
            SimulationTier::Standard => &self.simulations_standard,
            SimulationTier::Full => &self.simulations_full,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> SearchStats {
        SearchStats {
            iterations: self.iterations.load(Ordering::SeqCst),
            expansions: self.expansions.load(Ordering::SeqCst),
            simulations_quick: self.simulations_quick.load(Ordering::SeqCst),
            simulations_standard: self.simulations_standard.load(Ordering::SeqCst),
            simulations_full: self.simulations_full.load(Ordering::SeqCst),
            transposition_hits: self.transposition_hits.load(Ordering::SeqCst),
            iteration_failures: self.iteration_failures.load(Ordering::SeqCst),
            search_time: *self.search_time.lock(),
        }
    }
}

/// Orchestrates selection, expansion, simulation, and back-propagation
pub struct MCTSEngine {
    config: MCTSConfig,
    expansion: ExpansionManager,
    simulator: Arc<Simulator>,
    policy: Arc<dyn SelectionPolicy>,
    rave: Option<Arc<RaveTracker>>,
    transposition: Option<Arc<TranspositionTable>>,
    degradation: Arc<DegradationManager>,
    stats: EngineStats,
}

impl MCTSEngine {
    pub fn new(
        config: MCTSConfig,
        expander: Arc<dyn NodeExpander>,
        simulator: Arc<Simulator>,
    ) -> PlannerResult<Self> {
        config.validate()?;
        simulator.config().validate()?;

        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        let degradation = Arc::new(DegradationManager::new(
            config.degradation.clone(),
            Arc::clone(&breaker),
        ));
        let policy = make_policy(config.policy, config.exploration_constant);
        let expansion = ExpansionManager::new(expander, breaker, config.widening.clone());
        let rave = config.enable_rave.then(|| Arc::new(RaveTracker::new()));
        let transposition = config
            .enable_transposition
            .then(|| Arc::new(TranspositionTable::new()));

        info!(
            policy = policy.name(),
            max_iterations = config.max_iterations,
            "created MCTS engine",
        );
        Ok(Self {
            config,
            expansion,
            simulator,
            policy,
            rave,
            transposition,
            degradation,
            stats: EngineStats::default(),
        })
    }

    pub fn config(&self) -> &MCTSConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.expansion.breaker()
    }

    pub fn degradation(&self) -> &Arc<DegradationManager> {
        &self.degradation
    }

    pub fn rave(&self) -> Option<&Arc<RaveTracker>> {
        self.rave.as_ref()
    }

    pub fn transposition(&self) -> Option<&Arc<TranspositionTable>> {
        self.transposition.as_ref()
    }

    pub fn stats(&self) -> SearchStats {
        self.stats.snapshot()
    }

    /// Run the single-threaded search loop over a tree
    pub async fn search(&self, ctx: &Arc<CancelContext>, tree: &PlanTree) -> PlannerResult<()> {
        let started = Instant::now();
        self.initialize(ctx, tree).await?;

        let mut iterations = 0u32;
        while iterations < self.config.max_iterations {
            if let Err(err) = ctx.check() {
                debug!(error = %err, "search cancelled, extracting best path");
                break;
            }
            if tree.budget().check_limits().is_err() {
                break;
            }
            ctx.report_progress();

            match self.run_iteration(ctx, tree, false).await {
                Ok(()) => self.degradation.record_success(),
                Err(err) if err.ends_search() => {
                    debug!(error = %err, "search ended");
                    break;
                }
                Err(err) => self.note_iteration_failure(&err),
            }
            iterations += 1;
            self.record_iteration();
        }

        tree.extract_best_path();
        *self.stats.search_time.lock() += started.elapsed();
        Ok(())
    }

    /// Mark the root exploring, give it its first visit, and perform one
    /// unconditional expansion. An oracle failure here aborts the search;
    /// a budget violation merely ends it before it began.
    pub(crate) async fn initialize(
        &self,
        ctx: &Arc<CancelContext>,
        tree: &PlanTree,
    ) -> PlannerResult<()> {
        let root = tree.root();
        if root.visits() > 0 {
            return Ok(()); // already initialised by another worker
        }
        root.set_state(NodeState::Exploring);
        root.add_visit_and_score(0.0);

        match self
            .expansion
            .expand_and_integrate_with_allowance(
                ctx,
                tree,
                root,
                self.policy.as_ref(),
                Some(self.config.widening.max_children),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.ends_search() => Ok(()),
            Err(err) => {
                warn!(error = %err, "initial expansion failed");
                Err(err)
            }
        }
    }

    /// One select → expand → simulate → back-propagate pass
    pub(crate) async fn run_iteration(
        &self,
        ctx: &Arc<CancelContext>,
        tree: &PlanTree,
        use_virtual_loss: bool,
    ) -> PlannerResult<()> {
        let (mut path, mut leaf) = self.select(tree);
        let mut vl_guard = use_virtual_loss
            .then(|| VirtualLossGuard::apply(&path, self.config.virtual_loss_value));

        // A fresh leaf whose content hash was already evaluated inherits the
        // stored score instead of paying for expansion and simulation.
        if let Some(table) = &self.transposition {
            if leaf.visits() == 0 {
                if let Some(entry) = table.lookup(&leaf.content_hash()) {
                    self.stats.transposition_hits.fetch_add(1, Ordering::SeqCst);
                    self.backpropagate(&path, &leaf, entry.average_score);
                    return Ok(());
                }
            }
        }

        if leaf.state() == NodeState::Unexplored
            && leaf.visits() >= self.config.min_visits_before_expand
        {
            let outcome = self
                .expansion
                .expand_and_integrate(ctx, tree, &leaf, self.policy.as_ref())
                .await?;
            if let ExpandOutcome::Expanded(added) = outcome {
                self.stats.expansions.fetch_add(1, Ordering::SeqCst);
                leaf.set_state(NodeState::Exploring);
                debug!(node = leaf.id(), added, "expanded leaf");
                if let Some(child) = self.policy.select_child(&leaf) {
                    if let Some(guard) = vl_guard.as_mut() {
                        guard.extend(&child);
                    }
                    path.push(Arc::clone(&child));
                    leaf = child;
                }
            }
        }

        ctx.report_progress();
        let result = if self.config.progressive_simulation {
            self.simulator.simulate_progressive(ctx, &leaf).await
        } else {
            self.simulator
                .simulate(ctx, &leaf, self.config.simulation_tier)
                .await
        };
        self.stats.record_simulation(result.tier);
        let score = result.score;
        leaf.set_simulation_result(result);
        self.maybe_abandon(&leaf, score);

        self.backpropagate(&path, &leaf, score);
        drop(vl_guard);
        Ok(())
    }

    /// Leaf-parallel pass: one selection, several simulations, one update
    pub(crate) async fn run_leaf_parallel_iteration(
        &self,
        ctx: &Arc<CancelContext>,
        tree: &PlanTree,
        simulations_per_leaf: usize,
        aggregation: Aggregation,
    ) -> PlannerResult<()> {
        let (mut path, mut leaf) = self.select(tree);

        if leaf.state() == NodeState::Unexplored
            && leaf.visits() >= self.config.min_visits_before_expand
        {
            let outcome = self
                .expansion
                .expand_and_integrate(ctx, tree, &leaf, self.policy.as_ref())
                .await?;
            if let ExpandOutcome::Expanded(_) = outcome {
                self.stats.expansions.fetch_add(1, Ordering::SeqCst);
                leaf.set_state(NodeState::Exploring);
                if let Some(child) = self.policy.select_child(&leaf) {
                    path.push(Arc::clone(&child));
                    leaf = child;
                }
            }
        }

        ctx.report_progress();
        let runs = futures::future::join_all((0..simulations_per_leaf.max(1)).map(|_| async {
            if self.config.progressive_simulation {
                self.simulator.simulate_progressive(ctx, &leaf).await
            } else {
                self.simulator
                    .simulate(ctx, &leaf, self.config.simulation_tier)
                    .await
            }
        }))
        .await;

        let scores: Vec<f64> = runs.iter().map(|r| r.score).collect();
        let score = aggregate_scores(&scores, aggregation);
        for run in &runs {
            self.stats.record_simulation(run.tier);
        }
        if let Some(best) = runs
            .into_iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
        {
            leaf.set_simulation_result(best);
        }
        self.maybe_abandon(&leaf, score);

        self.backpropagate(&path, &leaf, score);
        Ok(())
    }

    /// Descend from the root by repeated policy application
    fn select(&self, tree: &PlanTree) -> (Vec<Arc<PlanNode>>, Arc<PlanNode>) {
        let mut path = vec![Arc::clone(tree.root())];
        let mut leaf = Arc::clone(tree.root());
        while leaf.child_count() > 0 {
            match self.policy.select_child(&leaf) {
                Some(child) => {
                    path.push(Arc::clone(&child));
                    leaf = child;
                }
                None => break,
            }
        }
        (path, leaf)
    }

    fn maybe_abandon(&self, leaf: &Arc<PlanNode>, score: f64) {
        if score < self.config.abandon_threshold && leaf.visits() > 2 {
            leaf.set_state(NodeState::Abandoned);
            debug!(node = leaf.id(), score, "abandoned low-scoring node");
        }
    }

    /// Root→leaf update of visits and scores, plus RAVE and transposition
    fn backpropagate(&self, path: &[Arc<PlanNode>], leaf: &Arc<PlanNode>, score: f64) {
        for node in path {
            node.add_visit_and_score(score);
        }
        if let Some(rave) = &self.rave {
            if let Some(action) = leaf.action() {
                rave.record(action.action_type, score);
            }
        }
        if let Some(table) = &self.transposition {
            table.store(leaf.content_hash(), leaf.average_score(), leaf.visits());
        }
    }

    pub(crate) fn record_iteration(&self) {
        self.stats.iterations.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn note_iteration_failure(&self, err: &PlannerError) {
        self.stats.iteration_failures.fetch_add(1, Ordering::SeqCst);
        match err {
            PlannerError::ExpansionFailed(_)
            | PlannerError::CircuitOpen(_)
            | PlannerError::SimulationFailed(_) => {
                self.degradation.record_failure(err.error_type());
            }
            _ => {}
        }
        warn!(error = %err, "iteration failed, continuing");
    }
}

/// Combine a batch of leaf-parallel scores
fn aggregate_scores(scores: &[f64], aggregation: Aggregation) -> f64 {
    if scores.is_empty() {
        return 0.5;
    }
    match aggregation {
        Aggregation::Mean => scores.iter().sum::<f64>() / scores.len() as f64,
        Aggregation::Max => scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::Weighted => {
            let mut weighted = 0.0;
            let mut total = 0.0;
            for s in scores {
                let w = s + 0.1;
                weighted += s * w;
                total += w;
            }
            weighted / total
        }
    }
}
