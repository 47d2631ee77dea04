//! Node expansion: the oracle interface, progressive widening, integration
//!
//! The expander is the expensive external oracle. Every call goes through
//! the circuit breaker, respects the depth gate and the budget, and is
//! serialised per node so parallel workers cannot double-expand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::budget::TreeBudget;
use crate::cancel::CancelContext;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{PlannerError, PlannerResult};
use crate::node::PlanNode;
use crate::policy::SelectionPolicy;
use crate::tree::PlanTree;
use crate::types::{ActionType, PlannedAction};

/// What one oracle call produced
pub struct Expansion {
    /// Detached child nodes; integration attaches and counts them
    pub children: Vec<Arc<PlanNode>>,
    /// Optional per-child prior probabilities, parallel to `children`
    pub priors: Option<Vec<f64>>,
    /// Tokens the call consumed, charged to the budget by the caller
    pub tokens_used: u64,
    /// Dollar cost of the call, charged to the budget by the caller
    pub cost_usd: f64,
}

/// The expansion oracle. Implementations must respect the context, may
/// return fewer children than asked for, and must not mutate the parent.
#[async_trait]
pub trait NodeExpander: Send + Sync {
    async fn expand(
        &self,
        ctx: &CancelContext,
        parent: &Arc<PlanNode>,
        budget: &TreeBudget,
    ) -> PlannerResult<Expansion>;
}

/// Progressive-widening parameters: `clamp(k * visits^alpha, min, max)`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WideningConfig {
    pub k: f64,
    pub alpha: f64,
    pub min_children: usize,
    pub max_children: usize,
}

impl Default for WideningConfig {
    fn default() -> Self {
        Self {
            k: 1.0,
            alpha: 0.5,
            min_children: 1,
            max_children: 10,
        }
    }
}

impl WideningConfig {
    pub fn validate(&self) -> PlannerResult<()> {
        if self.k <= 0.0 || self.alpha < 0.0 {
            return Err(PlannerError::invalid_config(
                "widening k must be positive and alpha non-negative",
            ));
        }
        if self.min_children == 0 || self.min_children > self.max_children {
            return Err(PlannerError::invalid_config(
                "widening requires 0 < min_children <= max_children",
            ));
        }
        Ok(())
    }

    /// Branching allowance for a node with the given visit count
    pub fn max_children_allowed(&self, visits: u64) -> usize {
        let raw = (self.k * (visits as f64).powf(self.alpha)).floor() as usize;
        raw.clamp(self.min_children, self.max_children)
    }
}

/// Result of an integration attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpandOutcome {
    /// This many children were attached
    Expanded(usize),
    /// Nothing to do: widening or budget already satisfied
    Saturated,
}

/// Drives oracle calls and integrates their output into the tree
pub struct ExpansionManager {
    expander: Arc<dyn NodeExpander>,
    breaker: Arc<CircuitBreaker>,
    widening: WideningConfig,
}

impl ExpansionManager {
    pub fn new(
        expander: Arc<dyn NodeExpander>,
        breaker: Arc<CircuitBreaker>,
        widening: WideningConfig,
    ) -> Self {
        Self {
            expander,
            breaker,
            widening,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn widening(&self) -> &WideningConfig {
        &self.widening
    }

    /// Expand a node and attach the children it is entitled to.
    ///
    /// A saturated node is a no-op, not an error, and stays a no-op on
    /// repeated calls. Depth and budget violations, circuit rejections, and
    /// oracle failures surface as errors.
    pub async fn expand_and_integrate(
        &self,
        ctx: &CancelContext,
        tree: &PlanTree,
        parent: &Arc<PlanNode>,
        policy: &dyn SelectionPolicy,
    ) -> PlannerResult<ExpandOutcome> {
        self.expand_and_integrate_with_allowance(ctx, tree, parent, policy, None)
            .await
    }

    /// As [`expand_and_integrate`](Self::expand_and_integrate), with an
    /// explicit branching allowance overriding progressive widening. The
    /// engine's unconditional root expansion uses the widening maximum.
    pub async fn expand_and_integrate_with_allowance(
        &self,
        ctx: &CancelContext,
        tree: &PlanTree,
        parent: &Arc<PlanNode>,
        policy: &dyn SelectionPolicy,
        allowance: Option<usize>,
    ) -> PlannerResult<ExpandOutcome> {
        let budget = tree.budget();
        budget.check_depth(parent.depth() + 1)?;

        // Per-node gate: parallel workers queue here instead of racing the
        // same expansion.
        let _gate = parent.expansion_gate().lock().await;

        let allowed =
            allowance.unwrap_or_else(|| self.widening.max_children_allowed(parent.visits()));
        let current = parent.child_count();
        if current >= allowed {
            trace!(node = parent.id(), allowed, current, "widening satisfied");
            return Ok(ExpandOutcome::Saturated);
        }
        if !budget.can_expand(current)? {
            return Ok(ExpandOutcome::Saturated);
        }
        ctx.check()?;

        let (permitted, _probe) = self.breaker.allow();
        if !permitted {
            return Err(PlannerError::circuit_open("expansion call rejected"));
        }

        let expansion = match self.expander.expand(ctx, parent, budget).await {
            Ok(expansion) => {
                self.breaker.record_success();
                expansion
            }
            Err(err) => {
                self.breaker.record_failure();
                return Err(PlannerError::expansion_failed(err.to_string()));
            }
        };
        budget.record_llm_call(expansion.tokens_used, expansion.cost_usd);

        // Retain only the children widening and the node budget admit.
        let mut intake = allowed - current;
        if let Some(remaining) = budget.remaining_nodes() {
            intake = intake.min(remaining as usize);
        }

        let priors = expansion.priors;
        let mut added = 0;
        for (i, child) in expansion.children.into_iter().enumerate() {
            if added >= intake {
                break;
            }
            parent.attach_child(Arc::clone(&child));
            tree.record_node();
            budget.record_node();
            if let Some(priors) = &priors {
                if let Some(prior) = priors.get(i) {
                    policy.record_prior(child.id(), *prior);
                }
            }
            added += 1;
        }

        // The budget is consulted after every oracle call.
        budget.check_limits()?;

        debug!(node = parent.id(), added, "expansion integrated");
        if added == 0 {
            Ok(ExpandOutcome::Saturated)
        } else {
            Ok(ExpandOutcome::Expanded(added))
        }
    }
}

/// Deterministic in-process expander for tests and benchmarks
pub struct MockExpander {
    children_per_call: usize,
    fail_from: u64,
    fail_count: u64,
    priors: Option<Vec<f64>>,
    tokens_per_call: u64,
    cost_per_call: f64,
    calls: AtomicU64,
}

impl MockExpander {
    pub fn new(children_per_call: usize) -> Self {
        Self {
            children_per_call,
            fail_from: 1,
            fail_count: 0,
            priors: None,
            tokens_per_call: 100,
            cost_per_call: 0.001,
            calls: AtomicU64::new(0),
        }
    }

    /// Fail the first `n` calls before recovering
    pub fn with_failures(self, n: u64) -> Self {
        self.with_failures_from(1, n)
    }

    /// Fail `n` consecutive calls starting at 1-based call `from`
    pub fn with_failures_from(mut self, from: u64, n: u64) -> Self {
        self.fail_from = from;
        self.fail_count = n;
        self
    }

    pub fn with_priors(mut self, priors: Vec<f64>) -> Self {
        self.priors = Some(priors);
        self
    }

    pub fn with_usage(mut self, tokens: u64, cost: f64) -> Self {
        self.tokens_per_call = tokens;
        self.cost_per_call = cost;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeExpander for MockExpander {
    async fn expand(
        &self,
        ctx: &CancelContext,
        parent: &Arc<PlanNode>,
        _budget: &TreeBudget,
    ) -> PlannerResult<Expansion> {
        ctx.check()?;
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call >= self.fail_from && call < self.fail_from + self.fail_count {
            return Err(PlannerError::expansion_failed("mock oracle failure"));
        }

        let children = (0..self.children_per_call)
            .map(|i| {
                let mut action = PlannedAction::new(
                    ActionType::Edit,
                    "a.go",
                    "// noop",
                    "go",
                    format!("step {i} under {}", parent.id()),
                );
                action.validated = true;
                PlanNode::new(
                    format!("{}-child-{call}-{i}", parent.id()),
                    format!("candidate step {i}"),
                    Some(action),
                )
            })
            .collect();

        Ok(Expansion {
            children,
            priors: self.priors.clone(),
            tokens_used: self.tokens_per_call,
            cost_usd: self.cost_per_call,
        })
    }
}
