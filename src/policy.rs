//! Child-selection policies
//!
//! Both policies score every eligible child and return the argmax; the
//! engine re-applies the policy until it reaches a leaf. Unvisited children
//! score infinity under UCB1 so each child is sampled at least once.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::node::PlanNode;
use crate::types::{ActionType, NodeState};

/// Which selection rule the engine applies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Ucb1,
    Puct,
}

/// Scores children of a node and picks the best
pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score one child given its parent's visit count and sibling count
    fn score(&self, parent_visits: u64, sibling_count: usize, child: &PlanNode) -> f64;

    /// Record an expander-supplied prior for a child; UCB1 ignores priors
    fn record_prior(&self, _child_id: &str, _prior: f64) {}

    /// Highest-scoring non-abandoned child, if any
    fn select_child(&self, parent: &Arc<PlanNode>) -> Option<Arc<PlanNode>> {
        let children = parent.children();
        let parent_visits = parent.visits();
        let sibling_count = children.len();
        children
            .into_iter()
            .filter(|c| c.state() != NodeState::Abandoned)
            .max_by(|a, b| {
                let sa = self.score(parent_visits, sibling_count, a);
                let sb = self.score(parent_visits, sibling_count, b);
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

/// Upper Confidence Bound (1): `avg + c * sqrt(ln(N) / n)`
pub struct Ucb1Policy {
    exploration_constant: f64,
}

impl Ucb1Policy {
    pub fn new(exploration_constant: f64) -> Self {
        Self {
            exploration_constant,
        }
    }
}

impl Default for Ucb1Policy {
    fn default() -> Self {
        Self::new(std::f64::consts::SQRT_2)
    }
}

impl SelectionPolicy for Ucb1Policy {
    fn name(&self) -> &'static str {
        "ucb1"
    }

    fn score(&self, parent_visits: u64, _sibling_count: usize, child: &PlanNode) -> f64 {
        let visits = child.visits();
        if visits == 0 {
            return f64::INFINITY;
        }
        let parent_visits = parent_visits.max(1) as f64;
        child.average_score()
            + self.exploration_constant * (parent_visits.ln() / visits as f64).sqrt()
    }
}

/// Predictor + UCB for trees: `avg + c * prior * sqrt(N) / (1 + n)`
///
/// Priors are recorded by the expansion path, keyed by child ID; a child
/// without a recorded prior falls back to uniform `1/k`.
pub struct PuctPolicy {
    exploration_constant: f64,
    priors: DashMap<String, f64>,
}

impl PuctPolicy {
    pub fn new(exploration_constant: f64) -> Self {
        Self {
            exploration_constant,
            priors: DashMap::new(),
        }
    }

    pub fn prior_for(&self, child_id: &str, sibling_count: usize) -> f64 {
        self.priors
            .get(child_id)
            .map(|p| *p)
            .unwrap_or_else(|| 1.0 / sibling_count.max(1) as f64)
    }
}

impl Default for PuctPolicy {
    fn default() -> Self {
        Self::new(std::f64::consts::SQRT_2)
    }
}

impl SelectionPolicy for PuctPolicy {
    fn name(&self) -> &'static str {
        "puct"
    }

    fn record_prior(&self, child_id: &str, prior: f64) {
        self.priors.insert(child_id.to_string(), prior);
    }

    fn score(&self, parent_visits: u64, sibling_count: usize, child: &PlanNode) -> f64 {
        let prior = self.prior_for(child.id(), sibling_count);
        child.average_score()
            + self.exploration_constant * prior * (parent_visits as f64).sqrt()
                / (1.0 + child.visits() as f64)
    }
}

/// Build the configured policy
pub fn make_policy(kind: PolicyKind, exploration_constant: f64) -> Arc<dyn SelectionPolicy> {
    match kind {
        PolicyKind::Ucb1 => Arc::new(Ucb1Policy::new(exploration_constant)),
        PolicyKind::Puct => Arc::new(PuctPolicy::new(exploration_constant)),
    }
}

/// Applies virtual loss to a path and guarantees release on every exit path
pub struct VirtualLossGuard {
    nodes: Vec<Arc<PlanNode>>,
    value: f64,
}

impl VirtualLossGuard {
    pub fn apply(path: &[Arc<PlanNode>], value: f64) -> Self {
        for node in path {
            node.apply_virtual_loss(value);
        }
        Self {
            nodes: path.to_vec(),
            value,
        }
    }

    /// Extend the guard over a node selected after expansion
    pub fn extend(&mut self, node: &Arc<PlanNode>) {
        node.apply_virtual_loss(self.value);
        self.nodes.push(Arc::clone(node));
    }
}

impl Drop for VirtualLossGuard {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.release_virtual_loss(self.value);
        }
    }
}

/// Rapid Action-Value Estimation: shared running value per action type
#[derive(Default)]
pub struct RaveTracker {
    stats: DashMap<ActionType, RaveStats>,
}

#[derive(Clone, Copy, Debug, Default)]
struct RaveStats {
    samples: u64,
    total: f64,
}

impl RaveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, action_type: ActionType, score: f64) {
        let mut entry = self.stats.entry(action_type).or_default();
        entry.samples += 1;
        entry.total += score;
    }

    /// Mean score observed for an action type, if any
    pub fn value(&self, action_type: ActionType) -> Option<f64> {
        self.stats.get(&action_type).and_then(|s| {
            if s.samples == 0 {
                None
            } else {
                Some(s.total / s.samples as f64)
            }
        })
    }

    pub fn samples(&self, action_type: ActionType) -> u64 {
        self.stats.get(&action_type).map(|s| s.samples).unwrap_or(0)
    }
}
