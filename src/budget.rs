//! Multi-resource budget enforcement for a search tree
//!
//! Counters are atomic; the floating-point cost accumulator sits behind a
//! mutex. Exhaustion is sticky: the first axis to trip is recorded and every
//! later check short-circuits on that record. A zero limit means unlimited on
//! that axis.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::degradation::DegradationLevel;
use crate::error::{PlannerError, PlannerResult};

/// Budget axes, in the order they are checked
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAxis {
    Time,
    Nodes,
    LlmCalls,
    Tokens,
    Cost,
}

impl BudgetAxis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Nodes => "nodes",
            Self::LlmCalls => "llm_calls",
            Self::Tokens => "tokens",
            Self::Cost => "cost",
        }
    }
}

impl std::fmt::Display for BudgetAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-axis limits for one search tree; zero means unlimited
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub max_nodes: u64,
    pub max_depth: u32,
    pub max_expansions_per_node: usize,
    pub time_limit: Duration,
    pub llm_call_limit: u64,
    pub llm_token_limit: u64,
    pub cost_limit_usd: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_nodes: 50,
            max_depth: 5,
            max_expansions_per_node: 10,
            time_limit: Duration::from_secs(30),
            llm_call_limit: 25,
            llm_token_limit: 200_000,
            cost_limit_usd: 2.0,
        }
    }
}

impl BudgetLimits {
    /// Limits with every axis unlimited
    pub fn unlimited() -> Self {
        Self {
            max_nodes: 0,
            max_depth: 0,
            max_expansions_per_node: 0,
            time_limit: Duration::ZERO,
            llm_call_limit: 0,
            llm_token_limit: 0,
            cost_limit_usd: 0.0,
        }
    }

    /// Budget template for a degradation level
    pub fn for_level(level: DegradationLevel) -> Self {
        match level {
            DegradationLevel::Normal => Self::default(),
            DegradationLevel::Reduced => Self {
                max_nodes: 20,
                max_depth: 4,
                max_expansions_per_node: 5,
                time_limit: Duration::from_secs(15),
                llm_call_limit: 10,
                llm_token_limit: 80_000,
                cost_limit_usd: 0.5,
            },
            DegradationLevel::Minimal => Self {
                max_nodes: 8,
                max_depth: 2,
                max_expansions_per_node: 3,
                time_limit: Duration::from_secs(5),
                llm_call_limit: 4,
                llm_token_limit: 20_000,
                cost_limit_usd: 0.1,
            },
            DegradationLevel::Linear => Self {
                max_nodes: 1,
                max_depth: 1,
                max_expansions_per_node: 1,
                time_limit: Duration::from_secs(5),
                llm_call_limit: 1,
                llm_token_limit: 8_000,
                cost_limit_usd: 0.05,
            },
        }
    }
}

/// JSON-serializable budget snapshot for observability consumers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub limits: BudgetLimits,
    pub nodes_explored: u64,
    pub llm_calls: u64,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub elapsed: Duration,
    pub exhausted_by: Option<BudgetAxis>,
}

/// Mutable budget state for one search tree
pub struct TreeBudget {
    limits: BudgetLimits,
    nodes_explored: AtomicU64,
    llm_calls: AtomicU64,
    tokens_used: AtomicU64,
    // Floating-point accumulator, so a mutex rather than an atomic.
    cost_usd: Mutex<f64>,
    started_at: Mutex<Instant>,
    exhausted_by: Mutex<Option<BudgetAxis>>,
}

impl TreeBudget {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            nodes_explored: AtomicU64::new(0),
            llm_calls: AtomicU64::new(0),
            tokens_used: AtomicU64::new(0),
            cost_usd: Mutex::new(0.0),
            started_at: Mutex::new(Instant::now()),
            exhausted_by: Mutex::new(None),
        }
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    pub fn nodes_explored(&self) -> u64 {
        self.nodes_explored.load(Ordering::SeqCst)
    }

    pub fn llm_calls(&self) -> u64 {
        self.llm_calls.load(Ordering::SeqCst)
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::SeqCst)
    }

    pub fn cost_usd(&self) -> f64 {
        *self.cost_usd.lock()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.lock().elapsed()
    }

    /// The axis that first tripped, if any
    pub fn exhausted_by(&self) -> Option<BudgetAxis> {
        *self.exhausted_by.lock()
    }

    /// Node-creation headroom; `None` means unlimited
    pub fn remaining_nodes(&self) -> Option<u64> {
        if self.limits.max_nodes == 0 {
            None
        } else {
            Some(
                self.limits
                    .max_nodes
                    .saturating_sub(self.nodes_explored()),
            )
        }
    }

    /// Charge one explored node
    pub fn record_node(&self) {
        self.nodes_explored.fetch_add(1, Ordering::SeqCst);
    }

    /// Charge one LLM call with its token and dollar cost
    pub fn record_llm_call(&self, tokens: u64, cost_usd: f64) {
        self.llm_calls.fetch_add(1, Ordering::SeqCst);
        self.tokens_used.fetch_add(tokens, Ordering::SeqCst);
        *self.cost_usd.lock() += cost_usd;
    }

    /// Check every axis; sticky after the first violation
    pub fn check_limits(&self) -> PlannerResult<()> {
        if let Some(axis) = self.exhausted_by() {
            return Err(self.exhaustion_error(axis));
        }

        if !self.limits.time_limit.is_zero() && self.elapsed() >= self.limits.time_limit {
            return Err(self.trip(BudgetAxis::Time));
        }
        if self.limits.max_nodes > 0 && self.nodes_explored() >= self.limits.max_nodes {
            return Err(self.trip(BudgetAxis::Nodes));
        }
        if self.limits.llm_call_limit > 0 && self.llm_calls() >= self.limits.llm_call_limit {
            return Err(self.trip(BudgetAxis::LlmCalls));
        }
        if self.limits.llm_token_limit > 0 && self.tokens_used() >= self.limits.llm_token_limit {
            return Err(self.trip(BudgetAxis::Tokens));
        }
        if self.limits.cost_limit_usd > 0.0 && self.cost_usd() >= self.limits.cost_limit_usd {
            return Err(self.trip(BudgetAxis::Cost));
        }
        Ok(())
    }

    /// Depth gate for a prospective child; not an exhaustion axis
    pub fn check_depth(&self, depth: u32) -> PlannerResult<()> {
        if self.limits.max_depth > 0 && depth >= self.limits.max_depth {
            return Err(PlannerError::depth_limit(depth));
        }
        Ok(())
    }

    /// True when the per-node expansion cap still allows another child
    pub fn expansion_allowed(&self, current_children: usize) -> bool {
        self.limits.max_expansions_per_node == 0
            || current_children < self.limits.max_expansions_per_node
    }

    /// Combined exhaustion and per-node cap check before an expansion
    pub fn can_expand(&self, current_children: usize) -> PlannerResult<bool> {
        self.check_limits()?;
        Ok(self.expansion_allowed(current_children))
    }

    /// Zero every counter, clear the sticky record, restart the clock
    pub fn reset(&self) {
        self.nodes_explored.store(0, Ordering::SeqCst);
        self.llm_calls.store(0, Ordering::SeqCst);
        self.tokens_used.store(0, Ordering::SeqCst);
        *self.cost_usd.lock() = 0.0;
        *self.started_at.lock() = Instant::now();
        *self.exhausted_by.lock() = None;
    }

    pub fn status(&self) -> BudgetStatus {
        BudgetStatus {
            limits: self.limits.clone(),
            nodes_explored: self.nodes_explored(),
            llm_calls: self.llm_calls(),
            tokens_used: self.tokens_used(),
            cost_usd: self.cost_usd(),
            elapsed: self.elapsed(),
            exhausted_by: self.exhausted_by(),
        }
    }

    fn trip(&self, axis: BudgetAxis) -> PlannerError {
        let mut sticky = self.exhausted_by.lock();
        let axis = match *sticky {
            // Another thread tripped first; keep its record.
            Some(first) => first,
            None => {
                *sticky = Some(axis);
                debug!(axis = axis.as_str(), "budget exhausted");
                axis
            }
        };
        drop(sticky);
        self.exhaustion_error(axis)
    }

    fn exhaustion_error(&self, axis: BudgetAxis) -> PlannerError {
        let observed = match axis {
            BudgetAxis::Nodes => self.nodes_explored(),
            BudgetAxis::LlmCalls => self.llm_calls(),
            BudgetAxis::Tokens => self.tokens_used(),
            _ => 0,
        };
        PlannerError::budget_exhausted(axis, observed, self.elapsed(), self.cost_usd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_limits_never_exhaust() {
        let budget = TreeBudget::new(BudgetLimits::unlimited());
        for _ in 0..1000 {
            budget.record_node();
            budget.record_llm_call(10_000, 0.5);
        }
        assert!(budget.check_limits().is_ok());
        assert!(budget.exhausted_by().is_none());
    }

    #[test]
    fn test_node_exhaustion_is_sticky() {
        let limits = BudgetLimits {
            max_nodes: 3,
            ..BudgetLimits::unlimited()
        };
        let budget = TreeBudget::new(limits);
        budget.record_node();
        budget.record_node();
        assert!(budget.check_limits().is_ok());
        budget.record_node();

        let err = budget.check_limits().unwrap_err();
        assert_eq!(err.error_type(), "NodeLimitExceeded");
        assert_eq!(budget.exhausted_by(), Some(BudgetAxis::Nodes));

        // A later cost overrun does not replace the first record.
        budget.record_llm_call(0, 100.0);
        let err = budget.check_limits().unwrap_err();
        assert_eq!(err.error_type(), "NodeLimitExceeded");
    }

    #[test]
    fn test_llm_axes() {
        let limits = BudgetLimits {
            llm_call_limit: 2,
            ..BudgetLimits::unlimited()
        };
        let budget = TreeBudget::new(limits);
        budget.record_llm_call(100, 0.01);
        assert!(budget.check_limits().is_ok());
        budget.record_llm_call(100, 0.01);
        let err = budget.check_limits().unwrap_err();
        assert_eq!(err.error_type(), "LlmCallLimitExceeded");
    }

    #[test]
    fn test_depth_gate() {
        let limits = BudgetLimits {
            max_depth: 3,
            ..BudgetLimits::unlimited()
        };
        let budget = TreeBudget::new(limits);
        assert!(budget.check_depth(2).is_ok());
        assert!(budget.check_depth(3).is_err());
        assert!(budget.check_depth(7).is_err());
        // Depth violations are not exhaustion.
        assert!(budget.exhausted_by().is_none());
    }

    #[test]
    fn test_can_expand_combines_cap_and_exhaustion() {
        let limits = BudgetLimits {
            max_expansions_per_node: 2,
            ..BudgetLimits::unlimited()
        };
        let budget = TreeBudget::new(limits);
        assert!(budget.can_expand(0).unwrap());
        assert!(budget.can_expand(1).unwrap());
        assert!(!budget.can_expand(2).unwrap());
    }

    #[test]
    fn test_reset_clears_everything() {
        let limits = BudgetLimits {
            max_nodes: 1,
            ..BudgetLimits::unlimited()
        };
        let budget = TreeBudget::new(limits);
        budget.record_node();
        assert!(budget.check_limits().is_err());

        budget.reset();
        assert!(budget.check_limits().is_ok());
        assert_eq!(budget.nodes_explored(), 0);
        assert!(budget.exhausted_by().is_none());
    }

    #[test]
    fn test_linear_template_is_tightest() {
        let linear = BudgetLimits::for_level(DegradationLevel::Linear);
        assert_eq!(linear.max_nodes, 1);
        assert_eq!(linear.max_depth, 1);
        assert_eq!(linear.llm_call_limit, 1);

        let normal = BudgetLimits::for_level(DegradationLevel::Normal);
        assert!(normal.max_nodes > linear.max_nodes);
    }

    #[test]
    fn test_status_snapshot_serializes() {
        let budget = TreeBudget::new(BudgetLimits::default());
        budget.record_node();
        budget.record_llm_call(500, 0.02);

        let status = budget.status();
        assert_eq!(status.nodes_explored, 1);
        assert_eq!(status.llm_calls, 1);
        assert_eq!(status.tokens_used, 500);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["nodes_explored"], 1);
        assert!(json["exhausted_by"].is_null());
    }

    #[test]
    fn test_concurrent_cost_accumulation() {
        use std::sync::Arc;
        let budget = Arc::new(TreeBudget::new(BudgetLimits::unlimited()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = Arc::clone(&budget);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    b.record_llm_call(1, 0.001);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(budget.llm_calls(), 800);
        assert!((budget.cost_usd() - 0.8).abs() < 1e-3);
    }
}
