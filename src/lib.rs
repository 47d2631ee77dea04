//! # MCTS Planner
//!
//! Monte Carlo Tree Search planning engine for autonomous code-editing
//! agents. Given a natural-language task, the engine explores a tree of
//! candidate plans, evaluates each candidate with tiered static checks, and
//! returns the highest-scoring plan path.
//!
//! ## Features
//!
//! - MCTS with UCB1 or PUCT selection and progressive widening
//! - Tiered simulation (quick / standard / full) over pluggable signal
//!   providers
//! - Multi-resource budget enforcement with sticky exhaustion
//! - Circuit breaker and graceful degradation around the expansion oracle
//! - Hierarchical cancellation with deadlock detection and 4-phase shutdown
//! - Root-parallel and leaf-parallel search drivers with virtual loss

pub mod budget;
pub mod cancel;
pub mod circuit_breaker;
pub mod degradation;
pub mod engine;
pub mod error;
pub mod expander;
pub mod node;
pub mod parallel;
pub mod policy;
pub mod shutdown;
pub mod simulator;
pub mod transposition;
pub mod tree;
pub mod types;

// Re-export main types for easier usage
pub use budget::{BudgetLimits, BudgetStatus, TreeBudget};
pub use cancel::{CancelConfig, CancelContext, CancelController, CancelReason};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use degradation::{DegradationConfig, DegradationLevel, DegradationManager};
pub use engine::{Aggregation, MCTSConfig, MCTSEngine, SearchStats};
pub use error::{PlannerError, PlannerResult};
pub use expander::{Expansion, MockExpander, NodeExpander, WideningConfig};
pub use node::PlanNode;
pub use parallel::{MCTSRunner, ParallelMode};
pub use policy::{PolicyKind, PuctPolicy, SelectionPolicy, Ucb1Policy};
pub use shutdown::ShutdownReport;
pub use simulator::{Simulator, SimulatorConfig};
pub use transposition::TranspositionTable;
pub use tree::PlanTree;
pub use types::{ActionType, NodeState, PlannedAction, SimulationResult, SimulationTier};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Initialize structured logging for the planner
pub fn init() -> PlannerResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| PlannerError::invalid_config(e.to_string()))?;

    tracing::info!("MCTS planner v{} initialized", VERSION);
    Ok(())
}
