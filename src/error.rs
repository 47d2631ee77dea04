//! Error types for the planning engine
//!
//! Errors fall into four classes: budget and depth violations, oracle
//! failures, contract violations, and cancellation. The first and last end a
//! search but still yield a best path; oracle failures abandon one iteration;
//! contract violations propagate to the caller with no partial result.

use std::time::Duration;

use crate::budget::BudgetAxis;
use crate::cancel::CancelReason;

/// Main error type for planner operations
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("time limit exceeded after {0:?}")]
    TimeLimitExceeded(Duration),

    #[error("node limit exceeded at {0} nodes")]
    NodeLimitExceeded(u64),

    #[error("LLM call limit exceeded at {0} calls")]
    LlmCallLimitExceeded(u64),

    #[error("token limit exceeded at {0} tokens")]
    TokenLimitExceeded(u64),

    #[error("cost limit exceeded at ${0:.4}")]
    CostLimitExceeded(f64),

    #[error("depth limit exceeded at depth {0}")]
    DepthLimitExceeded(u32),

    #[error("circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("expansion failed: {0}")]
    ExpansionFailed(String),

    #[error("simulation failed: {0}")]
    SimulationFailed(String),

    #[error("action not validated: {0}")]
    ActionNotValidated(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("context not found: {0}")]
    ContextNotFound(String),

    #[error("node detached from tree: {0}")]
    NodeDetached(String),

    #[error("best path is empty")]
    EmptyBestPath,

    #[error("cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PlannerError {
    /// Create a configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create the budget-exhaustion error for the given axis
    pub fn budget_exhausted(axis: BudgetAxis, observed: u64, elapsed: Duration, cost: f64) -> Self {
        match axis {
            BudgetAxis::Time => Self::TimeLimitExceeded(elapsed),
            BudgetAxis::Nodes => Self::NodeLimitExceeded(observed),
            BudgetAxis::LlmCalls => Self::LlmCallLimitExceeded(observed),
            BudgetAxis::Tokens => Self::TokenLimitExceeded(observed),
            BudgetAxis::Cost => Self::CostLimitExceeded(cost),
        }
    }

    /// Create a depth-limit error
    pub fn depth_limit(depth: u32) -> Self {
        Self::DepthLimitExceeded(depth)
    }

    /// Create a circuit-open error
    pub fn circuit_open(msg: impl Into<String>) -> Self {
        Self::CircuitOpen(msg.into())
    }

    /// Create an expansion error
    pub fn expansion_failed(msg: impl Into<String>) -> Self {
        Self::ExpansionFailed(msg.into())
    }

    /// Create a simulation error
    pub fn simulation_failed(msg: impl Into<String>) -> Self {
        Self::SimulationFailed(msg.into())
    }

    /// Create an unvalidated-action error
    pub fn action_not_validated(msg: impl Into<String>) -> Self {
        Self::ActionNotValidated(msg.into())
    }

    /// Create a node-not-found error
    pub fn node_not_found(node_id: impl Into<String>) -> Self {
        Self::NodeNotFound(node_id.into())
    }

    /// Create a cancellation error
    pub fn cancelled(reason: CancelReason) -> Self {
        Self::Cancelled(reason)
    }

    /// Get the error type as a string
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::TimeLimitExceeded(_) => "TimeLimitExceeded",
            Self::NodeLimitExceeded(_) => "NodeLimitExceeded",
            Self::LlmCallLimitExceeded(_) => "LlmCallLimitExceeded",
            Self::TokenLimitExceeded(_) => "TokenLimitExceeded",
            Self::CostLimitExceeded(_) => "CostLimitExceeded",
            Self::DepthLimitExceeded(_) => "DepthLimitExceeded",
            Self::CircuitOpen(_) => "CircuitOpen",
            Self::ExpansionFailed(_) => "ExpansionFailed",
            Self::SimulationFailed(_) => "SimulationFailed",
            Self::ActionNotValidated(_) => "ActionNotValidated",
            Self::InvalidAction(_) => "InvalidAction",
            Self::NodeNotFound(_) => "NodeNotFound",
            Self::ContextNotFound(_) => "ContextNotFound",
            Self::NodeDetached(_) => "NodeDetached",
            Self::EmptyBestPath => "EmptyBestPath",
            Self::Cancelled(_) => "Cancelled",
            Self::Serialization(_) => "SerializationError",
        }
    }

    /// True when the engine can end the search and still extract a best path
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TimeLimitExceeded(_)
            | Self::NodeLimitExceeded(_)
            | Self::LlmCallLimitExceeded(_)
            | Self::TokenLimitExceeded(_)
            | Self::CostLimitExceeded(_)
            | Self::DepthLimitExceeded(_)
            | Self::CircuitOpen(_)
            | Self::ExpansionFailed(_)
            | Self::SimulationFailed(_)
            | Self::Cancelled(_) => true,
            Self::InvalidConfig(_)
            | Self::ActionNotValidated(_)
            | Self::InvalidAction(_)
            | Self::NodeNotFound(_)
            | Self::ContextNotFound(_)
            | Self::NodeDetached(_)
            | Self::EmptyBestPath
            | Self::Serialization(_) => false,
        }
    }

    /// True when the error ends the search loop rather than one iteration
    pub fn ends_search(&self) -> bool {
        matches!(
            self,
            Self::TimeLimitExceeded(_)
                | Self::NodeLimitExceeded(_)
                | Self::LlmCallLimitExceeded(_)
                | Self::TokenLimitExceeded(_)
                | Self::CostLimitExceeded(_)
                | Self::DepthLimitExceeded(_)
                | Self::Cancelled(_)
        )
    }

    /// Convert to a JSON-serializable error for observability consumers
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.error_type(),
            "message": self.to_string(),
            "recoverable": self.is_recoverable(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }
}

// Result type alias for convenience
pub type PlannerResult<T> = Result<T, PlannerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let budget = PlannerError::NodeLimitExceeded(50);
        assert_eq!(budget.error_type(), "NodeLimitExceeded");
        assert!(budget.is_recoverable());
        assert!(budget.ends_search());

        let contract = PlannerError::invalid_config("bad exploration constant");
        assert!(!contract.is_recoverable());
        assert!(!contract.ends_search());

        let oracle = PlannerError::expansion_failed("model unavailable");
        assert!(oracle.is_recoverable());
        assert!(!oracle.ends_search());
    }

    #[test]
    fn test_budget_axis_mapping() {
        let err = PlannerError::budget_exhausted(
            BudgetAxis::Cost,
            0,
            Duration::from_secs(1),
            1.25,
        );
        assert_eq!(err.error_type(), "CostLimitExceeded");

        let err = PlannerError::budget_exhausted(
            BudgetAxis::Time,
            0,
            Duration::from_secs(31),
            0.0,
        );
        assert_eq!(err.error_type(), "TimeLimitExceeded");
    }

    #[test]
    fn test_json_serialization() {
        let err = PlannerError::cancelled(CancelReason::Deadlock);
        let json = err.to_json();

        assert_eq!(json["type"], "Cancelled");
        assert_eq!(json["recoverable"], true);
        assert!(json["timestamp"].is_string());
    }
}
