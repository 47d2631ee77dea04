//! Progressive capability reduction and recovery
//!
//! Tracks consecutive engine-level successes and failures and maps them onto
//! a degradation level. Failures may jump several levels at once; recovery
//! climbs exactly one level per success streak and never climbs past what
//! the circuit breaker justifies.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::budget::BudgetLimits;
use crate::circuit_breaker::CircuitBreaker;

/// Capability levels, best first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Normal,
    Reduced,
    Minimal,
    Linear,
}

impl DegradationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Reduced => "reduced",
            Self::Minimal => "minimal",
            Self::Linear => "linear",
        }
    }

    /// One level toward full capability
    fn one_level_up(&self) -> Self {
        match self {
            Self::Normal | Self::Reduced => Self::Normal,
            Self::Minimal => Self::Reduced,
            Self::Linear => Self::Minimal,
        }
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds mapping failure streaks onto levels
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DegradationConfig {
    pub consecutive_failures_for_reduced: u32,
    pub consecutive_failures_for_minimal: u32,
    pub consecutive_failures_for_linear: u32,
    pub successes_for_recovery: u32,
    /// Level pinned while the circuit breaker is open
    pub circuit_open_degradation: DegradationLevel,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            consecutive_failures_for_reduced: 2,
            consecutive_failures_for_minimal: 4,
            consecutive_failures_for_linear: 6,
            successes_for_recovery: 3,
            circuit_open_degradation: DegradationLevel::Linear,
        }
    }
}

/// A level change, snapshotted under the lock, fired outside it
#[derive(Clone, Debug, Serialize)]
pub struct DegradationTransition {
    pub from: DegradationLevel,
    pub to: DegradationLevel,
    pub reason: String,
}

/// JSON-serializable manager snapshot
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DegradationStatus {
    pub level: DegradationLevel,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub circuit_open: bool,
}

pub type DegradationObserver = Box<dyn Fn(&DegradationTransition) + Send + Sync>;

struct DegradationInner {
    level: DegradationLevel,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

/// Maps engine-level outcomes onto a capability level
pub struct DegradationManager {
    config: DegradationConfig,
    breaker: Arc<CircuitBreaker>,
    inner: Mutex<DegradationInner>,
    observers: RwLock<Vec<DegradationObserver>>,
}

impl DegradationManager {
    pub fn new(config: DegradationConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            config,
            breaker,
            inner: Mutex::new(DegradationInner {
                level: DegradationLevel::Normal,
                consecutive_failures: 0,
                consecutive_successes: 0,
            }),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn current_level(&self) -> DegradationLevel {
        let circuit_open = self.breaker.is_open();
        let level = self.inner.lock().level;
        self.effective_level(level, circuit_open)
    }

    /// Budget template for the current level
    pub fn budget_limits(&self) -> BudgetLimits {
        BudgetLimits::for_level(self.current_level())
    }

    pub fn add_observer(&self, observer: DegradationObserver) {
        self.observers.write().push(observer);
    }

    /// Record an engine-level failure; may drop several levels at once
    pub fn record_failure(&self, reason: &str) {
        // Breaker state is read before taking our own lock; subsystem locks
        // are never held together.
        let circuit_open = self.breaker.is_open();
        let transition = {
            let mut inner = self.inner.lock();
            inner.consecutive_successes = 0;
            inner.consecutive_failures += 1;

            let target = self.level_for_failures(inner.consecutive_failures);
            let target = self.effective_level(target.max(inner.level), circuit_open);
            if target > inner.level {
                let t = DegradationTransition {
                    from: inner.level,
                    to: target,
                    reason: reason.to_string(),
                };
                inner.level = target;
                Some(t)
            } else {
                None
            }
        };
        self.fire(transition, true);
    }

    /// Record an engine-level success; recovery climbs one level at a time
    pub fn record_success(&self) {
        let circuit_open = self.breaker.is_open();
        let transition = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures = 0;
            inner.consecutive_successes += 1;

            if inner.consecutive_successes < self.config.successes_for_recovery {
                None
            } else {
                inner.consecutive_successes = 0;
                let candidate = inner.level.one_level_up();
                // Recovery cannot pass the level the breaker justifies.
                let target = self.effective_level(candidate, circuit_open);
                if target < inner.level {
                    let t = DegradationTransition {
                        from: inner.level,
                        to: target,
                        reason: "recovery".to_string(),
                    };
                    inner.level = target;
                    Some(t)
                } else {
                    None
                }
            }
        };
        self.fire(transition, false);
    }

    pub fn status(&self) -> DegradationStatus {
        let circuit_open = self.breaker.is_open();
        let inner = self.inner.lock();
        DegradationStatus {
            level: if circuit_open {
                inner.level.max(self.config.circuit_open_degradation)
            } else {
                inner.level
            },
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            circuit_open,
        }
    }

    /// Deepest level whose threshold the failure streak meets
    fn level_for_failures(&self, failures: u32) -> DegradationLevel {
        if failures >= self.config.consecutive_failures_for_linear {
            DegradationLevel::Linear
        } else if failures >= self.config.consecutive_failures_for_minimal {
            DegradationLevel::Minimal
        } else if failures >= self.config.consecutive_failures_for_reduced {
            DegradationLevel::Reduced
        } else {
            DegradationLevel::Normal
        }
    }

    /// Pin the level while the breaker is open
    fn effective_level(&self, level: DegradationLevel, circuit_open: bool) -> DegradationLevel {
        if circuit_open {
            level.max(self.config.circuit_open_degradation)
        } else {
            level
        }
    }

    // Observers run after the state lock is released.
    fn fire(&self, transition: Option<DegradationTransition>, failure: bool) {
        let Some(transition) = transition else { return };
        if failure {
            warn!(
                from = transition.from.as_str(),
                to = transition.to.as_str(),
                reason = %transition.reason,
                "degrading capability",
            );
        } else {
            info!(
                from = transition.from.as_str(),
                to = transition.to.as_str(),
                "recovering capability",
            );
        }
        for observer in self.observers.read().iter() {
            observer(&transition);
        }
    }
}
