//! Circuit breaker guarding the expansion oracle
//!
//! Three states: closed (calls flow), open (calls rejected), half-open (a
//! bounded number of probes test recovery). Consecutive failures open the
//! circuit; the open state rolls over to half-open after a fixed duration;
//! consecutive half-open successes close it again.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PlannerError, PlannerResult};

/// Circuit breaker states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Configuration for the breaker
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it
    pub success_threshold: u32,
    /// Time spent open before probing
    pub open_duration: Duration,
    /// Concurrent probes admitted while half-open
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(10),
            half_open_max: 1,
        }
    }
}

/// JSON-serializable breaker snapshot
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub active_probes: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_state_change: Instant,
}

/// Failure-protection state machine for the expansion oracle
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    active_probes: AtomicU32,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

/// Decrements the half-open probe counter when dropped
pub struct ProbeGuard {
    breaker: Arc<CircuitBreaker>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.breaker.active_probes.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_state_change: Instant::now(),
            }),
            active_probes: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        })
    }

    /// Ask to make a call. Returns whether the call is permitted and, in
    /// half-open state, a guard that releases the probe slot on drop.
    pub fn allow(self: &Arc<Self>) -> (bool, Option<ProbeGuard>) {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);

        match inner.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                drop(inner);
                self.total_rejections.fetch_add(1, Ordering::SeqCst);
                (false, None)
            }
            CircuitState::HalfOpen => {
                let admitted = self
                    .active_probes
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        if n < self.config.half_open_max {
                            Some(n + 1)
                        } else {
                            None
                        }
                    })
                    .is_ok();
                drop(inner);
                if admitted {
                    (
                        true,
                        Some(ProbeGuard {
                            breaker: Arc::clone(self),
                        }),
                    )
                } else {
                    self.total_rejections.fetch_add(1, Ordering::SeqCst);
                    (false, None)
                }
            }
        }
    }

    /// Record a completed call that succeeded
    pub fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                Self::transition(&mut inner, CircuitState::Closed);
            }
        }
    }

    /// Record a completed call that failed
    pub fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        self.total_failures.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::transition(&mut inner, CircuitState::Open);
                }
            }
            // Any half-open failure reopens the circuit.
            CircuitState::HalfOpen => Self::transition(&mut inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    /// Run a call under the breaker, recording the outcome
    pub async fn execute<T, F, Fut>(self: &Arc<Self>, f: F) -> PlannerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = PlannerResult<T>>,
    {
        let (permitted, _guard) = self.allow();
        if !permitted {
            return Err(PlannerError::circuit_open("call rejected"));
        }
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        CircuitBreakerStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            active_probes: self.active_probes.load(Ordering::SeqCst),
            total_calls: self.total_calls.load(Ordering::SeqCst),
            total_failures: self.total_failures.load(Ordering::SeqCst),
            total_rejections: self.total_rejections.load(Ordering::SeqCst),
        }
    }

    /// Roll open into half-open once the open duration has elapsed
    fn advance(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && inner.last_state_change.elapsed() >= self.config.open_duration
        {
            Self::transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(inner: &mut BreakerInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        inner.last_state_change = Instant::now();
        inner.consecutive_successes = 0;
        match to {
            CircuitState::Open => warn!(%from, "circuit breaker opened"),
            CircuitState::HalfOpen => info!(%from, "circuit breaker half-open, probing"),
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                debug!(%from, "circuit breaker closed");
            }
        }
    }
}
