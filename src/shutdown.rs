//! Graceful shutdown for the cancellation hierarchy
//!
//! Four phases: signal every context, collect partial results within the
//! grace period, force-finalise whatever remains, report. The coordinator is
//! idempotent; concurrent callers join the first run and receive its report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::cancel::{CancelController, CancelReason};

/// Outcome of a graceful shutdown
#[derive(Clone, Debug, Serialize)]
pub struct ShutdownReport {
    pub success: bool,
    pub duration: Duration,
    pub partial_collected: usize,
    pub force_killed: usize,
    pub errors: Vec<String>,
}

/// Runs the 4-phase shutdown exactly once
pub struct ShutdownCoordinator {
    report: OnceCell<ShutdownReport>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            report: OnceCell::new(),
        }
    }

    /// Shut the controller down; later and concurrent calls join the first
    pub async fn run(&self, controller: &Arc<CancelController>) -> ShutdownReport {
        self.report
            .get_or_init(|| execute(controller))
            .await
            .clone()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn execute(controller: &Arc<CancelController>) -> ShutdownReport {
    let started = Instant::now();
    let grace = controller.config().grace_period;
    let force_kill_timeout = controller.config().force_kill_timeout;
    let errors: Vec<String> = Vec::new();

    // Phase 1: signal. Every session flips to cancelling and the signal
    // propagates down the hierarchy.
    let sessions = controller.sessions();
    info!(sessions = sessions.len(), "shutdown: signalling");
    for session in &sessions {
        session.cancel(CancelReason::Shutdown);
    }

    // Phase 2: collect partial results, bounded by the grace period.
    let contexts = controller.all_contexts();
    let mut partial_collected = 0;
    for ctx in &contexts {
        if ctx.collect_partial().is_some() {
            partial_collected += 1;
        }
    }
    let grace_deadline = started + grace;
    while Instant::now() < grace_deadline {
        if contexts.iter().all(|c| c.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Phase 3: force-finalise whatever has not reached a terminal state,
    // bounded by the remainder of the force-kill budget.
    let force_deadline = started + force_kill_timeout;
    let mut force_killed = 0;
    for ctx in &contexts {
        if Instant::now() >= force_deadline {
            warn!("shutdown: force-kill budget exhausted");
            break;
        }
        if !ctx.is_terminal() {
            ctx.mark_cancelled();
            force_killed += 1;
        }
    }

    // Phase 4: report.
    let report = ShutdownReport {
        success: errors.is_empty(),
        duration: started.elapsed(),
        partial_collected,
        force_killed,
        errors,
    };
    info!(
        duration_ms = report.duration.as_millis() as u64,
        partial_collected = report.partial_collected,
        force_killed = report.force_killed,
        "shutdown complete",
    );
    report
}
