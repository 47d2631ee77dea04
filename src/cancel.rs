//! Hierarchical cancellation framework
//!
//! Three levels: Session → Activity → Algorithm. Cancelling a context
//! cancels all of its descendants with a `parent` reason; siblings are
//! untouched. State moves `running → cancelling → cancelled` through
//! compare-and-swap transitions, with `done` as the parallel terminal state
//! for contexts that finish on their own. A background monitor cancels
//! contexts that stop reporting progress; an optional resource monitor
//! cancels sessions that exceed memory or thread limits.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::error::{PlannerError, PlannerResult};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};

/// Why a context was cancelled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    User,
    Timeout,
    Deadlock,
    ResourceLimit,
    Parent,
    Shutdown,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Timeout => "timeout",
            Self::Deadlock => "deadlock",
            Self::ResourceLimit => "resource_limit",
            Self::Parent => "parent",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hierarchy levels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelLevel {
    Session,
    Activity,
    Algorithm,
}

impl CancelLevel {
    /// The level a child context takes; algorithms are leaves
    fn child(&self) -> Option<Self> {
        match self {
            Self::Session => Some(Self::Activity),
            Self::Activity => Some(Self::Algorithm),
            Self::Algorithm => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Activity => "activity",
            Self::Algorithm => "algorithm",
        }
    }
}

/// Context lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Running,
    Cancelling,
    Cancelled,
    Done,
}

impl ContextState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Done)
    }
}

const STATE_RUNNING: u8 = 0;
const STATE_CANCELLING: u8 = 1;
const STATE_CANCELLED: u8 = 2;
const STATE_DONE: u8 = 3;

fn state_from_u8(raw: u8) -> ContextState {
    match raw {
        STATE_CANCELLING => ContextState::Cancelling,
        STATE_CANCELLED => ContextState::Cancelled,
        STATE_DONE => ContextState::Done,
        _ => ContextState::Running,
    }
}

/// Per-session resource ceilings; zero disables an axis
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_threads: u64,
}

/// Framework configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelConfig {
    /// Time granted to algorithms between signal and forced cancellation
    pub grace_period: Duration,
    /// Hard ceiling on shutdown, including the grace period
    pub force_kill_timeout: Duration,
    /// Cadence of the deadlock monitor scan
    pub progress_check_interval: Duration,
    /// A context is deadlocked after this many missed progress intervals
    pub deadlock_multiplier: u32,
    pub session_progress_interval: Duration,
    pub activity_progress_interval: Duration,
    pub algorithm_progress_interval: Duration,
    /// Default resource ceilings applied to new sessions
    pub resource_limits: Option<ResourceLimits>,
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(500),
            force_kill_timeout: Duration::from_secs(5),
            progress_check_interval: Duration::from_millis(100),
            deadlock_multiplier: 3,
            session_progress_interval: Duration::from_secs(30),
            activity_progress_interval: Duration::from_secs(10),
            algorithm_progress_interval: Duration::from_millis(100),
            resource_limits: None,
        }
    }
}

impl CancelConfig {
    pub fn validate(&self) -> PlannerResult<()> {
        if self.grace_period > self.force_kill_timeout {
            return Err(PlannerError::invalid_config(
                "grace_period exceeds force_kill_timeout",
            ));
        }
        if self.deadlock_multiplier == 0 {
            return Err(PlannerError::invalid_config(
                "deadlock_multiplier must be at least 1",
            ));
        }
        if self.progress_check_interval.is_zero() {
            return Err(PlannerError::invalid_config(
                "progress_check_interval must be non-zero",
            ));
        }
        Ok(())
    }

    fn progress_interval_for(&self, level: CancelLevel) -> Duration {
        match level {
            CancelLevel::Session => self.session_progress_interval,
            CancelLevel::Activity => self.activity_progress_interval,
            CancelLevel::Algorithm => self.algorithm_progress_interval,
        }
    }
}

pub type PartialResultCollector = Box<dyn Fn() -> serde_json::Value + Send + Sync>;

/// One node of the cancellation hierarchy
pub struct CancelContext {
    id: String,
    level: CancelLevel,
    state: AtomicU8,
    reason: Mutex<Option<CancelReason>>,
    token: CancellationToken,
    progress_interval: Duration,
    last_progress: Mutex<Instant>,
    parent: Weak<CancelContext>,
    children: Mutex<Vec<Arc<CancelContext>>>,
    collector: Mutex<Option<PartialResultCollector>>,
    partial_result: Mutex<Option<serde_json::Value>>,
}

impl CancelContext {
    fn new(
        id: String,
        level: CancelLevel,
        token: CancellationToken,
        progress_interval: Duration,
        parent: Weak<CancelContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            level,
            state: AtomicU8::new(STATE_RUNNING),
            reason: Mutex::new(None),
            token,
            progress_interval,
            last_progress: Mutex::new(Instant::now()),
            parent,
            children: Mutex::new(Vec::new()),
            collector: Mutex::new(None),
            partial_result: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn level(&self) -> CancelLevel {
        self.level
    }

    pub fn state(&self) -> ContextState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock()
    }

    /// Resolves when the context is cancelled
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Error out when the context has been cancelled
    pub fn check(&self) -> PlannerResult<()> {
        if self.token.is_cancelled() {
            Err(PlannerError::cancelled(
                self.reason().unwrap_or(CancelReason::Parent),
            ))
        } else {
            Ok(())
        }
    }

    /// Refresh the liveness timestamp on this context and its ancestors
    pub fn report_progress(&self) {
        *self.last_progress.lock() = Instant::now();
        if let Some(parent) = self.parent.upgrade() {
            parent.report_progress();
        }
    }

    pub fn last_progress_age(&self) -> Duration {
        self.last_progress.lock().elapsed()
    }

    /// Register the closure invoked to salvage partial results
    pub fn register_collector(&self, collector: PartialResultCollector) {
        *self.collector.lock() = Some(collector);
    }

    /// Invoke the collector once; later calls return the recorded output
    pub fn collect_partial(&self) -> Option<serde_json::Value> {
        let mut stored = self.partial_result.lock();
        if stored.is_none() {
            let collector = self.collector.lock();
            if let Some(collector) = collector.as_ref() {
                *stored = Some(collector());
            }
        }
        stored.clone()
    }

    /// Signal cancellation: CAS `running → cancelling`, first reason wins,
    /// descendants are cancelled with a `parent` reason.
    pub fn cancel(self: &Arc<Self>, reason: CancelReason) -> bool {
        let won = self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_CANCELLING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if won {
            {
                let mut stored = self.reason.lock();
                if stored.is_none() {
                    *stored = Some(reason);
                }
            }
            info!(id = %self.id, reason = reason.as_str(), "cancelling context");
            self.token.cancel();
            let children = self.children.lock().clone();
            for child in children {
                child.cancel(CancelReason::Parent);
            }
        }
        won
    }

    /// CAS `cancelling → cancelled`; runs after grace and collection
    pub(crate) fn mark_cancelled(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_CANCELLING,
                STATE_CANCELLED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// CAS `running → done` for a context that completed normally
    pub fn finish(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_RUNNING,
                STATE_DONE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn children_snapshot(&self) -> Vec<Arc<CancelContext>> {
        self.children.lock().clone()
    }

    fn status(&self) -> ContextStatus {
        ContextStatus {
            id: self.id.clone(),
            level: self.level,
            state: self.state(),
            reason: self.reason(),
            last_progress_age_ms: self.last_progress_age().as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for CancelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelContext")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("state", &self.state())
            .finish()
    }
}

/// Per-context status row
#[derive(Clone, Debug, Serialize)]
pub struct ContextStatus {
    pub id: String,
    pub level: CancelLevel,
    pub state: ContextState,
    pub reason: Option<CancelReason>,
    pub last_progress_age_ms: u64,
}

/// JSON-serializable controller snapshot
#[derive(Clone, Debug, Serialize)]
pub struct CancellationStatus {
    pub contexts: Vec<ContextStatus>,
}

/// Owns every context and the monitor tasks
pub struct CancelController {
    config: CancelConfig,
    contexts: DashMap<String, Arc<CancelContext>>,
    session_seq: AtomicU64,
    monitor: Mutex<Option<JoinHandle<()>>>,
    resource_monitors: Mutex<Vec<JoinHandle<()>>>,
    shutdown: ShutdownCoordinator,
    closed: AtomicBool,
}

impl CancelController {
    pub fn new(config: CancelConfig) -> PlannerResult<Arc<Self>> {
        config.validate()?;
        let controller = Arc::new(Self {
            config,
            contexts: DashMap::new(),
            session_seq: AtomicU64::new(0),
            monitor: Mutex::new(None),
            resource_monitors: Mutex::new(Vec::new()),
            shutdown: ShutdownCoordinator::new(),
            closed: AtomicBool::new(false),
        });
        controller.spawn_deadlock_monitor();
        Ok(controller)
    }

    pub fn config(&self) -> &CancelConfig {
        &self.config
    }

    /// Create a session context under an external parent token
    pub fn new_session(self: &Arc<Self>, parent: &CancellationToken) -> Arc<CancelContext> {
        self.new_session_with(parent, self.config.resource_limits)
    }

    /// Create a session with explicit resource ceilings
    pub fn new_session_with(
        self: &Arc<Self>,
        parent: &CancellationToken,
        limits: Option<ResourceLimits>,
    ) -> Arc<CancelContext> {
        let seq = self.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("session-{seq}");
        let ctx = CancelContext::new(
            id.clone(),
            CancelLevel::Session,
            parent.child_token(),
            self.config.progress_interval_for(CancelLevel::Session),
            Weak::new(),
        );
        self.contexts.insert(id, Arc::clone(&ctx));
        if let Some(limits) = limits {
            self.spawn_resource_monitor(Arc::clone(&ctx), limits);
        }
        debug!(id = ctx.id(), "session registered");
        ctx
    }

    /// Create a child context one level below the parent
    pub fn child(
        self: &Arc<Self>,
        parent: &Arc<CancelContext>,
        name: &str,
    ) -> PlannerResult<Arc<CancelContext>> {
        let level = parent.level.child().ok_or_else(|| {
            PlannerError::invalid_config("algorithm contexts cannot have children")
        })?;
        parent.check()?;
        let id = format!("{}/{}", parent.id, name);
        let ctx = CancelContext::new(
            id.clone(),
            level,
            parent.token.child_token(),
            self.config.progress_interval_for(level),
            Arc::downgrade(parent),
        );
        parent.children.lock().push(Arc::clone(&ctx));
        self.contexts.insert(id, Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Resolve an ID: exact path match first, then a linear scan over
    /// algorithm contexts by bare name.
    pub fn resolve(&self, id: &str) -> Option<Arc<CancelContext>> {
        if let Some(ctx) = self.contexts.get(id) {
            return Some(Arc::clone(ctx.value()));
        }
        self.contexts.iter().find_map(|entry| {
            let ctx = entry.value();
            if ctx.level == CancelLevel::Algorithm
                && ctx.id.rsplit('/').next() == Some(id)
            {
                Some(Arc::clone(ctx))
            } else {
                None
            }
        })
    }

    /// Cancel a context (and its descendants) by ID
    pub fn cancel(self: &Arc<Self>, id: &str, reason: CancelReason) -> PlannerResult<()> {
        let ctx = self
            .resolve(id)
            .ok_or_else(|| PlannerError::ContextNotFound(id.to_string()))?;
        self.request_cancel(&ctx, reason);
        Ok(())
    }

    /// Cancel every session
    pub fn cancel_all(self: &Arc<Self>, reason: CancelReason) {
        let sessions: Vec<_> = self
            .contexts
            .iter()
            .filter(|e| e.value().level == CancelLevel::Session)
            .map(|e| Arc::clone(e.value()))
            .collect();
        for session in sessions {
            self.request_cancel(&session, reason);
        }
    }

    /// Cancel a context after a timeout unless it finished first
    pub fn schedule_timeout(self: &Arc<Self>, ctx: &Arc<CancelContext>, timeout: Duration) {
        let controller = Arc::downgrade(self);
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if !ctx.is_terminal() {
                        if let Some(controller) = controller.upgrade() {
                            controller.request_cancel(&ctx, CancelReason::Timeout);
                        }
                    }
                }
                _ = ctx.done() => {}
            }
        });
    }

    /// Signal a cancel and schedule its grace-period finalisation
    pub(crate) fn request_cancel(self: &Arc<Self>, ctx: &Arc<CancelContext>, reason: CancelReason) {
        if ctx.cancel(reason) {
            let grace = self.config.grace_period;
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                finalize_cancelled(&ctx);
            });
        }
    }

    pub fn status(&self) -> CancellationStatus {
        let mut contexts: Vec<_> = self
            .contexts
            .iter()
            .map(|entry| entry.value().status())
            .collect();
        contexts.sort_by(|a, b| a.id.cmp(&b.id));
        CancellationStatus { contexts }
    }

    /// Graceful 4-phase shutdown; concurrent calls join the first
    pub async fn shutdown(self: &Arc<Self>) -> ShutdownReport {
        self.shutdown.run(self).await
    }

    /// Release monitor tasks; contexts are left as they are
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        for handle in self.resource_monitors.lock().drain(..) {
            handle.abort();
        }
        debug!("cancellation controller closed");
    }

    pub(crate) fn all_contexts(&self) -> Vec<Arc<CancelContext>> {
        self.contexts
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<CancelContext>> {
        self.contexts
            .iter()
            .filter(|e| e.value().level == CancelLevel::Session)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    fn spawn_deadlock_monitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.progress_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(controller) = weak.upgrade() else { break };
                controller.scan_for_deadlocks();
            }
        });
        *self.monitor.lock() = Some(handle);
    }

    fn scan_for_deadlocks(self: &Arc<Self>) {
        let multiplier = self.config.deadlock_multiplier;
        let stale: Vec<_> = self
            .contexts
            .iter()
            .filter_map(|entry| {
                let ctx = entry.value();
                let threshold = ctx.progress_interval * multiplier;
                if ctx.state() == ContextState::Running && ctx.last_progress_age() > threshold {
                    Some(Arc::clone(ctx))
                } else {
                    None
                }
            })
            .collect();
        for ctx in stale {
            warn!(
                id = ctx.id(),
                age_ms = ctx.last_progress_age().as_millis() as u64,
                "no progress reported, treating as deadlocked",
            );
            self.request_cancel(&ctx, CancelReason::Deadlock);
        }
    }

    fn spawn_resource_monitor(self: &Arc<Self>, session: Arc<CancelContext>, limits: ResourceLimits) {
        let controller = Arc::downgrade(self);
        let interval = self.config.progress_check_interval;
        let handle = tokio::spawn(async move {
            let mut sys = sysinfo::System::new();
            let pid = sysinfo::Pid::from_u32(std::process::id());
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if session.is_terminal() || session.is_cancelled() {
                    break;
                }
                sys.refresh_process(pid);
                let memory_mb = sys
                    .process(pid)
                    .map(|p| p.memory() / (1024 * 1024))
                    .unwrap_or(0);
                let threads = thread_count();

                let memory_exceeded =
                    limits.max_memory_mb > 0 && memory_mb > limits.max_memory_mb;
                let threads_exceeded = limits.max_threads > 0 && threads > limits.max_threads;
                if memory_exceeded || threads_exceeded {
                    warn!(
                        session = session.id(),
                        memory_mb,
                        threads,
                        "resource limits exceeded",
                    );
                    if let Some(controller) = controller.upgrade() {
                        controller.request_cancel(&session, CancelReason::ResourceLimit);
                    }
                    break;
                }
            }
        });
        self.resource_monitors.lock().push(handle);
    }
}

/// Collect partial results and finalise the cancelled subtree
pub(crate) fn finalize_cancelled(ctx: &Arc<CancelContext>) {
    ctx.collect_partial();
    ctx.mark_cancelled();
    for child in ctx.children_snapshot() {
        finalize_cancelled(&child);
    }
}

#[cfg(target_os = "linux")]
fn thread_count() -> u64 {
    procfs::process::Process::myself()
        .and_then(|p| p.stat())
        .map(|s| s.num_threads as u64)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn thread_count() -> u64 {
    0
}

tokio::task_local! {
    static CURRENT_CONTEXT: Arc<CancelContext>;
}

/// Run a future with an ambient context installed for helper lookups
pub async fn with_context<F>(ctx: Arc<CancelContext>, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_CONTEXT.scope(ctx, fut).await
}

/// The ambient context, when running under [`with_context`]
pub fn current_context() -> Option<Arc<CancelContext>> {
    CURRENT_CONTEXT.try_with(Arc::clone).ok()
}

/// Report progress through the ambient context; false when none is in scope
pub fn report_ambient_progress() -> bool {
    CURRENT_CONTEXT.try_with(|ctx| ctx.report_progress()).is_ok()
}
