//! Plan-tree vertices
//!
//! A `PlanNode` owns its children; the parent pointer is a non-owning weak
//! back-reference. Visit counts are atomic so selection can read them without
//! taking the node lock; everything else mutable sits behind a per-node
//! read-write lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::{NodeState, PlannedAction, SimulationResult};

/// A vertex of the plan search tree
pub struct PlanNode {
    id: String,
    description: String,
    depth: AtomicU32,
    parent: RwLock<Weak<PlanNode>>,
    visits: AtomicU64,
    // Serialises concurrent expansion attempts on this node.
    expansion_gate: tokio::sync::Mutex<()>,
    inner: RwLock<NodeInner>,
}

struct NodeInner {
    action: Option<PlannedAction>,
    content_hash: [u8; 32],
    total_score: f64,
    state: NodeState,
    children: Vec<Arc<PlanNode>>,
    simulation_result: Option<SimulationResult>,
}

impl PlanNode {
    /// Create a detached node; depth and parent are assigned on attach
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        action: Option<PlannedAction>,
    ) -> Arc<Self> {
        let id = id.into();
        let description = description.into();
        let content_hash = compute_content_hash(&id, &description, action.as_ref());
        Arc::new(Self {
            id,
            description,
            depth: AtomicU32::new(0),
            parent: RwLock::new(Weak::new()),
            visits: AtomicU64::new(0),
            expansion_gate: tokio::sync::Mutex::new(()),
            inner: RwLock::new(NodeInner {
                action,
                content_hash,
                total_score: 0.0,
                state: NodeState::Unexplored,
                children: Vec::new(),
                simulation_result: None,
            }),
        })
    }

    /// Create the root node for a task
    pub fn new_root(task: impl Into<String>) -> Arc<Self> {
        Self::new(format!("root-{}", Uuid::new_v4()), task, None)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Upgraded parent reference; `None` for the root or a detached node
    pub fn parent(&self) -> Option<Arc<PlanNode>> {
        self.parent.read().upgrade()
    }

    pub fn visits(&self) -> u64 {
        self.visits.load(Ordering::SeqCst)
    }

    pub fn total_score(&self) -> f64 {
        self.inner.read().total_score
    }

    /// Mean score over visits; 0 when the node was never visited
    pub fn average_score(&self) -> f64 {
        let visits = self.visits();
        if visits == 0 {
            0.0
        } else {
            self.inner.read().total_score / visits as f64
        }
    }

    pub fn state(&self) -> NodeState {
        self.inner.read().state
    }

    /// Transition lifecycle state; terminal states are never left
    pub fn set_state(&self, state: NodeState) {
        let mut inner = self.inner.write();
        if !inner.state.is_terminal() {
            inner.state = state;
        }
    }

    pub fn action(&self) -> Option<PlannedAction> {
        self.inner.read().action.clone()
    }

    /// Replace the action and recompute the content hash
    pub fn set_action(&self, action: Option<PlannedAction>) {
        let mut inner = self.inner.write();
        inner.content_hash = compute_content_hash(&self.id, &self.description, action.as_ref());
        inner.action = action;
    }

    /// 32-byte hash over `(id, description, action type, file path, diff)`
    pub fn content_hash(&self) -> [u8; 32] {
        self.inner.read().content_hash
    }

    pub fn content_hash_hex(&self) -> String {
        hex::encode(self.content_hash())
    }

    pub fn children(&self) -> Vec<Arc<PlanNode>> {
        self.inner.read().children.clone()
    }

    pub fn child_count(&self) -> usize {
        self.inner.read().children.len()
    }

    pub fn is_leaf(&self) -> bool {
        self.inner.read().children.is_empty()
    }

    pub fn simulation_result(&self) -> Option<SimulationResult> {
        self.inner.read().simulation_result.clone()
    }

    pub fn set_simulation_result(&self, result: SimulationResult) {
        self.inner.write().simulation_result = Some(result);
    }

    /// Attach a child produced by expansion: parent pointer, depth, ownership
    pub fn attach_child(self: &Arc<Self>, child: Arc<PlanNode>) {
        *child.parent.write() = Arc::downgrade(self);
        child.depth.store(self.depth() + 1, Ordering::SeqCst);
        self.inner.write().children.push(child);
    }

    /// One back-propagation step on this node
    pub fn add_visit_and_score(&self, score: f64) {
        self.visits.fetch_add(1, Ordering::SeqCst);
        self.inner.write().total_score += score;
    }

    /// Pre-penalise the node so concurrent workers diverge
    pub fn apply_virtual_loss(&self, value: f64) {
        self.visits.fetch_add(1, Ordering::SeqCst);
        self.inner.write().total_score -= value;
    }

    /// Compensate a previously applied virtual loss
    pub fn release_virtual_loss(&self, value: f64) {
        self.visits.fetch_sub(1, Ordering::SeqCst);
        self.inner.write().total_score += value;
    }

    /// Gate serialising expansion attempts on this node
    pub(crate) fn expansion_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.expansion_gate
    }

    /// Keep only the children the predicate accepts; used by pruning
    pub(crate) fn retain_children<F>(&self, f: F)
    where
        F: FnMut(&Arc<PlanNode>) -> bool,
    {
        self.inner.write().children.retain(f);
    }
}

impl std::fmt::Debug for PlanNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanNode")
            .field("id", &self.id)
            .field("depth", &self.depth())
            .field("visits", &self.visits())
            .field("avg_score", &self.average_score())
            .field("state", &self.state())
            .field("children", &self.child_count())
            .finish()
    }
}

fn compute_content_hash(id: &str, description: &str, action: Option<&PlannedAction>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update([0u8]);
    hasher.update(description.as_bytes());
    hasher.update([0u8]);
    if let Some(action) = action {
        hasher.update(action.action_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(action.file_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(action.code_diff.as_bytes());
    }
    hasher.finalize().into()
}
