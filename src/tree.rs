//! The plan search tree
//!
//! Owns every node reachable from the root. Nodes are created by expansion
//! and destroyed only when the tree is discarded (or pruned).

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::budget::TreeBudget;
use crate::node::PlanNode;
use crate::types::NodeState;

/// A search tree for one planning task
pub struct PlanTree {
    task: String,
    root: Arc<PlanNode>,
    budget: Arc<TreeBudget>,
    total_nodes: AtomicU64,
    best_path: RwLock<Vec<Arc<PlanNode>>>,
}

impl PlanTree {
    pub fn new(task: impl Into<String>, budget: TreeBudget) -> Self {
        let task = task.into();
        Self {
            root: PlanNode::new_root(task.clone()),
            task,
            budget: Arc::new(budget),
            total_nodes: AtomicU64::new(1),
            best_path: RwLock::new(Vec::new()),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn root(&self) -> &Arc<PlanNode> {
        &self.root
    }

    pub fn budget(&self) -> &Arc<TreeBudget> {
        &self.budget
    }

    pub fn total_nodes(&self) -> u64 {
        self.total_nodes.load(Ordering::SeqCst)
    }

    /// Count a node attached by expansion
    pub fn record_node(&self) {
        self.total_nodes.fetch_add(1, Ordering::SeqCst);
    }

    /// Deepest depth currently present
    pub fn max_depth(&self) -> u32 {
        fn walk(node: &Arc<PlanNode>) -> u32 {
            node.children()
                .iter()
                .map(walk)
                .max()
                .unwrap_or_else(|| node.depth())
        }
        walk(&self.root)
    }

    /// Locate a node by ID anywhere in the tree
    pub fn find_node(&self, id: &str) -> Option<Arc<PlanNode>> {
        fn walk(node: &Arc<PlanNode>, id: &str) -> Option<Arc<PlanNode>> {
            if node.id() == id {
                return Some(Arc::clone(node));
            }
            node.children().iter().find_map(|c| walk(c, id))
        }
        walk(&self.root, id)
    }

    /// Descend by highest average score, skipping abandoned children.
    ///
    /// Returns an empty path when the root has no children; otherwise the
    /// path starts at the root and ends at a leaf or at the last node with
    /// an eligible child.
    pub fn extract_best_path(&self) -> Vec<Arc<PlanNode>> {
        let mut path = Vec::new();
        if self.root.child_count() > 0 {
            path.push(Arc::clone(&self.root));
            let mut current = Arc::clone(&self.root);
            loop {
                let next = current
                    .children()
                    .into_iter()
                    .filter(|c| c.state() != NodeState::Abandoned)
                    .max_by(|a, b| {
                        a.average_score()
                            .partial_cmp(&b.average_score())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                match next {
                    Some(child) => {
                        path.push(Arc::clone(&child));
                        current = child;
                    }
                    None => break,
                }
            }
        }
        *self.best_path.write() = path.clone();
        path
    }

    /// Most recently extracted best path
    pub fn best_path(&self) -> Vec<Arc<PlanNode>> {
        self.best_path.read().clone()
    }

    /// Average score of the best path's terminal node; 0 when empty
    pub fn best_score(&self) -> f64 {
        self.best_path
            .read()
            .last()
            .map(|n| n.average_score())
            .unwrap_or(0.0)
    }

    /// Drop abandoned subtrees; returns the number of nodes removed
    pub fn prune_abandoned(&self) -> u64 {
        fn subtree_size(node: &Arc<PlanNode>) -> u64 {
            1 + node.children().iter().map(subtree_size).sum::<u64>()
        }
        fn walk(node: &Arc<PlanNode>) -> u64 {
            let mut removed = 0;
            let children = node.children();
            let (abandoned, kept): (Vec<_>, Vec<_>) = children
                .into_iter()
                .partition(|c| c.state() == NodeState::Abandoned);
            for child in &abandoned {
                removed += subtree_size(child);
            }
            if !abandoned.is_empty() {
                node.retain_children(|c| c.state() != NodeState::Abandoned);
            }
            for child in &kept {
                removed += walk(child);
            }
            removed
        }
        let removed = walk(&self.root);
        self.total_nodes.fetch_sub(removed, Ordering::SeqCst);
        removed
    }

    /// Indented tree dump for logs
    pub fn format(&self) -> String {
        fn walk(node: &Arc<PlanNode>, indent: usize, out: &mut String) {
            let _ = writeln!(
                out,
                "{}{} [{} visits={} avg={:.3}]",
                "  ".repeat(indent),
                node.id(),
                node.state(),
                node.visits(),
                node.average_score(),
            );
            for child in node.children() {
                walk(&child, indent + 1, out);
            }
        }
        let mut out = String::new();
        let _ = writeln!(out, "task: {}", self.task);
        walk(&self.root, 0, &mut out);
        out
    }
}

impl std::fmt::Debug for PlanTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanTree")
            .field("task", &self.task)
            .field("total_nodes", &self.total_nodes())
            .field("max_depth", &self.max_depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetLimits;

    fn tree_with_children(scores: &[f64]) -> PlanTree {
        let tree = PlanTree::new("task", TreeBudget::new(BudgetLimits::unlimited()));
        for (i, score) in scores.iter().enumerate() {
            let child = PlanNode::new(format!("c{i}"), "step", None);
            child.add_visit_and_score(*score);
            tree.root().attach_child(child);
            tree.record_node();
        }
        tree
    }

    #[test]
    fn test_empty_tree_extraction() {
        let tree = PlanTree::new("task", TreeBudget::new(BudgetLimits::unlimited()));
        assert!(tree.extract_best_path().is_empty());
        assert_eq!(tree.best_score(), 0.0);
        assert_eq!(tree.total_nodes(), 1);
    }

    #[test]
    fn test_best_path_prefers_highest_average() {
        let tree = tree_with_children(&[0.2, 0.9, 0.5]);
        let path = tree.extract_best_path();
        assert_eq!(path.len(), 2);
        assert_eq!(path[1].id(), "c1");
        assert!((tree.best_score() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_best_path_skips_abandoned() {
        let tree = tree_with_children(&[0.2, 0.9, 0.5]);
        tree.find_node("c1").unwrap().set_state(NodeState::Abandoned);
        let path = tree.extract_best_path();
        assert_eq!(path[1].id(), "c2");
    }

    #[test]
    fn test_find_node() {
        let tree = tree_with_children(&[0.1, 0.2]);
        let grandchild = PlanNode::new("g0", "deeper", None);
        tree.find_node("c0").unwrap().attach_child(grandchild);
        tree.record_node();

        assert!(tree.find_node("g0").is_some());
        assert!(tree.find_node("missing").is_none());
        assert_eq!(tree.max_depth(), 2);
    }

    #[test]
    fn test_prune_abandoned_subtree() {
        let tree = tree_with_children(&[0.1, 0.2]);
        let doomed = tree.find_node("c0").unwrap();
        let grandchild = PlanNode::new("g0", "deeper", None);
        doomed.attach_child(grandchild);
        tree.record_node();
        doomed.set_state(NodeState::Abandoned);

        assert_eq!(tree.total_nodes(), 4);
        let removed = tree.prune_abandoned();
        assert_eq!(removed, 2);
        assert_eq!(tree.total_nodes(), 2);
        assert!(tree.find_node("c0").is_none());
        assert!(tree.find_node("g0").is_none());
    }

    #[test]
    fn test_format_lists_every_node() {
        let tree = tree_with_children(&[0.1]);
        let dump = tree.format();
        assert!(dump.contains("task: task"));
        assert!(dump.contains("c0"));
    }
}
