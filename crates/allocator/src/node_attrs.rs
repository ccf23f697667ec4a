//! Per-allocation scratch computed for every candidate node (spec §3).

use std::rc::Rc;

use cpuset::CpuSet;
use topology::{CpuTree, TreeNode, WalkControl};

/// The scoring inputs for one candidate node, computed against a specific
/// `(currentCpus, freeCpus)` pair. Never cached across calls: both the
/// held set and the free set change on every allocation.
pub(crate) struct NodeAttrs {
    pub(crate) node: Rc<TreeNode>,
    pub(crate) depth: usize,
    pub(crate) current_count: usize,
    pub(crate) free_count: usize,
    /// `currentCpuCount` at each ancestor, root-to-node inclusive.
    pub(crate) current_levels: Vec<usize>,
    /// `freeCpuCount` at each ancestor, root-to-node inclusive.
    pub(crate) free_levels: Vec<usize>,
}

/// Computes [`NodeAttrs`] for every node in `tree`, in tree order.
pub(crate) fn collect(tree: &CpuTree, current: &CpuSet, free: &CpuSet) -> Vec<NodeAttrs> {
    let mut out = Vec::new();
    tree.walk(&mut |node| {
        let ancestors = CpuTree::ancestors(node);
        let current_levels: Vec<usize> = ancestors.iter().map(|a| a.cpus().intersection(current).len()).collect();
        let free_levels: Vec<usize> = ancestors.iter().map(|a| a.cpus().intersection(free).len()).collect();
        out.push(NodeAttrs {
            node: node.clone(),
            depth: ancestors.len() - 1,
            current_count: *current_levels.last().unwrap(),
            free_count: *free_levels.last().unwrap(),
            current_levels,
            free_levels,
        });
        WalkControl::Continue
    });
    out
}
