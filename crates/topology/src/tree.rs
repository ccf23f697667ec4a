//! The immutable CPU tree built once at startup from discovered hardware.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use cpuset::{CpuId, CpuSet};

use crate::level::TopologyLevel;
use crate::provider::TopologyProvider;

/// One node of the [`CpuTree`].
///
/// The CPU set of a node always equals the union of its children's sets;
/// a child's level is always strictly deeper than its parent's; each CPU
/// identifier appears in exactly one leaf (spec §3).
pub struct TreeNode {
    name: String,
    level: TopologyLevel,
    /// The discovery id of this node (package/die/numa/core id, or the
    /// CPU id itself for a thread leaf). `0` for the root and for
    /// synthetic split-level nodes, neither of which has one.
    id: CpuId,
    cpus: CpuSet,
    parent: RefCell<Weak<TreeNode>>,
    children: Vec<Rc<TreeNode>>,
}

impl TreeNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> TopologyLevel {
        self.level
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn cpus(&self) -> &CpuSet {
        &self.cpus
    }

    pub fn children(&self) -> &[Rc<TreeNode>] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// The parent node, or `None` at the root. Never follow a parent
    /// pointer past the root; absence of a parent *is* the root marker.
    pub fn parent(&self) -> Option<Rc<TreeNode>> {
        self.parent.borrow().upgrade()
    }
}

fn new_node(name: String, level: TopologyLevel, id: CpuId, cpus: CpuSet, children: Vec<Rc<TreeNode>>) -> Rc<TreeNode> {
    let node = Rc::new(TreeNode {
        name,
        level,
        id,
        cpus,
        parent: RefCell::new(Weak::new()),
        children,
    });
    for child in &node.children {
        *child.parent.borrow_mut() = Rc::downgrade(&node);
    }
    node
}

fn union_of(nodes: &[Rc<TreeNode>]) -> CpuSet {
    nodes.iter().fold(CpuSet::new(), |acc, n| acc.union(&n.cpus))
}

/// What a [`CpuTree::walk`] visitor callback asks the walker to do next.
pub enum WalkControl {
    /// Descend into this node's children, then move to the next sibling.
    Continue,
    /// Do not descend into this node's children; move to the next sibling.
    SkipChildren,
    /// Stop the walk entirely.
    Stop,
}

/// Immutable tree of topology nodes: system → package → die → NUMA →
/// core → thread, each carrying a CPU set (spec §4.1).
///
/// Cheaply `Clone`-able: cloning only bumps the root `Rc`'s refcount, the
/// node graph itself is shared.
#[derive(Clone)]
pub struct CpuTree {
    root: Rc<TreeNode>,
}

impl CpuTree {
    /// Builds the tree from a discovered topology. Offlined CPUs are
    /// excluded from every node's set; branches left with no online CPU
    /// are pruned rather than kept as empty leaves.
    pub fn discover(provider: &dyn TopologyProvider) -> Self {
        let offlined = provider.offlined();
        let mut packages = Vec::new();
        for package in provider.packages() {
            let mut dies = Vec::new();
            for die in provider.dies(package) {
                let mut numas = Vec::new();
                for numa in provider.numa_nodes(die) {
                    let mut cores = Vec::new();
                    for core in provider.cores(numa) {
                        let mut threads = Vec::new();
                        for thread in provider.threads(core) {
                            if offlined.contains(thread) {
                                continue;
                            }
                            threads.push(new_node(
                                format!("cpu{thread}"),
                                TopologyLevel::THREAD,
                                thread,
                                CpuSet::single(thread),
                                Vec::new(),
                            ));
                        }
                        if threads.is_empty() {
                            continue;
                        }
                        cores.push(new_node(
                            format!("core{core}"),
                            TopologyLevel::CORE,
                            core,
                            union_of(&threads),
                            threads,
                        ));
                    }
                    if cores.is_empty() {
                        continue;
                    }
                    numas.push(new_node(
                        format!("numa{numa}"),
                        TopologyLevel::NUMA,
                        numa,
                        union_of(&cores),
                        cores,
                    ));
                }
                if numas.is_empty() {
                    continue;
                }
                dies.push(new_node(format!("die{die}"), TopologyLevel::DIE, die, union_of(&numas), numas));
            }
            if dies.is_empty() {
                continue;
            }
            packages.push(new_node(
                format!("package{package}"),
                TopologyLevel::PACKAGE,
                package,
                union_of(&dies),
                dies,
            ));
        }
        let root = new_node("system".to_string(), TopologyLevel::SYSTEM, 0, union_of(&packages), packages);
        CpuTree { root }
    }

    /// Builds a tree directly from a pre-built root, for tests and for
    /// [`CpuTree::split_level`].
    pub fn from_root(root: Rc<TreeNode>) -> Self {
        CpuTree { root }
    }

    pub fn root(&self) -> &Rc<TreeNode> {
        &self.root
    }

    pub fn cpus(&self) -> &CpuSet {
        &self.root.cpus
    }

    /// Deterministic depth-first walk: children are visited in insertion
    /// order.
    pub fn walk<F: FnMut(&Rc<TreeNode>) -> WalkControl>(&self, visit: &mut F) {
        walk_node(&self.root, visit);
    }

    /// The unique leaf whose CPU set contains `cpu`; `None` if absent.
    pub fn find_leaf_with_cpu(&self, cpu: CpuId) -> Option<Rc<TreeNode>> {
        let mut found = None;
        self.walk(&mut |node| {
            if !node.cpus.contains(cpu) {
                return WalkControl::SkipChildren;
            }
            if node.is_leaf() {
                found = Some(node.clone());
                return WalkControl::Stop;
            }
            WalkControl::Continue
        });
        found
    }

    /// All leaf nodes, in tree order.
    pub fn leaves(&self) -> Vec<Rc<TreeNode>> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if node.is_leaf() {
                out.push(node.clone());
            }
            WalkControl::Continue
        });
        out
    }

    /// For each topology level from the root downward, the names of the
    /// nodes at that level whose CPU set intersects `query`, in tree
    /// order (spec §4.1, used by the metrics exporter).
    pub fn cpu_locations(&self, query: &CpuSet) -> Vec<(TopologyLevel, Vec<String>)> {
        let mut by_level: BTreeMap<TopologyLevel, Vec<String>> = BTreeMap::new();
        self.walk(&mut |node| {
            if !node.cpus.intersection(query).is_empty() {
                by_level.entry(node.level).or_default().push(node.name.clone());
            }
            WalkControl::Continue
        });
        by_level.into_iter().collect()
    }

    /// Rebuilds the tree with a new layer inserted directly below `level`:
    /// every node at `level` gets one child per class returned by
    /// `classify` over its CPU identifiers; descendant subtrees are cloned
    /// with their CPU sets intersected by the class mask, and branches
    /// whose intersection is empty are pruned (spec §4.1).
    pub fn split_level<F: Fn(CpuId) -> String>(&self, level: TopologyLevel, classify: F) -> CpuTree {
        let root = rebuild(&self.root, level, &classify);
        CpuTree { root }
    }

    /// The chain of ancestors from the root down to (and including)
    /// `node`.
    pub fn ancestors(node: &Rc<TreeNode>) -> Vec<Rc<TreeNode>> {
        let mut chain = vec![node.clone()];
        let mut cur = node.clone();
        while let Some(parent) = cur.parent() {
            chain.push(parent.clone());
            cur = parent;
        }
        chain.reverse();
        chain
    }

    /// Depth of `node` from the root (root itself is depth 0).
    pub fn depth(node: &Rc<TreeNode>) -> usize {
        Self::ancestors(node).len() - 1
    }
}

fn walk_node<F: FnMut(&Rc<TreeNode>) -> WalkControl>(node: &Rc<TreeNode>, visit: &mut F) -> WalkControl {
    match visit(node) {
        WalkControl::Stop => WalkControl::Stop,
        WalkControl::SkipChildren => WalkControl::Continue,
        WalkControl::Continue => {
            for child in &node.children {
                if let WalkControl::Stop = walk_node(child, visit) {
                    return WalkControl::Stop;
                }
            }
            WalkControl::Continue
        }
    }
}

fn rebuild<F: Fn(CpuId) -> String>(node: &Rc<TreeNode>, split_level: TopologyLevel, classify: &F) -> Rc<TreeNode> {
    if node.level == split_level && !node.is_leaf() {
        let mut classes: BTreeMap<String, CpuSet> = BTreeMap::new();
        for cpu in node.cpus.iter() {
            classes.entry(classify(cpu)).or_default().insert(cpu);
        }
        let synthetic_level = split_level.synthetic_child();
        let mut new_children = Vec::new();
        for (class_name, mask) in classes {
            let cloned: Vec<Rc<TreeNode>> = node
                .children
                .iter()
                .filter_map(|child| clone_intersect(child, &mask))
                .collect();
            new_children.push(new_node(format!("{}~{}", node.name, class_name), synthetic_level, 0, mask, cloned));
        }
        new_node(node.name.clone(), node.level, node.id, node.cpus.clone(), new_children)
    } else {
        let new_children: Vec<Rc<TreeNode>> = node.children.iter().map(|child| rebuild(child, split_level, classify)).collect();
        new_node(node.name.clone(), node.level, node.id, node.cpus.clone(), new_children)
    }
}

fn clone_intersect(node: &Rc<TreeNode>, mask: &CpuSet) -> Option<Rc<TreeNode>> {
    let cpus = node.cpus.intersection(mask);
    if cpus.is_empty() {
        return None;
    }
    let children: Vec<Rc<TreeNode>> = node.children.iter().filter_map(|child| clone_intersect(child, mask)).collect();
    Some(new_node(node.name.clone(), node.level, node.id, cpus, children))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A simple grid topology: `packages` packages, each with `dies_per_package`
    /// dies, each with `numas_per_die` NUMA nodes, each with `cores_per_numa`
    /// cores, each with `threads_per_core` hyperthreads.
    struct GridTopology {
        packages: u32,
        dies_per_package: u32,
        numas_per_die: u32,
        cores_per_numa: u32,
        threads_per_core: u32,
    }

    impl GridTopology {
        fn die_id(&self, package: u32, die_idx: u32) -> u32 {
            package * self.dies_per_package + die_idx
        }
        fn numa_id(&self, die: u32, numa_idx: u32) -> u32 {
            die * self.numas_per_die + numa_idx
        }
        fn core_id(&self, numa: u32, core_idx: u32) -> u32 {
            numa * self.cores_per_numa + core_idx
        }
        fn thread_id(&self, core: u32, thread_idx: u32) -> u32 {
            core * self.threads_per_core + thread_idx
        }
    }

    impl TopologyProvider for GridTopology {
        fn packages(&self) -> Vec<CpuId> {
            (0..self.packages).collect()
        }
        fn dies(&self, package: CpuId) -> Vec<CpuId> {
            (0..self.dies_per_package).map(|i| self.die_id(package, i)).collect()
        }
        fn numa_nodes(&self, die: CpuId) -> Vec<CpuId> {
            (0..self.numas_per_die).map(|i| self.numa_id(die, i)).collect()
        }
        fn cores(&self, numa: CpuId) -> Vec<CpuId> {
            (0..self.cores_per_numa).map(|i| self.core_id(numa, i)).collect()
        }
        fn threads(&self, core: CpuId) -> Vec<CpuId> {
            (0..self.threads_per_core).map(|i| self.thread_id(core, i)).collect()
        }
        fn offlined(&self) -> CpuSet {
            CpuSet::new()
        }
    }

    fn grid_32() -> GridTopology {
        // 2 packages x 2 dies x 2 numa x 2 cores x 2 threads = 32 CPUs.
        GridTopology {
            packages: 2,
            dies_per_package: 2,
            numas_per_die: 2,
            cores_per_numa: 2,
            threads_per_core: 2,
        }
    }

    #[test]
    fn every_cpu_in_exactly_one_leaf() {
        let tree = CpuTree::discover(&grid_32());
        let mut seen: HashMap<CpuId, usize> = HashMap::new();
        for leaf in tree.leaves() {
            for cpu in leaf.cpus().iter() {
                *seen.entry(cpu).or_insert(0) += 1;
            }
        }
        assert_eq!(seen.len(), 32);
        assert!(seen.values().all(|&count| count == 1));
    }

    #[test]
    fn node_cpus_is_union_of_children() {
        let tree = CpuTree::discover(&grid_32());
        tree.walk(&mut |node| {
            if !node.is_leaf() {
                let union: CpuSet = node.children().iter().fold(CpuSet::new(), |acc, c| acc.union(c.cpus()));
                assert_eq!(&union, node.cpus());
            }
            WalkControl::Continue
        });
    }

    #[test]
    fn find_leaf_with_cpu_roundtrips() {
        let tree = CpuTree::discover(&grid_32());
        for cpu in 0..32 {
            let leaf = tree.find_leaf_with_cpu(cpu).unwrap();
            assert!(leaf.is_leaf());
            assert!(leaf.cpus().contains(cpu));
        }
    }

    #[test]
    fn split_level_round_trip_is_lossless() {
        let tree = CpuTree::discover(&grid_32());
        let split = tree.split_level(TopologyLevel::NUMA, |cpu| {
            // classify by hyperthread index: cpu id parity within its core
            (cpu % 2).to_string()
        });
        assert_eq!(split.cpus(), tree.cpus());
    }

    #[test]
    fn cpu_locations_reports_every_ancestor_level() {
        let tree = CpuTree::discover(&grid_32());
        let query = CpuSet::single(0);
        let locations = tree.cpu_locations(&query);
        let levels: Vec<TopologyLevel> = locations.iter().map(|(l, _)| *l).collect();
        assert!(levels.contains(&TopologyLevel::PACKAGE));
        assert!(levels.contains(&TopologyLevel::DIE));
        assert!(levels.contains(&TopologyLevel::NUMA));
        assert!(levels.contains(&TopologyLevel::CORE));
        assert!(levels.contains(&TopologyLevel::THREAD));
    }
}
