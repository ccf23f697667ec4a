//! The topology-aware tree allocator (spec §4.2).

use std::cmp::Ordering;

use cpuset::{CpuId, CpuSet};
use log::debug;
use topology::{CpuTree, TopologyLevel, WalkControl};

use crate::error::AllocatorError;
use crate::node_attrs::{collect, NodeAttrs};

/// Tunables that shape how [`TreeAllocator`] scores candidate subtrees.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeAllocatorOptions {
    /// `true` spreads new allocations across branches; `false` packs them
    /// into the fullest branch that still fits.
    pub topology_balancing: bool,
    /// Splits the tree below the NUMA level by hyperthread index so that
    /// single-CPU picks land on distinct physical cores before a second
    /// hyperthread is ever used (spec §4.1, §4.2).
    pub prefer_spread_on_physical_cores: bool,
}

/// Recommends which CPUs to add to, or remove from, a caller's CPU set by
/// scoring candidate subtrees of an immutable [`CpuTree`] (spec §4.2).
///
/// The allocator never mutates its inputs; it only recommends a region the
/// caller picks from (or, under `preferSpreadOnPhysicalCores`, a concrete
/// set already narrowed down one CPU at a time).
pub struct TreeAllocator {
    tree: CpuTree,
    options: TreeAllocatorOptions,
}

impl TreeAllocator {
    pub fn new(tree: CpuTree, options: TreeAllocatorOptions) -> Self {
        let tree = if options.prefer_spread_on_physical_cores {
            let hyperthread_index = hyperthread_index_map(&tree);
            tree.split_level(TopologyLevel::NUMA, move |cpu| {
                hyperthread_index.get(&cpu).copied().unwrap_or(0).to_string()
            })
        } else {
            tree
        };
        Self { tree, options }
    }

    pub fn options(&self) -> &TreeAllocatorOptions {
        &self.options
    }

    /// `delta > 0` recommends CPUs to add; `delta < 0` recommends CPUs to
    /// remove; `delta == 0` is a no-op returning an empty set.
    pub fn recommend(&self, current: &CpuSet, free: &CpuSet, delta: i64) -> Result<CpuSet, AllocatorError> {
        match delta.cmp(&0) {
            Ordering::Equal => Ok(CpuSet::new()),
            Ordering::Greater => self.recommend_add(current, free, delta as usize),
            Ordering::Less => self.recommend_remove(current, free, (-delta) as usize),
        }
    }

    fn recommend_add(&self, current: &CpuSet, free: &CpuSet, count: usize) -> Result<CpuSet, AllocatorError> {
        if !self.options.prefer_spread_on_physical_cores {
            return self.region_for_add(current, free, count);
        }
        let mut transient_current = current.clone();
        let mut transient_free = free.clone();
        let mut picked = CpuSet::new();
        for _ in 0..count {
            let region = self.region_for_add(&transient_current, &transient_free, 1)?;
            let cpu = region.iter().next().expect("non-empty region for delta=1");
            picked.insert(cpu);
            transient_current.insert(cpu);
            transient_free.remove(cpu);
        }
        debug!(target: "tree_allocator", "spread-refined add of {count} CPUs -> {picked}");
        Ok(picked)
    }

    fn recommend_remove(&self, current: &CpuSet, free: &CpuSet, count: usize) -> Result<CpuSet, AllocatorError> {
        if !self.options.prefer_spread_on_physical_cores {
            return self.region_for_remove(current, free, count);
        }
        let mut transient_current = current.clone();
        let mut transient_free = free.clone();
        let mut picked = CpuSet::new();
        for _ in 0..count {
            let region = self.region_for_remove(&transient_current, &transient_free, 1)?;
            let cpu = region.iter().next().expect("non-empty region for delta=1");
            picked.insert(cpu);
            transient_current.remove(cpu);
            transient_free.insert(cpu);
        }
        debug!(target: "tree_allocator", "spread-refined release of {count} CPUs -> {picked}");
        Ok(picked)
    }

    fn region_for_add(&self, current: &CpuSet, free: &CpuSet, count: usize) -> Result<CpuSet, AllocatorError> {
        let mut candidates: Vec<NodeAttrs> = collect(&self.tree, current, free).into_iter().filter(|a| a.free_count >= count).collect();
        if candidates.is_empty() {
            return Err(AllocatorError::NotEnoughFreeCpus { requested: count, available: free.len() });
        }
        candidates.sort_by(|a, b| compare_alloc(a, b, self.options.topology_balancing));
        let region = candidates[0].node.cpus().intersection(free);
        debug!(target: "tree_allocator", "addFrom candidate {} -> {region}", candidates[0].node.name());
        Ok(region)
    }

    fn region_for_remove(&self, current: &CpuSet, free: &CpuSet, count: usize) -> Result<CpuSet, AllocatorError> {
        let mut candidates: Vec<NodeAttrs> = collect(&self.tree, current, free).into_iter().filter(|a| a.current_count >= count).collect();
        if candidates.is_empty() {
            return Err(AllocatorError::NotEnoughHeldCpus { requested: count, available: current.len() });
        }
        candidates.sort_by(|a, b| compare_release(a, b, self.options.topology_balancing));
        let region = candidates[0].node.cpus().intersection(current);
        debug!(target: "tree_allocator", "removeFrom candidate {} -> {region}", candidates[0].node.name());
        Ok(region)
    }
}

/// Lexicographic allocation score (spec §4.2): deeper subtree wins, then
/// greater `currentCpuCount` at each ancestor level (co-locate with what
/// the caller already holds), then `freeCpuCount` at each level (greater
/// under spreading, lesser under packing), then ascending node name.
fn compare_alloc(a: &NodeAttrs, b: &NodeAttrs, spread: bool) -> Ordering {
    b.depth
        .cmp(&a.depth)
        .then_with(|| b.current_levels.cmp(&a.current_levels))
        .then_with(|| if spread { b.free_levels.cmp(&a.free_levels) } else { a.free_levels.cmp(&b.free_levels) })
        .then_with(|| a.node.name().cmp(b.node.name()))
}

/// Release score (spec §4.2): deeper subtree still wins, then *lesser*
/// `currentCpuCount` at each level (release the most fragmented holdings
/// first), then `freeCpuCount` exactly as in allocation, then descending
/// node name.
fn compare_release(a: &NodeAttrs, b: &NodeAttrs, spread: bool) -> Ordering {
    b.depth
        .cmp(&a.depth)
        .then_with(|| a.current_levels.cmp(&b.current_levels))
        .then_with(|| if spread { b.free_levels.cmp(&a.free_levels) } else { a.free_levels.cmp(&b.free_levels) })
        .then_with(|| b.node.name().cmp(a.node.name()))
}

/// Maps every CPU id to its index (0, 1, …) among the thread siblings of
/// its owning physical core, in ascending CPU id order. Used to classify
/// CPUs for [`CpuTree::split_level`] when spreading across hyperthreads.
fn hyperthread_index_map(tree: &CpuTree) -> std::collections::HashMap<CpuId, usize> {
    let mut map = std::collections::HashMap::new();
    tree.walk(&mut |node| {
        if node.level() == TopologyLevel::CORE {
            for (index, cpu) in node.cpus().iter().enumerate() {
                map.insert(cpu, index);
            }
            return WalkControl::SkipChildren;
        }
        WalkControl::Continue
    });
    map
}
