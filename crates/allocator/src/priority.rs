//! The priority CPU allocator (spec §4.3): a simpler, non-tree-scoring
//! allocator used when a caller supplies a priority level directly rather
//! than going through [`crate::TreeAllocator`].

use std::cmp::Reverse;
use std::collections::HashMap;

use cpuset::{CpuId, CpuSet};
use topology::{CpuTree, TopologyLevel, WalkControl};

use crate::error::AllocatorError;

/// Which granularities of idle hardware the allocator may take whole,
/// before falling back to thread-by-thread selection.
///
/// Mirrors a balloon definition's `allocatorPriority` (none/low/normal/
/// high): `none`/`low` map to `NONE` (thread-by-thread only), `normal`
/// maps to `CORES`, `high` maps to `PACKAGES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Priority {
    pub idle_packages: bool,
    pub idle_cores: bool,
}

impl Priority {
    pub const NONE: Priority = Priority { idle_packages: false, idle_cores: false };
    pub const CORES: Priority = Priority { idle_packages: false, idle_cores: true };
    pub const PACKAGES: Priority = Priority { idle_packages: true, idle_cores: true };
}

struct Membership {
    package_of: HashMap<CpuId, CpuId>,
    core_of: HashMap<CpuId, CpuId>,
}

fn membership(tree: &CpuTree) -> Membership {
    let mut package_of = HashMap::new();
    let mut core_of = HashMap::new();
    tree.walk(&mut |node| {
        if node.level() == TopologyLevel::PACKAGE {
            for cpu in node.cpus().iter() {
                package_of.insert(cpu, node.id());
            }
        } else if node.level() == TopologyLevel::CORE {
            for cpu in node.cpus().iter() {
                core_of.insert(cpu, node.id());
            }
        }
        WalkControl::Continue
    });
    Membership { package_of, core_of }
}

/// Whole-package and whole-core node listings, sorted by ascending id, for
/// the coarse-granularity steps of the algorithm.
fn packages_and_cores(tree: &CpuTree) -> (Vec<(CpuId, CpuSet)>, Vec<(CpuId, CpuSet)>) {
    let mut packages = Vec::new();
    let mut cores = Vec::new();
    tree.walk(&mut |node| {
        if node.level() == TopologyLevel::PACKAGE {
            packages.push((node.id(), node.cpus().clone()));
        } else if node.level() == TopologyLevel::CORE {
            cores.push((node.id(), node.cpus().clone()));
        }
        WalkControl::Continue
    });
    packages.sort_by_key(|(id, _)| *id);
    cores.sort_by_key(|(id, _)| *id);
    (packages, cores)
}

/// Picks CPUs out of `from` by trying, in order: whole idle packages,
/// whole idle cores, then individual threads ranked by co-location (spec
/// §4.3). Returns the taken set, always of size exactly `n`.
pub struct PriorityAllocator {
    tree: CpuTree,
}

impl PriorityAllocator {
    pub fn new(tree: CpuTree) -> Self {
        Self { tree }
    }

    pub fn allocate(&self, from: &CpuSet, n: usize, priority: Priority) -> Result<CpuSet, AllocatorError> {
        if from.len() < n {
            return Err(AllocatorError::NotEnoughFreeCpus { requested: n, available: from.len() });
        }
        if n == 0 {
            return Ok(CpuSet::new());
        }

        let members = membership(&self.tree);
        let (packages, cores) = packages_and_cores(&self.tree);

        let mut remaining = n;
        let mut pool = from.clone();
        let mut taken = CpuSet::new();

        if priority.idle_packages {
            for (_, cpus) in &packages {
                if remaining == 0 {
                    break;
                }
                if cpus.is_subset_of(&pool) && cpus.len() <= remaining {
                    take_whole(&mut pool, &mut taken, &mut remaining, cpus);
                }
            }
        }

        if priority.idle_cores && remaining > 0 {
            for (_, cpus) in &cores {
                if remaining == 0 {
                    break;
                }
                if cpus.is_subset_of(&pool) && cpus.len() <= remaining {
                    take_whole(&mut pool, &mut taken, &mut remaining, cpus);
                }
            }
        }

        while remaining > 0 {
            let cpu = rank_threads(&pool, &taken, &members)
                .into_iter()
                .next()
                .expect("pool has at least `remaining` CPUs left");
            pool.remove(cpu);
            taken.insert(cpu);
            remaining -= 1;
        }

        Ok(taken)
    }

    /// The symmetric release: given the CPUs currently held (`from`) and a
    /// count `n` to give back, returns the *kept* set (size `|from| - n`).
    pub fn release(&self, from: &CpuSet, n: usize, priority: Priority) -> Result<CpuSet, AllocatorError> {
        if from.len() < n {
            return Err(AllocatorError::NotEnoughHeldCpus { requested: n, available: from.len() });
        }
        if n == 0 {
            return Ok(from.clone());
        }

        let members = membership(&self.tree);
        let (packages, cores) = packages_and_cores(&self.tree);

        let mut remaining = n;
        let mut pool = from.clone();
        let mut released = CpuSet::new();

        if priority.idle_packages {
            for (_, cpus) in &packages {
                if remaining == 0 {
                    break;
                }
                let held = cpus.intersection(&pool);
                if held == *cpus && held.len() <= remaining {
                    take_whole(&mut pool, &mut released, &mut remaining, cpus);
                }
            }
        }

        if priority.idle_cores && remaining > 0 {
            for (_, cpus) in &cores {
                if remaining == 0 {
                    break;
                }
                let held = cpus.intersection(&pool);
                if held == *cpus && held.len() <= remaining {
                    take_whole(&mut pool, &mut released, &mut remaining, cpus);
                }
            }
        }

        while remaining > 0 {
            let cpu = rank_threads_for_release(&pool, &released, &members)
                .into_iter()
                .next()
                .expect("pool has at least `remaining` CPUs left");
            pool.remove(cpu);
            released.insert(cpu);
            remaining -= 1;
        }

        Ok(from.difference(&released))
    }
}

fn take_whole(pool: &mut CpuSet, taken: &mut CpuSet, remaining: &mut usize, cpus: &CpuSet) {
    for cpu in cpus.iter() {
        pool.remove(cpu);
        taken.insert(cpu);
    }
    *remaining -= cpus.len();
}

/// Ranks the CPUs still in `pool` for the thread-by-thread allocation step:
/// (a) more CPUs already taken in the same package wins, (b) fewer free
/// CPUs left in that package wins, (c) fewer free CPUs left in that core
/// wins, (d) lower CPU id wins. Returns candidates best-first.
fn rank_threads(pool: &CpuSet, taken: &CpuSet, members: &Membership) -> Vec<CpuId> {
    let mut candidates: Vec<CpuId> = pool.iter().collect();
    candidates.sort_by_key(|&cpu| {
        let package = members.package_of.get(&cpu).copied();
        let core = members.core_of.get(&cpu).copied();
        let taken_in_package = package.map_or(0, |p| taken.iter().filter(|c| members.package_of.get(c) == Some(&p)).count());
        let free_in_package = package.map_or(0, |p| pool.iter().filter(|c| members.package_of.get(c) == Some(&p)).count());
        let free_in_core = core.map_or(0, |c| pool.iter().filter(|x| members.core_of.get(x) == Some(&c)).count());
        (Reverse(taken_in_package), free_in_package, free_in_core, cpu)
    });
    candidates
}

/// Ranks CPUs for release (spec §4.3, "symmetric operation"): prefer
/// releasing from the package holding the *fewest* CPUs so far (preserving
/// larger concentrated holdings intact), then from the package and core
/// already *emptiest* of other held CPUs, then higher CPU id.
fn rank_threads_for_release(pool: &CpuSet, released: &CpuSet, members: &Membership) -> Vec<CpuId> {
    let mut candidates: Vec<CpuId> = pool.iter().collect();
    candidates.sort_by_key(|&cpu| {
        let package = members.package_of.get(&cpu).copied();
        let core = members.core_of.get(&cpu).copied();
        let held_in_package = package.map_or(0, |p| pool.iter().filter(|c| members.package_of.get(c) == Some(&p)).count());
        let released_in_package = package.map_or(0, |p| released.iter().filter(|c| members.package_of.get(c) == Some(&p)).count());
        let held_in_core = core.map_or(0, |c| pool.iter().filter(|x| members.core_of.get(x) == Some(&c)).count());
        (held_in_package, Reverse(released_in_package), Reverse(held_in_core), Reverse(cpu))
    });
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use topology::TopologyProvider;

    struct GridTopology {
        packages: u32,
        dies_per_package: u32,
        numas_per_die: u32,
        cores_per_numa: u32,
        threads_per_core: u32,
    }

    impl GridTopology {
        fn die_id(&self, package: u32, i: u32) -> u32 {
            package * self.dies_per_package + i
        }
        fn numa_id(&self, die: u32, i: u32) -> u32 {
            die * self.numas_per_die + i
        }
        fn core_id(&self, numa: u32, i: u32) -> u32 {
            numa * self.cores_per_numa + i
        }
        fn thread_id(&self, core: u32, i: u32) -> u32 {
            core * self.threads_per_core + i
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
        GridTopology { packages: 2, dies_per_package: 2, numas_per_die: 2, cores_per_numa: 2, threads_per_core: 2 }
    }

    #[test]
    fn idle_packages_takes_whole_packages_first() {
        let tree = CpuTree::discover(&grid_32());
        let allocator = PriorityAllocator::new(tree.clone());
        let from = tree.cpus().clone();
        let taken = allocator.allocate(&from, 16, Priority::PACKAGES).unwrap();
        // 16 CPUs is exactly one whole package; idlePackages should take
        // it wholesale rather than spilling into thread-by-thread picks.
        assert_eq!(taken.len(), 16);
        assert!(taken.iter().all(|c| c < 16) || taken.iter().all(|c| c >= 16));
    }

    #[test]
    fn thread_by_thread_colocates_with_already_taken() {
        let tree = CpuTree::discover(&grid_32());
        let allocator = PriorityAllocator::new(tree.clone());
        // Request fewer CPUs than a core, twice, with Priority::NONE: the
        // second request should land in the same package as what's
        // already implied "taken" via ranking only among the pool itself,
        // so just assert a valid, exactly-sized result here.
        let from = tree.cpus().clone();
        let taken = allocator.allocate(&from, 3, Priority::NONE).unwrap();
        assert_eq!(taken.len(), 3);
    }

    #[test]
    fn not_enough_cpus_is_reported() {
        let tree = CpuTree::discover(&grid_32());
        let allocator = PriorityAllocator::new(tree.clone());
        let err = allocator.allocate(&CpuSet::from_ids([0, 1]), 3, Priority::NONE).unwrap_err();
        assert!(matches!(err, AllocatorError::NotEnoughFreeCpus { requested: 3, available: 2 }));
    }

    #[test]
    fn release_is_symmetric_with_allocate() {
        let tree = CpuTree::discover(&grid_32());
        let allocator = PriorityAllocator::new(tree.clone());
        let held = CpuSet::from_ids(0..16);
        let kept = allocator.release(&held, 4, Priority::NONE).unwrap();
        assert_eq!(kept.len(), 12);
        assert!(kept.is_subset_of(&held));
    }
}
