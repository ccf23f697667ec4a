use std::collections::BTreeMap;

use parking_lot::RwLock;

use cpuset::CpuSet;
use interfaces::{ContainerCache, ContainerInfo, CpuClassApplier, Pinner};
use topology::TopologyProvider;

/// A uniform `packages x dies x numas x cores x threads` grid, for local
/// exercising without reading `/sys` (spec §9: discovery is out of scope
/// for the core; this is a stand-in implementation, not part of it).
pub struct UniformTopology {
    pub packages: u32,
    pub dies_per_package: u32,
    pub numas_per_die: u32,
    pub cores_per_numa: u32,
    pub threads_per_core: u32,
}

impl Default for UniformTopology {
    fn default() -> Self {
        UniformTopology { packages: 2, dies_per_package: 1, numas_per_die: 1, cores_per_numa: 8, threads_per_core: 2 }
    }
}

impl TopologyProvider for UniformTopology {
    fn packages(&self) -> Vec<u32> {
        (0..self.packages).collect()
    }
    fn dies(&self, package: u32) -> Vec<u32> {
        (0..self.dies_per_package).map(|i| package * self.dies_per_package + i).collect()
    }
    fn numa_nodes(&self, die: u32) -> Vec<u32> {
        (0..self.numas_per_die).map(|i| die * self.numas_per_die + i).collect()
    }
    fn cores(&self, numa: u32) -> Vec<u32> {
        (0..self.cores_per_numa).map(|i| numa * self.cores_per_numa + i).collect()
    }
    fn threads(&self, core: u32) -> Vec<u32> {
        (0..self.threads_per_core).map(|i| core * self.threads_per_core + i).collect()
    }
    fn offlined(&self) -> CpuSet {
        CpuSet::new()
    }
}

/// An in-memory container cache a CLI demo can populate directly; a real
/// deployment backs this with the CRI shim's own cache (spec §4.6).
#[derive(Default)]
pub struct MockContainerCache {
    containers: RwLock<BTreeMap<String, ContainerInfo>>,
}

impl MockContainerCache {
    pub fn insert(&self, info: ContainerInfo) {
        self.containers.write().insert(info.id.clone(), info);
    }

    pub fn remove(&self, id: &str) {
        self.containers.write().remove(id);
    }
}

impl ContainerCache for MockContainerCache {
    fn get(&self, id: &str) -> Option<ContainerInfo> {
        self.containers.read().get(id).cloned()
    }

    fn list(&self) -> Vec<ContainerInfo> {
        self.containers.read().values().cloned().collect()
    }
}

/// Logs what it would have tagged instead of writing to an RDT/cache
/// mechanism (spec §9: that mechanism is explicitly out of scope).
pub struct LoggingCpuClassApplier;

impl CpuClassApplier for LoggingCpuClassApplier {
    fn assign(&self, class: &str, cpus: &CpuSet) {
        log::debug!(target: "cpu_class_applier", "assign class {class:?} to {cpus}");
    }
}

/// Logs what it would have written to the container's cgroup instead of
/// touching one (spec §9: the cgroup writer is out of scope for the core).
pub struct LoggingPinner;

impl Pinner for LoggingPinner {
    fn set_cpuset_cpus(&self, container_id: &str, cpus: &CpuSet) {
        log::debug!(target: "pinner", "container {container_id:?}: cpuset.cpus = {cpus}");
    }

    fn set_cpuset_mems(&self, container_id: &str, mems: &CpuSet) {
        log::debug!(target: "pinner", "container {container_id:?}: cpuset.mems = {mems}");
    }

    fn set_cpu_shares(&self, container_id: &str, milli_cpu: u64) {
        log::debug!(target: "pinner", "container {container_id:?}: cpu.shares for {milli_cpu} milli-CPU");
    }
}
