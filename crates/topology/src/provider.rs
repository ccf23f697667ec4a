//! The sysfs topology discovery collaborator consumed by the core.
//!
//! Discovery itself is out of scope for this system (spec §1): the core
//! only ever sees the narrow interface below, implemented elsewhere
//! (typically by walking `/sys/devices/system/{cpu,node}` at startup) and
//! handed to [`crate::CpuTree::discover`].

use cpuset::CpuId;

/// Ordered hardware topology as seen by the host.
///
/// Every method returns ids in the order they should appear as siblings in
/// the tree: the depth-first walk (spec §4.1) must be deterministic, so
/// implementations are expected to return a stable order (e.g. ascending
/// id) rather than relying on the core to sort.
pub trait TopologyProvider {
    /// Ordered package ids.
    fn packages(&self) -> Vec<CpuId>;
    /// Ordered die ids belonging to a package.
    fn dies(&self, package: CpuId) -> Vec<CpuId>;
    /// Ordered NUMA node ids belonging to a die.
    fn numa_nodes(&self, die: CpuId) -> Vec<CpuId>;
    /// Ordered physical core ids belonging to a NUMA node.
    fn cores(&self, numa: CpuId) -> Vec<CpuId>;
    /// Ordered logical CPU (thread) ids belonging to a physical core.
    fn threads(&self, core: CpuId) -> Vec<CpuId>;
    /// CPUs taken offline by the host; excluded while building the tree.
    fn offlined(&self) -> cpuset::CpuSet;
}
