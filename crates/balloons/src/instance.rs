//! Balloon instances: a named, elastic pool of CPUs and the containers
//! pinned to it (spec §3, §4.4).

use std::collections::BTreeMap;
use std::rc::Rc;

use cpuset::CpuSet;

use crate::definition::BalloonDefinition;

/// A named, elastic pool with a CPU set, closest memory nodes, and an
/// index of assigned `{pod -> [containers]}` (spec §3).
///
/// Passive container: no logic beyond accessors (spec §4.4). Resize,
/// fill-method selection, shared-idle bookkeeping, and pinning all live
/// on [`crate::policy::BalloonPolicy`]; this type only stores state and
/// answers questions about it.
pub struct BalloonInstance {
    /// The definition this instance was created from. Definitions are
    /// copied on reconfig (spec §5, §9) so that an instance still
    /// holding an old `Rc` continues to see a consistent view until the
    /// policy resynchronizes it.
    definition: Rc<BalloonDefinition>,
    /// Stable per-definition instance index (spec §3); `0`/`1` are
    /// reserved for the two built-in balloons across the whole policy.
    index: u32,
    cpus: CpuSet,
    mem_nodes: CpuSet,
    shared_idle: CpuSet,
    /// `pod id -> ordered container ids`, insertion order preserved by
    /// `Vec` (iteration order of this map is never relied on for
    /// anything ordering-sensitive, per spec §9; callers that need a
    /// deterministic listing sort explicitly).
    pods: BTreeMap<String, Vec<String>>,
}

impl BalloonInstance {
    pub fn new(definition: Rc<BalloonDefinition>, index: u32, cpus: CpuSet) -> Self {
        BalloonInstance {
            definition,
            index,
            cpus,
            mem_nodes: CpuSet::new(),
            shared_idle: CpuSet::new(),
            pods: BTreeMap::new(),
        }
    }

    pub fn definition(&self) -> &Rc<BalloonDefinition> {
        &self.definition
    }

    pub fn set_definition(&mut self, definition: Rc<BalloonDefinition>) {
        self.definition = definition;
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn cpus(&self) -> &CpuSet {
        &self.cpus
    }

    pub fn set_cpus(&mut self, cpus: CpuSet) {
        self.cpus = cpus;
    }

    pub fn mem_nodes(&self) -> &CpuSet {
        &self.mem_nodes
    }

    pub fn set_mem_nodes(&mut self, mem_nodes: CpuSet) {
        self.mem_nodes = mem_nodes;
    }

    pub fn shared_idle(&self) -> &CpuSet {
        &self.shared_idle
    }

    pub fn set_shared_idle(&mut self, shared_idle: CpuSet) {
        self.shared_idle = shared_idle;
    }

    /// The set containers are actually pinned to: owned CPUs plus
    /// whatever idle CPUs are currently shared in (spec §4.5).
    pub fn pinned_cpus(&self) -> CpuSet {
        self.cpus.union(&self.shared_idle)
    }

    pub fn pods(&self) -> &BTreeMap<String, Vec<String>> {
        &self.pods
    }

    pub fn is_empty(&self) -> bool {
        self.pods.values().all(|containers| containers.is_empty())
    }

    pub fn container_count(&self) -> usize {
        self.pods.values().map(|c| c.len()).sum()
    }

    /// All container ids across every pod, pod-then-insertion order.
    pub fn containers(&self) -> Vec<String> {
        self.pods.values().flatten().cloned().collect()
    }

    pub fn has_pod(&self, pod_id: &str) -> bool {
        self.pods.contains_key(pod_id)
    }

    pub fn add_container(&mut self, pod_id: &str, container_id: &str) {
        self.pods.entry(pod_id.to_string()).or_default().push(container_id.to_string());
    }

    /// Removes a container; drops the pod entry entirely once its last
    /// container leaves, so `is_empty` does not need to special-case
    /// empty-but-present pod entries.
    pub fn remove_container(&mut self, container_id: &str) -> bool {
        let mut removed = false;
        self.pods.retain(|_, containers| {
            let before = containers.len();
            containers.retain(|c| c != container_id);
            removed |= containers.len() != before;
            !containers.is_empty()
        });
        removed
    }

    /// `|cpus| * 1000` (spec §4.4).
    pub fn avail_milli_cpu(&self) -> u64 {
        self.cpus.len() as u64 * 1000
    }

    /// Capacity if inflated to `maxCpus`, or `None` if unlimited.
    pub fn max_avail_milli_cpu(&self) -> Option<u64> {
        self.definition.max_cpus_bound().map(|max| max as u64 * 1000)
    }

    /// A human-readable `definition[index]` form used in introspection
    /// and logging (spec §4.4 "pretty name").
    pub fn pretty_name(&self) -> String {
        format!("{}[{}]", self.definition.name, self.index)
    }
}
