//! The narrow external-interface traits the core consumes (spec §4.6).
//!
//! Topology discovery is out of scope for this crate (it lives in
//! [`topology::TopologyProvider`]); everything here is the rest of
//! §4.6's collaborator surface: the container-lifecycle cache, the
//! CPU-class applier, and the cgroup pinner. Keeping these in their own
//! crate (rather than alongside the engine or the runtime binary) lets
//! `balloons` depend only on trait objects and never on a concrete
//! transport, while `runtime` can implement them without `balloons`
//! having to depend on `runtime` in turn.

use std::collections::BTreeMap;

use cpuset::CpuSet;
use serde::{Deserialize, Serialize};

/// Quality-of-service class, as read from the container cache (spec
/// §4.6). Not otherwise interpreted by the core; classification and
/// fill methods key off namespace and annotations, not QoS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

/// A container as seen by the policy: the subset of pod/container cache
/// state (spec §4.6) the engine needs to classify, fill, and pin it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub pod_id: String,
    pub namespace: String,
    /// CPU request, in milli-CPU (spec §3, §4.5).
    pub milli_cpu: u64,
    pub qos_class: QosClass,
    /// Effective annotations visible to this container, including any
    /// pod-level annotations inherited down (spec §6's annotation
    /// surface; lookup key is `balloon.<policy>.<resmgr-namespace>`).
    pub annotations: BTreeMap<String, String>,
}

/// Lookup and enumeration surface over the container-lifecycle cache
/// (spec §4.6). Implemented elsewhere (typically backed by the CRI
/// shim's own container cache); the core never mutates it.
pub trait ContainerCache {
    fn get(&self, id: &str) -> Option<ContainerInfo>;
    fn list(&self) -> Vec<ContainerInfo>;
}

/// Records that a set of CPUs is to be treated under an opaque class
/// string (spec §4.6, §1: "it only tags a string 'class' per CPU"). The
/// meaning of `class` — RDT group, cpuset cgroup template, whatever — is
/// entirely up to the implementation; the core only ever calls this.
pub trait CpuClassApplier {
    fn assign(&self, class: &str, cpus: &CpuSet);
}

/// The cgroup writer that materializes the engine's placement decisions
/// (spec §1, §4.6). Best-effort from the engine's point of view (spec
/// §5): failures are logged by the implementation, never propagated
/// back into the engine's own control flow.
pub trait Pinner {
    fn set_cpuset_cpus(&self, container_id: &str, cpus: &CpuSet);
    fn set_cpuset_mems(&self, container_id: &str, mems: &CpuSet);
    fn set_cpu_shares(&self, container_id: &str, milli_cpu: u64);
}
