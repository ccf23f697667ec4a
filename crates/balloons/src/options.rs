//! Validated, policy-wide options (spec §6). Parsed from YAML/JSON by
//! `runtime::config` into this type; the policy itself never touches a
//! file or a raw/optional representation.

use cpuset::CpuSet;

use crate::definition::BalloonDefinition;

/// How the reserved CPU set is sized (spec §3, §4.5 startup).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservedCpuSpec {
    /// An explicit set, intersected with the allowed CPUs.
    Explicit(CpuSet),
    /// A milli-CPU quantity, rounded up to a CPU count and cut from the
    /// allowed CPUs via the priority allocator.
    MilliCpu(u64),
}

/// Top-level policy configuration (spec §6's table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalloonPolicyOptions {
    pub pin_cpu: bool,
    pub pin_memory: bool,
    pub idle_cpu_class: String,
    pub reserved_pool_namespaces: Vec<String>,
    pub allocator_topology_balancing: bool,
    pub prefer_spread_on_physical_cores: bool,
    pub balloon_types: Vec<BalloonDefinition>,
    pub reserved: ReservedCpuSpec,
    /// Configured allowed CPUs; `None` means "all CPUs the tree knows
    /// about" (spec §4.5 startup: "configured or all online minus
    /// offlined" — offlining is already excluded by [`topology::CpuTree`]
    /// construction, so this is the configured-subset half of that).
    pub allowed_cpus: Option<CpuSet>,
}

impl Default for BalloonPolicyOptions {
    fn default() -> Self {
        BalloonPolicyOptions {
            pin_cpu: true,
            pin_memory: true,
            idle_cpu_class: String::new(),
            reserved_pool_namespaces: Vec::new(),
            allocator_topology_balancing: false,
            prefer_spread_on_physical_cores: false,
            balloon_types: Vec::new(),
            reserved: ReservedCpuSpec::MilliCpu(0),
            allowed_cpus: None,
        }
    }
}
