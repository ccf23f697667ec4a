//! Balloon definitions: the named template a balloon instance is created
//! from (spec §3).

use allocator::Priority;
use serde::{Deserialize, Serialize};
use topology::TopologyLevel;

/// Name of the built-in balloon that always holds reserved CPUs and
/// system/infrastructure containers (spec §3, §4.5).
pub const RESERVED_BALLOON: &str = "reserved";
/// Name of the built-in catch-all balloon (spec §3, §4.5).
pub const DEFAULT_BALLOON: &str = "default";

/// An allocator priority level, carried per balloon definition (spec §3).
///
/// Maps onto [`allocator::Priority`]'s two boolean flags: `high` tries
/// whole idle packages first, `normal` whole idle cores, `low`/`none`
/// fall straight to thread-by-thread selection (spec §4.3's priority
/// flags are the `idlePackages`/`idleCores` pair; this is the chosen
/// mapping from the definition-level vocabulary onto them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorPriority {
    High,
    Normal,
    Low,
    None,
}

impl Default for AllocatorPriority {
    fn default() -> Self {
        AllocatorPriority::None
    }
}

impl From<AllocatorPriority> for Priority {
    fn from(p: AllocatorPriority) -> Self {
        match p {
            AllocatorPriority::High => Priority::PACKAGES,
            AllocatorPriority::Normal => Priority::CORES,
            AllocatorPriority::Low | AllocatorPriority::None => Priority::NONE,
        }
    }
}

/// The template zero or more [`crate::BalloonInstance`]s are created from
/// (spec §3). `maxCpus`/`maxBalloons` of `0` mean unlimited, per spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalloonDefinition {
    pub name: String,
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub min_balloons: u32,
    pub max_balloons: u32,
    pub priority: AllocatorPriority,
    pub cpu_class: String,
    /// Namespace glob patterns (spec §4.5 classification step 3).
    pub namespaces: Vec<String>,
    pub prefer_spreading_pods: bool,
    pub prefer_per_namespace_balloon: bool,
    pub prefer_new_balloons: bool,
    /// `None` means "use the policy-wide default" (spec §9: tagged
    /// variants over `*bool` override pointers).
    pub prefer_spread_on_physical_cores: Option<bool>,
    pub allocator_topology_balancing: Option<bool>,
    pub share_idle_cpus_in_same: Option<TopologyLevel>,
}

impl BalloonDefinition {
    /// A finite `maxCpus`, or `None` when unlimited (`0`).
    pub fn max_cpus_bound(&self) -> Option<u32> {
        if self.max_cpus == 0 {
            None
        } else {
            Some(self.max_cpus)
        }
    }

    /// A finite `maxBalloons`, or `None` when unlimited (`0`).
    pub fn max_balloons_bound(&self) -> Option<u32> {
        if self.max_balloons == 0 {
            None
        } else {
            Some(self.max_balloons)
        }
    }

    /// Clamps a requested CPU count into `[minCpus, maxCpus]`.
    pub fn clamp_cpus(&self, cpus: u32) -> u32 {
        let cpus = cpus.max(self.min_cpus);
        match self.max_cpus_bound() {
            Some(max) => cpus.min(max),
            None => cpus,
        }
    }

    pub fn reserved() -> Self {
        BalloonDefinition {
            name: RESERVED_BALLOON.to_string(),
            min_cpus: 0,
            max_cpus: 0,
            min_balloons: 1,
            max_balloons: 1,
            priority: AllocatorPriority::None,
            cpu_class: String::new(),
            namespaces: Vec::new(),
            prefer_spreading_pods: true,
            prefer_per_namespace_balloon: false,
            prefer_new_balloons: false,
            prefer_spread_on_physical_cores: None,
            allocator_topology_balancing: None,
            share_idle_cpus_in_same: None,
        }
    }

    pub fn default_balloon() -> Self {
        BalloonDefinition {
            name: DEFAULT_BALLOON.to_string(),
            min_cpus: 0,
            max_cpus: 0,
            min_balloons: 1,
            max_balloons: 1,
            priority: AllocatorPriority::None,
            cpu_class: String::new(),
            namespaces: vec!["*".to_string()],
            prefer_spreading_pods: true,
            prefer_per_namespace_balloon: false,
            prefer_new_balloons: false,
            prefer_spread_on_physical_cores: None,
            allocator_topology_balancing: None,
            share_idle_cpus_in_same: None,
        }
    }
}
