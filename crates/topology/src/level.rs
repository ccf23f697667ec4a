//! Topology level ranks.

use serde::{Deserialize, Serialize};

/// An enumerated rank: `system < package < die < numa < core < thread`.
///
/// Represented as an ordered integer rather than a plain six-variant enum
/// so that [`crate::CpuTree::split_level`] can insert a synthetic layer
/// strictly between two canonical levels (used to implement
/// `preferSpreadOnPhysicalCores`, see spec §4.1) while keeping the
/// "child's level is strictly deeper than its parent's" invariant a
/// simple integer comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopologyLevel(u16);

impl TopologyLevel {
    pub const SYSTEM: TopologyLevel = TopologyLevel(0);
    pub const PACKAGE: TopologyLevel = TopologyLevel(100);
    pub const DIE: TopologyLevel = TopologyLevel(200);
    pub const NUMA: TopologyLevel = TopologyLevel(300);
    pub const CORE: TopologyLevel = TopologyLevel(400);
    pub const THREAD: TopologyLevel = TopologyLevel(500);

    /// A human-readable label for debugging and metrics; canonical levels
    /// get their spec name, synthetic split layers get `"split"`.
    pub fn label(self) -> &'static str {
        match self {
            TopologyLevel::SYSTEM => "system",
            TopologyLevel::PACKAGE => "package",
            TopologyLevel::DIE => "die",
            TopologyLevel::NUMA => "numa",
            TopologyLevel::CORE => "core",
            TopologyLevel::THREAD => "thread",
            _ => "split",
        }
    }

    /// A rank strictly deeper than `self` and strictly shallower than the
    /// next canonical level, used when inserting a synthetic split layer.
    pub fn synthetic_child(self) -> TopologyLevel {
        TopologyLevel(self.0 + 50)
    }

    /// Parses one of the six canonical level names (as used in
    /// configuration, e.g. `shareIdleCpusInSame: numa`). Synthetic split
    /// levels have no name and are never accepted here.
    pub fn from_label(label: &str) -> Option<TopologyLevel> {
        match label {
            "system" => Some(TopologyLevel::SYSTEM),
            "package" => Some(TopologyLevel::PACKAGE),
            "die" => Some(TopologyLevel::DIE),
            "numa" => Some(TopologyLevel::NUMA),
            "core" => Some(TopologyLevel::CORE),
            "thread" => Some(TopologyLevel::THREAD),
            _ => None,
        }
    }
}

impl std::fmt::Display for TopologyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order() {
        assert!(TopologyLevel::SYSTEM < TopologyLevel::PACKAGE);
        assert!(TopologyLevel::PACKAGE < TopologyLevel::DIE);
        assert!(TopologyLevel::DIE < TopologyLevel::NUMA);
        assert!(TopologyLevel::NUMA < TopologyLevel::CORE);
        assert!(TopologyLevel::CORE < TopologyLevel::THREAD);
    }

    #[test]
    fn synthetic_child_is_strictly_between() {
        let synthetic = TopologyLevel::NUMA.synthetic_child();
        assert!(synthetic > TopologyLevel::NUMA);
        assert!(synthetic < TopologyLevel::CORE);
    }
}
