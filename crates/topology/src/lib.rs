//! Immutable CPU tree and topology discovery interface.
//!
//! Built once at startup from a [`TopologyProvider`] and thereafter
//! read-only; it may be shared freely across the allocator and the
//! balloon policy (spec §5, §9).

mod level;
mod provider;
mod tree;

pub use level::TopologyLevel;
pub use provider::TopologyProvider;
pub use tree::{CpuTree, TreeNode, WalkControl};
