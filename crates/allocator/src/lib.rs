//! CPU allocators: the topology-scoring tree allocator (spec §4.2) and
//! the simpler priority allocator (spec §4.3).
//!
//! Both only ever *recommend* or *take* CPUs out of sets the caller owns;
//! neither mutates `currentCpus`/`freeCpus` itself (spec §4.2).

mod error;
mod node_attrs;
mod priority;
mod tree_allocator;

pub use error::AllocatorError;
pub use priority::{Priority, PriorityAllocator};
pub use tree_allocator::{TreeAllocator, TreeAllocatorOptions};
