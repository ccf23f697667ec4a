//! Mock collaborators used by the `balloons-engined` binary so the
//! workspace is a runnable crate without a real CRI shim or sysfs tree
//! to talk to (spec §9: topology discovery, the container cache, the
//! CPU-class applier and the cgroup writer are all explicitly out of
//! scope for the core and left to be implemented elsewhere).

mod mocks;

pub use mocks::{LoggingCpuClassApplier, LoggingPinner, MockContainerCache, UniformTopology};
