//! Prometheus gauges describing every balloon (spec §6's Metrics table).
//!
//! `prometheus`'s label-vector idiom does not fit free-text lists well,
//! so the descriptive fields (CPU set, membership lists, container
//! names) ride on a single always-`1` `balloon_info` gauge the way
//! `kube_pod_info`-style exporters attach metadata to an info metric;
//! the numeric fields get their own gauge vectors.

use prometheus::{GaugeVec, Opts, Registry};
use topology::{CpuTree, TopologyLevel, WalkControl};

use balloons::BalloonPolicy;
use cpuset::CpuSet;

pub struct Metrics {
    registry: Registry,
    info: GaugeVec,
    min_cpus: GaugeVec,
    max_cpus: GaugeVec,
    cpu_count: GaugeVec,
    package_count: GaugeVec,
    die_count: GaugeVec,
    numa_count: GaugeVec,
    requested_milli_cpu: GaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let info = GaugeVec::new(
            Opts::new("balloon_info", "Static, per-balloon descriptive fields; value is always 1"),
            &["balloon", "definition", "cpu_class", "cpu_set", "packages", "dies", "numa_nodes", "shared_idle", "containers"],
        )
        .expect("static metric definition");
        let min_cpus = GaugeVec::new(Opts::new("balloon_min_cpus", "Configured minCpus"), &["balloon", "definition"]).expect("static metric definition");
        let max_cpus = GaugeVec::new(Opts::new("balloon_max_cpus", "Configured maxCpus (0 shown as -1: unlimited)"), &["balloon", "definition"]).expect("static metric definition");
        let cpu_count = GaugeVec::new(Opts::new("balloon_cpu_count", "Current exclusive CPU count"), &["balloon", "definition"]).expect("static metric definition");
        let package_count = GaugeVec::new(Opts::new("balloon_package_count", "Number of packages the balloon's CPUs touch"), &["balloon", "definition"]).expect("static metric definition");
        let die_count = GaugeVec::new(Opts::new("balloon_die_count", "Number of dies the balloon's CPUs touch"), &["balloon", "definition"]).expect("static metric definition");
        let numa_count = GaugeVec::new(Opts::new("balloon_numa_count", "Number of NUMA nodes the balloon's CPUs touch"), &["balloon", "definition"]).expect("static metric definition");
        let requested_milli_cpu = GaugeVec::new(Opts::new("balloon_requested_milli_cpu", "Sum of assigned containers' milli-CPU requests"), &["balloon", "definition"]).expect("static metric definition");

        for collector in [&info, &min_cpus, &max_cpus, &cpu_count, &package_count, &die_count, &numa_count, &requested_milli_cpu] {
            registry.register(Box::new(collector.clone())).expect("metric names are unique and registered once");
        }

        Metrics { registry, info, min_cpus, max_cpus, cpu_count, package_count, die_count, numa_count, requested_milli_cpu }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Repopulates every series from the policy's current state. Resets
    /// first so balloons that were deleted since the last snapshot don't
    /// leave stale series behind.
    pub fn update(&self, tree: &CpuTree, policy: &BalloonPolicy) {
        for collector in [&self.info, &self.min_cpus, &self.max_cpus, &self.cpu_count, &self.package_count, &self.die_count, &self.numa_count, &self.requested_milli_cpu] {
            collector.reset();
        }

        for index in 0..policy.balloons().len() {
            self.record_balloon(tree, policy, index);
        }
    }

    fn record_balloon(&self, tree: &CpuTree, policy: &BalloonPolicy, index: usize) {
        let balloon = &policy.balloons()[index];
        let def = balloon.definition();
        let name = balloon.pretty_name();
        let labels = [name.as_str(), def.name.as_str()];

        let packages = membership(tree, TopologyLevel::PACKAGE, balloon.cpus());
        let dies = membership(tree, TopologyLevel::DIE, balloon.cpus());
        let numa_nodes = membership(tree, TopologyLevel::NUMA, balloon.cpus());
        let requested_milli_cpu = policy.balloon_requested_milli_cpu(index);

        self.info
            .with_label_values(&[
                &name,
                &def.name,
                &def.cpu_class,
                &balloon.cpus().to_string(),
                &join(&packages),
                &join(&dies),
                &join(&numa_nodes),
                &balloon.shared_idle().to_string(),
                &balloon.containers().join(","),
            ])
            .set(1.0);
        self.min_cpus.with_label_values(&labels).set(def.min_cpus as f64);
        self.max_cpus.with_label_values(&labels).set(def.max_cpus_bound().map(|v| v as f64).unwrap_or(-1.0));
        self.cpu_count.with_label_values(&labels).set(balloon.cpus().len() as f64);
        self.package_count.with_label_values(&labels).set(packages.len() as f64);
        self.die_count.with_label_values(&labels).set(dies.len() as f64);
        self.numa_count.with_label_values(&labels).set(numa_nodes.len() as f64);
        self.requested_milli_cpu.with_label_values(&labels).set(requested_milli_cpu as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sorted ids of every node at `level` whose CPU set intersects `cpus`.
fn membership(tree: &CpuTree, level: TopologyLevel, cpus: &CpuSet) -> Vec<u32> {
    let mut ids = Vec::new();
    tree.walk(&mut |node| {
        if node.level() == level {
            if !node.cpus().intersection(cpus).is_empty() {
                ids.push(node.id());
            }
            return WalkControl::SkipChildren;
        }
        WalkControl::Continue
    });
    ids.sort_unstable();
    ids
}

fn join(ids: &[u32]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}
