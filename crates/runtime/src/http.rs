//! The `/introspect` HTTP endpoint (spec §6) and the `/metrics` endpoint
//! alongside it, served over a small `tokio` runtime with `warp`.

use std::sync::Arc;

use parking_lot::RwLock;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use warp::Filter;

use balloons::BalloonPolicy;
use cpuset::CpuSet;
use topology::{CpuTree, TopologyLevel, WalkControl};

/// Read side of the pre-serialized snapshot (spec §5): the engine
/// publishes a fresh string only when it holds the write side, after a
/// sync/allocate/release/config-notify call completes; the HTTP handler
/// never touches the engine itself.
pub type Snapshot = Arc<RwLock<String>>;

#[derive(Serialize)]
struct IntrospectDoc {
    policy: String,
    balloons: Vec<BalloonDoc>,
}

#[derive(Serialize)]
struct BalloonDoc {
    name: String,
    definition: String,
    cpus: String,
    packages: Vec<u32>,
    dies: Vec<u32>,
    numa_nodes: Vec<u32>,
    mem_nodes: String,
    shared_idle: String,
    requested_milli_cpu: u64,
    pods: Vec<PodDoc>,
}

#[derive(Serialize)]
struct PodDoc {
    pod_id: String,
    containers: Vec<String>,
}

/// Renders the current policy state to JSON (spec §6's introspection
/// field list). Called by the owner of the write lock, never by the
/// HTTP handler itself.
pub fn render(tree: &CpuTree, policy: &BalloonPolicy) -> String {
    let doc = IntrospectDoc {
        policy: policy.name().to_string(),
        balloons: (0..policy.balloons().len())
            .map(|idx| {
                let balloon = &policy.balloons()[idx];
                let def = balloon.definition();
                let mut pods: Vec<PodDoc> = balloon.pods().iter().map(|(pod_id, containers)| PodDoc { pod_id: pod_id.clone(), containers: containers.clone() }).collect();
                pods.sort_by(|a, b| a.pod_id.cmp(&b.pod_id));
                BalloonDoc {
                    name: balloon.pretty_name(),
                    definition: def.name.clone(),
                    cpus: balloon.cpus().to_string(),
                    packages: membership(tree, TopologyLevel::PACKAGE, balloon.cpus()),
                    dies: membership(tree, TopologyLevel::DIE, balloon.cpus()),
                    numa_nodes: membership(tree, TopologyLevel::NUMA, balloon.cpus()),
                    mem_nodes: balloon.mem_nodes().to_string(),
                    shared_idle: balloon.shared_idle().to_string(),
                    requested_milli_cpu: policy.balloon_requested_milli_cpu(idx),
                    pods,
                }
            })
            .collect(),
    };
    serde_json::to_string_pretty(&doc).expect("introspection doc is always representable as JSON")
}

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

/// Serves `/introspect` (the snapshot) and `/metrics` (the Prometheus
/// text exposition format) until the process exits.
pub async fn serve(addr: std::net::SocketAddr, snapshot: Snapshot, registry: Registry) {
    let introspect = warp::path("introspect").and(warp::get()).map(move || {
        let body = snapshot.read().clone();
        warp::reply::with_header(body, "content-type", "application/json")
    });

    let metrics = warp::path("metrics").and(warp::get()).map(move || {
        let encoder = TextEncoder::new();
        let families = registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).expect("well-formed metric families always encode");
        warp::reply::with_header(buf, "content-type", encoder.format_type())
    });

    log::info!(target: "runtime_http", "serving /introspect and /metrics on {addr}");
    warp::serve(introspect.or(metrics)).run(addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_finds_the_touched_packages() {
        struct SinglePackage;
        impl topology::TopologyProvider for SinglePackage {
            fn packages(&self) -> Vec<u32> {
                vec![0, 1]
            }
            fn dies(&self, package: u32) -> Vec<u32> {
                vec![package]
            }
            fn numa_nodes(&self, die: u32) -> Vec<u32> {
                vec![die]
            }
            fn cores(&self, numa: u32) -> Vec<u32> {
                vec![numa * 2, numa * 2 + 1]
            }
            fn threads(&self, core: u32) -> Vec<u32> {
                vec![core]
            }
            fn offlined(&self) -> CpuSet {
                CpuSet::new()
            }
        }
        let tree = CpuTree::discover(&SinglePackage);
        let cpus = CpuSet::from_ids([0]);
        assert_eq!(membership(&tree, TopologyLevel::PACKAGE, &cpus), vec![0]);
    }
}
