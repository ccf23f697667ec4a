//! `balloons-engined`: wires the policy engine to mock collaborators and
//! serves `/introspect` and `/metrics` for local exercising (spec §9's
//! "plumbing" named out of scope for the core, supplied here so the
//! workspace is a runnable crate rather than a library with no entry
//! point).

mod collaborators;
mod config;
mod error;
mod http;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parking_lot::RwLock;

use balloons::{BalloonPolicy, BalloonPolicyOptions};
use topology::CpuTree;

use crate::collaborators::{LoggingCpuClassApplier, LoggingPinner, MockContainerCache, UniformTopology};
use crate::config::BalloonPolicyOptionsRaw;
use crate::error::RuntimeError;
use crate::metrics::Metrics;

#[derive(Parser, Debug)]
#[command(about = "Balloon policy engine", long_about = None)]
struct Args {
    /// Path to a YAML or JSON policy config file; defaults are used if absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to serve /introspect and /metrics on.
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    listen: std::net::SocketAddr,
}

fn load_options(args: &Args) -> Result<BalloonPolicyOptions, RuntimeError> {
    match &args.config {
        Some(path) => BalloonPolicyOptionsRaw::from_file(path)?.into_options(),
        None => Ok(BalloonPolicyOptions::default()),
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env().init();

    let args = Args::parse();
    let options = match load_options(&args) {
        Ok(options) => options,
        Err(err) => {
            log::error!(target: "runtime", "failed to load config: {err}");
            std::process::exit(1);
        }
    };

    let topology = UniformTopology::default();
    let tree = CpuTree::discover(&topology);

    let policy = match BalloonPolicy::new(
        tree.clone(),
        options,
        "blnpolicy",
        "resource-policy.nri.io",
        Box::new(MockContainerCache::default()),
        Box::new(LoggingCpuClassApplier),
        Box::new(LoggingPinner),
    ) {
        Ok(policy) => policy,
        Err(err) => {
            log::error!(target: "runtime", "failed to start policy: {err}");
            std::process::exit(1);
        }
    };

    log::info!(
        target: "runtime",
        "started {:?}: allowed={}, reserved={}, free={}, {} balloons",
        policy.name(),
        policy.allowed_cpus(),
        policy.reserved_cpus(),
        policy.free_cpus(),
        policy.balloons().len()
    );

    let metrics = Metrics::new();
    metrics.update(&tree, &policy);
    let snapshot: http::Snapshot = Arc::new(RwLock::new(http::render(&tree, &policy)));

    let serve = http::serve(args.listen, snapshot, metrics.registry().clone());
    tokio::select! {
        _ = serve => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!(target: "runtime", "shutting down {:?}", policy.name());
        }
    }
}
