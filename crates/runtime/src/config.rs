//! Configuration loading (spec §6), following the `*Raw`-struct pattern
//! `dslab-iaas::core::config::SimulationConfig` uses: every field
//! optional on the wire, defaulted and validated into the concrete type
//! the engine actually runs with.

use std::path::Path;

use serde::{Deserialize, Serialize};

use balloons::{AllocatorPriority, BalloonDefinition, BalloonPolicyOptions, ReservedCpuSpec};
use cpuset::CpuSet;
use topology::TopologyLevel;

use crate::error::RuntimeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalloonDefinitionRaw {
    name: String,
    min_cpus: Option<u32>,
    max_cpus: Option<u32>,
    min_balloons: Option<u32>,
    max_balloons: Option<u32>,
    priority: Option<AllocatorPriority>,
    cpu_class: Option<String>,
    namespaces: Option<Vec<String>>,
    prefer_spreading_pods: Option<bool>,
    prefer_per_namespace_balloon: Option<bool>,
    prefer_new_balloons: Option<bool>,
    prefer_spread_on_physical_cores: Option<bool>,
    allocator_topology_balancing: Option<bool>,
    /// One of the six canonical level names (`"numa"`, `"package"`, ...),
    /// not the raw [`TopologyLevel`] rank (spec §6: config is
    /// human-authored YAML/JSON, not a dump of internal integers).
    share_idle_cpus_in_same: Option<String>,
}

impl BalloonDefinitionRaw {
    fn try_into_definition(self) -> Result<BalloonDefinition, RuntimeError> {
        let share_idle_cpus_in_same = self
            .share_idle_cpus_in_same
            .map(|label| TopologyLevel::from_label(&label).ok_or_else(|| RuntimeError::ConfigParse(format!("{}: unknown topology level {label:?}", self.name))))
            .transpose()?;
        Ok(BalloonDefinition {
            name: self.name,
            min_cpus: self.min_cpus.unwrap_or(0),
            max_cpus: self.max_cpus.unwrap_or(0),
            min_balloons: self.min_balloons.unwrap_or(0),
            max_balloons: self.max_balloons.unwrap_or(0),
            priority: self.priority.unwrap_or_default(),
            cpu_class: self.cpu_class.unwrap_or_default(),
            namespaces: self.namespaces.unwrap_or_default(),
            prefer_spreading_pods: self.prefer_spreading_pods.unwrap_or(false),
            prefer_per_namespace_balloon: self.prefer_per_namespace_balloon.unwrap_or(false),
            prefer_new_balloons: self.prefer_new_balloons.unwrap_or(false),
            prefer_spread_on_physical_cores: self.prefer_spread_on_physical_cores,
            allocator_topology_balancing: self.allocator_topology_balancing,
            share_idle_cpus_in_same,
        })
    }
}

/// How the reserved pool is sized on the wire: either an explicit CPU
/// range string or a milli-CPU quantity, never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReservedRaw {
    cpus: Option<String>,
    milli_cpu: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalloonPolicyOptionsRaw {
    #[serde(rename = "pinCPU")]
    pin_cpu: Option<bool>,
    pin_memory: Option<bool>,
    idle_cpu_class: Option<String>,
    reserved_pool_namespaces: Option<Vec<String>>,
    allocator_topology_balancing: Option<bool>,
    prefer_spread_on_physical_cores: Option<bool>,
    balloon_types: Option<Vec<BalloonDefinitionRaw>>,
    reserved: Option<ReservedRaw>,
    allowed_cpus: Option<String>,
}

impl BalloonPolicyOptionsRaw {
    /// Parses a config file, dispatching on extension (`.json` vs.
    /// anything else treated as YAML, matching `SimulationConfig::from_file`'s
    /// single-format assumption generalized to the two formats spec §6
    /// actually names).
    pub fn from_file(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path).map_err(|err| RuntimeError::ConfigRead { path: path.display().to_string(), source: err })?;
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            serde_json::from_str(&text).map_err(|err| RuntimeError::ConfigParse(err.to_string()))
        } else {
            serde_yaml::from_str(&text).map_err(|err| RuntimeError::ConfigParse(err.to_string()))
        }
    }

    pub fn into_options(self) -> Result<BalloonPolicyOptions, RuntimeError> {
        let reserved = match self.reserved {
            Some(ReservedRaw { cpus: Some(cpus), milli_cpu: Some(_) }) => {
                return Err(RuntimeError::ConfigParse(format!("reserved: both cpus and milliCpu given (cpus={cpus:?})")));
            }
            Some(ReservedRaw { cpus: Some(cpus), .. }) => {
                let set: CpuSet = cpus.parse().map_err(|err| RuntimeError::ConfigParse(format!("reserved.cpus: {err}")))?;
                ReservedCpuSpec::Explicit(set)
            }
            Some(ReservedRaw { milli_cpu: Some(milli_cpu), .. }) => ReservedCpuSpec::MilliCpu(milli_cpu),
            _ => ReservedCpuSpec::MilliCpu(0),
        };

        let allowed_cpus = self
            .allowed_cpus
            .map(|s| s.parse::<CpuSet>().map_err(|err| RuntimeError::ConfigParse(format!("allowedCpus: {err}"))))
            .transpose()?;

        Ok(BalloonPolicyOptions {
            pin_cpu: self.pin_cpu.unwrap_or(true),
            pin_memory: self.pin_memory.unwrap_or(true),
            idle_cpu_class: self.idle_cpu_class.unwrap_or_default(),
            reserved_pool_namespaces: self.reserved_pool_namespaces.unwrap_or_default(),
            allocator_topology_balancing: self.allocator_topology_balancing.unwrap_or(false),
            prefer_spread_on_physical_cores: self.prefer_spread_on_physical_cores.unwrap_or(false),
            balloon_types: self
                .balloon_types
                .unwrap_or_default()
                .into_iter()
                .map(BalloonDefinitionRaw::try_into_definition)
                .collect::<Result<Vec<_>, _>>()?,
            reserved,
            allowed_cpus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_everything_absent() {
        let raw: BalloonPolicyOptionsRaw = serde_yaml::from_str("{}").unwrap();
        let options = raw.into_options().unwrap();
        assert!(options.pin_cpu);
        assert!(options.pin_memory);
        assert!(options.balloon_types.is_empty());
        assert_eq!(options.reserved, ReservedCpuSpec::MilliCpu(0));
    }

    #[test]
    fn parses_a_populated_yaml_document() {
        let yaml = r#"
pinCPU: false
idleCpuClass: idle
reservedPoolNamespaces: ["kube-*"]
reserved:
  milliCpu: 2000
balloonTypes:
  - name: batch
    minCpus: 2
    maxCpus: 16
    maxBalloons: 4
    preferNewBalloons: true
    namespaces: ["batch-*"]
"#;
        let raw: BalloonPolicyOptionsRaw = serde_yaml::from_str(yaml).unwrap();
        let options = raw.into_options().unwrap();
        assert!(!options.pin_cpu);
        assert_eq!(options.idle_cpu_class, "idle");
        assert_eq!(options.reserved, ReservedCpuSpec::MilliCpu(2000));
        assert_eq!(options.balloon_types.len(), 1);
        assert_eq!(options.balloon_types[0].max_cpus, 16);
        assert!(options.balloon_types[0].prefer_new_balloons);
    }

    #[test]
    fn rejects_both_reserved_forms_at_once() {
        let yaml = "reserved:\n  cpus: \"0-1\"\n  milliCpu: 1000\n";
        let raw: BalloonPolicyOptionsRaw = serde_yaml::from_str(yaml).unwrap();
        assert!(raw.into_options().is_err());
    }
}
