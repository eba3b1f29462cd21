//! Plugin configuration document.

use std::collections::HashMap;
use std::fs;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use common::{parse_cpu, parse_memory};

use crate::models::Resources;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AutoscaleConfig {
    /// Bytes per memory slot, as a resource quantity (e.g. "1Gi"). Must be a
    /// positive integer.
    pub mem_slot_size: String,
    /// Whether a node missing `Capacity` may be hydrated from `Allocatable`.
    #[serde(default)]
    pub fallback_to_allocatable: bool,
    pub node_defaults: NodeConfig,
    /// Per-node overrides, keyed by node name.
    #[serde(default)]
    pub node_overrides: HashMap<String, NodeConfig>,
    /// Veto migration dispatch when a victim's 1-minute load average drifted
    /// further than this from its value at selection time.
    #[serde(default = "default_load_drift_threshold")]
    pub load_drift_threshold: f32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub cpu: ResourceConfig,
    pub memory: ResourceConfig,
    /// The `{cpu, mem}` ratio well-behaved agents keep their reservations
    /// aligned to.
    pub compute_unit: Resources,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Quantity pre-reserved for system overhead (e.g. "500m" or "1Gi").
    pub system: String,
    /// Fraction of the reservable amount above which migration is considered.
    pub watermark: f32,
}

fn default_load_drift_threshold() -> f32 {
    1.0
}

impl AutoscaleConfig {
    pub fn validate(&self) -> Result<()> {
        self.mem_slot_size_bytes()?;
        self.node_defaults
            .validate()
            .context("node_defaults is invalid")?;
        for (node, conf) in &self.node_overrides {
            conf.validate()
                .with_context(|| format!("override for node {node} is invalid"))?;
        }
        if self.load_drift_threshold < 0.0 {
            bail!(
                "load_drift_threshold must be non-negative, got {}",
                self.load_drift_threshold
            );
        }
        Ok(())
    }

    pub fn mem_slot_size_bytes(&self) -> Result<u64> {
        match parse_memory(&self.mem_slot_size) {
            Some(bytes) if bytes > 0 => Ok(bytes),
            _ => bail!(
                "mem_slot_size must be a positive memory quantity, got {:?}",
                self.mem_slot_size
            ),
        }
    }

    /// The configuration applying to a node: its override if present, the
    /// defaults otherwise.
    pub fn node_config(&self, node_name: &str) -> &NodeConfig {
        self.node_overrides
            .get(node_name)
            .unwrap_or(&self.node_defaults)
    }
}

impl NodeConfig {
    fn validate(&self) -> Result<()> {
        if parse_cpu(&self.cpu.system).is_none() {
            bail!("cpu.system is not a CPU quantity: {:?}", self.cpu.system);
        }
        if parse_memory(&self.memory.system).is_none() {
            bail!(
                "memory.system is not a memory quantity: {:?}",
                self.memory.system
            );
        }
        for (name, watermark) in [("cpu", self.cpu.watermark), ("memory", self.memory.watermark)] {
            if !(0.0..=1.0).contains(&watermark) {
                bail!("{name}.watermark must lie in [0, 1], got {watermark}");
            }
        }
        if self.compute_unit.vcpu == 0 || self.compute_unit.mem_slots == 0 {
            bail!(
                "compute_unit must have non-zero components, got {}",
                self.compute_unit
            );
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<AutoscaleConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let conf: AutoscaleConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    conf.validate()?;
    Ok(conf)
}
