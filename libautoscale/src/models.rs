use std::fmt;

use serde::{Deserialize, Serialize};

/// A `{vcpu, memory-slot}` pair in the plugin's accounting units.
///
/// Used for agent requests, permits, scaling bounds and compute units alike.
/// CPU is counted in whole cores, memory in fixed-size slots whose byte size
/// comes from the configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    pub vcpu: u16,
    pub mem_slots: u16,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        vcpu: 0,
        mem_slots: 0,
    };

    pub fn new(vcpu: u16, mem_slots: u16) -> Self {
        Self { vcpu, mem_slots }
    }

    pub fn get(&self, kind: ResourceKind) -> u16 {
        match kind {
            ResourceKind::Cpu => self.vcpu,
            ResourceKind::Memory => self.mem_slots,
        }
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} CPU / {} mem slots", self.vcpu, self.mem_slots)
    }
}

/// Tag distinguishing the two ledger instances a pod and node carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "CPU"),
            ResourceKind::Memory => write!(f, "memory"),
        }
    }
}

/// Namespaced pod name, the identity pods are keyed by everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodName {
    pub namespace: String,
    pub name: String,
}

impl PodName {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for PodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Most recent metrics reported by a VM's autoscaling agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmMetrics {
    pub load_avg_1min: f32,
    pub load_avg_5min: f32,
    pub memory_usage_bytes: u64,
}

/// Scaling bounds carried on a VM pod's bounds annotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingBounds {
    pub min: Resources,
    pub max: Resources,
}

/// A resource-change request from a VM's autoscaling agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub pod: PodName,
    /// The reservation the agent would like to end up with.
    pub resources: Resources,
    /// The last permit a (possibly previous) scheduler granted, if the agent
    /// remembers one.
    #[serde(default)]
    pub last_permit: Option<Resources>,
    pub metrics: VmMetrics,
    /// The `{cpu, mem}` ratio the agent scales in. Increases are quantised
    /// down to multiples of its components.
    pub compute_unit: Resources,
}

/// Reply to an agent request: the resulting reservation, and whether the
/// plugin decided to migrate the VM away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitResponse {
    pub permit: Resources,
    pub migrate: bool,
}
