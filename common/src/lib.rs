//! Pod and Node definitions shared by the autoscale scheduler plugin.
//!
//! The object model mirrors the subset of the orchestrator API the plugin
//! consumes: pod metadata with the autoscaling labels/annotations, container
//! resource requirements, and node capacity/allocatable maps. Quantities are
//! kept as strings on the wire and parsed with [`parse_cpu`] / [`parse_memory`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Label carrying the name of the virtual machine backing a pod. Pods without
/// it are accounted as ordinary (non-VM) pods.
pub const VM_NAME_LABEL: &str = "autoscaling/vm-name";
/// Label gating agent-driven scaling for a VM pod. Anything other than
/// `"false"` (including absence) means enabled.
pub const AUTOSCALING_ENABLED_LABEL: &str = "autoscaling/enabled";
/// Testing-only label forcing the pod to be selected for migration on its next
/// agent request.
pub const ALWAYS_MIGRATE_LABEL: &str = "autoscaling/testing-only-always-migrate";
/// Annotation holding the VM scaling bounds as JSON: `{"min": {...}, "max": {...}}`.
pub const BOUNDS_ANNOTATION: &str = "autoscaling/bounds";
/// Annotation holding the last permit granted by a previous scheduler as JSON:
/// `{"vcpu": N, "memSlots": M}`.
pub const LAST_PERMIT_ANNOTATION: &str = "autoscaling/last-permit";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTask {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub resources: Option<ResourcesRequirements>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesRequirements {
    #[serde(default)]
    pub requests: Option<ResourceList>,
    #[serde(default)]
    pub limits: Option<ResourceList>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub capacity: Option<HashMap<String, String>>,
    #[serde(default)]
    pub allocatable: Option<HashMap<String, String>>,
}

impl PodTask {
    /// The VM name label value, if this is a VM-bearing pod.
    pub fn vm_name(&self) -> Option<&str> {
        self.metadata.labels.get(VM_NAME_LABEL).map(String::as_str)
    }

    pub fn autoscaling_enabled(&self) -> bool {
        self.metadata
            .labels
            .get(AUTOSCALING_ENABLED_LABEL)
            .map(String::as_str)
            != Some("false")
    }

    pub fn always_migrate(&self) -> bool {
        self.metadata
            .labels
            .get(ALWAYS_MIGRATE_LABEL)
            .map(String::as_str)
            == Some("true")
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }
}

/// Parses a CPU quantity into millicores. `"250m"` is 250, `"2"` is 2000.
pub fn parse_cpu(cpu: &str) -> Option<u64> {
    let cpu = cpu.trim();
    if let Some(millis) = cpu.strip_suffix('m') {
        millis.parse::<u64>().ok()
    } else {
        let cores = cpu.parse::<f64>().ok()?;
        if !cores.is_finite() || cores < 0.0 {
            return None;
        }
        Some((cores * 1000.0).round() as u64)
    }
}

/// Parses a memory quantity into bytes. Accepts binary (`Ki`, `Mi`, `Gi`,
/// `Ti`) and decimal (`k`, `M`, `G`, `T`) suffixes as well as plain byte
/// counts.
pub fn parse_memory(memory: &str) -> Option<u64> {
    let memory = memory.trim();
    let suffixes: [(&str, u64); 8] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    for (suffix, multiplier) in suffixes {
        if let Some(value) = memory.strip_suffix(suffix) {
            return value.parse::<u64>().ok()?.checked_mul(multiplier);
        }
    }
    memory.parse::<u64>().ok()
}
