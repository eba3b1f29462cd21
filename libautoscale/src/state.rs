//! Process-wide plugin state and node hydration.
//!
//! One [`AutoscalePlugin`] exists per scheduler process. A single coarse
//! `tokio::sync::Mutex` serialises every read and write of the node and pod
//! tables; the only operation that releases it mid-flight is
//! [`AutoscalePlugin::get_or_fetch_node_state`], which drops the guard while
//! the node object is fetched from the orchestrator and reacquires it before
//! doing anything else.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use common::{Node, parse_cpu, parse_memory};

use crate::config::{AutoscaleConfig, ResourceConfig};
use crate::ledger::NodeResourceState;
use crate::models::{PodName, ResourceKind};
use crate::node::NodeState;

/// Read-only access to the orchestrator's node objects. The production
/// implementation lives in [`crate::with_xline`]; tests substitute an
/// in-memory map.
#[async_trait]
pub trait NodeFetcher: Send + Sync {
    async fn fetch_node(&self, name: &str) -> Result<Node>;
}

#[derive(Debug, Error)]
pub enum HydrateError {
    #[error("node {node} has no {kind} capacity")]
    MissingCapacity { node: String, kind: ResourceKind },
    #[error("node {node} has an unparseable {kind} quantity {value:?}")]
    BadQuantity {
        node: String,
        kind: ResourceKind,
        value: String,
    },
    #[error("node {node}: {what} {value} exceeds the 16-bit accounting range")]
    RangeOverflow {
        node: String,
        what: &'static str,
        value: u64,
    },
}

/// Everything the plugin knows, guarded by [`AutoscalePlugin`]'s mutex.
pub struct PluginState {
    pub conf: AutoscaleConfig,
    pub(crate) nodes: HashMap<String, NodeState>,
    /// Locator from pod to owning node; the pod entry itself lives in the
    /// node's tables.
    pub(crate) pod_nodes: HashMap<PodName, String>,
    max_total_reservable_cpu: u16,
    max_total_reservable_mem_slots: u16,
}

impl PluginState {
    pub fn new(conf: AutoscaleConfig) -> Self {
        Self {
            conf,
            nodes: HashMap::new(),
            pod_nodes: HashMap::new(),
            max_total_reservable_cpu: 0,
            max_total_reservable_mem_slots: 0,
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values()
    }

    /// The node a pod is accounted on, if the pod is known.
    pub fn node_of(&self, pod: &PodName) -> Option<&str> {
        self.pod_nodes.get(pod).map(String::as_str)
    }

    /// Largest `total - system` CPU across hydrated nodes, for cross-node
    /// score normalisation.
    pub fn max_total_reservable_cpu(&self) -> u16 {
        self.max_total_reservable_cpu
    }

    pub fn max_total_reservable_mem_slots(&self) -> u16 {
        self.max_total_reservable_mem_slots
    }

    pub(crate) fn mem_slot_size(&self) -> u64 {
        self.conf
            .mem_slot_size_bytes()
            .expect("mem_slot_size was validated at config load")
    }

    pub(crate) fn register_node(&mut self, node: NodeState) {
        self.max_total_reservable_cpu = self
            .max_total_reservable_cpu
            .max(node.cpu.total_reservable());
        self.max_total_reservable_mem_slots = self
            .max_total_reservable_mem_slots
            .max(node.mem.total_reservable());
        info!(
            "hydrated node {}: {} CPU ({} system), {} mem slots ({} system)",
            node.name, node.cpu.total, node.cpu.system, node.mem.total, node.mem.system
        );
        self.nodes.insert(node.name.clone(), node);
    }

    /// Builds a node entry from the orchestrator's node object and the
    /// configuration applying to it.
    pub(crate) fn node_state_from_api(&self, node: &Node) -> Result<NodeState, HydrateError> {
        let name = node.metadata.name.clone();
        let conf = self.conf.node_config(&name);
        let slot_size = self.mem_slot_size();

        let cpu_quantity = resource_quantity(
            node,
            "cpu",
            ResourceKind::Cpu,
            self.conf.fallback_to_allocatable,
        )?;
        let cpu_millis =
            parse_cpu(cpu_quantity).ok_or_else(|| HydrateError::BadQuantity {
                node: name.clone(),
                kind: ResourceKind::Cpu,
                value: cpu_quantity.to_string(),
            })?;
        // Truncate: a fraction of a core must not be advertised as available.
        let total_cpu = in_range(cpu_millis / 1000, &name, "total CPU")?;

        let mem_quantity = resource_quantity(
            node,
            "memory",
            ResourceKind::Memory,
            self.conf.fallback_to_allocatable,
        )?;
        let mem_bytes =
            parse_memory(mem_quantity).ok_or_else(|| HydrateError::BadQuantity {
                node: name.clone(),
                kind: ResourceKind::Memory,
                value: mem_quantity.to_string(),
            })?;
        let total_mem_slots = in_range(mem_bytes / slot_size, &name, "memory slot count")?;

        let cpu = derive_ledger(&name, ResourceKind::Cpu, total_cpu, &conf.cpu, slot_size)?;
        let mem = derive_ledger(
            &name,
            ResourceKind::Memory,
            total_mem_slots,
            &conf.memory,
            slot_size,
        )?;
        Ok(NodeState::new(name, cpu, mem, slot_size))
    }

    /// Applies a new configuration: `system` and `watermark` are recomputed on
    /// every node, reservations are left untouched. The `reserved <=
    /// total - system` preference may be violated until the agents converge.
    pub(crate) fn apply_config(&mut self, conf: AutoscaleConfig) {
        self.conf = conf;
        self.max_total_reservable_cpu = 0;
        self.max_total_reservable_mem_slots = 0;
        for node in self.nodes.values_mut() {
            let node_conf = self
                .conf
                .node_overrides
                .get(&node.name)
                .unwrap_or(&self.conf.node_defaults);
            for (kind, ledger, rc) in [
                (ResourceKind::Cpu, &mut node.cpu, &node_conf.cpu),
                (ResourceKind::Memory, &mut node.mem, &node_conf.memory),
            ] {
                match derive_ledger(&node.name, kind, ledger.total, rc, node.mem_slot_size) {
                    Ok(fresh) => {
                        ledger.system = fresh.system;
                        ledger.watermark = fresh.watermark;
                    }
                    Err(err) => warn!("keeping old {kind} config for node {}: {err}", node.name),
                }
                if ledger.reserved > ledger.total_reservable() {
                    warn!(
                        "node {} has {} {kind} reserved above the new reservable {} after \
                         config update",
                        node.name,
                        ledger.reserved,
                        ledger.total_reservable()
                    );
                }
            }
            self.max_total_reservable_cpu = self
                .max_total_reservable_cpu
                .max(node.cpu.total_reservable());
            self.max_total_reservable_mem_slots = self
                .max_total_reservable_mem_slots
                .max(node.mem.total_reservable());
        }
    }
}

fn resource_quantity<'a>(
    node: &'a Node,
    key: &str,
    kind: ResourceKind,
    fallback_to_allocatable: bool,
) -> Result<&'a str, HydrateError> {
    let capacity = node
        .status
        .capacity
        .as_ref()
        .and_then(|map| map.get(key));
    if let Some(value) = capacity {
        return Ok(value);
    }
    if fallback_to_allocatable {
        if let Some(value) = node
            .status
            .allocatable
            .as_ref()
            .and_then(|map| map.get(key))
        {
            debug!(
                "node {} has no {kind} capacity, using allocatable",
                node.metadata.name
            );
            return Ok(value);
        }
    }
    Err(HydrateError::MissingCapacity {
        node: node.metadata.name.clone(),
        kind,
    })
}

fn in_range(value: u64, node: &str, what: &'static str) -> Result<u16, HydrateError> {
    u16::try_from(value).map_err(|_| HydrateError::RangeOverflow {
        node: node.to_string(),
        what,
        value,
    })
}

fn derive_ledger(
    node: &str,
    kind: ResourceKind,
    total: u16,
    conf: &ResourceConfig,
    slot_size: u64,
) -> Result<NodeResourceState, HydrateError> {
    let system = match kind {
        ResourceKind::Cpu => parse_cpu(&conf.system).map(|millis| millis.div_ceil(1000)),
        ResourceKind::Memory => parse_memory(&conf.system).map(|bytes| bytes.div_ceil(slot_size)),
    }
    .ok_or_else(|| HydrateError::BadQuantity {
        node: node.to_string(),
        kind,
        value: conf.system.clone(),
    })?;
    let system = if system > u64::from(total) {
        warn!(
            "node {node}: configured {kind} system amount {system} exceeds total {total}, \
             clamping"
        );
        total
    } else {
        system as u16
    };
    let reservable = total - system;
    let watermark = (f64::from(reservable) * f64::from(conf.watermark)).floor() as u16;
    Ok(NodeResourceState {
        total,
        system,
        watermark,
        ..Default::default()
    })
}

/// The plugin: state behind the single coarse lock, plus the node fetcher.
pub struct AutoscalePlugin {
    pub(crate) state: Mutex<PluginState>,
    fetcher: Arc<dyn NodeFetcher>,
}

impl AutoscalePlugin {
    pub fn new(conf: AutoscaleConfig, fetcher: Arc<dyn NodeFetcher>) -> Result<Self> {
        conf.validate()?;
        Ok(Self {
            state: Mutex::new(PluginState::new(conf)),
            fetcher,
        })
    }

    /// Locks the plugin state for inspection. Dispatch entry points take the
    /// lock themselves; this is for debug surfaces and tests.
    pub async fn lock_state(&self) -> MutexGuard<'_, PluginState> {
        self.state.lock().await
    }

    /// Returns the state guard with an entry for `node_name` present,
    /// fetching the node from the orchestrator if needed.
    ///
    /// This is the only operation that releases the lock mid-transition: the
    /// guard is dropped around the fetch and reacquired before the node map
    /// is consulted again, so a concurrently installed entry wins over the
    /// fetched one. Callers must treat all previously observed state as
    /// refreshed.
    pub(crate) async fn get_or_fetch_node_state<'a>(
        &'a self,
        guard: MutexGuard<'a, PluginState>,
        node_name: &str,
    ) -> Result<MutexGuard<'a, PluginState>> {
        if guard.nodes.contains_key(node_name) {
            return Ok(guard);
        }
        drop(guard);
        let fetched = self.fetcher.fetch_node(node_name).await;
        let mut guard = self.state.lock().await;
        let node = fetched.with_context(|| format!("failed to fetch node {node_name}"))?;
        if guard.nodes.contains_key(node_name) {
            debug!("node {node_name} was hydrated concurrently");
            return Ok(guard);
        }
        let state = guard.node_state_from_api(&node)?;
        guard.register_node(state);
        Ok(guard)
    }
}
