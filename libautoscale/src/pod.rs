//! Per-pod state tracked by the plugin.

use std::cmp::Ordering;

use crate::ledger::PodResourceState;
use crate::migration::MigrationState;
use crate::models::{PodName, Resources, VmMetrics};

/// Ledger and identity of a VM-bearing pod.
#[derive(Debug, Clone)]
pub struct PodState {
    pub name: PodName,
    /// Value of the VM name label the pod carries.
    pub vm_name: String,
    /// Name of the owning node entry. A lookup handle, not ownership.
    pub node_name: String,
    pub cpu: PodResourceState,
    pub mem: PodResourceState,
    pub autoscaling_enabled: bool,
    /// Testing-only: migrate on the next agent request regardless of pressure.
    pub always_migrate: bool,
    /// Whether the agent has contacted this scheduler at least once.
    pub received_contact: bool,
    /// Compute unit observed on the most recent agent request.
    pub most_recent_compute_unit: Option<Resources>,
    pub metrics: Option<VmMetrics>,
    /// Snapshot of `metrics` taken when the pod last entered the migration
    /// queue. The drift check before dispatch compares against this, not
    /// against the continuously overwritten live value.
    pub selected_metrics: Option<VmMetrics>,
    pub migration: Option<MigrationState>,
    /// Position in the owning node's migration queue; `None` while the pod has
    /// no metrics or is migrating.
    pub mq_index: Option<usize>,
}

impl PodState {
    pub fn reserved(&self) -> Resources {
        Resources {
            vcpu: self.cpu.reserved,
            mem_slots: self.mem.reserved,
        }
    }

    /// A pod can sit in the migration queue iff we have metrics for it and no
    /// migration is underway.
    pub fn migration_candidate(&self) -> bool {
        self.metrics.is_some() && self.migration.is_none()
    }

    /// Ranks pods by suitability as a migration victim: lower 1-minute load
    /// average migrates first, ties broken by name so the order is total.
    pub fn migration_cmp(&self, other: &PodState) -> Ordering {
        let own = self
            .metrics
            .as_ref()
            .map_or(f32::INFINITY, |m| m.load_avg_1min);
        let theirs = other
            .metrics
            .as_ref()
            .map_or(f32::INFINITY, |m| m.load_avg_1min);
        own.total_cmp(&theirs).then_with(|| self.name.cmp(&other.name))
    }

    /// Final check before a migration is dispatched: veto when the load has
    /// drifted too far from what it was when the pod was selected, in which
    /// case migrating something else may be the better call.
    pub fn check_ok_to_migrate(&self, old_metrics: &VmMetrics, drift_threshold: f32) -> bool {
        match &self.metrics {
            None => false,
            Some(now) => {
                (now.load_avg_1min - old_metrics.load_avg_1min).abs() <= drift_threshold
            }
        }
    }
}

/// Raw resource sums for a pod outside the autoscaler's control. Only its
/// rounded-up equivalents ever reach the node ledger.
#[derive(Debug, Clone)]
pub struct NonVmPodState {
    pub name: PodName,
    pub node_name: String,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}
