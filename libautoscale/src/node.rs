//! Per-node aggregate state: the VM and non-VM pod tables, the two resource
//! ledgers, the raw non-VM sub-ledger, and the migration queue.

use std::collections::HashMap;

use crate::ledger::{NodeResourceState, add_units, sub_units};
use crate::migration::MigrationQueue;
use crate::models::{PodName, ResourceKind};
use crate::pod::{NonVmPodState, PodState};

#[derive(Debug, Default)]
pub struct NodeState {
    pub name: String,
    pub cpu: NodeResourceState,
    pub mem: NodeResourceState,
    /// Bytes per memory slot, captured at hydration time.
    pub mem_slot_size: u64,
    pub pods: HashMap<PodName, PodState>,
    pub non_vm_pods: HashMap<PodName, NonVmPodState>,
    pub mq: MigrationQueue,
    // Raw sums over the non-VM pod table. Only their rounded-up equivalents
    // (tracked below) are folded into the ledgers' `reserved`.
    raw_non_vm_cpu_millis: u64,
    raw_non_vm_memory_bytes: u64,
    non_vm_reserved_cpu: u16,
    non_vm_reserved_mem_slots: u16,
}

impl NodeState {
    pub fn new(
        name: String,
        cpu: NodeResourceState,
        mem: NodeResourceState,
        mem_slot_size: u64,
    ) -> Self {
        Self {
            name,
            cpu,
            mem,
            mem_slot_size,
            ..Default::default()
        }
    }

    /// Whether this node needs relief through migration. False while both
    /// reservations sit at or below their watermark; otherwise true iff the
    /// pressure above the watermark plus the demand currently denied exceeds
    /// what ongoing migrations are already expected to resolve.
    pub fn too_much_pressure(&self) -> bool {
        if self.cpu.reserved <= self.cpu.watermark && self.mem.reserved <= self.mem.watermark {
            return false;
        }
        [&self.cpu, &self.mem].into_iter().any(|ledger| {
            u32::from(ledger.logical_pressure()) + u32::from(ledger.capacity_pressure)
                > u32::from(ledger.pressure_accounted_for)
        })
    }

    /// Which resource, if any, lacks room for the given raw amounts once they
    /// are folded into the non-VM sub-ledger.
    pub fn non_vm_room_for(&self, cpu_millis: u64, memory_bytes: u64) -> Option<ResourceKind> {
        let new_cpu = ceil_cores(self.raw_non_vm_cpu_millis + cpu_millis);
        let cpu_growth = new_cpu.saturating_sub(u64::from(self.non_vm_reserved_cpu));
        if u64::from(self.cpu.reserved) + cpu_growth > u64::from(self.cpu.total_reservable()) {
            return Some(ResourceKind::Cpu);
        }
        let new_mem = ceil_slots(self.raw_non_vm_memory_bytes + memory_bytes, self.mem_slot_size);
        let mem_growth = new_mem.saturating_sub(u64::from(self.non_vm_reserved_mem_slots));
        if u64::from(self.mem.reserved) + mem_growth > u64::from(self.mem.total_reservable()) {
            return Some(ResourceKind::Memory);
        }
        None
    }

    /// Adds a non-VM pod's raw sums and folds the rounded delta into the
    /// ledgers.
    pub fn add_non_vm_pod(&mut self, pod: NonVmPodState) {
        self.raw_non_vm_cpu_millis += pod.cpu_millis;
        self.raw_non_vm_memory_bytes += pod.memory_bytes;
        self.non_vm_pods.insert(pod.name.clone(), pod);
        self.recompute_non_vm_reserved();
    }

    /// Removes a non-VM pod and folds the rounded delta back out. Subtracting
    /// below zero means the books are corrupt and aborts the process.
    pub fn remove_non_vm_pod(&mut self, name: &PodName) -> Option<NonVmPodState> {
        let pod = self.non_vm_pods.remove(name)?;
        if pod.cpu_millis > self.raw_non_vm_cpu_millis {
            panic!(
                "non-VM CPU underflow on node {}: removing {}m from {}m",
                self.name, pod.cpu_millis, self.raw_non_vm_cpu_millis
            );
        }
        if pod.memory_bytes > self.raw_non_vm_memory_bytes {
            panic!(
                "non-VM memory underflow on node {}: removing {}B from {}B",
                self.name, pod.memory_bytes, self.raw_non_vm_memory_bytes
            );
        }
        self.raw_non_vm_cpu_millis -= pod.cpu_millis;
        self.raw_non_vm_memory_bytes -= pod.memory_bytes;
        self.recompute_non_vm_reserved();
        Some(pod)
    }

    fn recompute_non_vm_reserved(&mut self) {
        let new_cpu = to_units(ceil_cores(self.raw_non_vm_cpu_millis), "non-VM reserved CPU");
        let new_mem = to_units(
            ceil_slots(self.raw_non_vm_memory_bytes, self.mem_slot_size),
            "non-VM reserved memory slots",
        );
        apply_delta(&mut self.cpu.reserved, self.non_vm_reserved_cpu, new_cpu);
        apply_delta(&mut self.mem.reserved, self.non_vm_reserved_mem_slots, new_mem);
        self.non_vm_reserved_cpu = new_cpu;
        self.non_vm_reserved_mem_slots = new_mem;
    }

    pub fn ledger(&self, kind: ResourceKind) -> &NodeResourceState {
        match kind {
            ResourceKind::Cpu => &self.cpu,
            ResourceKind::Memory => &self.mem,
        }
    }
}

fn apply_delta(reserved: &mut u16, old: u16, new: u16) {
    if new >= old {
        *reserved = add_units(*reserved, new - old, "node reserved");
    } else {
        *reserved = sub_units(*reserved, old - new, "node reserved");
    }
}

fn ceil_cores(millis: u64) -> u64 {
    millis.div_ceil(1000)
}

fn ceil_slots(bytes: u64, slot_size: u64) -> u64 {
    bytes.div_ceil(slot_size)
}

fn to_units(value: u64, what: &str) -> u16 {
    match u16::try_from(value) {
        Ok(v) => v,
        Err(_) => panic!("{what} {value} exceeds the 16-bit accounting range"),
    }
}
