//! Event entry points.
//!
//! Every entry point acquires the plugin lock for its whole duration (node
//! hydration excepted, see [`crate::state`]), locates the affected node and
//! pod entries, runs the matching transitions, and logs their verdicts before
//! the lock is released, so the log order is consistent with mutation order.

use anyhow::{Result, bail};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use thiserror::Error;

use common::{BOUNDS_ANNOTATION, LAST_PERMIT_ANNOTATION, ObjectMeta, PodTask, ResourceList,
             parse_cpu, parse_memory};

use crate::config::AutoscaleConfig;
use crate::ledger::{PodResourceState, add_units};
use crate::migration::MigrationState;
use crate::models::{AgentRequest, PermitResponse, PodName, ResourceKind, Resources,
                    ScalingBounds};
use crate::node::NodeState;
use crate::pod::{NonVmPodState, PodState};
use crate::state::{AutoscalePlugin, PluginState};
use crate::transitions::ResourceTransition;

/// Why a pod was refused at placement time.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("container {container} has no {kind} limit")]
    MissingLimits {
        container: String,
        kind: ResourceKind,
    },
    #[error("container {container}: {kind} requests ({requests}) differ from limits ({limits})")]
    RequestsMismatch {
        container: String,
        kind: ResourceKind,
        requests: String,
        limits: String,
    },
    #[error("container {container} has an unparseable {kind} quantity {value:?}")]
    BadQuantity {
        container: String,
        kind: ResourceKind,
        value: String,
    },
    #[error("pod {pod} needs {amount} {kind} units, exceeding the accounting range")]
    QuantityOverflow {
        pod: PodName,
        kind: ResourceKind,
        amount: u64,
    },
    #[error("not enough reservable {kind} on node {node} for pod {pod}")]
    NotEnoughRoom {
        kind: ResourceKind,
        node: String,
        pod: PodName,
    },
}

/// Why an agent request was refused.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("pod {0} is not tracked by the scheduler")]
    UnknownPod(PodName),
    #[error("pod {0} does not have autoscaling enabled")]
    AutoscalingDisabled(PodName),
    #[error("compute unit has a zero component: {0}")]
    ZeroComputeUnit(Resources),
}

impl AutoscalePlugin {
    /// Records a placement decision: builds the pod's ledger from its spec and
    /// folds it into the target node, hydrating the node entry first if this
    /// is the first time we hear of it.
    pub async fn reserve_pod(&self, pod: &PodTask) -> Result<()> {
        let Some(node_name) = pod.spec.node_name.clone() else {
            bail!("pod {} has not been assigned a node", pod.metadata.name);
        };
        let name = object_pod_name(&pod.metadata);
        let guard = self.state.lock().await;
        let mut state = self.get_or_fetch_node_state(guard, &node_name).await?;
        if state.pod_nodes.contains_key(&name) {
            warn!("pod {name} is already tracked, ignoring duplicate reserve");
            return Ok(());
        }
        match pod.vm_name() {
            Some(vm) => reserve_vm_pod(&mut state, pod, vm, &node_name, name),
            None => reserve_non_vm_pod(&mut state, pod, &node_name, name),
        }
    }

    /// Removes a deleted pod from the books. An unknown pod is a warning, not
    /// a failure: the previous scheduler may never have told us about it.
    pub async fn delete_pod(&self, name: &PodName) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(node_name) = state.pod_nodes.remove(name) else {
            warn!("deletion of unknown pod {name}, nothing to do");
            return Ok(());
        };
        let node = node_entry(&mut state, &node_name);
        if node.pods.contains_key(name) {
            let NodeState {
                pods, mq, cpu, mem, ..
            } = &mut *node;
            mq.remove(pods, name);
            let mut pod = pods.remove(name).expect("pod table checked above");
            let migrating = pod.migration.is_some();
            let cpu_verdict =
                ResourceTransition::new(ResourceKind::Cpu, cpu, &mut pod.cpu)
                    .handle_deleted(migrating);
            let mem_verdict =
                ResourceTransition::new(ResourceKind::Memory, mem, &mut pod.mem)
                    .handle_deleted(migrating);
            info!("deleted pod {name} from node {node_name}: {cpu_verdict}; {mem_verdict}");
        } else if node.remove_non_vm_pod(name).is_some() {
            info!("deleted non-VM pod {name} from node {node_name}");
        } else {
            warn!("pod {name} was tracked on node {node_name} but absent from its tables");
        }
        Ok(())
    }

    /// Answers an autoscaling agent's resource request with a permit equal to
    /// the resulting reservation, deciding along the way whether the VM has to
    /// be migrated off its node.
    pub async fn handle_agent_request(&self, req: AgentRequest) -> Result<PermitResponse> {
        if req.compute_unit.vcpu == 0 || req.compute_unit.mem_slots == 0 {
            return Err(AgentError::ZeroComputeUnit(req.compute_unit).into());
        }
        let mut state = self.state.lock().await;
        let Some(node_name) = state.pod_nodes.get(&req.pod).cloned() else {
            return Err(AgentError::UnknownPod(req.pod.clone()).into());
        };
        let node = node_entry(&mut state, &node_name);

        // Bookkeeping on the pod entry itself.
        let (first_contact, already_migrating) = {
            let Some(pod) = node.pods.get_mut(&req.pod) else {
                return Err(AgentError::UnknownPod(req.pod.clone()).into());
            };
            if !pod.autoscaling_enabled {
                return Err(AgentError::AutoscalingDisabled(req.pod.clone()).into());
            }
            let first_contact = !pod.received_contact;
            pod.received_contact = true;
            pod.most_recent_compute_unit = Some(req.compute_unit);
            pod.metrics = Some(req.metrics);
            (first_contact, pod.migration.is_some())
        };

        // A reconnecting agent reports the last grant it obtained from our
        // predecessor; replay it before anything else so stale buffer never
        // survives the handover.
        if first_contact {
            if let Some(last_permit) = req.last_permit {
                let NodeState {
                    pods, cpu, mem, ..
                } = &mut *node;
                let pod = pods.get_mut(&req.pod).expect("pod table checked above");
                let cpu_verdict = ResourceTransition::new(ResourceKind::Cpu, cpu, &mut pod.cpu)
                    .handle_last_permit(last_permit.vcpu);
                let mem_verdict =
                    ResourceTransition::new(ResourceKind::Memory, mem, &mut pod.mem)
                        .handle_last_permit(last_permit.mem_slots);
                info!("replayed last permit for pod {}: {cpu_verdict}; {mem_verdict}", req.pod);
            }
        }

        // Fresh metrics may change the pod's rank, or make it a candidate for
        // the first time.
        {
            let NodeState { pods, mq, .. } = &mut *node;
            if pods[&req.pod].mq_index.is_some() {
                mq.update(pods, &req.pod);
            } else if pods[&req.pod].migration_candidate() {
                mq.insert(pods, &req.pod);
            }
        }

        let start_migration = {
            let pod = &node.pods[&req.pod];
            pod.migration.is_none()
                && (pod.always_migrate
                    || (node.too_much_pressure() && node.mq.peek_best() == Some(&req.pod)))
        };
        if start_migration {
            start_migration_on(node, &req.pod);
        }

        let migrating = start_migration || already_migrating;
        let (permit, cpu_verdict, mem_verdict) = {
            let NodeState {
                pods, cpu, mem, ..
            } = &mut *node;
            let pod = pods.get_mut(&req.pod).expect("pod table checked above");
            let cpu_verdict = ResourceTransition::new(ResourceKind::Cpu, cpu, &mut pod.cpu)
                .handle_requested(req.resources.vcpu, migrating, req.compute_unit.vcpu);
            let mem_verdict = ResourceTransition::new(ResourceKind::Memory, mem, &mut pod.mem)
                .handle_requested(req.resources.mem_slots, migrating, req.compute_unit.mem_slots);
            (pod.reserved(), cpu_verdict, mem_verdict)
        };
        info!("agent request for pod {}: {cpu_verdict}; {mem_verdict}", req.pod);

        Ok(PermitResponse {
            permit,
            migrate: migrating,
        })
    }

    /// Applies a pod object update: the autoscaling-enabled toggle, new
    /// scaling bounds, and usage changes of VMs outside the autoscaler's
    /// control.
    pub async fn handle_vm_pod_updated(&self, pod_task: &PodTask) -> Result<()> {
        let name = object_pod_name(&pod_task.metadata);
        let mut state = self.state.lock().await;
        let slot_size = state.mem_slot_size();
        let Some(node_name) = state.pod_nodes.get(&name).cloned() else {
            debug!("update for untracked pod {name}, ignoring");
            return Ok(());
        };
        let node = node_entry(&mut state, &node_name);
        if !node.pods.contains_key(&name) {
            // Non-VM pods only count through their container sums, which are
            // immutable per pod.
            return Ok(());
        }

        let enabled_now = pod_task.autoscaling_enabled();
        {
            let NodeState {
                pods, mq, cpu, mem, ..
            } = &mut *node;
            let was_enabled = pods[&name].autoscaling_enabled;
            if was_enabled && !enabled_now {
                mq.remove(pods, &name);
                let pod = pods.get_mut(&name).expect("pod table checked above");
                pod.autoscaling_enabled = false;
                // The agent stops reporting once disabled; stale metrics must
                // not keep the pod eligible for the migration queue.
                pod.metrics = None;
                let cpu_verdict = ResourceTransition::new(ResourceKind::Cpu, cpu, &mut pod.cpu)
                    .handle_autoscaling_disabled();
                let mem_verdict =
                    ResourceTransition::new(ResourceKind::Memory, mem, &mut pod.mem)
                        .handle_autoscaling_disabled();
                info!("autoscaling disabled for pod {name}: {cpu_verdict}; {mem_verdict}");
            } else if !was_enabled && enabled_now {
                pods.get_mut(&name)
                    .expect("pod table checked above")
                    .autoscaling_enabled = true;
                info!("autoscaling re-enabled for pod {name}");
            }
            pods.get_mut(&name)
                .expect("pod table checked above")
                .always_migrate = pod_task.always_migrate();
        }

        let bounds = if enabled_now {
            decode_annotation::<ScalingBounds>(pod_task, BOUNDS_ANNOTATION)
        } else {
            None
        };
        if let Some(bounds) = bounds {
            let NodeState {
                pods, cpu, mem, ..
            } = &mut *node;
            let pod = pods.get_mut(&name).expect("pod table checked above");
            let received_contact = pod.received_contact;
            if let Some(verdict) = ResourceTransition::new(ResourceKind::Cpu, cpu, &mut pod.cpu)
                .handle_updated_limits(received_contact, bounds.min.vcpu, bounds.max.vcpu)
            {
                info!("updated CPU bounds of pod {name}: {verdict}");
            }
            if let Some(verdict) =
                ResourceTransition::new(ResourceKind::Memory, mem, &mut pod.mem)
                    .handle_updated_limits(
                        received_contact,
                        bounds.min.mem_slots,
                        bounds.max.mem_slots,
                    )
            {
                info!("updated memory bounds of pod {name}: {verdict}");
            }
        }

        if !enabled_now {
            match vm_spec_usage(pod_task, &name, slot_size) {
                Ok(usage) => {
                    let NodeState {
                        pods, cpu, mem, ..
                    } = &mut *node;
                    let pod = pods.get_mut(&name).expect("pod table checked above");
                    let cpu_verdict =
                        ResourceTransition::new(ResourceKind::Cpu, cpu, &mut pod.cpu)
                            .handle_non_autoscaling_usage(usage.vcpu);
                    let mem_verdict =
                        ResourceTransition::new(ResourceKind::Memory, mem, &mut pod.mem)
                            .handle_non_autoscaling_usage(usage.mem_slots);
                    info!("usage change for pod {name}: {cpu_verdict}; {mem_verdict}");
                }
                Err(err) => warn!("ignoring usage update for pod {name}: {err}"),
            }
        }
        Ok(())
    }

    /// Marks a migration as underway for a pod. The actual migration request
    /// is submitted by the caller after the lock is released; if that
    /// submission fails the books stay consistent, the pod merely remains
    /// marked as migrating.
    pub async fn start_migration(&self, name: &PodName) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(node_name) = state.pod_nodes.get(name).cloned() else {
            return Err(AgentError::UnknownPod(name.clone()).into());
        };
        let node = node_entry(&mut state, &node_name);
        let Some(pod) = node.pods.get(name) else {
            return Err(AgentError::UnknownPod(name.clone()).into());
        };
        if pod.migration.is_some() {
            warn!("pod {name} is already migrating");
            return Ok(());
        }
        start_migration_on(node, name);
        Ok(())
    }

    /// Pops migration victims off a node's queue while it is under too much
    /// pressure, marking each as migrating. Returns the victims so the caller
    /// can submit the migration requests once the lock is dropped.
    pub async fn reconcile_node_pressure(&self, node_name: &str) -> Result<Vec<PodName>> {
        let mut state = self.state.lock().await;
        let drift_threshold = state.conf.load_drift_threshold;
        let Some(node) = state.nodes.get_mut(node_name) else {
            warn!("pressure reconciliation for unknown node {node_name}");
            return Ok(Vec::new());
        };
        let mut victims = Vec::new();
        while node.too_much_pressure() {
            let popped = {
                let NodeState { pods, mq, .. } = &mut *node;
                mq.pop_best(pods)
            };
            let Some(victim) = popped else {
                warn!("node {node_name} is under pressure but has no migration candidates");
                break;
            };
            let ok_to_migrate = {
                let pod = &node.pods[&victim];
                let selected = pod
                    .selected_metrics
                    .expect("queued pods have selection metrics");
                pod.check_ok_to_migrate(&selected, drift_threshold)
            };
            if !ok_to_migrate {
                // Re-queue with the load it reports now; the refreshed
                // selection is re-evaluated on the next pass.
                debug!("re-queueing pod {victim}, load drifted since selection");
                let NodeState { pods, mq, .. } = &mut *node;
                mq.insert(pods, &victim);
                continue;
            }
            start_migration_on(node, &victim);
            victims.push(victim);
        }
        if !victims.is_empty() {
            info!(
                "selected {} migration victim(s) on node {node_name}",
                victims.len()
            );
        }
        Ok(victims)
    }

    /// Applies an updated configuration document. Reservations are left as
    /// they are; nodes over the new limits converge as their agents check in.
    pub async fn handle_updated_conf(&self, conf: AutoscaleConfig) -> Result<()> {
        conf.validate()?;
        let mut state = self.state.lock().await;
        state.apply_config(conf);
        info!("applied updated configuration");
        Ok(())
    }
}

fn node_entry<'a>(state: &'a mut PluginState, node_name: &str) -> &'a mut NodeState {
    match state.nodes.get_mut(node_name) {
        Some(node) => node,
        None => panic!("pod locator points at node {node_name} which is not hydrated"),
    }
}

fn start_migration_on(node: &mut NodeState, name: &PodName) {
    let NodeState {
        pods, mq, cpu, mem, ..
    } = &mut *node;
    mq.remove(pods, name);
    let pod = pods.get_mut(name).expect("caller checked the pod table");
    pod.migration = Some(MigrationState::new());
    let cpu_verdict =
        ResourceTransition::new(ResourceKind::Cpu, cpu, &mut pod.cpu).handle_start_migration();
    let mem_verdict =
        ResourceTransition::new(ResourceKind::Memory, mem, &mut pod.mem).handle_start_migration();
    info!("started migration of pod {name}: {cpu_verdict}; {mem_verdict}");
}

fn reserve_vm_pod(
    state: &mut PluginState,
    pod_task: &PodTask,
    vm: &str,
    node_name: &str,
    name: PodName,
) -> Result<()> {
    let slot_size = state.mem_slot_size();
    let (mut cpu_ledger, mut mem_ledger) = vm_pod_ledgers(pod_task, &name, slot_size)?;
    let last_permit = decode_annotation::<Resources>(pod_task, LAST_PERMIT_ANNOTATION);
    let node = node_entry(state, node_name);

    for (kind, ledger) in [
        (ResourceKind::Cpu, &cpu_ledger),
        (ResourceKind::Memory, &mem_ledger),
    ] {
        if ledger.reserved > node.ledger(kind).remaining_reservable() {
            return Err(AdmissionError::NotEnoughRoom {
                kind,
                node: node_name.to_string(),
                pod: name.clone(),
            }
            .into());
        }
    }
    node.cpu.reserved = add_units(node.cpu.reserved, cpu_ledger.reserved, "node reserved");
    node.cpu.buffer = add_units(node.cpu.buffer, cpu_ledger.buffer, "node buffer");
    node.mem.reserved = add_units(node.mem.reserved, mem_ledger.reserved, "node reserved");
    node.mem.buffer = add_units(node.mem.buffer, mem_ledger.buffer, "node buffer");

    if let Some(permit) = last_permit {
        let cpu_verdict = ResourceTransition::new(ResourceKind::Cpu, &mut node.cpu, &mut cpu_ledger)
            .handle_last_permit(permit.vcpu);
        let mem_verdict =
            ResourceTransition::new(ResourceKind::Memory, &mut node.mem, &mut mem_ledger)
                .handle_last_permit(permit.mem_slots);
        info!("replayed permit annotation of pod {name}: {cpu_verdict}; {mem_verdict}");
    }

    let pod = PodState {
        name: name.clone(),
        vm_name: vm.to_string(),
        node_name: node_name.to_string(),
        cpu: cpu_ledger,
        mem: mem_ledger,
        autoscaling_enabled: pod_task.autoscaling_enabled(),
        always_migrate: pod_task.always_migrate(),
        received_contact: false,
        most_recent_compute_unit: None,
        metrics: None,
        selected_metrics: None,
        migration: None,
        mq_index: None,
    };
    info!(
        "reserved pod {name} (VM {vm}) on node {node_name}: {}",
        pod.reserved()
    );
    node.pods.insert(name.clone(), pod);
    state.pod_nodes.insert(name, node_name.to_string());
    Ok(())
}

fn reserve_non_vm_pod(
    state: &mut PluginState,
    pod_task: &PodTask,
    node_name: &str,
    name: PodName,
) -> Result<()> {
    let (limits, _requests) = sum_container_resources(pod_task, true)?;
    let node = node_entry(state, node_name);
    if let Some(kind) = node.non_vm_room_for(limits.cpu_millis, limits.memory_bytes) {
        return Err(AdmissionError::NotEnoughRoom {
            kind,
            node: node_name.to_string(),
            pod: name,
        }
        .into());
    }
    info!(
        "reserved non-VM pod {name} on node {node_name}: {}m CPU, {} bytes memory",
        limits.cpu_millis, limits.memory_bytes
    );
    node.add_non_vm_pod(NonVmPodState {
        name: name.clone(),
        node_name: node_name.to_string(),
        cpu_millis: limits.cpu_millis,
        memory_bytes: limits.memory_bytes,
    });
    state.pod_nodes.insert(name, node_name.to_string());
    Ok(())
}

fn object_pod_name(meta: &ObjectMeta) -> PodName {
    let namespace = if meta.namespace.is_empty() {
        "default"
    } else {
        &meta.namespace
    };
    PodName::new(namespace, &meta.name)
}

fn decode_annotation<T: DeserializeOwned>(pod: &PodTask, key: &str) -> Option<T> {
    let raw = pod.annotation(key)?;
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                "ignoring malformed {key} annotation on pod {}: {err}",
                pod.metadata.name
            );
            None
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RawSums {
    cpu_millis: u64,
    memory_bytes: u64,
}

fn list_quantity<'a>(list: &'a ResourceList, kind: ResourceKind) -> Option<&'a str> {
    match kind {
        ResourceKind::Cpu => list.cpu.as_deref(),
        ResourceKind::Memory => list.memory.as_deref(),
    }
}

fn parse_quantity(kind: ResourceKind, value: &str) -> Option<u64> {
    match kind {
        ResourceKind::Cpu => parse_cpu(value),
        ResourceKind::Memory => parse_memory(value),
    }
}

/// Sums container limits (and requests) across the pod. Limits are mandatory
/// per resource; with `require_requests_equal`, a requests entry that differs
/// from its limit is an admission error, otherwise requests default to the
/// limit.
fn sum_container_resources(
    pod: &PodTask,
    require_requests_equal: bool,
) -> Result<(RawSums, RawSums), AdmissionError> {
    let mut limits = RawSums::default();
    let mut requests = RawSums::default();
    for container in &pod.spec.containers {
        for kind in [ResourceKind::Cpu, ResourceKind::Memory] {
            let limit_value = container
                .resources
                .as_ref()
                .and_then(|r| r.limits.as_ref())
                .and_then(|l| list_quantity(l, kind))
                .ok_or_else(|| AdmissionError::MissingLimits {
                    container: container.name.clone(),
                    kind,
                })?;
            let limit = parse_quantity(kind, limit_value).ok_or_else(|| {
                AdmissionError::BadQuantity {
                    container: container.name.clone(),
                    kind,
                    value: limit_value.to_string(),
                }
            })?;
            let request = match container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .and_then(|l| list_quantity(l, kind))
            {
                Some(request_value) => {
                    let request = parse_quantity(kind, request_value).ok_or_else(|| {
                        AdmissionError::BadQuantity {
                            container: container.name.clone(),
                            kind,
                            value: request_value.to_string(),
                        }
                    })?;
                    if require_requests_equal && request != limit {
                        return Err(AdmissionError::RequestsMismatch {
                            container: container.name.clone(),
                            kind,
                            requests: request_value.to_string(),
                            limits: limit_value.to_string(),
                        });
                    }
                    request
                }
                None => limit,
            };
            match kind {
                ResourceKind::Cpu => {
                    limits.cpu_millis += limit;
                    requests.cpu_millis += request;
                }
                ResourceKind::Memory => {
                    limits.memory_bytes += limit;
                    requests.memory_bytes += request;
                }
            }
        }
    }
    Ok((limits, requests))
}

fn pod_units(pod: &PodName, kind: ResourceKind, amount: u64) -> Result<u16, AdmissionError> {
    u16::try_from(amount).map_err(|_| AdmissionError::QuantityOverflow {
        pod: pod.clone(),
        kind,
        amount,
    })
}

/// Reconstructs a VM pod's per-resource ledgers from its spec: `reserved` is
/// the rounded-up limit, `using` the rounded-up request, and the difference is
/// buffer the agent has not confirmed yet.
fn vm_pod_ledgers(
    pod_task: &PodTask,
    name: &PodName,
    slot_size: u64,
) -> Result<(PodResourceState, PodResourceState), AdmissionError> {
    let (limits, requests) = sum_container_resources(pod_task, false)?;
    let reserved_cpu = pod_units(name, ResourceKind::Cpu, limits.cpu_millis.div_ceil(1000))?;
    let reserved_mem = pod_units(
        name,
        ResourceKind::Memory,
        limits.memory_bytes.div_ceil(slot_size),
    )?;
    let using_cpu =
        pod_units(name, ResourceKind::Cpu, requests.cpu_millis.div_ceil(1000))?.min(reserved_cpu);
    let using_mem = pod_units(
        name,
        ResourceKind::Memory,
        requests.memory_bytes.div_ceil(slot_size),
    )?
    .min(reserved_mem);
    let bounds = decode_annotation::<ScalingBounds>(pod_task, BOUNDS_ANNOTATION).unwrap_or(
        ScalingBounds {
            min: Resources::new(using_cpu, using_mem),
            max: Resources::new(reserved_cpu, reserved_mem),
        },
    );
    Ok((
        PodResourceState {
            reserved: reserved_cpu,
            buffer: reserved_cpu - using_cpu,
            capacity_pressure: 0,
            min: bounds.min.vcpu,
            max: bounds.max.vcpu,
        },
        PodResourceState {
            reserved: reserved_mem,
            buffer: reserved_mem - using_mem,
            capacity_pressure: 0,
            min: bounds.min.mem_slots,
            max: bounds.max.mem_slots,
        },
    ))
}

/// Current usage of a VM pod outside the autoscaler's control, straight from
/// its container limits.
fn vm_spec_usage(
    pod_task: &PodTask,
    name: &PodName,
    slot_size: u64,
) -> Result<Resources, AdmissionError> {
    let (limits, _requests) = sum_container_resources(pod_task, false)?;
    Ok(Resources {
        vcpu: pod_units(name, ResourceKind::Cpu, limits.cpu_millis.div_ceil(1000))?,
        mem_slots: pod_units(
            name,
            ResourceKind::Memory,
            limits.memory_bytes.div_ceil(slot_size),
        )?,
    })
}
