//! Per-node migration queue and the handle marking an in-flight migration.
//!
//! The queue is an indexed binary min-heap over pod names, ordered by
//! [`PodState::migration_cmp`]: the best victim sits at the root. Each queued
//! pod stores its heap position in `mq_index`, so removal of an arbitrary pod
//! is O(log n). Comparisons and index writes go through the owning node's pod
//! table, which the caller passes in; queue and table are always mutated in
//! the same critical section.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::PodName;
use crate::pod::PodState;

/// Marker installed on a pod while its migration is in flight. Cleared only by
/// deletion of the pod.
#[derive(Debug, Clone)]
pub struct MigrationState {
    pub started_at: DateTime<Utc>,
}

impl MigrationState {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
        }
    }
}

impl Default for MigrationState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct MigrationQueue {
    heap: Vec<PodName>,
}

fn pod_mut<'a>(
    pods: &'a mut HashMap<PodName, PodState>,
    name: &PodName,
) -> &'a mut PodState {
    match pods.get_mut(name) {
        Some(pod) => pod,
        None => panic!("migration queue refers to pod {name} missing from the node's pod table"),
    }
}

fn pod_ref<'a>(pods: &'a HashMap<PodName, PodState>, name: &PodName) -> &'a PodState {
    match pods.get(name) {
        Some(pod) => pod,
        None => panic!("migration queue refers to pod {name} missing from the node's pod table"),
    }
}

impl MigrationQueue {
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The current best victim, without removing it.
    pub fn peek_best(&self) -> Option<&PodName> {
        self.heap.first()
    }

    /// Adds a pod to the queue, capturing its metrics as the selection
    /// snapshot the drift check compares against. The pod must be a migration
    /// candidate and not already queued.
    pub fn insert(&mut self, pods: &mut HashMap<PodName, PodState>, name: &PodName) {
        let index = self.heap.len();
        let pod = pod_mut(pods, name);
        assert!(
            pod.migration_candidate(),
            "pod {name} is not a migration candidate"
        );
        assert!(pod.mq_index.is_none(), "pod {name} is already queued");
        pod.selected_metrics = pod.metrics;
        pod.mq_index = Some(index);
        self.heap.push(name.clone());
        self.sift_up(pods, index);
    }

    /// Removes a pod if it is queued; a no-op otherwise.
    pub fn remove(&mut self, pods: &mut HashMap<PodName, PodState>, name: &PodName) {
        let Some(pod) = pods.get_mut(name) else {
            return;
        };
        let Some(index) = pod.mq_index.take() else {
            return;
        };
        if self.heap.get(index) != Some(name) {
            panic!("migration queue index of pod {name} is inconsistent");
        }
        self.heap.swap_remove(index);
        if index < self.heap.len() {
            let moved = self.heap[index].clone();
            pod_mut(pods, &moved).mq_index = Some(index);
            self.sift_down(pods, index);
            self.sift_up(pods, index);
        }
    }

    /// Restores heap order around a pod whose rank key changed. The selection
    /// snapshot is kept as it was at insertion, so drift between selection and
    /// dispatch stays visible to the veto check.
    pub fn update(&mut self, pods: &mut HashMap<PodName, PodState>, name: &PodName) {
        let Some(index) = pod_ref(pods, name).mq_index else {
            return;
        };
        if self.heap.get(index) != Some(name) {
            panic!("migration queue index of pod {name} is inconsistent");
        }
        self.sift_up(pods, index);
        self.sift_down(pods, index);
    }

    /// Removes and returns the best victim.
    pub fn pop_best(&mut self, pods: &mut HashMap<PodName, PodState>) -> Option<PodName> {
        let best = self.heap.first()?.clone();
        self.remove(pods, &best);
        Some(best)
    }

    fn ranks_before(
        &self,
        pods: &HashMap<PodName, PodState>,
        first: usize,
        second: usize,
    ) -> bool {
        pod_ref(pods, &self.heap[first])
            .migration_cmp(pod_ref(pods, &self.heap[second]))
            .is_lt()
    }

    fn swap(&mut self, pods: &mut HashMap<PodName, PodState>, first: usize, second: usize) {
        self.heap.swap(first, second);
        pod_mut(pods, &self.heap[first].clone()).mq_index = Some(first);
        pod_mut(pods, &self.heap[second].clone()).mq_index = Some(second);
    }

    fn sift_up(&mut self, pods: &mut HashMap<PodName, PodState>, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.ranks_before(pods, index, parent) {
                break;
            }
            self.swap(pods, index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, pods: &mut HashMap<PodName, PodState>, mut index: usize) {
        loop {
            let mut best = index;
            for child in [2 * index + 1, 2 * index + 2] {
                if child < self.heap.len() && self.ranks_before(pods, child, best) {
                    best = child;
                }
            }
            if best == index {
                break;
            }
            self.swap(pods, index, best);
            index = best;
        }
    }
}
