//! Transition functions over one `(node, pod)` ledger pair.
//!
//! A [`ResourceTransition`] is a short-lived view binding the node-side and
//! pod-side ledger of a single resource kind. Every handler snapshots both
//! slots, mutates them in place, and returns a human-readable verdict for the
//! operation log. Handlers are infallible; an arithmetic underflow of a
//! conservation-backed aggregate is a programmer error and aborts the process.

use crate::ledger::{NodeResourceState, PodResourceState, add_units, sub_units};
use crate::models::ResourceKind;

pub struct ResourceTransition<'a> {
    kind: ResourceKind,
    node: &'a mut NodeResourceState,
    pod: &'a mut PodResourceState,
}

impl<'a> ResourceTransition<'a> {
    pub fn new(
        kind: ResourceKind,
        node: &'a mut NodeResourceState,
        pod: &'a mut PodResourceState,
    ) -> Self {
        Self { kind, node, pod }
    }

    fn snapshot(&self) -> (NodeResourceState, PodResourceState) {
        (*self.node, *self.pod)
    }

    fn verdict(
        &self,
        before: (NodeResourceState, PodResourceState),
        note: Option<String>,
    ) -> String {
        let (node, pod) = before;
        let mut verdict = format!(
            "{}: pod reserved {} -> {} (buffer {} -> {}, pressure {} -> {}); \
             node reserved {} -> {} of {} (pressure {} -> {}, accounted {} -> {})",
            self.kind,
            pod.reserved,
            self.pod.reserved,
            pod.buffer,
            self.pod.buffer,
            pod.capacity_pressure,
            self.pod.capacity_pressure,
            node.reserved,
            self.node.reserved,
            self.node.total_reservable(),
            node.capacity_pressure,
            self.node.capacity_pressure,
            node.pressure_accounted_for,
            self.node.pressure_accounted_for,
        );
        if let Some(note) = note {
            verdict.push_str(" [");
            verdict.push_str(&note);
            verdict.push(']');
        }
        verdict
    }

    /// Clears the pod's buffer and removes it from the node aggregate. Every
    /// agent-driven transition ends with this: once the agent has spoken, the
    /// held-back amount is no longer needed.
    fn clear_buffer(&mut self) {
        self.node.buffer = sub_units(self.node.buffer, self.pod.buffer, "node buffer");
        self.pod.buffer = 0;
    }

    /// Replays the last permit a previous scheduler granted this pod, so that
    /// reconnecting agents do not leave stale buffer on the books.
    pub fn handle_last_permit(&mut self, last_permit: u16) -> String {
        let before = self.snapshot();
        let mut note = None;
        if last_permit <= self.pod.reserved {
            let diff = self.pod.reserved - last_permit;
            self.pod.reserved = last_permit;
            self.node.reserved = sub_units(self.node.reserved, diff, "node reserved");
            self.clear_buffer();
        } else {
            // A grant larger than our view of the pod. Should not happen;
            // leave the books alone and let the next request converge.
            note = Some(format!(
                "unexpected last permit {last_permit} > reserved {}, ignoring",
                self.pod.reserved
            ));
        }
        self.verdict(before, note)
    }

    /// Applies an agent's desired reservation.
    ///
    /// Increases are quantised down to a multiple of `factor` and capped by
    /// what the node has left; the denied remainder becomes capacity pressure.
    /// CPU and memory are quantised independently; the agent is expected to
    /// re-submit compute-unit-aligned values and the system converges.
    pub fn handle_requested(
        &mut self,
        requested: u16,
        starting_migration: bool,
        factor: u16,
    ) -> String {
        let before = self.snapshot();
        let mut note = None;
        if requested <= self.pod.reserved {
            let decrease = self.pod.reserved - requested;
            self.pod.reserved = requested;
            self.node.reserved = sub_units(self.node.reserved, decrease, "node reserved");
            self.set_capacity_pressure(0);
        } else if starting_migration {
            assert_eq!(
                self.pod.buffer, 0,
                "pod buffer must be zero when a migration is starting"
            );
            self.set_capacity_pressure(requested - self.pod.reserved);
            note = Some("migrating, increase denied".to_string());
        } else {
            assert!(factor > 0, "quantisation factor must be non-zero");
            let increase = requested - self.pod.reserved;
            let remaining = self.node.remaining_reservable();
            let max_increase = (remaining / factor) * factor;
            let granted = increase.min(max_increase);
            if granted < increase {
                note = Some(format!("increase capped at {granted} of {increase}"));
            }
            self.set_capacity_pressure(increase - granted);
            self.pod.reserved = add_units(self.pod.reserved, granted, "pod reserved");
            self.node.reserved = add_units(self.node.reserved, granted, "node reserved");
        }
        self.clear_buffer();
        self.verdict(before, note)
    }

    fn set_capacity_pressure(&mut self, pressure: u16) {
        self.node.capacity_pressure = add_units(
            sub_units(
                self.node.capacity_pressure,
                self.pod.capacity_pressure,
                "node capacity pressure",
            ),
            pressure,
            "node capacity pressure",
        );
        self.pod.capacity_pressure = pressure;
    }

    /// Removes the pod's contribution from the node on deletion.
    pub fn handle_deleted(&mut self, currently_migrating: bool) -> String {
        let before = self.snapshot();
        self.node.reserved = sub_units(self.node.reserved, self.pod.reserved, "node reserved");
        self.node.buffer = sub_units(self.node.buffer, self.pod.buffer, "node buffer");
        self.node.capacity_pressure = sub_units(
            self.node.capacity_pressure,
            self.pod.capacity_pressure,
            "node capacity pressure",
        );
        if currently_migrating {
            // Pressure accounted for is an estimate, not a conserved sum: a
            // migrating pod may have accrued capacity pressure after the
            // migration started. Floor at zero rather than treat the
            // mismatch as corruption.
            self.node.pressure_accounted_for = self
                .node
                .pressure_accounted_for
                .saturating_sub(self.pod.reserved)
                .saturating_sub(self.pod.capacity_pressure);
        }
        self.verdict(before, None)
    }

    /// Records a usage change for a VM pod whose autoscaling is disabled.
    pub fn handle_non_autoscaling_usage(&mut self, new_usage: u16) -> String {
        let before = self.snapshot();
        if new_usage >= self.pod.reserved {
            self.node.reserved = add_units(
                self.node.reserved,
                new_usage - self.pod.reserved,
                "node reserved",
            );
        } else {
            self.node.reserved = sub_units(
                self.node.reserved,
                self.pod.reserved - new_usage,
                "node reserved",
            );
        }
        self.pod.reserved = new_usage;
        self.verdict(before, None)
    }

    /// Drops the buffer and capacity pressure of a pod whose autoscaling got
    /// switched off; the buffer is part of `reserved`, so both shrink.
    pub fn handle_autoscaling_disabled(&mut self) -> String {
        let before = self.snapshot();
        self.node.reserved = sub_units(self.node.reserved, self.pod.buffer, "node reserved");
        self.pod.reserved = sub_units(self.pod.reserved, self.pod.buffer, "pod reserved");
        self.clear_buffer();
        self.set_capacity_pressure(0);
        self.verdict(before, None)
    }

    /// Marks the start of a migration away from this node: same bookkeeping as
    /// disabling autoscaling, plus the pod's remaining reservation counts
    /// toward pressure already being resolved.
    pub fn handle_start_migration(&mut self) -> String {
        let before = self.snapshot();
        self.node.reserved = sub_units(self.node.reserved, self.pod.buffer, "node reserved");
        self.pod.reserved = sub_units(self.pod.reserved, self.pod.buffer, "pod reserved");
        self.clear_buffer();
        self.set_capacity_pressure(0);
        self.node.pressure_accounted_for = add_units(
            self.node.pressure_accounted_for,
            self.pod.reserved,
            "node pressure accounted for",
        );
        self.verdict(before, None)
    }

    /// Applies new scaling bounds.
    ///
    /// When the agent has never contacted us and `max` changed, the previous
    /// scheduler's grant may still sit in the agent's memory; re-reserve up to
    /// the new `max` so a reconnect cannot overcommit the node. Returns `None`
    /// when the bounds did not change.
    pub fn handle_updated_limits(
        &mut self,
        received_contact: bool,
        new_min: u16,
        new_max: u16,
    ) -> Option<String> {
        if new_min == self.pod.min && new_max == self.pod.max {
            return None;
        }
        let before = self.snapshot();
        let max_changed = new_max != self.pod.max;
        self.pod.min = new_min;
        self.pod.max = new_max;
        if !received_contact && max_changed {
            let using = self.pod.using();
            let new_reserved = new_max.max(using);
            if new_reserved >= self.pod.reserved {
                self.node.reserved = add_units(
                    self.node.reserved,
                    new_reserved - self.pod.reserved,
                    "node reserved",
                );
            } else {
                self.node.reserved = sub_units(
                    self.node.reserved,
                    self.pod.reserved - new_reserved,
                    "node reserved",
                );
            }
            self.pod.reserved = new_reserved;
            let new_buffer = new_reserved - using;
            self.node.buffer = add_units(
                sub_units(self.node.buffer, self.pod.buffer, "node buffer"),
                new_buffer,
                "node buffer",
            );
            self.pod.buffer = new_buffer;
        }
        Some(self.verdict(before, Some(format!("bounds now [{new_min}, {new_max}]"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(total: u16, system: u16, watermark: u16) -> NodeResourceState {
        NodeResourceState {
            total,
            system,
            watermark,
            ..Default::default()
        }
    }

    fn place(node: &mut NodeResourceState, reserved: u16, buffer: u16) -> PodResourceState {
        node.reserved += reserved;
        node.buffer += buffer;
        PodResourceState {
            reserved,
            buffer,
            ..Default::default()
        }
    }

    #[test]
    fn test_basic_grant_then_release() {
        let mut n = node(8, 1, 6);
        let mut p = place(&mut n, 3, 0);

        ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut p).handle_requested(5, false, 1);
        assert_eq!(p.reserved, 5);
        assert_eq!(n.reserved, 5);
        assert_eq!(p.capacity_pressure, 0);
        assert_eq!(n.capacity_pressure, 0);

        ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut p).handle_deleted(false);
        assert_eq!(n.reserved, 0);
        assert_eq!(n.buffer, 0);
    }

    #[test]
    fn test_capped_increase() {
        let mut n = node(8, 1, 6);
        let mut a = place(&mut n, 3, 0);
        let _b = place(&mut n, 3, 0);

        let verdict =
            ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut a).handle_requested(6, false, 1);
        assert_eq!(a.reserved, 4);
        assert_eq!(n.reserved, 7);
        assert_eq!(a.capacity_pressure, 2);
        assert_eq!(n.capacity_pressure, 2);
        assert!(verdict.contains("capped"), "verdict: {verdict}");
    }

    #[test]
    fn test_factor_quantisation() {
        let mut n = node(8, 1, 6);
        let mut a = place(&mut n, 3, 0);
        let _b = place(&mut n, 3, 0);

        ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut a).handle_requested(6, false, 4);
        assert_eq!(a.reserved, 3);
        assert_eq!(n.reserved, 6);
        assert_eq!(a.capacity_pressure, 3);
        assert_eq!(n.capacity_pressure, 3);
    }

    #[test]
    fn test_notification_is_idempotent() {
        let mut n = node(8, 1, 6);
        let mut p = place(&mut n, 3, 0);
        p.capacity_pressure = 2;
        n.capacity_pressure = 2;

        ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut p).handle_requested(3, false, 1);
        assert_eq!(p.reserved, 3);
        assert_eq!(n.reserved, 3);
        assert_eq!(p.capacity_pressure, 0);
        assert_eq!(n.capacity_pressure, 0);
    }

    #[test]
    fn test_denied_increase_while_migrating() {
        let mut n = node(8, 1, 6);
        let mut p = place(&mut n, 3, 0);

        ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut p).handle_requested(5, true, 1);
        assert_eq!(p.reserved, 3);
        assert_eq!(n.reserved, 3);
        assert_eq!(p.capacity_pressure, 2);
        assert_eq!(n.capacity_pressure, 2);
    }

    #[test]
    #[should_panic(expected = "buffer must be zero")]
    fn test_migrating_increase_with_buffer_panics() {
        let mut n = node(8, 1, 6);
        let mut p = place(&mut n, 3, 1);
        ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut p).handle_requested(5, true, 1);
    }

    #[test]
    fn test_last_permit_replay() {
        let mut n = node(8, 1, 6);
        let mut p = place(&mut n, 5, 2);

        ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut p).handle_last_permit(3);
        assert_eq!(p.reserved, 3);
        assert_eq!(p.buffer, 0);
        assert_eq!(n.reserved, 3);
        assert_eq!(n.buffer, 0);
    }

    #[test]
    fn test_last_permit_overshoot_ignored() {
        let mut n = node(8, 1, 6);
        let mut p = place(&mut n, 3, 0);

        let verdict =
            ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut p).handle_last_permit(7);
        assert_eq!(p.reserved, 3);
        assert_eq!(n.reserved, 3);
        assert!(verdict.contains("unexpected"), "verdict: {verdict}");
    }

    #[test]
    fn test_limit_update_without_contact() {
        let mut n = node(16, 0, 12);
        let mut p = place(&mut n, 4, 0);
        p.min = 1;
        p.max = 4;

        // Shrinking max below what is in use changes nothing on the books.
        let verdict = ResourceTransition::new(ResourceKind::Memory, &mut n, &mut p)
            .handle_updated_limits(false, 1, 2);
        assert!(verdict.is_some());
        assert_eq!(p.reserved, 4);
        assert_eq!(p.buffer, 0);
        assert_eq!(n.reserved, 4);

        // Growing max re-reserves up to it while the agent is silent.
        ResourceTransition::new(ResourceKind::Memory, &mut n, &mut p)
            .handle_updated_limits(false, 1, 6);
        assert_eq!(p.reserved, 6);
        assert_eq!(p.buffer, 2);
        assert_eq!(n.reserved, 6);
        assert_eq!(n.buffer, 2);
    }

    #[test]
    fn test_limit_update_unchanged_is_noop() {
        let mut n = node(16, 0, 12);
        let mut p = place(&mut n, 4, 0);
        p.min = 1;
        p.max = 4;
        let verdict = ResourceTransition::new(ResourceKind::Memory, &mut n, &mut p)
            .handle_updated_limits(false, 1, 4);
        assert!(verdict.is_none());
    }

    #[test]
    fn test_limit_update_after_contact_leaves_reservation() {
        let mut n = node(16, 0, 12);
        let mut p = place(&mut n, 4, 0);
        p.min = 1;
        p.max = 4;
        ResourceTransition::new(ResourceKind::Memory, &mut n, &mut p)
            .handle_updated_limits(true, 2, 8);
        assert_eq!(p.min, 2);
        assert_eq!(p.max, 8);
        assert_eq!(p.reserved, 4);
        assert_eq!(n.reserved, 4);
    }

    #[test]
    fn test_start_migration_round_trip() {
        let mut n = node(8, 1, 6);
        let mut p = place(&mut n, 5, 2);

        ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut p).handle_start_migration();
        assert_eq!(p.reserved, 3);
        assert_eq!(p.buffer, 0);
        assert_eq!(n.reserved, 3);
        assert_eq!(n.pressure_accounted_for, 3);

        ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut p).handle_deleted(true);
        assert_eq!(n.reserved, 0);
        assert_eq!(n.buffer, 0);
        assert_eq!(n.capacity_pressure, 0);
        assert_eq!(n.pressure_accounted_for, 0);
    }

    #[test]
    fn test_autoscaling_disabled_reclaims_buffer() {
        let mut n = node(8, 1, 6);
        let mut p = place(&mut n, 5, 2);
        p.capacity_pressure = 1;
        n.capacity_pressure = 1;

        ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut p).handle_autoscaling_disabled();
        assert_eq!(p.reserved, 3);
        assert_eq!(p.buffer, 0);
        assert_eq!(p.capacity_pressure, 0);
        assert_eq!(n.reserved, 3);
        assert_eq!(n.buffer, 0);
        assert_eq!(n.capacity_pressure, 0);
    }

    #[test]
    fn test_non_autoscaling_usage_change() {
        let mut n = node(8, 1, 6);
        let mut p = place(&mut n, 3, 0);

        ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut p).handle_non_autoscaling_usage(5);
        assert_eq!(p.reserved, 5);
        assert_eq!(n.reserved, 5);

        ResourceTransition::new(ResourceKind::Cpu, &mut n, &mut p).handle_non_autoscaling_usage(2);
        assert_eq!(p.reserved, 2);
        assert_eq!(n.reserved, 2);
    }
}
