use std::collections::HashMap;

use indexmap::IndexSet;
use trapvisor_core::{Pa, VcpuId, VmiDriver};

use crate::{AddressSpace, BreakpointId, BreakpointScope, BreakpointState, breakpoint::Breakpoint};

/// Tracks the page table root of every vCPU and decides which
/// process-exclusive breakpoints may fire.
#[derive(Debug, Default)]
pub struct AddressSpaceSwitchGate {
    roots: HashMap<VcpuId, Pa>,
}

impl AddressSpaceSwitchGate {
    /// Creates a gate with no known roots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last root reported for `vcpu`.
    pub fn current_root(&self, vcpu: VcpuId) -> Option<Pa> {
        self.roots.get(&vcpu).copied()
    }

    /// Records that `vcpu` now runs with `root`.
    ///
    /// Returns `false` if the root did not change.
    pub fn record(&mut self, vcpu: VcpuId, root: Pa) -> bool {
        self.roots.insert(vcpu, root) != Some(root)
    }

    /// Returns `true` if any vCPU runs in `owner`.
    pub fn is_running(&self, owner: &AddressSpace) -> bool {
        self.roots.values().any(|root| owner.contains(*root))
    }

    /// Returns the state a new breakpoint starts in.
    ///
    /// Until the first switch is seen nothing is known about the running
    /// processes, and every breakpoint starts active.
    pub fn initial_state(&self, scope: BreakpointScope, owner: &AddressSpace) -> BreakpointState {
        if scope == BreakpointScope::Global || self.roots.is_empty() || self.is_running(owner) {
            BreakpointState::Active
        }
        else {
            BreakpointState::Suspended
        }
    }

    /// Suspends process-exclusive breakpoints whose owner is not running and
    /// resumes those whose owner is.
    ///
    /// Returns the physical addresses of the breakpoints that changed state.
    pub(crate) fn apply<'a, Driver>(
        &self,
        breakpoints: impl Iterator<Item = (&'a BreakpointId, &'a mut Breakpoint<Driver>)>,
    ) -> IndexSet<Pa>
    where
        Driver: VmiDriver + 'a,
    {
        let mut changed = IndexSet::new();

        for (id, breakpoint) in breakpoints {
            if breakpoint.scope != BreakpointScope::ProcessExclusive {
                continue;
            }

            let state = if self.is_running(&breakpoint.owner) {
                BreakpointState::Active
            }
            else {
                BreakpointState::Suspended
            };

            if breakpoint.state == state {
                continue;
            }

            tracing::debug!(%id, va = %breakpoint.va, ?state, "breakpoint state changed");
            breakpoint.state = state;
            changed.insert(breakpoint.pa);
        }

        changed
    }
}
