use trapvisor_core::{VcpuId, VmiCore, VmiDriver, VmiError};

use crate::arch::ArchAdapter;

/// Work to run once a vCPU has stepped over one instruction.
///
/// The `u64` is the resume data supplied when the step was armed.
pub type SingleStepAction<Driver> = Box<dyn FnOnce(&VmiCore<Driver>, u64) -> Result<(), VmiError>>;

/// A single-step that has fired and been disarmed, but whose action has not
/// run yet.
pub struct CompletedStep<Driver>
where
    Driver: VmiDriver,
{
    vcpu: VcpuId,
    action: SingleStepAction<Driver>,
    data: u64,
}

impl<Driver> CompletedStep<Driver>
where
    Driver: VmiDriver,
{
    /// Runs the action.
    ///
    /// Failures are logged and never propagated.
    pub fn run(self, vmi: &VmiCore<Driver>) {
        if let Err(err) = (self.action)(vmi, self.data) {
            tracing::error!(%err, vcpu = %self.vcpu, "single-step action failed");
        }
    }
}

struct Slot<Driver>
where
    Driver: VmiDriver,
{
    action: SingleStepAction<Driver>,
    data: u64,
}

/// Per-vCPU single-step slots.
///
/// Each vCPU can have at most one pending step.
pub struct SingleStepScheduler<Driver>
where
    Driver: VmiDriver,
{
    slots: Vec<Option<Slot<Driver>>>,
}

impl<Driver> Default for SingleStepScheduler<Driver>
where
    Driver: VmiDriver,
{
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<Driver> SingleStepScheduler<Driver>
where
    Driver: VmiDriver,
    Driver::Architecture: ArchAdapter,
{
    /// Creates a scheduler with one slot per vCPU.
    pub fn new(vcpus: u16) -> Self {
        let mut result = Self::default();
        result.resize(vcpus);
        result
    }

    /// Resizes the slot table to `vcpus` entries.
    ///
    /// Armed slots beyond the new size are dropped without being disarmed.
    pub fn resize(&mut self, vcpus: u16) {
        self.slots.resize_with(vcpus as usize, || None);
    }

    /// Returns `true` if a step is pending on `vcpu`.
    pub fn is_armed(&self, vcpu: VcpuId) -> bool {
        matches!(self.slots.get(vcpu.index()), Some(Some(_)))
    }

    /// Arms a single step on `vcpu`.
    ///
    /// Fails with [`VmiError::ContractViolation`] if a step is already
    /// pending on the vCPU.
    pub fn arm(
        &mut self,
        vmi: &VmiCore<Driver>,
        vcpu: VcpuId,
        action: SingleStepAction<Driver>,
        data: u64,
    ) -> Result<(), VmiError> {
        let slot = self
            .slots
            .get_mut(vcpu.index())
            .ok_or(VmiError::ContractViolation("single-step armed on unknown vCPU"))?;

        if slot.is_some() {
            return Err(VmiError::ContractViolation(
                "single-step already armed on vCPU",
            ));
        }

        vmi.monitor_enable(Driver::Architecture::singlestep_monitor(vcpu))?;
        *slot = Some(Slot { action, data });

        tracing::trace!(%vcpu, data, "single-step armed");
        Ok(())
    }

    /// Disarms the step pending on `vcpu` and hands back its action.
    ///
    /// Returns `None` if nothing was armed.
    pub fn complete(&mut self, vmi: &VmiCore<Driver>, vcpu: VcpuId) -> Option<CompletedStep<Driver>> {
        let Slot { action, data } = self.slots.get_mut(vcpu.index())?.take()?;

        if let Err(err) = vmi.monitor_disable(Driver::Architecture::singlestep_monitor(vcpu)) {
            tracing::error!(%err, %vcpu, "failed to disable single-step");
        }

        Some(CompletedStep { vcpu, action, data })
    }

    /// Handles a single-step event on `vcpu`.
    ///
    /// The slot is cleared before the action runs, so the action may arm a
    /// new step on the same vCPU.
    pub fn fire(&mut self, vmi: &VmiCore<Driver>, vcpu: VcpuId) {
        match self.complete(vmi, vcpu) {
            Some(step) => step.run(vmi),
            None => tracing::trace!(%vcpu, "single-step without pending action"),
        }
    }

    /// Disarms every pending step without running its action.
    pub fn teardown(&mut self, vmi: &VmiCore<Driver>) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.take().is_none() {
                continue;
            }

            let vcpu = VcpuId(index as u16);
            if let Err(err) = vmi.monitor_disable(Driver::Architecture::singlestep_monitor(vcpu)) {
                tracing::error!(%err, %vcpu, "failed to disable single-step");
            }
        }
    }
}

#[cfg(test)]
#[path = "singlestep_tests.rs"]
mod tests;
