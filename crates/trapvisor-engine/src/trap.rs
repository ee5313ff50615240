use trapvisor_core::{Pa, Registers as _, Va, VcpuId, VmiCore, VmiDriver, VmiError, VmiEvent};

use crate::{BreakpointId, InterruptDispatcher, arch::ArchAdapter};

/// Everything a breakpoint callback can see about the trap it handles.
pub struct TrapContext<'a, Driver>
where
    Driver: VmiDriver,
{
    vmi: &'a VmiCore<Driver>,
    event: &'a VmiEvent<Driver::Architecture>,
    dispatcher: &'a InterruptDispatcher<Driver>,
    breakpoint: BreakpointId,
    va: Va,
    pa: Pa,
}

impl<'a, Driver> TrapContext<'a, Driver>
where
    Driver: VmiDriver,
{
    pub(crate) fn new(
        vmi: &'a VmiCore<Driver>,
        event: &'a VmiEvent<Driver::Architecture>,
        dispatcher: &'a InterruptDispatcher<Driver>,
        breakpoint: BreakpointId,
        va: Va,
        pa: Pa,
    ) -> Self {
        Self {
            vmi,
            event,
            dispatcher,
            breakpoint,
            va,
            pa,
        }
    }

    /// Returns the VMI core.
    pub fn vmi(&self) -> &'a VmiCore<Driver> {
        self.vmi
    }

    /// Returns the event that reported the trap.
    pub fn event(&self) -> &'a VmiEvent<Driver::Architecture> {
        self.event
    }

    /// Returns the dispatcher that owns the breakpoint.
    ///
    /// Breakpoints may be created and removed from within a callback.
    pub fn dispatcher(&self) -> &'a InterruptDispatcher<Driver> {
        self.dispatcher
    }

    /// Returns the vCPU that hit the trap.
    pub fn vcpu_id(&self) -> VcpuId {
        self.event.vcpu_id()
    }

    /// Returns the registers at the time of the trap.
    pub fn registers(&self) -> &'a <Driver::Architecture as trapvisor_core::Architecture>::Registers {
        self.event.registers()
    }

    /// Returns the page table root the vCPU was running with.
    pub fn translation_root(&self) -> Pa {
        self.registers().translation_root()
    }

    /// Returns the breakpoint being handled.
    pub fn breakpoint(&self) -> BreakpointId {
        self.breakpoint
    }

    /// Returns the virtual address the breakpoint was created at.
    pub fn va(&self) -> Va {
        self.va
    }

    /// Returns the physical address of the trap.
    pub fn pa(&self) -> Pa {
        self.pa
    }
}

impl<Driver> TrapContext<'_, Driver>
where
    Driver: VmiDriver + 'static,
    Driver::Architecture: ArchAdapter,
{
    /// Removes the breakpoint being handled.
    ///
    /// Other breakpoints sharing the trap still run for this hit.
    pub fn remove(&self) -> Result<(), VmiError> {
        self.dispatcher.remove(self.vmi, self.breakpoint)
    }
}
