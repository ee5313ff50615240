use trapvisor_core::{Gfn, MemoryAccess, Pa, Va, VcpuId};

use crate::{Cr3, ExceptionVector, Interrupt};

/// Control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlRegister {
    /// Control Register 0.
    Cr0,

    /// Control Register 3.
    Cr3,

    /// Control Register 4.
    Cr4,
}

/// Event generated when monitored memory is accessed.
#[derive(Debug, Clone, Copy)]
pub struct EventMemoryAccess {
    /// Physical address that was accessed.
    pub pa: Pa,

    /// Virtual address that was accessed.
    pub va: Va,

    /// Type of access that occurred (read/write/execute).
    pub access: MemoryAccess,
}

/// Event generated when a control register is written to.
#[derive(Debug, Clone, Copy)]
pub struct EventWriteControlRegister {
    /// The control register that was written to.
    pub register: ControlRegister,

    /// New value of the control register.
    pub new_value: u64,

    /// Old value of the control register.
    pub old_value: u64,
}

/// Event generated when an interrupt or exception occurs.
#[derive(Debug, Clone, Copy)]
pub struct EventInterrupt {
    /// GFN of the current instruction pointer.
    pub gfn: Gfn,

    /// Information about the interrupt/exception.
    pub interrupt: Interrupt,
}

/// Event generated after a single-stepped instruction retires.
#[derive(Debug, Clone, Copy)]
pub struct EventSinglestep {
    /// GFN of the next instruction.
    pub gfn: Gfn,
}

/// Reason for an event.
#[derive(Debug, Clone, Copy)]
pub enum EventReason {
    /// Memory access event (read/write/execute).
    MemoryAccess(EventMemoryAccess),

    /// Control register write event.
    WriteControlRegister(EventWriteControlRegister),

    /// Interrupt or exception event.
    Interrupt(EventInterrupt),

    /// Singlestep event.
    Singlestep(EventSinglestep),
}

/// Specifies which hardware events should be monitored.
///
/// Memory access events are implicit: they are produced by restricting the
/// access permissions of a guest frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMonitor {
    /// Monitor writes to a specific control register.
    Register(ControlRegister),

    /// Monitor a specific exception vector.
    Interrupt(ExceptionVector),

    /// Single-step the given vCPU.
    Singlestep(VcpuId),
}

impl trapvisor_core::arch::EventMemoryAccess for EventMemoryAccess {
    fn pa(&self) -> Pa {
        self.pa
    }

    fn va(&self) -> Va {
        self.va
    }

    fn access(&self) -> MemoryAccess {
        self.access
    }
}

impl trapvisor_core::arch::EventInterrupt for EventInterrupt {
    fn gfn(&self) -> Gfn {
        self.gfn
    }
}

impl trapvisor_core::arch::EventReason for EventReason {
    fn as_memory_access(&self) -> Option<&impl trapvisor_core::arch::EventMemoryAccess> {
        match self {
            EventReason::MemoryAccess(memory_access) => Some(memory_access),
            _ => None,
        }
    }

    fn as_software_breakpoint(&self) -> Option<&impl trapvisor_core::arch::EventInterrupt> {
        match self {
            EventReason::Interrupt(interrupt) if interrupt.interrupt.is_software_breakpoint() => {
                Some(interrupt)
            }
            _ => None,
        }
    }

    fn is_singlestep(&self) -> bool {
        matches!(self, EventReason::Singlestep(_))
    }

    fn translation_root_switch(&self) -> Option<Pa> {
        match self {
            EventReason::WriteControlRegister(EventWriteControlRegister {
                register: ControlRegister::Cr3,
                new_value,
                ..
            }) => Some(Cr3(*new_value).into()),
            _ => None,
        }
    }
}
