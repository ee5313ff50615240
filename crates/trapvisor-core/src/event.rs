use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::{Architecture, VcpuId};

bitflags::bitflags! {
    /// Flags that can be set in a VMI event.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct VmiEventFlags: u8 {
        /// The virtual CPU is paused.
        const VCPU_PAUSED = 1 << 0;
    }
}

/// An event delivered by the hypervisor.
#[derive(Debug, Clone, Copy)]
pub struct VmiEvent<Arch>
where
    Arch: Architecture + ?Sized,
{
    vcpu_id: VcpuId,
    flags: VmiEventFlags,
    registers: Arch::Registers,
    reason: Arch::EventReason,
}

impl<Arch> VmiEvent<Arch>
where
    Arch: Architecture + ?Sized,
{
    /// Creates a new VMI event.
    pub fn new(
        vcpu_id: VcpuId,
        flags: VmiEventFlags,
        registers: Arch::Registers,
        reason: Arch::EventReason,
    ) -> Self {
        Self {
            vcpu_id,
            flags,
            registers,
            reason,
        }
    }

    /// Returns the ID of the virtual CPU where the event occurred.
    pub fn vcpu_id(&self) -> VcpuId {
        self.vcpu_id
    }

    /// Returns flags associated with the event.
    pub fn flags(&self) -> VmiEventFlags {
        self.flags
    }

    /// Returns a reference to the CPU registers at the time of the event.
    pub fn registers(&self) -> &Arch::Registers {
        &self.registers
    }

    /// Returns a reference to the reason for the event.
    pub fn reason(&self) -> &Arch::EventReason {
        &self.reason
    }
}

bitflags::bitflags! {
    /// Flags that can be set in a VMI event response.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct VmiEventResponseFlags: u8 {
        /// Reinject the interrupt.
        const REINJECT_INTERRUPT = 1 << 0;

        /// Emulate the instruction.
        const EMULATE = 1 << 1;
    }
}

/// Bytes handed to the guest in place of memory for an emulated read.
pub type VmiReadData = SmallVec<[u8; 16]>;

/// A response to a VMI event.
#[derive(Debug)]
pub struct VmiEventResponse<Arch>
where
    Arch: Architecture + ?Sized,
{
    /// Flags associated with the response.
    pub flags: VmiEventResponseFlags,

    /// Data returned to the guest by an emulated read.
    pub read_data: Option<VmiReadData>,

    _marker: PhantomData<Arch>,
}

impl<Arch> Default for VmiEventResponse<Arch>
where
    Arch: Architecture + ?Sized,
{
    fn default() -> Self {
        Self {
            flags: VmiEventResponseFlags::empty(),
            read_data: None,
            _marker: PhantomData,
        }
    }
}

impl<Arch> VmiEventResponse<Arch>
where
    Arch: Architecture + ?Sized,
{
    /// Creates a response to reinject an interrupt.
    pub fn reinject_interrupt() -> Self {
        Self::default().and_reinject_interrupt()
    }

    /// Creates a response to emulate the instruction.
    pub fn emulate() -> Self {
        Self::default().and_emulate()
    }

    /// Creates a response that emulates a read, returning `data` to the
    /// guest instead of live memory.
    pub fn emulate_read(data: &[u8]) -> Self {
        Self {
            read_data: Some(SmallVec::from_slice(data)),
            ..Self::emulate()
        }
    }

    /// Adds the reinject interrupt flag to the response.
    pub fn and_reinject_interrupt(self) -> Self {
        Self {
            flags: self.flags | VmiEventResponseFlags::REINJECT_INTERRUPT,
            ..self
        }
    }

    /// Adds the emulate flag to the response.
    pub fn and_emulate(self) -> Self {
        Self {
            flags: self.flags | VmiEventResponseFlags::EMULATE,
            ..self
        }
    }
}
