//! Architecture abstraction.
//!
//! The engine never names a concrete CPU. Page geometry, the trap opcode,
//! page table walking and event decoding are provided by an implementation
//! of [`Architecture`] (see the `trapvisor-arch-amd64` crate).

use std::fmt::Debug;

use crate::{AddressContext, Gfn, MemoryAccess, Pa, Va, VmiCore, VmiDriver, VmiError};

/// CPU architecture-specific constants and operations.
pub trait Architecture {
    /// The size of a memory page in bytes.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `0x1000` (4096 bytes)
    const PAGE_SIZE: u64;

    /// The number of bits to shift when converting between page numbers and
    /// physical addresses.
    const PAGE_SHIFT: u64;

    /// A bitmask used to isolate the page number from a full address.
    const PAGE_MASK: u64;

    /// The machine code of the trap instruction.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `&[0xcc]` (`INT3` instruction)
    const BREAKPOINT: &'static [u8];

    /// The complete set of CPU registers.
    type Registers: Registers;

    /// Event monitors that can be enabled on the driver.
    type EventMonitor: Debug + Clone + Copy;

    /// Architecture-specific event details.
    type EventReason: EventReason;

    /// Converts a guest physical address to a guest frame number.
    fn gfn_from_pa(pa: Pa) -> Gfn;

    /// Converts a guest frame number to a guest physical address.
    fn pa_from_gfn(gfn: Gfn) -> Pa;

    /// Extracts the offset within a page from a physical address.
    fn pa_offset(pa: Pa) -> u64;

    /// Extracts the offset within a page from a virtual address.
    fn va_offset(va: Va) -> u64;

    /// Aligns a virtual address down to its page boundary.
    fn va_align_down(va: Va) -> Va;

    /// Performs a full page table walk to translate a virtual address to a
    /// physical address.
    fn translate_address<Driver>(vmi: &VmiCore<Driver>, va: Va, root: Pa) -> Result<Pa, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>;
}

/// Complete set of CPU registers for a specific architecture.
pub trait Registers
where
    Self: Debug + Default + Clone + Copy,
{
    /// General-purpose registers of the architecture.
    type GpRegisters: Debug + Default + Clone + Copy;

    /// Returns the current value of the instruction pointer.
    fn instruction_pointer(&self) -> u64;

    /// Returns the current value of the stack pointer.
    fn stack_pointer(&self) -> u64;

    /// Returns a copy of all general-purpose registers.
    fn gp_registers(&self) -> Self::GpRegisters;

    /// Returns the root of the active page table hierarchy.
    fn translation_root(&self) -> Pa;

    /// Creates an address context for `va` in the active address space.
    fn address_context(&self, va: Va) -> AddressContext {
        AddressContext::new(va, self.translation_root())
    }
}

/// A memory access event.
pub trait EventMemoryAccess
where
    Self: Debug + Clone + Copy,
{
    /// Returns the physical address of the memory access.
    fn pa(&self) -> Pa;

    /// Returns the virtual address of the memory access.
    fn va(&self) -> Va;

    /// Returns the kind of access (read, write or execute).
    fn access(&self) -> MemoryAccess;
}

/// An interrupt event.
pub trait EventInterrupt
where
    Self: Debug + Clone + Copy,
{
    /// Returns the guest frame number of the current instruction pointer.
    fn gfn(&self) -> Gfn;
}

/// The reason for an event, with typed access to its details.
pub trait EventReason
where
    Self: Debug + Clone + Copy,
{
    /// If the event was caused by a memory access, returns its details.
    fn as_memory_access(&self) -> Option<&impl EventMemoryAccess>;

    /// If the event was caused by the trap opcode, returns its details.
    fn as_software_breakpoint(&self) -> Option<&impl EventInterrupt>;

    /// Returns `true` if the event reports a completed single step.
    fn is_singlestep(&self) -> bool;

    /// If the event reports a switch of the active page table root, returns
    /// the new root.
    fn translation_root_switch(&self) -> Option<Pa>;
}
