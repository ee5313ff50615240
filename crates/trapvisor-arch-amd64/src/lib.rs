//! AMD64 architecture definitions.

mod event;
mod interrupt;
mod paging;
mod registers;

use trapvisor_core::{Architecture, Gfn, Pa, Va, VmiCore, VmiDriver, VmiError};
use zerocopy::FromBytes;

pub use self::{
    event::{
        ControlRegister, EventInterrupt, EventMemoryAccess, EventMonitor, EventReason,
        EventSinglestep, EventWriteControlRegister,
    },
    interrupt::{ExceptionVector, Interrupt, InterruptType},
    paging::{PageTableEntry, PageTableLevel},
    registers::{Cr3, GpRegisters, Registers},
};

/// AMD64 architecture.
#[derive(Debug)]
pub struct Amd64;

impl Amd64 {
    /// Lowest canonical kernel-space address.
    ///
    /// Addresses at or above this boundary belong to the upper half, which
    /// both Windows and Linux reserve for the kernel.
    pub const KERNEL_SPACE_START: Va = Va(0xffff_8000_0000_0000);

    /// Returns the index of `va` into the page table at `level`.
    pub fn va_index_for(va: Va, level: PageTableLevel) -> u64 {
        (va.0 >> level.shift()) & 0x1ff
    }

    /// Returns the offset of `va` inside a page mapped at `level`.
    pub fn va_offset_for(va: Va, level: PageTableLevel) -> u64 {
        va.0 & ((1 << level.shift()) - 1)
    }
}

impl Architecture for Amd64 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    const BREAKPOINT: &'static [u8] = &[0xcc];

    type Registers = Registers;
    type EventMonitor = EventMonitor;
    type EventReason = EventReason;

    fn gfn_from_pa(pa: Pa) -> Gfn {
        Gfn(pa.0 >> Self::PAGE_SHIFT)
    }

    fn pa_from_gfn(gfn: Gfn) -> Pa {
        Pa(gfn.0 << Self::PAGE_SHIFT)
    }

    fn pa_offset(pa: Pa) -> u64 {
        pa.0 & !Self::PAGE_MASK
    }

    fn va_offset(va: Va) -> u64 {
        va.0 & !Self::PAGE_MASK
    }

    fn va_align_down(va: Va) -> Va {
        va & Self::PAGE_MASK
    }

    fn translate_address<Driver>(vmi: &VmiCore<Driver>, va: Va, root: Pa) -> Result<Pa, VmiError>
    where
        Driver: VmiDriver<Architecture = Self>,
    {
        let mut table = Self::gfn_from_pa(root);
        let mut level = PageTableLevel::Pml4;

        loop {
            let buffer = vmi.read_page(table)?;
            let entries =
                <[PageTableEntry]>::ref_from_bytes(&buffer).map_err(|_| VmiError::OutOfBounds)?;

            let entry = entries
                .get(Self::va_index_for(va, level) as usize)
                .copied()
                .ok_or(VmiError::OutOfBounds)?;

            if !entry.present() {
                return Err(VmiError::page_fault((va, root)));
            }

            //
            // A large page terminates the walk above the PT level. PML4
            // entries cannot map pages, so the bit is ignored there.
            //

            match level.next() {
                Some(next) if !(entry.large() && level != PageTableLevel::Pml4) => {
                    table = entry.pfn();
                    level = next;
                }
                _ => return Ok(Self::pa_from_gfn(entry.pfn()) + Self::va_offset_for(va, level)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn va_indices() {
        let va = Va(0xfffff806_2a31_4567);

        assert_eq!(Amd64::va_index_for(va, PageTableLevel::Pml4), 0x1f0);
        assert_eq!(Amd64::va_index_for(va, PageTableLevel::Pdpt), 0x018);
        assert_eq!(Amd64::va_index_for(va, PageTableLevel::Pd), 0x151);
        assert_eq!(Amd64::va_index_for(va, PageTableLevel::Pt), 0x114);
        assert_eq!(Amd64::va_offset_for(va, PageTableLevel::Pt), 0x567);
        assert_eq!(Amd64::va_offset_for(va, PageTableLevel::Pd), 0x114567);
    }

    #[test]
    fn cr3_drops_pcid() {
        let cr3 = Cr3(0x0000_0001_2345_6002);

        assert_eq!(cr3.pcid(), 2);
        assert_eq!(Pa::from(cr3), Pa(0x0000_0001_2345_6000));
    }

    #[test]
    fn breakpoint_interrupt_is_recognized() {
        use trapvisor_core::arch::EventReason as _;

        let reason = EventReason::Interrupt(EventInterrupt {
            gfn: Gfn(0x42),
            interrupt: Interrupt::breakpoint(1),
        });

        assert!(reason.as_software_breakpoint().is_some());
        assert!(reason.as_memory_access().is_none());
        assert!(!reason.is_singlestep());
    }

    #[test]
    fn cr3_write_reports_new_root() {
        use trapvisor_core::arch::EventReason as _;

        let reason = EventReason::WriteControlRegister(EventWriteControlRegister {
            register: ControlRegister::Cr3,
            new_value: 0x1aa000 | 0x5,
            old_value: 0x1bb000,
        });

        assert_eq!(reason.translation_root_switch(), Some(Pa(0x1aa000)));
    }
}
