use trapvisor_core::{Architecture as _, Gfn, Pa};

use crate::Amd64;

/// `CR3` control register.
///
/// Holds the physical address of the top-level page table and the PCID.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cr3(pub u64);

impl Cr3 {
    /// Returns the Process Context Identifier (PCID).
    pub fn pcid(self) -> u16 {
        (self.0 & 0xfff) as _
    }

    /// Returns the page frame number of the top-level page table.
    pub fn page_frame_number(self) -> Gfn {
        Gfn(self.0 >> 12 & 0x000f_ffff_ffff_ffff)
    }
}

impl std::fmt::Debug for Cr3 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cr3")
            .field("pcid", &self.pcid())
            .field("page_frame_number", &self.page_frame_number())
            .finish()
    }
}

impl From<u64> for Cr3 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Cr3> for Pa {
    fn from(value: Cr3) -> Self {
        Pa(value.page_frame_number().0 << Amd64::PAGE_SHIFT)
    }
}

/// The state of the CPU registers.
#[expect(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cr0: u64,
    pub cr3: Cr3,
    pub cr4: u64,
}

/// General-purpose registers.
#[expect(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GpRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl trapvisor_core::Registers for Registers {
    type GpRegisters = GpRegisters;

    fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    fn stack_pointer(&self) -> u64 {
        self.rsp
    }

    fn gp_registers(&self) -> GpRegisters {
        GpRegisters {
            rax: self.rax,
            rbx: self.rbx,
            rcx: self.rcx,
            rdx: self.rdx,
            rbp: self.rbp,
            rsi: self.rsi,
            rdi: self.rdi,
            rsp: self.rsp,
            r8: self.r8,
            r9: self.r9,
            r10: self.r10,
            r11: self.r11,
            r12: self.r12,
            r13: self.r13,
            r14: self.r14,
            r15: self.r15,
            rip: self.rip,
            rflags: self.rflags,
        }
    }

    fn translation_root(&self) -> Pa {
        self.cr3.into()
    }
}
