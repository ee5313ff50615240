use trapvisor_core::Gfn;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The levels in the 4-level page table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Page Table, pointing to 4KB pages.
    Pt,

    /// Page Directory, pointing to PTs or 2MB pages.
    Pd,

    /// Page Directory Pointer Table, pointing to PDs or 1GB pages.
    Pdpt,

    /// Page Map Level 4.
    Pml4,
}

impl PageTableLevel {
    /// Returns the next lower level in the hierarchy.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pt => None,
            Self::Pd => Some(Self::Pt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pml4 => Some(Self::Pdpt),
        }
    }

    /// Returns the bit position of the index for this level within a
    /// virtual address.
    pub fn shift(self) -> u64 {
        match self {
            Self::Pt => 12,
            Self::Pd => 21,
            Self::Pdpt => 30,
            Self::Pml4 => 39,
        }
    }
}

/// A page table entry in the paging structures.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    /// Checks if the page is present in physical memory.
    pub fn present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if the page is writable.
    pub fn write(self) -> bool {
        (self.0 >> 1) & 1 != 0
    }

    /// Checks if this entry maps a large page.
    pub fn large(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Extracts the page frame number from the entry.
    pub fn pfn(self) -> Gfn {
        const BITS: u64 = 40;
        const MASK: u64 = (1 << BITS) - 1;
        Gfn::new((self.0 >> 12) & MASK)
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("present", &self.present())
            .field("write", &self.write())
            .field("large", &self.large())
            .field("pfn", &self.pfn())
            .finish()
    }
}
