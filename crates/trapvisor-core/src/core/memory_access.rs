use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Memory access permission flags.
    ///
    /// Removing a permission from a guest frame turns the matching access
    /// into a memory access event.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MemoryAccess: u8 {
        /// Read permission.
        const R = 0b00000001;

        /// Write permission.
        const W = 0b00000010;

        /// Execute permission.
        const X = 0b00000100;

        /// Read and write.
        const RW = Self::R.bits() | Self::W.bits();

        /// Full access.
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl std::fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let r = if self.contains(Self::R) { 'r' } else { '-' };
        let w = if self.contains(Self::W) { 'w' } else { '-' };
        let x = if self.contains(Self::X) { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}
