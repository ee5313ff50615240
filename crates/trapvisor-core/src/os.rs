//! Process directory.
//!
//! Walking OS structures is left to the embedding application. The engine
//! only needs to find the process that owns a page table root.

use serde::{Deserialize, Serialize};

use crate::{Pa, VmiCore, VmiDriver, VmiError};

/// A process ID within a system.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A guest process as seen by the breakpoint engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmiProcess {
    /// The process ID.
    pub id: ProcessId,

    /// Short process name (e.g. `_EPROCESS.ImageFileName`).
    pub name: String,

    /// The kernel-mode page table root.
    pub translation_root: Pa,

    /// The user-mode page table root.
    ///
    /// Differs from [`translation_root`] only when the guest isolates kernel
    /// page tables (KPTI).
    ///
    /// [`translation_root`]: Self::translation_root
    pub user_translation_root: Pa,
}

impl VmiProcess {
    /// Returns `true` if `root` is one of the process's page table roots.
    pub fn owns_root(&self, root: Pa) -> bool {
        self.translation_root == root || self.user_translation_root == root
    }
}

/// Looks up guest processes by their page table root.
pub trait VmiOs<Driver>
where
    Driver: VmiDriver,
{
    /// Returns the process owning `root`, if any.
    fn process_by_root(
        &self,
        vmi: &VmiCore<Driver>,
        root: Pa,
    ) -> Result<Option<VmiProcess>, VmiError>;
}
