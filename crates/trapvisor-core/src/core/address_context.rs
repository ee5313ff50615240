use serde::{Deserialize, Serialize};

use super::{Pa, Va};

/// A virtual address paired with the page table root that maps it.
///
/// User-mode code is private to each process, so the same virtual address
/// resolves differently under different roots. Kernel code is mapped
/// identically in every root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressContext {
    /// The virtual address.
    pub va: Va,

    /// The translation root (e.g. `CR3` on AMD64).
    pub root: Pa,
}

impl AddressContext {
    /// Creates a new `AddressContext`.
    pub fn new(va: impl Into<Va>, root: impl Into<Pa>) -> Self {
        Self {
            va: va.into(),
            root: root.into(),
        }
    }
}

impl From<(Va, Pa)> for AddressContext {
    fn from(value: (Va, Pa)) -> Self {
        Self {
            va: value.0,
            root: value.1,
        }
    }
}

impl ::std::ops::Add<u64> for AddressContext {
    type Output = AddressContext;

    fn add(self, rhs: u64) -> Self::Output {
        Self {
            va: self.va + rhs,
            ..self
        }
    }
}

impl std::fmt::Display for AddressContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}@{}", self.va, self.root)
    }
}
