use serde::{Deserialize, Serialize};

use super::macros::impl_ops;
use crate::AddressContext;

impl_ops!(Gfn, "Guest Frame Number");
impl_ops!(Pa, "Guest Physical Address");
impl_ops!(Va, "Guest Virtual Address");

/// How the address of an [`AccessContext`] is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TranslationMechanism {
    /// The address is a guest physical address.
    Direct,

    /// The address is virtual and is walked through the page tables rooted
    /// at `root`.
    Paging {
        /// Root of the page table hierarchy (e.g. `CR3`).
        root: Pa,
    },
}

/// Target of a guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessContext {
    /// The address to access, interpreted according to `mechanism`.
    pub address: u64,

    /// The mechanism used for address translation.
    pub mechanism: TranslationMechanism,
}

impl AccessContext {
    /// Creates a physical access context.
    pub fn direct(address: impl Into<Pa>) -> Self {
        Self {
            address: address.into().0,
            mechanism: TranslationMechanism::Direct,
        }
    }

    /// Creates a virtual access context translated through `root`.
    pub fn paging(address: impl Into<Va>, root: impl Into<Pa>) -> Self {
        Self {
            address: address.into().0,
            mechanism: TranslationMechanism::Paging { root: root.into() },
        }
    }
}

impl From<Pa> for AccessContext {
    fn from(value: Pa) -> Self {
        Self::direct(value)
    }
}

impl From<(Va, Pa)> for AccessContext {
    fn from(value: (Va, Pa)) -> Self {
        Self::paging(value.0, value.1)
    }
}

impl From<AddressContext> for AccessContext {
    fn from(value: AddressContext) -> Self {
        Self::paging(value.va, value.root)
    }
}

impl ::std::ops::Add<u64> for AccessContext {
    type Output = AccessContext;

    fn add(self, rhs: u64) -> Self::Output {
        Self {
            address: self.address + rhs,
            ..self
        }
    }
}
