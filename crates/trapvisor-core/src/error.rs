use crate::{Pa, Va};

/// An error raised by the introspection stack.
#[derive(thiserror::Error, Debug)]
pub enum VmiError {
    /// An error occurred in the hypervisor driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A virtual address could not be translated.
    #[error("Page not present ({:?}, len: {})", .0[0], .0.len())]
    Translation(PageFaults),

    /// The target byte already holds the trap opcode.
    ///
    /// A foreign trap cannot be told apart from one installed by this
    /// process, so the breakpoint is refused.
    #[error("Trap opcode already present at {pa}")]
    Conflict {
        /// Physical address of the conflicting byte.
        pa: Pa,
    },

    /// A call sequence violated an engine invariant.
    #[error("Contract violation: {0}")]
    ContractViolation(&'static str),

    /// A breakpoint callback failed.
    #[error("Breakpoint callback {breakpoint} failed: {source}")]
    Callback {
        /// Identifier of the breakpoint whose callback failed.
        breakpoint: u64,

        /// The error returned (or the panic message raised) by the callback.
        source: Box<dyn std::error::Error>,
    },

    /// No process owns the given translation root.
    #[error("No process owns translation root {0}")]
    ProcessNotFound(Pa),

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,

    /// Timeout.
    #[error("Operation timed out.")]
    Timeout,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

/// A page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageFault {
    /// The virtual address that caused the page fault.
    pub address: Va,

    /// The root of the page table hierarchy.
    pub root: Pa,
}

/// A collection of page faults.
pub type PageFaults = smallvec::SmallVec<[PageFault; 1]>;

impl From<(Va, Pa)> for PageFault {
    fn from((address, root): (Va, Pa)) -> Self {
        Self { address, root }
    }
}

impl VmiError {
    /// Creates a new translation error for a single page fault.
    pub fn page_fault(pf: impl Into<PageFault>) -> Self {
        Self::Translation(smallvec::smallvec![pf.into()])
    }

    /// Returns `true` if the error was caused by a missing translation.
    pub fn is_translation(&self) -> bool {
        matches!(self, Self::Translation(_))
    }
}
