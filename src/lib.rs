//! Breakpoint multiplexing and interrupt dispatch for hypervisor-based
//! introspection.
//!
//! This crate re-exports the workspace members:
//!
//! - [`trapvisor_core`]: addresses, the [`VmiDriver`] abstraction, events
//!   and [`VmiCore`] with its translation and page caches
//! - [`arch::amd64`]: the AMD64 page table walk and event types
//! - [`engine`]: the interrupt dispatcher and the monitor loop
//!
//! The hypervisor backend and the guest OS process directory are supplied
//! by the embedding application through [`VmiDriver`] and [`VmiOs`].

pub use trapvisor_core::*;

/// Architecture support.
pub mod arch {
    pub use trapvisor_core::arch::*;

    #[cfg(feature = "arch-amd64")]
    pub use trapvisor_arch_amd64 as amd64;
}

#[cfg(feature = "engine")]
pub use trapvisor_engine as engine;
