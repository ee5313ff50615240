#[cfg(feature = "arch-amd64")]
mod amd64;

use trapvisor_core::{Architecture, Va, VcpuId};

/// Architecture hooks needed by the interrupt dispatcher.
pub trait ArchAdapter: Architecture {
    /// The single-byte trap opcode written over the target instruction.
    const TRAP_OPCODE: u8;

    /// Lowest virtual address of the kernel half of every address space.
    ///
    /// Breakpoints at or above this address are translated through the
    /// kernel page table root.
    const KERNEL_SPACE_START: Va;

    /// Monitor delivering trap opcode exceptions.
    fn software_breakpoint_monitor() -> Self::EventMonitor;

    /// Monitor delivering writes of the page table root register.
    fn translation_root_monitor() -> Self::EventMonitor;

    /// Monitor single-stepping one vCPU.
    fn singlestep_monitor(vcpu: VcpuId) -> Self::EventMonitor;
}
