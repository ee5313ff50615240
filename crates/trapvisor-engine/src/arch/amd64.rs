use trapvisor_arch_amd64::{Amd64, ControlRegister, EventMonitor, ExceptionVector};
use trapvisor_core::{Architecture as _, Va, VcpuId};

use super::ArchAdapter;

impl ArchAdapter for Amd64 {
    const TRAP_OPCODE: u8 = Self::BREAKPOINT[0];
    const KERNEL_SPACE_START: Va = Amd64::KERNEL_SPACE_START;

    fn software_breakpoint_monitor() -> EventMonitor {
        EventMonitor::Interrupt(ExceptionVector::Breakpoint)
    }

    fn translation_root_monitor() -> EventMonitor {
        EventMonitor::Register(ControlRegister::Cr3)
    }

    fn singlestep_monitor(vcpu: VcpuId) -> EventMonitor {
        EventMonitor::Singlestep(vcpu)
    }
}
