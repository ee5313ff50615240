use std::time::Duration;

use crate::{
    Architecture, Gfn, MemoryAccess, VmiError, VmiEvent, VmiEventResponse, VmiInfo, VmiMappedPage,
};

/// A hypervisor backend.
///
/// The driver owns the connection to the hypervisor: guest memory access,
/// memory permissions, event monitors and the blocking event wait.
pub trait VmiDriver {
    /// The architecture supported by the driver.
    type Architecture: Architecture + ?Sized;

    /// Retrieves information about the virtual machine.
    fn info(&self) -> Result<VmiInfo, VmiError>;

    /// Pauses the virtual machine.
    fn pause(&self) -> Result<(), VmiError>;

    /// Resumes the virtual machine.
    fn resume(&self) -> Result<(), VmiError>;

    /// Sets the memory access permissions for a specific GFN.
    ///
    /// Accesses outside of `access` are reported as memory access events.
    fn set_memory_access(&self, gfn: Gfn, access: MemoryAccess) -> Result<(), VmiError>;

    /// Reads a page of memory from the virtual machine.
    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError>;

    /// Writes data to a page of memory in the virtual machine.
    fn write_page(&self, gfn: Gfn, offset: u64, content: &[u8]) -> Result<(), VmiError>;

    /// Enables monitoring of specific events.
    fn monitor_enable(
        &self,
        option: <Self::Architecture as Architecture>::EventMonitor,
    ) -> Result<(), VmiError>;

    /// Disables monitoring of specific events.
    fn monitor_disable(
        &self,
        option: <Self::Architecture as Architecture>::EventMonitor,
    ) -> Result<(), VmiError>;

    /// Returns the number of pending events.
    fn events_pending(&self) -> usize;

    /// Waits for an event to occur and processes it with the provided handler.
    fn wait_for_event(
        &self,
        timeout: Duration,
        handler: impl FnMut(&VmiEvent<Self::Architecture>) -> VmiEventResponse<Self::Architecture>,
    ) -> Result<(), VmiError>;

    /// Resets the state of the VMI system.
    fn reset_state(&self) -> Result<(), VmiError>;
}
