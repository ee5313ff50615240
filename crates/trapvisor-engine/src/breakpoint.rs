use std::{error::Error, rc::Weak};

use serde::{Deserialize, Serialize};
use trapvisor_core::{Pa, Va, VmiCore, VmiDriver, VmiError, VmiProcess};

use crate::{TrapContext, arch::ArchAdapter, dispatcher::DispatcherInner, InterruptDispatcher};

/// Identifies a breakpoint within one dispatcher.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BreakpointId(pub u64);

impl std::fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decides which address spaces a breakpoint fires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointScope {
    /// Fires regardless of the running process.
    Global,

    /// Fires only while the owning process is running on some vCPU.
    ///
    /// The breakpoint is suspended while the owner is switched out.
    ProcessExclusive,
}

/// Lifecycle state of a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointState {
    /// The callback runs when the trap is hit.
    Active,

    /// The owning process is not running. The callback is skipped.
    Suspended,

    /// The breakpoint has been removed.
    Removed,
}

/// Tells the dispatcher what to do with a breakpoint after its callback ran.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointAction {
    /// Keep the breakpoint.
    #[default]
    Continue,

    /// Remove the breakpoint once every callback for the current trap has
    /// run.
    Deactivate,
}

/// Result returned by a breakpoint callback.
pub type BreakpointResult = Result<BreakpointAction, Box<dyn Error>>;

/// A breakpoint callback.
pub type BreakpointCallback<Driver> = Box<dyn FnMut(&TrapContext<'_, Driver>) -> BreakpointResult>;

/// The page table roots of the process owning a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressSpace {
    /// The kernel-mode page table root.
    pub translation_root: Pa,

    /// The user-mode page table root.
    pub user_translation_root: Pa,
}

impl AddressSpace {
    /// Returns `true` if `root` belongs to this address space.
    pub fn contains(&self, root: Pa) -> bool {
        self.translation_root == root || self.user_translation_root == root
    }
}

impl From<&VmiProcess> for AddressSpace {
    fn from(value: &VmiProcess) -> Self {
        Self {
            translation_root: value.translation_root,
            user_translation_root: value.user_translation_root,
        }
    }
}

pub(crate) struct Breakpoint<Driver>
where
    Driver: VmiDriver,
{
    pub(crate) va: Va,
    pub(crate) pa: Pa,
    pub(crate) owner: AddressSpace,
    pub(crate) scope: BreakpointScope,
    pub(crate) state: BreakpointState,

    /// Taken out of the record while the callback runs.
    pub(crate) callback: Option<BreakpointCallback<Driver>>,
}

impl<Driver> Breakpoint<Driver>
where
    Driver: VmiDriver,
{
    pub(crate) fn is_active(&self) -> bool {
        self.state == BreakpointState::Active
    }
}

/// A handle to a breakpoint created by an [`InterruptDispatcher`].
///
/// The handle does not keep the dispatcher alive. Dropping it leaves the
/// breakpoint in place. Use [`remove`] to take it down.
///
/// [`remove`]: Self::remove
pub struct BreakpointHandle<Driver>
where
    Driver: VmiDriver,
{
    id: BreakpointId,
    va: Va,
    pa: Pa,
    dispatcher: Weak<DispatcherInner<Driver>>,
}

impl<Driver> BreakpointHandle<Driver>
where
    Driver: VmiDriver,
{
    pub(crate) fn new(
        id: BreakpointId,
        va: Va,
        pa: Pa,
        dispatcher: Weak<DispatcherInner<Driver>>,
    ) -> Self {
        Self {
            id,
            va,
            pa,
            dispatcher,
        }
    }

    /// Returns the breakpoint identifier.
    pub fn id(&self) -> BreakpointId {
        self.id
    }

    /// Returns the virtual address the breakpoint was created at.
    pub fn va(&self) -> Va {
        self.va
    }

    /// Returns the physical address holding the trap.
    pub fn pa(&self) -> Pa {
        self.pa
    }
}

impl<Driver> BreakpointHandle<Driver>
where
    Driver: VmiDriver + 'static,
    Driver::Architecture: ArchAdapter,
{
    /// Returns the current state of the breakpoint.
    ///
    /// A breakpoint whose dispatcher is gone is reported as removed.
    pub fn state(&self) -> BreakpointState {
        self.dispatcher()
            .and_then(|dispatcher| dispatcher.breakpoint_state(self.id))
            .unwrap_or(BreakpointState::Removed)
    }

    /// Removes the breakpoint.
    ///
    /// Removing an already removed breakpoint is a no-op.
    pub fn remove(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        match self.dispatcher() {
            Some(dispatcher) => dispatcher.remove(vmi, self.id),
            None => Ok(()),
        }
    }

    fn dispatcher(&self) -> Option<InterruptDispatcher<Driver>> {
        self.dispatcher.upgrade().map(InterruptDispatcher::from_inner)
    }
}

impl<Driver> std::fmt::Debug for BreakpointHandle<Driver>
where
    Driver: VmiDriver,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakpointHandle")
            .field("id", &self.id)
            .field("va", &self.va)
            .field("pa", &self.pa)
            .finish()
    }
}
