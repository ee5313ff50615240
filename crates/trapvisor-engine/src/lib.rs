//! Breakpoint multiplexing and interrupt dispatch.
//!
//! The [`InterruptDispatcher`] lets any number of callbacks share a single
//! trap byte in guest physical memory. It keeps the trap in place for as
//! long as at least one of them is active, steps the vCPU over the original
//! instruction after every hit, hides the trap from guest reads of the page
//! and suspends process-exclusive breakpoints while their owner is switched
//! out.
//!
//! [`Monitor`] drives the dispatcher from the hypervisor's event stream.
//!
//! # Example
//!
//! ```no_run
//! # use trapvisor_core::{Pa, Va, VmiCore, VmiDriver, VmiError, VmiOs};
//! # use trapvisor_engine::{BreakpointAction, BreakpointScope, Monitor, MonitorContext, arch::ArchAdapter};
//! # fn example<Driver, Os>(vmi: &VmiCore<Driver>, os: &Os, root: Pa) -> Result<(), VmiError>
//! # where
//! #     Driver: VmiDriver + 'static,
//! #     Driver::Architecture: ArchAdapter,
//! #     Os: VmiOs<Driver>,
//! # {
//! let context = MonitorContext::default();
//! let monitor = Monitor::new(vmi, os, context);
//!
//! monitor.run(|session| {
//!     session.create_breakpoint(
//!         Va(0xfffff800_12345678),
//!         root,
//!         BreakpointScope::Global,
//!         |ctx| {
//!             tracing::info!(vcpu = %ctx.vcpu_id(), "hit");
//!             Ok(BreakpointAction::Continue)
//!         },
//!     )?;
//!
//!     Ok(())
//! })
//! # }
//! ```

/// Per-architecture trap opcodes and event monitors.
pub mod arch;
mod breakpoint;
mod context;
mod dispatcher;
mod guard;
mod monitor;
mod options;
mod registry;
mod singlestep;
mod switch;
mod trap;

#[cfg(test)]
mod mock;

pub use self::{
    breakpoint::{
        AddressSpace, BreakpointAction, BreakpointCallback, BreakpointHandle, BreakpointId,
        BreakpointResult, BreakpointScope, BreakpointState,
    },
    context::{ErrorSink, MonitorContext},
    dispatcher::InterruptDispatcher,
    guard::PageShadowGuard,
    monitor::{Monitor, MonitorSession},
    options::MonitorOptions,
    singlestep::{CompletedStep, SingleStepAction, SingleStepScheduler},
    switch::AddressSpaceSwitchGate,
    trap::TrapContext,
};
