use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    error::Error,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    time::Duration,
};

use indexmap::IndexSet;
use smallvec::SmallVec;
use trapvisor_core::{
    AddressContext, Architecture as _, MemoryAccess, Pa, Registers as _, Va, VcpuId, VmiCore,
    VmiDriver, VmiError, VmiEvent, VmiEventResponse, VmiProcess,
    arch::{EventInterrupt as _, EventMemoryAccess as _, EventReason as _},
};

use crate::{
    AddressSpace, AddressSpaceSwitchGate, BreakpointAction, BreakpointCallback, BreakpointHandle,
    BreakpointId, BreakpointResult, BreakpointScope, BreakpointState, MonitorContext, MonitorOptions,
    SingleStepScheduler, TrapContext,
    arch::ArchAdapter,
    breakpoint::Breakpoint,
    guard::ShadowGuards,
    registry::{Registry, RegistryEntry},
};

pub(crate) struct DispatcherState<Driver>
where
    Driver: VmiDriver,
{
    next_id: u64,
    breakpoints: HashMap<BreakpointId, Breakpoint<Driver>>,
    registry: Registry,
    guards: ShadowGuards,
    gate: AddressSpaceSwitchGate,

    /// Nesting depth of trap dispatch.
    dispatching: usize,

    /// Emptied trap locations waiting for pending events to drain.
    deferred: IndexSet<Pa>,
}

pub(crate) struct DispatcherInner<Driver>
where
    Driver: VmiDriver,
{
    context: MonitorContext,
    kernel_space_start: Va,
    state: RefCell<DispatcherState<Driver>>,
    singlestep: RefCell<SingleStepScheduler<Driver>>,
}

/// Multiplexes breakpoints onto single-byte traps and routes hypervisor
/// events to their callbacks.
///
/// Any number of breakpoints may share one physical address. The trap
/// opcode is written once per address and stays in guest memory exactly as
/// long as at least one breakpoint at that address is active.
///
/// After a hit the original byte is put back, the vCPU single-steps over
/// the instruction and the trap is re-installed from the single-step event.
///
/// Cloning the dispatcher is cheap, clones share all state.
pub struct InterruptDispatcher<Driver>
where
    Driver: VmiDriver,
{
    inner: Rc<DispatcherInner<Driver>>,
}

impl<Driver> Clone for InterruptDispatcher<Driver>
where
    Driver: VmiDriver,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Driver> InterruptDispatcher<Driver>
where
    Driver: VmiDriver + 'static,
    Driver::Architecture: ArchAdapter,
{
    /// Creates a dispatcher with default options.
    pub fn new(context: MonitorContext) -> Self {
        Self::with_options(context, &MonitorOptions::default())
    }

    /// Creates a dispatcher.
    pub fn with_options(context: MonitorContext, options: &MonitorOptions) -> Self {
        let kernel_space_start = options
            .kernel_space_start
            .unwrap_or(Driver::Architecture::KERNEL_SPACE_START);

        Self {
            inner: Rc::new(DispatcherInner {
                context,
                kernel_space_start,
                state: RefCell::new(DispatcherState {
                    next_id: 0,
                    breakpoints: HashMap::new(),
                    registry: Registry::default(),
                    guards: ShadowGuards::new(options.shadow_window),
                    gate: AddressSpaceSwitchGate::new(),
                    dispatching: 0,
                    deferred: IndexSet::new(),
                }),
                singlestep: RefCell::new(SingleStepScheduler::default()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<DispatcherInner<Driver>>) -> Self {
        Self { inner }
    }

    /// Returns the shared monitor context.
    pub fn context(&self) -> &MonitorContext {
        &self.inner.context
    }

    /// Sizes the single-step table and enables the trap and page table root
    /// monitors.
    pub fn initialize(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        let info = vmi.info()?;
        self.inner.singlestep.borrow_mut().resize(info.vcpus);

        vmi.monitor_enable(Driver::Architecture::software_breakpoint_monitor())?;
        vmi.monitor_enable(Driver::Architecture::translation_root_monitor())?;

        tracing::debug!(vcpus = info.vcpus, "dispatcher initialized");
        Ok(())
    }

    /// Creates a breakpoint at `va` in the address space of `process`.
    ///
    /// Addresses in kernel space are translated through the process's
    /// kernel root, all others through its user root. A process-exclusive
    /// breakpoint whose owner is known not to run on any vCPU starts
    /// suspended, every other breakpoint starts active.
    ///
    /// Fails with [`VmiError::Conflict`] if the byte at the translated
    /// address already holds the trap opcode and no breakpoint of this
    /// dispatcher owns it.
    #[tracing::instrument(skip(self, vmi, process, callback), fields(process = %process.id))]
    pub fn create_breakpoint(
        &self,
        vmi: &VmiCore<Driver>,
        va: Va,
        process: &VmiProcess,
        scope: BreakpointScope,
        callback: impl FnMut(&TrapContext<'_, Driver>) -> BreakpointResult + 'static,
    ) -> Result<BreakpointHandle<Driver>, VmiError> {
        let root = if va >= self.inner.kernel_space_start {
            process.translation_root
        }
        else {
            process.user_translation_root
        };

        let pa = vmi.translate_address((va, root))?;
        let owner = AddressSpace::from(process);

        let mut state = self.inner.state.borrow_mut();
        let fresh = !state.registry.contains(pa);
        if fresh {
            Self::prepare_entry(vmi, &mut state, AddressContext::new(va, root), pa)?;
        }

        let id = BreakpointId(state.next_id);
        state.next_id += 1;

        let initial = state.gate.initial_state(scope, &owner);
        state.breakpoints.insert(
            id,
            Breakpoint {
                va,
                pa,
                owner,
                scope,
                state: initial,
                callback: Some(Box::new(callback)),
            },
        );

        if let Some(entry) = state.registry.get_mut(pa) {
            entry.members.push(id);
        }

        if let Err(err) = Self::sync_entry(vmi, &mut state, pa) {
            let breakpoint = state.breakpoints.remove(&id);
            if let Some(entry) = state.registry.get_mut(pa) {
                entry.detach(id);
            }

            if fresh {
                Self::release_entry(vmi, &mut state, pa);
            }

            drop(state);
            drop(breakpoint);
            return Err(err);
        }

        if fresh {
            vmi.flush_v2p_cache();
            vmi.flush_gfn_cache();
        }

        tracing::debug!(%id, %pa, ?scope, state = ?initial, "breakpoint created");
        Ok(BreakpointHandle::new(id, va, pa, Rc::downgrade(&self.inner)))
    }

    /// Returns the state of a breakpoint, or `None` if it does not exist.
    pub fn breakpoint_state(&self, id: BreakpointId) -> Option<BreakpointState> {
        let state = self.inner.state.borrow();
        state.breakpoints.get(&id).map(|breakpoint| breakpoint.state)
    }

    /// Removes a breakpoint.
    ///
    /// Removing a breakpoint that does not exist is a no-op. When the last
    /// breakpoint at a physical address goes away, the original byte is put
    /// back immediately. The trap location itself is released once pending
    /// events have been drained, or after the current trap if called from a
    /// callback.
    pub fn remove(&self, vmi: &VmiCore<Driver>, id: BreakpointId) -> Result<(), VmiError> {
        let mut state = self.inner.state.borrow_mut();

        let Some(breakpoint) = state.breakpoints.remove(&id) else {
            return Ok(());
        };

        let pa = breakpoint.pa;
        let orphaned = match state.registry.get_mut(pa) {
            Some(entry) => {
                entry.detach(id);
                entry.members.is_empty()
            }
            None => false,
        };

        let result = Self::sync_entry(vmi, &mut state, pa);
        if orphaned {
            state.deferred.insert(pa);
        }

        let dispatching = state.dispatching > 0;
        drop(state);
        drop(breakpoint);

        tracing::debug!(%id, %pa, "breakpoint removed");
        result?;

        if orphaned && !dispatching {
            self.reclaim(vmi)
        }
        else {
            Ok(())
        }
    }

    /// Releases trap locations emptied by [`remove`].
    ///
    /// Pending events are drained first, so a trap that was already in
    /// flight still finds its location. Does nothing while a trap is being
    /// dispatched.
    ///
    /// [`remove`]: Self::remove
    pub fn reclaim(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        {
            let state = self.inner.state.borrow();
            if state.deferred.is_empty() || state.dispatching > 0 {
                return Ok(());
            }
        }

        self.drain(vmi)?;

        let mut state = self.inner.state.borrow_mut();
        let deferred = std::mem::take(&mut state.deferred);
        for pa in deferred {
            Self::release_entry(vmi, &mut state, pa);
        }

        Ok(())
    }

    /// Routes one hypervisor event.
    ///
    /// Returns the response the hypervisor should apply before resuming the
    /// vCPU.
    #[tracing::instrument(skip_all, fields(vcpu = %event.vcpu_id()))]
    pub fn handle_event(
        &self,
        vmi: &VmiCore<Driver>,
        event: &VmiEvent<Driver::Architecture>,
    ) -> VmiEventResponse<Driver::Architecture> {
        let reason = event.reason();

        if let Some(interrupt) = reason.as_software_breakpoint() {
            let ip = Va(event.registers().instruction_pointer());
            let pa = Driver::Architecture::pa_from_gfn(interrupt.gfn())
                + Driver::Architecture::va_offset(ip);
            return self.on_trap(vmi, event, pa);
        }

        if reason.is_singlestep() {
            self.on_singlestep(vmi, event.vcpu_id());
            return VmiEventResponse::default();
        }

        if let Some(access) = reason.as_memory_access() {
            return self.on_memory_access(access.pa(), access.access());
        }

        if let Some(root) = reason.translation_root_switch() {
            self.on_address_space_switch(vmi, event.vcpu_id(), root);
            return VmiEventResponse::default();
        }

        tracing::trace!(?reason, "unhandled event");
        VmiEventResponse::default()
    }

    /// Dispatches a trap hit at `pa`.
    ///
    /// Traps at unknown addresses belong to the guest and are reinjected.
    /// Process-exclusive breakpoints only see traps raised in their owner's
    /// address space.
    pub fn on_trap(
        &self,
        vmi: &VmiCore<Driver>,
        event: &VmiEvent<Driver::Architecture>,
        pa: Pa,
    ) -> VmiEventResponse<Driver::Architecture> {
        vmi.flush_v2p_cache();
        vmi.flush_gfn_cache();

        let members = {
            let state = self.inner.state.borrow();
            match state.registry.get(pa) {
                Some(entry) => entry.members.clone(),
                None => {
                    tracing::debug!(%pa, "trap not owned, reinjecting");
                    return VmiEventResponse::reinject_interrupt();
                }
            }
        };

        self.inner.state.borrow_mut().dispatching += 1;

        let root = event.registers().translation_root();

        let mut deactivated = SmallVec::<[BreakpointId; 2]>::new();
        for id in members {
            let Some((va, mut callback)) = self.take_callback(id, root) else {
                continue;
            };

            let ctx = TrapContext::new(vmi, event, self, id, va, pa);
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(&ctx)));
            self.restore_callback(id, callback);

            match result {
                Ok(Ok(BreakpointAction::Continue)) => {}
                Ok(Ok(BreakpointAction::Deactivate)) => deactivated.push(id),
                Ok(Err(err)) => self.callback_failed(id, err),
                Err(payload) => self.callback_failed(id, panic_message(payload).into()),
            }
        }

        for id in deactivated {
            if let Err(err) = self.remove(vmi, id) {
                tracing::error!(%err, %id, "failed to deactivate breakpoint");
            }
        }

        self.finish_trap(vmi, event.vcpu_id(), pa);
        self.inner.state.borrow_mut().dispatching -= 1;

        VmiEventResponse::default()
    }

    /// Handles a completed single step on `vcpu`.
    pub fn on_singlestep(&self, vmi: &VmiCore<Driver>, vcpu: VcpuId) {
        let step = self.inner.singlestep.borrow_mut().complete(vmi, vcpu);

        match step {
            Some(step) => step.run(vmi),
            None => tracing::trace!(%vcpu, "single-step without pending action"),
        }
    }

    /// Answers an access to a guarded page.
    pub fn on_memory_access(
        &self,
        pa: Pa,
        access: MemoryAccess,
    ) -> VmiEventResponse<Driver::Architecture> {
        let gfn = Driver::Architecture::gfn_from_pa(pa);

        let mut state = self.inner.state.borrow_mut();
        match state.guards.get_mut(gfn) {
            Some(guard) => guard.on_access::<Driver>(pa, access),
            None => {
                tracing::trace!(%pa, %access, "access to unguarded page");
                VmiEventResponse::default()
            }
        }
    }

    /// Handles `vcpu` switching to the page table `root`.
    pub fn on_address_space_switch(&self, vmi: &VmiCore<Driver>, vcpu: VcpuId, root: Pa) {
        let mut state = self.inner.state.borrow_mut();
        let state = &mut *state;

        if !state.gate.record(vcpu, root) {
            return;
        }

        tracing::trace!(%vcpu, %root, "address space switch");

        let changed = state.gate.apply(state.breakpoints.iter_mut());
        for pa in changed {
            if let Err(err) = Self::sync_entry(vmi, state, pa) {
                tracing::error!(%err, %pa, "failed to update trap after address space switch");
            }
        }
    }

    /// Restores every original byte, lifts page guards, disarms pending
    /// single steps and disables the dispatcher's monitors.
    ///
    /// The virtual machine is paused for the duration. Failures are logged
    /// and do not stop the remaining cleanup.
    pub fn teardown(&self, vmi: &VmiCore<Driver>) {
        let _pause_guard = match vmi.pause_guard() {
            Ok(guard) => Some(guard),
            Err(err) => {
                tracing::error!(%err, "failed to pause the virtual machine");
                None
            }
        };

        let breakpoints = {
            let mut state = self.inner.state.borrow_mut();

            for (pa, entry) in state.registry.drain() {
                if !entry.installed {
                    continue;
                }

                if let Err(err) = vmi.write_u8(pa, entry.original) {
                    tracing::error!(%err, %pa, "failed to restore original byte");
                }
            }

            state.guards.teardown(vmi);
            state.deferred.clear();
            std::mem::take(&mut state.breakpoints)
        };

        self.inner.singlestep.borrow_mut().teardown(vmi);

        for monitor in [
            Driver::Architecture::software_breakpoint_monitor(),
            Driver::Architecture::translation_root_monitor(),
        ] {
            if let Err(err) = vmi.monitor_disable(monitor) {
                tracing::error!(%err, ?monitor, "failed to disable monitor");
            }
        }

        tracing::debug!(breakpoints = breakpoints.len(), "dispatcher torn down");
    }

    fn take_callback(
        &self,
        id: BreakpointId,
        root: Pa,
    ) -> Option<(Va, BreakpointCallback<Driver>)> {
        let mut state = self.inner.state.borrow_mut();
        let breakpoint = state.breakpoints.get_mut(&id)?;

        if !breakpoint.is_active() {
            return None;
        }

        // Another vCPU keeps the owner running, but this trap is not its.
        if breakpoint.scope == BreakpointScope::ProcessExclusive
            && !breakpoint.owner.contains(root)
        {
            tracing::trace!(%id, %root, "trap raised outside the owning process");
            return None;
        }

        let callback = breakpoint.callback.take()?;
        Some((breakpoint.va, callback))
    }

    fn restore_callback(&self, id: BreakpointId, callback: BreakpointCallback<Driver>) {
        let orphan = {
            let mut state = self.inner.state.borrow_mut();
            match state.breakpoints.get_mut(&id) {
                Some(breakpoint) => {
                    breakpoint.callback = Some(callback);
                    None
                }
                None => Some(callback),
            }
        };

        drop(orphan);
    }

    fn callback_failed(&self, id: BreakpointId, source: Box<dyn Error>) {
        let err = VmiError::Callback {
            breakpoint: id.0,
            source,
        };

        tracing::error!(%err, %id, "breakpoint callback failed");
        self.inner.context.report(&err);
    }

    /// Puts the original byte back and single-steps the vCPU over it if any
    /// breakpoint at `pa` is still active.
    fn finish_trap(&self, vmi: &VmiCore<Driver>, vcpu: VcpuId, pa: Pa) {
        let mut state = self.inner.state.borrow_mut();
        let state = &mut *state;

        let Some(entry) = state.registry.get_mut(pa) else {
            return;
        };

        if entry.installed {
            match vmi.write_u8(pa, entry.original) {
                Ok(()) => entry.installed = false,
                Err(err) => {
                    tracing::error!(%err, %pa, "failed to restore original byte");
                    return;
                }
            }
        }

        let active = entry.members.iter().any(|id| {
            state
                .breakpoints
                .get(id)
                .is_some_and(Breakpoint::is_active)
        });

        if !active {
            if entry.members.is_empty() {
                state.deferred.insert(pa);
            }

            return;
        }

        let dispatcher = Rc::downgrade(&self.inner);
        let action = Box::new(move |vmi: &VmiCore<Driver>, data: u64| {
            let inner = dispatcher
                .upgrade()
                .ok_or(VmiError::Other("dispatcher dropped before re-arm"))?;

            Self::from_inner(inner).rearm(vmi, Pa(data))
        });

        entry.stepping += 1;
        let armed = self
            .inner
            .singlestep
            .borrow_mut()
            .arm(vmi, vcpu, action, pa.0);

        if let Err(err) = armed {
            entry.stepping -= 1;
            tracing::error!(%err, %pa, %vcpu, "failed to arm single-step, trap stays removed");
            self.inner.context.report(&err);
        }
    }

    /// Re-installs the trap at `pa` after a single step.
    fn rearm(&self, vmi: &VmiCore<Driver>, pa: Pa) -> Result<(), VmiError> {
        let mut state = self.inner.state.borrow_mut();

        let Some(entry) = state.registry.get_mut(pa) else {
            tracing::debug!(%pa, "trap location released before re-arm");
            return Ok(());
        };

        entry.stepping = entry.stepping.saturating_sub(1);
        Self::sync_entry(vmi, &mut state, pa)
    }

    /// Reads the original byte and guards its page.
    ///
    /// The trap opcode itself is written by [`sync_entry`] once the first
    /// member has joined.
    ///
    /// [`sync_entry`]: Self::sync_entry
    fn prepare_entry(
        vmi: &VmiCore<Driver>,
        state: &mut DispatcherState<Driver>,
        ctx: AddressContext,
        pa: Pa,
    ) -> Result<(), VmiError> {
        let original = vmi.read_u8(pa)?;
        if original == Driver::Architecture::TRAP_OPCODE {
            return Err(VmiError::Conflict { pa });
        }

        let gfn = Driver::Architecture::gfn_from_pa(pa);
        let page = AddressContext::new(Driver::Architecture::va_align_down(ctx.va), ctx.root);
        state.guards.acquire(vmi, &state.registry, gfn, page)?;
        state.registry.insert(pa, RegistryEntry::new(original));

        tracing::debug!(%pa, original, "trap location prepared");
        Ok(())
    }

    /// Makes guest memory at `pa` agree with the breakpoints sharing it.
    ///
    /// The trap is present iff some member is active, except while a vCPU
    /// is stepping over the location.
    fn sync_entry(
        vmi: &VmiCore<Driver>,
        state: &mut DispatcherState<Driver>,
        pa: Pa,
    ) -> Result<(), VmiError> {
        let Some(entry) = state.registry.get_mut(pa) else {
            return Ok(());
        };

        if entry.stepping > 0 {
            return Ok(());
        }

        let wanted = entry.members.iter().any(|id| {
            state
                .breakpoints
                .get(id)
                .is_some_and(Breakpoint::is_active)
        });

        match (wanted, entry.installed) {
            (true, false) => {
                vmi.write_u8(pa, Driver::Architecture::TRAP_OPCODE)?;
                entry.installed = true;
                tracing::trace!(%pa, "trap installed");
            }
            (false, true) => {
                vmi.write_u8(pa, entry.original)?;
                entry.installed = false;
                tracing::trace!(%pa, "trap lifted");
            }
            _ => {}
        }

        Ok(())
    }

    /// Forgets the trap location at `pa` unless a breakpoint was created
    /// there in the meantime.
    fn release_entry(vmi: &VmiCore<Driver>, state: &mut DispatcherState<Driver>, pa: Pa) {
        match state.registry.get(pa) {
            Some(entry) if entry.members.is_empty() => {}
            _ => return,
        }

        let Some(entry) = state.registry.remove(pa) else {
            return;
        };

        if entry.installed {
            if let Err(err) = vmi.write_u8(pa, entry.original) {
                tracing::error!(%err, %pa, "failed to restore original byte");
            }
        }

        state
            .guards
            .release(vmi, Driver::Architecture::gfn_from_pa(pa));

        tracing::debug!(%pa, "trap location released");
    }

    /// Handles every event that was delivered before the caller's change
    /// took effect.
    ///
    /// Each wait consumes one event, so this keeps waiting until the driver
    /// reports nothing pending.
    fn drain(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError> {
        loop {
            let pending = vmi.events_pending();
            if pending == 0 {
                return Ok(());
            }

            tracing::debug!(pending, "draining pending events");

            match vmi.wait_for_event(Duration::ZERO, |event| self.handle_event(vmi, event)) {
                Ok(()) => {}
                Err(VmiError::Timeout) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return format!("callback panicked: {message}");
    }

    if let Some(message) = payload.downcast_ref::<String>() {
        return format!("callback panicked: {message}");
    }

    String::from("callback panicked")
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
