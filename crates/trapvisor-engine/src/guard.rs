//! Shadow pages hiding installed traps from guest reads.
//!
//! Integrity checkers (e.g. PatchGuard) hash kernel code. A frame carrying a
//! trap is restricted to execute-only. Reads of it are answered from a copy
//! of the frame taken before the first trap went in, writes are emulated.

use std::collections::HashMap;

use trapvisor_core::{
    AddressContext, Architecture as _, Gfn, MemoryAccess, Pa, VmiCore, VmiDriver, VmiError,
    VmiEventResponse,
};

use crate::registry::Registry;

/// Execute-only protection of one guest frame.
#[derive(Debug)]
pub struct PageShadowGuard {
    gfn: Gfn,

    /// The frame followed by `window` bytes of the next page.
    shadow: Vec<u8>,
    window: usize,

    references: u32,
    reported: bool,
    reads: u64,
    writes: u64,
}

impl PageShadowGuard {
    /// Captures the frame and restricts it to execute-only.
    ///
    /// `page` is the page-aligned address through which the frame is mapped.
    /// The trailing window is read through the same address space and is
    /// zero-filled if the next page is not mapped. Traps already installed in
    /// the captured range are replaced by the bytes they hide.
    pub(crate) fn install<Driver>(
        vmi: &VmiCore<Driver>,
        gfn: Gfn,
        page: AddressContext,
        window: usize,
        registry: &Registry,
    ) -> Result<Self, VmiError>
    where
        Driver: VmiDriver,
    {
        let page_size = Driver::Architecture::PAGE_SIZE as usize;
        let mut shadow = vec![0u8; page_size + window];

        vmi.read(page, &mut shadow[..page_size])?;
        registry.overlay(Driver::Architecture::pa_from_gfn(gfn), &mut shadow[..page_size]);

        if window > 0 {
            let next = page + page_size as u64;
            let trailing = vmi
                .translate_address(next)
                .and_then(|pa| vmi.read(pa, &mut shadow[page_size..]).map(|()| pa));

            match trailing {
                Ok(pa) => registry.overlay(pa, &mut shadow[page_size..]),
                Err(err) => {
                    shadow[page_size..].fill(0);
                    tracing::debug!(%err, %next, "trailing shadow bytes unavailable");
                }
            }
        }

        vmi.set_memory_access(gfn, MemoryAccess::X)?;
        tracing::debug!(%gfn, "page guard installed");

        Ok(Self {
            gfn,
            shadow,
            window,
            references: 1,
            reported: false,
            reads: 0,
            writes: 0,
        })
    }

    /// Returns the guarded frame.
    pub fn gfn(&self) -> Gfn {
        self.gfn
    }

    /// Returns the number of emulated reads.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Returns the number of emulated writes.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Returns the shadow bytes served for a read at `offset`.
    pub fn read_window(&self, offset: usize) -> Option<&[u8]> {
        self.shadow.get(offset..offset + self.window)
    }

    /// Answers an access to the guarded frame.
    pub fn on_access<Driver>(
        &mut self,
        pa: Pa,
        access: MemoryAccess,
    ) -> VmiEventResponse<Driver::Architecture>
    where
        Driver: VmiDriver,
    {
        if !self.reported {
            self.reported = true;
            tracing::warn!(
                gfn = %self.gfn,
                %access,
                "guarded page accessed, check if patch guard is active"
            );
        }

        if access.contains(MemoryAccess::W) {
            self.writes += 1;
            tracing::debug!(%pa, writes = self.writes, "write to guarded page emulated");
            return VmiEventResponse::emulate();
        }

        if access.contains(MemoryAccess::R) {
            let offset = Driver::Architecture::pa_offset(pa) as usize;
            let response = self
                .read_window(offset)
                .map(VmiEventResponse::<Driver::Architecture>::emulate_read);

            if let Some(response) = response {
                self.reads += 1;
                tracing::trace!(%pa, reads = self.reads, "read of guarded page emulated");
                return response;
            }
        }

        VmiEventResponse::default()
    }

    /// Lifts the access restriction.
    pub fn teardown<Driver>(&self, vmi: &VmiCore<Driver>) -> Result<(), VmiError>
    where
        Driver: VmiDriver,
    {
        vmi.set_memory_access(self.gfn, MemoryAccess::RWX)?;
        tracing::debug!(gfn = %self.gfn, "page guard removed");
        Ok(())
    }
}

/// Guards keyed by frame, shared by every trap location in the frame.
#[derive(Debug)]
pub(crate) struct ShadowGuards {
    window: usize,
    guards: HashMap<Gfn, PageShadowGuard>,
}

impl ShadowGuards {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            window,
            guards: HashMap::new(),
        }
    }

    pub(crate) fn get_mut(&mut self, gfn: Gfn) -> Option<&mut PageShadowGuard> {
        self.guards.get_mut(&gfn)
    }

    /// Takes a reference on the guard of `gfn`, installing it if needed.
    pub(crate) fn acquire<Driver>(
        &mut self,
        vmi: &VmiCore<Driver>,
        registry: &Registry,
        gfn: Gfn,
        page: AddressContext,
    ) -> Result<(), VmiError>
    where
        Driver: VmiDriver,
    {
        if let Some(guard) = self.guards.get_mut(&gfn) {
            guard.references += 1;
            return Ok(());
        }

        let guard = PageShadowGuard::install(vmi, gfn, page, self.window, registry)?;
        self.guards.insert(gfn, guard);
        Ok(())
    }

    /// Drops a reference on the guard of `gfn`, removing it with the last
    /// reference.
    pub(crate) fn release<Driver>(&mut self, vmi: &VmiCore<Driver>, gfn: Gfn)
    where
        Driver: VmiDriver,
    {
        let Some(guard) = self.guards.get_mut(&gfn) else {
            return;
        };

        guard.references -= 1;
        if guard.references > 0 {
            return;
        }

        let Some(guard) = self.guards.remove(&gfn) else {
            return;
        };

        if let Err(err) = guard.teardown(vmi) {
            tracing::error!(%err, %gfn, "failed to remove page guard");
        }
    }

    pub(crate) fn teardown<Driver>(&mut self, vmi: &VmiCore<Driver>)
    where
        Driver: VmiDriver,
    {
        for (gfn, guard) in self.guards.drain() {
            if let Err(err) = guard.teardown(vmi) {
                tracing::error!(%err, %gfn, "failed to remove page guard");
            }
        }
    }
}
