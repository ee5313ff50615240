//! Core types for hypervisor breakpoint multiplexing.
//!
//! [`VmiCore`] wraps a [`VmiDriver`] with the memory primitives the
//! breakpoint engine relies on: translation of virtual addresses, byte and
//! range access to guest physical memory, and the page and translation
//! caches that must be flushed whenever guest page tables may have changed.

pub mod arch;
mod core;
mod driver;
mod error;
mod event;
pub mod os;
mod page;

use std::{cell::RefCell, num::NonZeroUsize, time::Duration};

use lru::LruCache;

pub use self::{
    arch::{Architecture, Registers},
    core::{
        AccessContext, AddressContext, Gfn, MemoryAccess, Pa, TranslationMechanism, Va, VcpuId,
        VmiInfo,
    },
    driver::VmiDriver,
    error::{PageFault, PageFaults, VmiError},
    event::{VmiEvent, VmiEventFlags, VmiEventResponse, VmiEventResponseFlags, VmiReadData},
    os::{ProcessId, VmiOs, VmiProcess},
    page::VmiMappedPage,
};

struct Cache {
    gfn: RefCell<LruCache<Gfn, VmiMappedPage>>,
    v2p: RefCell<LruCache<AddressContext, Pa>>,
}

impl Cache {
    const DEFAULT_SIZE: NonZeroUsize = NonZeroUsize::new(8192).unwrap();

    fn new() -> Self {
        Self {
            gfn: RefCell::new(LruCache::new(Self::DEFAULT_SIZE)),
            v2p: RefCell::new(LruCache::new(Self::DEFAULT_SIZE)),
        }
    }
}

/// The core functionality for Virtual Machine Introspection (VMI).
pub struct VmiCore<Driver>
where
    Driver: VmiDriver,
{
    driver: Driver,
    cache: Cache,
}

impl<Driver> VmiCore<Driver>
where
    Driver: VmiDriver,
{
    /// Creates a new `VmiCore` instance with the given driver.
    ///
    /// Both the GFN cache and the V2P cache are enabled, each with a
    /// capacity of 8192 entries.
    pub fn new(driver: Driver) -> Result<Self, VmiError> {
        Ok(Self {
            driver,
            cache: Cache::new(),
        })
    }

    /// Replaces the GFN cache with one of the given capacity.
    pub fn with_gfn_cache(self, size: NonZeroUsize) -> Self {
        Self {
            cache: Cache {
                gfn: RefCell::new(LruCache::new(size)),
                ..self.cache
            },
            ..self
        }
    }

    /// Replaces the V2P cache with one of the given capacity.
    pub fn with_v2p_cache(self, size: NonZeroUsize) -> Self {
        Self {
            cache: Cache {
                v2p: RefCell::new(LruCache::new(size)),
                ..self.cache
            },
            ..self
        }
    }

    /// Removes a specific entry from the GFN cache.
    pub fn flush_gfn_cache_entry(&self, gfn: Gfn) -> Option<VmiMappedPage> {
        self.cache.gfn.borrow_mut().pop(&gfn)
    }

    /// Clears the entire GFN cache.
    pub fn flush_gfn_cache(&self) {
        self.cache.gfn.borrow_mut().clear();
    }

    /// Clears the entire V2P cache.
    ///
    /// The guest may rewrite its page tables between any two events, so a
    /// cached translation is only trustworthy within the event that
    /// produced it.
    pub fn flush_v2p_cache(&self) {
        self.cache.v2p.borrow_mut().clear();
    }

    /// Returns the driver used by this `VmiCore` instance.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Retrieves information about the virtual machine.
    pub fn info(&self) -> Result<VmiInfo, VmiError> {
        self.driver.info()
    }

    /// Pauses the virtual machine and returns a guard that will resume it when
    /// dropped.
    pub fn pause_guard(&self) -> Result<VmiPauseGuard<'_, Driver>, VmiError> {
        VmiPauseGuard::new(&self.driver)
    }

    /// Sets the memory access permissions for a specific guest frame number
    /// (GFN).
    pub fn set_memory_access(&self, gfn: Gfn, access: MemoryAccess) -> Result<(), VmiError> {
        self.driver.set_memory_access(gfn, access)
    }

    /// Enables monitoring of specific events.
    pub fn monitor_enable(
        &self,
        option: <Driver::Architecture as Architecture>::EventMonitor,
    ) -> Result<(), VmiError> {
        self.driver.monitor_enable(option)
    }

    /// Disables monitoring of specific events.
    pub fn monitor_disable(
        &self,
        option: <Driver::Architecture as Architecture>::EventMonitor,
    ) -> Result<(), VmiError> {
        self.driver.monitor_disable(option)
    }

    /// Returns the number of events delivered but not yet processed.
    pub fn events_pending(&self) -> usize {
        self.driver.events_pending()
    }

    /// Waits for an event to occur and processes it with the provided handler.
    pub fn wait_for_event(
        &self,
        timeout: Duration,
        handler: impl FnMut(&VmiEvent<Driver::Architecture>) -> VmiEventResponse<Driver::Architecture>,
    ) -> Result<(), VmiError> {
        self.driver.wait_for_event(timeout, handler)
    }

    /// Resets the state of the VMI system.
    pub fn reset_state(&self) -> Result<(), VmiError> {
        self.driver.reset_state()
    }

    /// Reads memory from the virtual machine.
    pub fn read(&self, ctx: impl Into<AccessContext>, buffer: &mut [u8]) -> Result<(), VmiError> {
        let ctx = ctx.into();
        let mut position = 0usize;

        while position < buffer.len() {
            let address = self.translate_access_context(ctx + position as u64)?;
            let gfn = Driver::Architecture::gfn_from_pa(address);
            let offset = Driver::Architecture::pa_offset(address) as usize;

            let page = self.read_page(gfn)?;
            let page = page.get(offset..).ok_or(VmiError::OutOfBounds)?;

            let size = std::cmp::min(buffer.len() - position, page.len());
            buffer[position..position + size].copy_from_slice(&page[..size]);
            position += size;
        }

        Ok(())
    }

    /// Writes memory to the virtual machine.
    ///
    /// Every touched page is evicted from the GFN cache.
    pub fn write(&self, ctx: impl Into<AccessContext>, buffer: &[u8]) -> Result<(), VmiError> {
        let ctx = ctx.into();
        let mut position = 0usize;

        while position < buffer.len() {
            let address = self.translate_access_context(ctx + position as u64)?;
            let gfn = Driver::Architecture::gfn_from_pa(address);
            let offset = Driver::Architecture::pa_offset(address);

            let size = std::cmp::min(
                buffer.len() - position,
                (Driver::Architecture::PAGE_SIZE - offset) as usize,
            );

            self.driver
                .write_page(gfn, offset, &buffer[position..position + size])?;
            self.flush_gfn_cache_entry(gfn);
            position += size;
        }

        Ok(())
    }

    /// Reads a single byte from the virtual machine.
    pub fn read_u8(&self, ctx: impl Into<AccessContext>) -> Result<u8, VmiError> {
        let mut buffer = [0u8; 1];
        self.read(ctx, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Writes a single byte to the virtual machine.
    pub fn write_u8(&self, ctx: impl Into<AccessContext>, value: u8) -> Result<(), VmiError> {
        self.write(ctx, &[value])
    }

    /// Translates a virtual address to a physical address.
    pub fn translate_address(&self, ctx: impl Into<AddressContext>) -> Result<Pa, VmiError> {
        let ctx = ctx.into();
        let mut cache = self.cache.v2p.borrow_mut();
        let pa = cache.try_get_or_insert(ctx, || {
            <Driver::Architecture as Architecture>::translate_address(self, ctx.va, ctx.root)
        })?;
        Ok(*pa)
    }

    /// Translates an access context to a physical address.
    pub fn translate_access_context(&self, ctx: AccessContext) -> Result<Pa, VmiError> {
        match ctx.mechanism {
            TranslationMechanism::Direct => Ok(Pa(ctx.address)),
            TranslationMechanism::Paging { root } => {
                self.translate_address((Va(ctx.address), root))
            }
        }
    }

    /// Reads a page of memory from the virtual machine, using the GFN cache.
    pub fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        let mut cache = self.cache.gfn.borrow_mut();
        let page = cache.try_get_or_insert(gfn, || self.driver.read_page(gfn))?;

        // Mapped pages are reference counted, so cloning it is cheap.
        Ok(page.clone())
    }
}

/// A guard that pauses the virtual machine on creation and resumes it on drop.
pub struct VmiPauseGuard<'a, Driver>
where
    Driver: VmiDriver,
{
    driver: &'a Driver,
}

impl<'a, Driver> VmiPauseGuard<'a, Driver>
where
    Driver: VmiDriver,
{
    /// Creates a new pause guard.
    pub fn new(driver: &'a Driver) -> Result<Self, VmiError> {
        driver.pause()?;
        Ok(Self { driver })
    }
}

impl<Driver> Drop for VmiPauseGuard<'_, Driver>
where
    Driver: VmiDriver,
{
    fn drop(&mut self) {
        if let Err(err) = self.driver.resume() {
            tracing::error!(%err, "failed to resume the virtual machine");
        }
    }
}
