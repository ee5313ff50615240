//! In-memory driver used by the unit tests.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet, VecDeque},
    time::Duration,
};

use trapvisor_arch_amd64::{
    Amd64, ControlRegister, EventInterrupt, EventMemoryAccess, EventMonitor, EventReason,
    EventSinglestep, EventWriteControlRegister, Interrupt, PageTableEntry, PageTableLevel,
    Registers,
};
use trapvisor_core::{
    Architecture as _, Gfn, MemoryAccess, Pa, ProcessId, Va, VcpuId, VmiCore, VmiDriver, VmiError,
    VmiEvent, VmiEventFlags, VmiEventResponse, VmiInfo, VmiMappedPage, VmiOs, VmiProcess,
};

pub const KERNEL_ROOT_A: Pa = Pa(0x0010_0000);
pub const USER_ROOT_A: Pa = Pa(0x0010_1000);
pub const KERNEL_ROOT_B: Pa = Pa(0x0011_0000);
pub const USER_ROOT_B: Pa = Pa(0x0011_1000);

pub const KERNEL_VA: Va = Va(0xfffff803_1240_0000);
pub const KERNEL_PA: Pa = Pa(0x0200_0000);

pub const USER_VA: Va = Va(0x0000_7ff6_3a20_0000);
pub const USER_PA: Pa = Pa(0x0300_0000);

const PAGE_SIZE: usize = Amd64::PAGE_SIZE as usize;
const FIRST_TABLE: u64 = 0x8000;

pub struct MockDriver {
    vcpus: u16,
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
    next_table: Cell<u64>,

    writes: RefCell<Vec<(Pa, u8)>>,
    rejected_writes: RefCell<HashSet<Pa>>,
    access: RefCell<HashMap<Gfn, MemoryAccess>>,
    monitors: RefCell<Vec<(EventMonitor, bool)>>,

    events: RefCell<VecDeque<VmiEvent<Amd64>>>,
    responses: RefCell<Vec<VmiEventResponse<Amd64>>>,
    waits: Cell<usize>,
    wait_error: RefCell<Option<VmiError>>,

    pauses: Cell<usize>,
    resumes: Cell<usize>,
}

impl MockDriver {
    pub fn new(vcpus: u16) -> Self {
        Self {
            vcpus,
            pages: RefCell::new(HashMap::new()),
            next_table: Cell::new(FIRST_TABLE),
            writes: RefCell::new(Vec::new()),
            rejected_writes: RefCell::new(HashSet::new()),
            access: RefCell::new(HashMap::new()),
            monitors: RefCell::new(Vec::new()),
            events: RefCell::new(VecDeque::new()),
            responses: RefCell::new(Vec::new()),
            waits: Cell::new(0),
            wait_error: RefCell::new(None),
            pauses: Cell::new(0),
            resumes: Cell::new(0),
        }
    }

    /// Maps the page containing `va` to the frame containing `pa`.
    pub fn map(&self, root: Pa, va: Va, pa: Pa) {
        let mut table = Amd64::gfn_from_pa(root);
        self.frame(table);

        let mut level = PageTableLevel::Pml4;
        while let Some(next) = level.next() {
            let index = Amd64::va_index_for(va, level);
            let entry = self.entry(table, index);

            table = if entry.present() {
                entry.pfn()
            }
            else {
                let gfn = Gfn(self.next_table.get());
                self.next_table.set(gfn.0 + 1);
                self.frame(gfn);
                self.set_entry(table, index, PageTableEntry((gfn.0 << 12) | 1));
                gfn
            };

            level = next;
        }

        let gfn = Amd64::gfn_from_pa(pa);
        self.frame(gfn);
        self.set_entry(
            table,
            Amd64::va_index_for(va, PageTableLevel::Pt),
            PageTableEntry((gfn.0 << 12) | 1),
        );
    }

    /// Writes guest memory without recording the write.
    pub fn poke(&self, pa: Pa, content: &[u8]) {
        for (index, byte) in content.iter().enumerate() {
            let pa = pa + index as u64;
            let offset = Amd64::pa_offset(pa) as usize;
            self.frame(Amd64::gfn_from_pa(pa));
            self.pages.borrow_mut().get_mut(&Amd64::gfn_from_pa(pa)).unwrap()[offset] = *byte;
        }
    }

    pub fn peek(&self, pa: Pa) -> u8 {
        let offset = Amd64::pa_offset(pa) as usize;
        self.pages.borrow()[&Amd64::gfn_from_pa(pa)][offset]
    }

    /// Returns every byte written through the driver at `pa`, in order.
    pub fn writes_at(&self, pa: Pa) -> Vec<u8> {
        self.writes
            .borrow()
            .iter()
            .filter(|(address, _)| *address == pa)
            .map(|(_, byte)| *byte)
            .collect()
    }

    pub fn reject_writes_at(&self, pa: Pa) {
        self.rejected_writes.borrow_mut().insert(pa);
    }

    pub fn accept_writes_at(&self, pa: Pa) {
        self.rejected_writes.borrow_mut().remove(&pa);
    }

    pub fn access(&self, gfn: Gfn) -> Option<MemoryAccess> {
        self.access.borrow().get(&gfn).copied()
    }

    pub fn is_monitored(&self, monitor: EventMonitor) -> bool {
        self.monitors
            .borrow()
            .iter()
            .rev()
            .find(|(candidate, _)| *candidate == monitor)
            .is_some_and(|(_, enabled)| *enabled)
    }

    pub fn monitor_toggles(&self, monitor: EventMonitor) -> usize {
        self.monitors
            .borrow()
            .iter()
            .filter(|(candidate, _)| *candidate == monitor)
            .count()
    }

    pub fn push_event(&self, event: VmiEvent<Amd64>) {
        self.events.borrow_mut().push_back(event);
    }

    pub fn take_responses(&self) -> Vec<VmiEventResponse<Amd64>> {
        std::mem::take(&mut self.responses.borrow_mut())
    }

    pub fn waits(&self) -> usize {
        self.waits.get()
    }

    /// Makes the next wait on an empty queue fail with `err`.
    pub fn fail_next_wait(&self, err: VmiError) {
        *self.wait_error.borrow_mut() = Some(err);
    }

    pub fn pauses(&self) -> usize {
        self.pauses.get()
    }

    pub fn resumes(&self) -> usize {
        self.resumes.get()
    }

    fn frame(&self, gfn: Gfn) {
        self.pages
            .borrow_mut()
            .entry(gfn)
            .or_insert_with(|| vec![0u8; PAGE_SIZE]);
    }

    fn entry(&self, table: Gfn, index: u64) -> PageTableEntry {
        let pages = self.pages.borrow();
        let offset = index as usize * 8;
        let bytes = &pages[&table][offset..offset + 8];
        PageTableEntry(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn set_entry(&self, table: Gfn, index: u64, entry: PageTableEntry) {
        let mut pages = self.pages.borrow_mut();
        let offset = index as usize * 8;
        pages.get_mut(&table).unwrap()[offset..offset + 8].copy_from_slice(&entry.0.to_le_bytes());
    }
}

impl VmiDriver for MockDriver {
    type Architecture = Amd64;

    fn info(&self) -> Result<VmiInfo, VmiError> {
        Ok(VmiInfo {
            page_size: Amd64::PAGE_SIZE,
            page_shift: Amd64::PAGE_SHIFT,
            max_gfn: Gfn(0xf_ffff),
            vcpus: self.vcpus,
        })
    }

    fn pause(&self) -> Result<(), VmiError> {
        self.pauses.set(self.pauses.get() + 1);
        Ok(())
    }

    fn resume(&self) -> Result<(), VmiError> {
        self.resumes.set(self.resumes.get() + 1);
        Ok(())
    }

    fn set_memory_access(&self, gfn: Gfn, access: MemoryAccess) -> Result<(), VmiError> {
        self.access.borrow_mut().insert(gfn, access);
        Ok(())
    }

    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        match self.pages.borrow().get(&gfn) {
            Some(page) => Ok(VmiMappedPage::from(page.clone())),
            None => Err(VmiError::Other("frame not backed")),
        }
    }

    fn write_page(&self, gfn: Gfn, offset: u64, content: &[u8]) -> Result<(), VmiError> {
        let base = Amd64::pa_from_gfn(gfn) + offset;
        if (0..content.len() as u64).any(|index| self.rejected_writes.borrow().contains(&(base + index))) {
            return Err(VmiError::Other("write rejected"));
        }

        let mut pages = self.pages.borrow_mut();
        let page = pages
            .get_mut(&gfn)
            .ok_or(VmiError::Other("frame not backed"))?;

        let offset = offset as usize;
        page[offset..offset + content.len()].copy_from_slice(content);

        let mut writes = self.writes.borrow_mut();
        for (index, byte) in content.iter().enumerate() {
            writes.push((base + index as u64, *byte));
        }

        Ok(())
    }

    fn monitor_enable(&self, option: EventMonitor) -> Result<(), VmiError> {
        self.monitors.borrow_mut().push((option, true));
        Ok(())
    }

    fn monitor_disable(&self, option: EventMonitor) -> Result<(), VmiError> {
        self.monitors.borrow_mut().push((option, false));
        Ok(())
    }

    fn events_pending(&self) -> usize {
        self.events.borrow().len()
    }

    fn wait_for_event(
        &self,
        _timeout: Duration,
        mut handler: impl FnMut(&VmiEvent<Amd64>) -> VmiEventResponse<Amd64>,
    ) -> Result<(), VmiError> {
        self.waits.set(self.waits.get() + 1);

        let event = self.events.borrow_mut().pop_front();
        match event {
            Some(event) => {
                let response = handler(&event);
                self.responses.borrow_mut().push(response);
                Ok(())
            }
            None => match self.wait_error.borrow_mut().take() {
                Some(err) => Err(err),
                None => Err(VmiError::Timeout),
            },
        }
    }

    fn reset_state(&self) -> Result<(), VmiError> {
        Ok(())
    }
}

/// Process directory over a fixed list.
pub struct MockOs {
    pub processes: Vec<VmiProcess>,
}

impl VmiOs<MockDriver> for MockOs {
    fn process_by_root(
        &self,
        _vmi: &VmiCore<MockDriver>,
        root: Pa,
    ) -> Result<Option<VmiProcess>, VmiError> {
        Ok(self
            .processes
            .iter()
            .find(|process| process.owns_root(root))
            .cloned())
    }
}

pub fn process_a() -> VmiProcess {
    VmiProcess {
        id: ProcessId(4),
        name: String::from("System"),
        translation_root: KERNEL_ROOT_A,
        user_translation_root: USER_ROOT_A,
    }
}

pub fn process_b() -> VmiProcess {
    VmiProcess {
        id: ProcessId(1337),
        name: String::from("notepad.exe"),
        translation_root: KERNEL_ROOT_B,
        user_translation_root: USER_ROOT_B,
    }
}

/// A guest with two processes that share the kernel code page and the
/// user code page.
pub fn guest(vcpus: u16) -> VmiCore<MockDriver> {
    let driver = MockDriver::new(vcpus);

    for root in [KERNEL_ROOT_A, KERNEL_ROOT_B] {
        driver.map(root, KERNEL_VA, KERNEL_PA);
        driver.map(root, KERNEL_VA + 0x1000u64, KERNEL_PA + 0x1000u64);
    }

    for root in [USER_ROOT_A, USER_ROOT_B] {
        driver.map(root, USER_VA, USER_PA);
    }

    let code: Vec<u8> = (0..PAGE_SIZE).map(|index| (index % 0x80) as u8 + 0x10).collect();
    driver.poke(KERNEL_PA, &code);
    driver.poke(KERNEL_PA + 0x1000u64, &code);
    driver.poke(USER_PA, &code);

    VmiCore::new(driver).unwrap()
}

pub fn trap_event(vcpu: u16, va: Va, pa: Pa, root: Pa) -> VmiEvent<Amd64> {
    let registers = Registers {
        rip: va.0,
        cr3: root.0.into(),
        ..Default::default()
    };

    VmiEvent::new(
        VcpuId(vcpu),
        VmiEventFlags::VCPU_PAUSED,
        registers,
        EventReason::Interrupt(EventInterrupt {
            gfn: Amd64::gfn_from_pa(pa),
            interrupt: Interrupt::breakpoint(1),
        }),
    )
}

pub fn singlestep_event(vcpu: u16) -> VmiEvent<Amd64> {
    VmiEvent::new(
        VcpuId(vcpu),
        VmiEventFlags::VCPU_PAUSED,
        Registers::default(),
        EventReason::Singlestep(EventSinglestep { gfn: Gfn(0) }),
    )
}

pub fn switch_event(vcpu: u16, root: Pa) -> VmiEvent<Amd64> {
    VmiEvent::new(
        VcpuId(vcpu),
        VmiEventFlags::VCPU_PAUSED,
        Registers::default(),
        EventReason::WriteControlRegister(EventWriteControlRegister {
            register: ControlRegister::Cr3,
            new_value: root.0,
            old_value: 0,
        }),
    )
}

pub fn access_event(vcpu: u16, va: Va, pa: Pa, access: MemoryAccess) -> VmiEvent<Amd64> {
    VmiEvent::new(
        VcpuId(vcpu),
        VmiEventFlags::VCPU_PAUSED,
        Registers::default(),
        EventReason::MemoryAccess(EventMemoryAccess { pa, va, access }),
    )
}
