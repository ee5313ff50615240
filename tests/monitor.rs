//! Drives a [`Monitor`] over a scripted event stream and stops it from a
//! breakpoint callback through a signal, the way a command line tool would
//! on SIGINT.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::Duration,
};

use trapvisor::{
    Architecture as _, Gfn, MemoryAccess, Pa, ProcessId, Va, VcpuId, VmiCore, VmiDriver, VmiError,
    VmiEvent, VmiEventFlags, VmiEventResponse, VmiEventResponseFlags, VmiInfo, VmiMappedPage,
    VmiOs, VmiProcess,
    arch::amd64::{
        Amd64, EventInterrupt, EventMemoryAccess, EventReason, EventSinglestep, Interrupt,
        PageTableEntry, PageTableLevel, Registers,
    },
    engine::{BreakpointAction, BreakpointScope, Monitor, MonitorContext, MonitorOptions},
};

const ROOT: Pa = Pa(0x0010_0000);
const CODE_VA: Va = Va(0xfffff806_2a31_4560);
const CODE_PA: Pa = Pa(0x0004_2560);

struct ScriptedDriver {
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
    script: RefCell<VecDeque<VmiEvent<Amd64>>>,
    responses: RefCell<Vec<VmiEventResponse<Amd64>>>,
}

impl ScriptedDriver {
    fn new() -> Self {
        Self {
            pages: RefCell::new(HashMap::new()),
            script: RefCell::new(VecDeque::new()),
            responses: RefCell::new(Vec::new()),
        }
    }

    /// Builds a four-level mapping of `va` to `pa`, allocating tables
    /// right after the root.
    fn map(&self, root: Pa, va: Va, pa: Pa) {
        let mut pages = self.pages.borrow_mut();
        let mut table = Amd64::gfn_from_pa(root);
        pages.entry(table).or_insert_with(|| vec![0; 0x1000]);

        let mut level = PageTableLevel::Pml4;
        loop {
            let next = match level.next() {
                Some(_) => Gfn(table.0 + 1),
                None => Amd64::gfn_from_pa(pa),
            };

            let offset = Amd64::va_index_for(va, level) as usize * 8;
            let entry = PageTableEntry((next.0 << 12) | 1);
            pages.get_mut(&table).unwrap()[offset..offset + 8]
                .copy_from_slice(&entry.0.to_le_bytes());

            match level.next() {
                Some(lower) => {
                    pages.insert(next, vec![0; 0x1000]);
                    table = next;
                    level = lower;
                }
                None => {
                    pages.entry(next).or_insert_with(|| vec![0x90; 0x1000]);
                    break;
                }
            }
        }
    }

    fn byte(&self, pa: Pa) -> u8 {
        self.pages.borrow()[&Amd64::gfn_from_pa(pa)][Amd64::pa_offset(pa) as usize]
    }
}

impl VmiDriver for ScriptedDriver {
    type Architecture = Amd64;

    fn info(&self) -> Result<VmiInfo, VmiError> {
        Ok(VmiInfo {
            page_size: Amd64::PAGE_SIZE,
            page_shift: Amd64::PAGE_SHIFT,
            max_gfn: Gfn(0xfffff),
            vcpus: 1,
        })
    }

    fn pause(&self) -> Result<(), VmiError> {
        Ok(())
    }

    fn resume(&self) -> Result<(), VmiError> {
        Ok(())
    }

    fn set_memory_access(&self, _gfn: Gfn, _access: MemoryAccess) -> Result<(), VmiError> {
        Ok(())
    }

    fn read_page(&self, gfn: Gfn) -> Result<VmiMappedPage, VmiError> {
        self.pages
            .borrow()
            .get(&gfn)
            .map(|page| VmiMappedPage::from(page.clone()))
            .ok_or(VmiError::Other("frame not backed"))
    }

    fn write_page(&self, gfn: Gfn, offset: u64, content: &[u8]) -> Result<(), VmiError> {
        let mut pages = self.pages.borrow_mut();
        let page = pages
            .get_mut(&gfn)
            .ok_or(VmiError::Other("frame not backed"))?;

        let offset = offset as usize;
        page[offset..offset + content.len()].copy_from_slice(content);
        Ok(())
    }

    fn monitor_enable(&self, _option: trapvisor::arch::amd64::EventMonitor) -> Result<(), VmiError> {
        Ok(())
    }

    fn monitor_disable(&self, _option: trapvisor::arch::amd64::EventMonitor) -> Result<(), VmiError> {
        Ok(())
    }

    fn events_pending(&self) -> usize {
        self.script.borrow().len()
    }

    fn wait_for_event(
        &self,
        _timeout: Duration,
        mut handler: impl FnMut(&VmiEvent<Amd64>) -> VmiEventResponse<Amd64>,
    ) -> Result<(), VmiError> {
        let event = self.script.borrow_mut().pop_front();
        let event = event.ok_or(VmiError::Timeout)?;

        let response = handler(&event);
        self.responses.borrow_mut().push(response);
        Ok(())
    }

    fn reset_state(&self) -> Result<(), VmiError> {
        Ok(())
    }
}

struct SingleProcess(VmiProcess);

impl VmiOs<ScriptedDriver> for SingleProcess {
    fn process_by_root(
        &self,
        _vmi: &VmiCore<ScriptedDriver>,
        root: Pa,
    ) -> Result<Option<VmiProcess>, VmiError> {
        Ok(self.0.owns_root(root).then(|| self.0.clone()))
    }
}

fn event(reason: EventReason) -> VmiEvent<Amd64> {
    let registers = Registers {
        rip: CODE_VA.0,
        cr3: ROOT.0.into(),
        ..Default::default()
    };

    VmiEvent::new(VcpuId(0), VmiEventFlags::VCPU_PAUSED, registers, reason)
}

fn trap() -> VmiEvent<Amd64> {
    event(EventReason::Interrupt(EventInterrupt {
        gfn: Amd64::gfn_from_pa(CODE_PA),
        interrupt: Interrupt::breakpoint(1),
    }))
}

fn step() -> VmiEvent<Amd64> {
    event(EventReason::Singlestep(EventSinglestep {
        gfn: Amd64::gfn_from_pa(CODE_PA),
    }))
}

fn read(pa: Pa) -> VmiEvent<Amd64> {
    event(EventReason::MemoryAccess(EventMemoryAccess {
        pa,
        va: CODE_VA,
        access: MemoryAccess::R,
    }))
}

#[test]
fn monitor_stops_on_signal_and_restores_guest() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    let driver = ScriptedDriver::new();
    driver.map(ROOT, CODE_VA, CODE_PA);
    driver.script.borrow_mut().extend([
        trap(),
        step(),
        read(CODE_PA - 4u64),
        trap(),
        step(),
    ]);

    let vmi = VmiCore::new(driver)?;
    let os = SingleProcess(VmiProcess {
        id: ProcessId(4),
        name: String::from("System"),
        translation_root: ROOT,
        user_translation_root: ROOT,
    });

    let context = MonitorContext::default();
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, context.terminate_flag())?;

    let hits = Rc::new(Cell::new(0));
    let options = MonitorOptions::default().with_wait_timeout(Duration::from_millis(10));
    let monitor = Monitor::new(&vmi, &os, context.clone()).with_options(options);

    monitor.run(|session| {
        let hits = hits.clone();

        session.create_breakpoint(CODE_VA, ROOT, BreakpointScope::Global, move |ctx| {
            hits.set(hits.get() + 1);
            tracing::info!(vcpu = %ctx.vcpu_id(), va = %ctx.va(), hits = hits.get(), "hit");

            if hits.get() == 2 {
                signal_hook::low_level::raise(signal_hook::consts::SIGUSR1)?;
            }

            Ok(BreakpointAction::Continue)
        })?;

        Ok(())
    })?;

    assert_eq!(hits.get(), 2);
    assert!(context.should_stop());

    let driver = vmi.driver();
    assert_eq!(driver.byte(CODE_PA), 0x90);

    // The step after the second hit was never consumed.
    assert_eq!(driver.script.borrow().len(), 1);

    let responses = driver.responses.borrow();
    assert_eq!(responses.len(), 4);
    assert!(responses[2].flags.contains(VmiEventResponseFlags::EMULATE));
    assert_eq!(responses[2].read_data.as_deref(), Some(&[0x90; 16][..]));

    Ok(())
}
