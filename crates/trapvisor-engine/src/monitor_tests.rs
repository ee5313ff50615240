use std::{
    cell::{Cell, RefCell},
    io,
    rc::Rc,
    time::Duration,
};

use trapvisor_arch_amd64::{ControlRegister, EventMonitor, ExceptionVector};
use trapvisor_core::VcpuId;

use super::*;
use crate::{
    BreakpointAction,
    mock::{
        KERNEL_PA, KERNEL_ROOT_A, KERNEL_VA, MockOs, USER_ROOT_B, guest, process_a, process_b,
        switch_event, trap_event,
    },
};

fn os() -> MockOs {
    MockOs {
        processes: vec![process_a(), process_b()],
    }
}

fn collecting() -> (Rc<RefCell<Vec<String>>>, MonitorContext) {
    let errors = Rc::new(RefCell::new(Vec::new()));
    let context = MonitorContext::new({
        let errors = errors.clone();
        move |err: &VmiError| errors.borrow_mut().push(err.to_string())
    });

    (errors, context)
}

#[test]
fn run_dispatches_until_stop_is_requested() {
    let vmi = guest(1);
    let os = os();
    let (errors, context) = collecting();
    let monitor = Monitor::new(&vmi, &os, context.clone());
    let hits = Rc::new(Cell::new(0));

    vmi.driver()
        .push_event(trap_event(0, KERNEL_VA, KERNEL_PA, KERNEL_ROOT_A));

    monitor
        .run(|session| {
            let hits = hits.clone();
            let context = session.dispatcher().context().clone();

            session.create_breakpoint(KERNEL_VA, KERNEL_ROOT_A, BreakpointScope::Global, move |_| {
                hits.set(hits.get() + 1);
                context.request_stop();
                Ok(BreakpointAction::Continue)
            })?;

            assert_eq!(session.vmi().driver().peek(KERNEL_PA), 0xcc);
            Ok(())
        })
        .unwrap();

    assert_eq!(hits.get(), 1);
    assert_eq!(vmi.driver().waits(), 1);
    assert!(errors.borrow().is_empty());
    assert!(context.should_stop());

    // Torn down: original byte, no pending step and no monitors left behind.
    assert_eq!(vmi.driver().peek(KERNEL_PA), 0x10);
    assert!(!vmi.driver().is_monitored(EventMonitor::Singlestep(VcpuId(0))));
    assert!(!vmi.driver().is_monitored(EventMonitor::Interrupt(ExceptionVector::Breakpoint)));
    assert!(!vmi.driver().is_monitored(EventMonitor::Register(ControlRegister::Cr3)));
    assert_eq!((vmi.driver().pauses(), vmi.driver().resumes()), (1, 1));
}

#[test]
fn failed_setup_is_reported_and_torn_down() {
    let vmi = guest(1);
    let os = os();
    let (errors, context) = collecting();
    let monitor = Monitor::new(&vmi, &os, context.clone());

    let result = monitor.run(|session| {
        session.create_breakpoint(KERNEL_VA, KERNEL_ROOT_A, BreakpointScope::Global, |_| {
            Ok(BreakpointAction::Continue)
        })?;

        session.create_breakpoint(KERNEL_VA, Pa(0xdead_0000), BreakpointScope::Global, |_| {
            Ok(BreakpointAction::Continue)
        })?;

        Ok(())
    });

    assert!(matches!(result, Err(VmiError::ProcessNotFound(Pa(0xdead_0000)))));
    assert_eq!(errors.borrow().len(), 1);
    assert!(context.should_stop());
    assert_eq!(vmi.driver().waits(), 0);
    assert_eq!(vmi.driver().peek(KERNEL_PA), 0x10);
}

#[test]
fn wait_failure_ends_run_with_error() {
    let vmi = guest(1);
    let os = os();
    let (errors, context) = collecting();
    let monitor = Monitor::new(&vmi, &os, context);

    vmi.driver().fail_next_wait(VmiError::Other("hypervisor went away"));

    let result = monitor.run(|session| {
        session.create_breakpoint(KERNEL_VA, KERNEL_ROOT_A, BreakpointScope::Global, |_| {
            Ok(BreakpointAction::Continue)
        })?;

        Ok(())
    });

    assert!(matches!(result, Err(VmiError::Other("hypervisor went away"))));
    assert_eq!(*errors.borrow(), ["hypervisor went away"]);
    assert_eq!(vmi.driver().peek(KERNEL_PA), 0x10);
}

#[test]
fn interrupted_wait_ends_run_quietly() {
    let vmi = guest(1);
    let os = os();
    let (errors, context) = collecting();
    let options = MonitorOptions::default().with_wait_timeout(Duration::from_millis(10));
    let monitor = Monitor::new(&vmi, &os, context).with_options(options);

    vmi.driver().push_event(switch_event(0, USER_ROOT_B));
    vmi.driver()
        .fail_next_wait(VmiError::Io(io::Error::from(io::ErrorKind::Interrupted)));

    monitor.run(|_| Ok(())).unwrap();

    assert_eq!(vmi.driver().waits(), 2);
    assert!(errors.borrow().is_empty());
}
