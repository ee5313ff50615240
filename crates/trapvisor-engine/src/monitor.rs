use std::io::ErrorKind;

use trapvisor_core::{Pa, Va, VmiCore, VmiDriver, VmiError, VmiOs};

use crate::{
    BreakpointHandle, BreakpointResult, BreakpointScope, InterruptDispatcher, MonitorContext,
    MonitorOptions, TrapContext, arch::ArchAdapter,
};

/// Runs the event loop of one monitored virtual machine.
pub struct Monitor<'a, Driver, Os>
where
    Driver: VmiDriver,
    Os: VmiOs<Driver>,
{
    vmi: &'a VmiCore<Driver>,
    os: &'a Os,
    context: MonitorContext,
    options: MonitorOptions,
}

/// What the setup closure of [`Monitor::run`] gets to work with.
pub struct MonitorSession<'a, Driver, Os>
where
    Driver: VmiDriver,
    Os: VmiOs<Driver>,
{
    vmi: &'a VmiCore<Driver>,
    os: &'a Os,
    dispatcher: &'a InterruptDispatcher<Driver>,
}

impl<'a, Driver, Os> MonitorSession<'a, Driver, Os>
where
    Driver: VmiDriver + 'static,
    Driver::Architecture: ArchAdapter,
    Os: VmiOs<Driver>,
{
    /// Returns the VMI core.
    pub fn vmi(&self) -> &'a VmiCore<Driver> {
        self.vmi
    }

    /// Returns the process directory.
    pub fn os(&self) -> &'a Os {
        self.os
    }

    /// Returns the dispatcher.
    pub fn dispatcher(&self) -> &'a InterruptDispatcher<Driver> {
        self.dispatcher
    }

    /// Creates a breakpoint at `va` in the process owning `root`.
    pub fn create_breakpoint(
        &self,
        va: Va,
        root: Pa,
        scope: BreakpointScope,
        callback: impl FnMut(&TrapContext<'_, Driver>) -> BreakpointResult + 'static,
    ) -> Result<BreakpointHandle<Driver>, VmiError> {
        let process = self
            .os
            .process_by_root(self.vmi, root)?
            .ok_or(VmiError::ProcessNotFound(root))?;

        self.dispatcher
            .create_breakpoint(self.vmi, va, &process, scope, callback)
    }
}

impl<'a, Driver, Os> Monitor<'a, Driver, Os>
where
    Driver: VmiDriver + 'static,
    Driver::Architecture: ArchAdapter,
    Os: VmiOs<Driver>,
{
    /// Creates a monitor with default options.
    pub fn new(vmi: &'a VmiCore<Driver>, os: &'a Os, context: MonitorContext) -> Self {
        Self {
            vmi,
            os,
            context,
            options: MonitorOptions::default(),
        }
    }

    /// Replaces the options.
    pub fn with_options(self, options: MonitorOptions) -> Self {
        Self { options, ..self }
    }

    /// Returns the shared context.
    pub fn context(&self) -> &MonitorContext {
        &self.context
    }

    /// Initializes a dispatcher, lets `setup` create breakpoints, and
    /// dispatches events until a stop is requested.
    ///
    /// The dispatcher is torn down on every exit path. Errors that end the
    /// loop are reported to the context's sink before being returned.
    #[tracing::instrument(skip_all)]
    pub fn run(
        &self,
        setup: impl FnOnce(&MonitorSession<'_, Driver, Os>) -> Result<(), VmiError>,
    ) -> Result<(), VmiError> {
        let dispatcher = InterruptDispatcher::with_options(self.context.clone(), &self.options);

        let result = dispatcher.initialize(self.vmi).and_then(|()| {
            setup(&MonitorSession {
                vmi: self.vmi,
                os: self.os,
                dispatcher: &dispatcher,
            })
        });

        let result = match result {
            Ok(()) => self.event_loop(&dispatcher),
            Err(err) => {
                tracing::error!(%err, "monitor setup failed");
                Err(err)
            }
        };

        if let Err(err) = &result {
            self.context.report(err);
            self.context.request_stop();
        }

        dispatcher.teardown(self.vmi);
        result
    }

    fn event_loop(&self, dispatcher: &InterruptDispatcher<Driver>) -> Result<(), VmiError> {
        while !self.context.should_stop() {
            let result = self
                .vmi
                .wait_for_event(self.options.wait_timeout, |event| {
                    dispatcher.handle_event(self.vmi, event)
                })
                .and_then(|()| dispatcher.reclaim(self.vmi));

            match result {
                Ok(()) => {}
                Err(VmiError::Timeout) => tracing::trace!("timeout"),
                Err(VmiError::Io(err)) if err.kind() == ErrorKind::Interrupted => {
                    tracing::debug!("interrupted");
                    break;
                }
                Err(err) => {
                    tracing::error!(%err, "monitor loop failed");
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
