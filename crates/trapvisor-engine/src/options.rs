use std::time::Duration;

use serde::{Deserialize, Serialize};
use trapvisor_core::Va;

/// Tunables of the monitor loop and the interrupt dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorOptions {
    /// How long a single wait for events may block.
    ///
    /// Bounds the latency of reacting to a stop request.
    pub wait_timeout: Duration,

    /// Number of shadow bytes returned to the guest for one emulated read
    /// of a guarded page.
    pub shadow_window: usize,

    /// Overrides the architecture's kernel space boundary.
    pub kernel_space_start: Option<Va>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_millis(500),
            shadow_window: 16,
            kernel_space_start: None,
        }
    }
}

impl MonitorOptions {
    /// Sets the event wait timeout.
    pub fn with_wait_timeout(self, wait_timeout: Duration) -> Self {
        Self {
            wait_timeout,
            ..self
        }
    }

    /// Sets the size of the emulated read window.
    pub fn with_shadow_window(self, shadow_window: usize) -> Self {
        Self {
            shadow_window,
            ..self
        }
    }

    /// Sets the kernel space boundary.
    pub fn with_kernel_space_start(self, kernel_space_start: Va) -> Self {
        Self {
            kernel_space_start: Some(kernel_space_start),
            ..self
        }
    }
}
