//! Cooperative task pump signalling
//!
//! The controller's interrupt path raises an [`IrqLine`]; that sets a single
//! pending marker and wakes any waiter. However many times it is raised before
//! the task runs, one pump is owed. The pump itself lives on
//! [`UsbHost::task`](crate::UsbHost::task).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Pending-pump marker plus wakeup for the cooperative task
#[derive(Debug, Default)]
pub struct PumpSignal {
    pending: AtomicBool,
    requests: AtomicU64,
    coalesced: AtomicU64,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PumpStats {
    pub requests: u64,
    /// Requests that found a pump already owed
    pub coalesced: u64,
}

impl PumpSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ask for a pump; returns `true` if no pump was owed before this call
    pub fn request(&self) -> bool {
        self.requests.fetch_add(1, Ordering::Relaxed);

        // Release pairs with the Acquire in `take`: whatever the requester
        // queued before raising is visible to the pump that clears the marker.
        if self.pending.swap(true, Ordering::AcqRel) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let _guard = self.wake_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.wake.notify_all();
        true
    }

    /// Clear the marker, returning whether a pump was owed
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Block until a pump is requested or `timeout` passes
    ///
    /// Returns whether a pump is owed. Does not clear the marker.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.wake_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_pending() {
            return true;
        }
        let _ = self
            .wake
            .wait_timeout_while(guard, timeout, |_| !self.is_pending())
            .unwrap_or_else(|e| e.into_inner());
        self.is_pending()
    }

    pub fn stats(&self) -> PumpStats {
        PumpStats {
            requests: self.requests.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// Handed to the host controller at init; raised from its interrupt path
#[derive(Debug, Clone)]
pub struct IrqLine {
    signal: Arc<PumpSignal>,
}

impl IrqLine {
    pub fn new(signal: Arc<PumpSignal>) -> Self {
        Self { signal }
    }

    /// Schedule the host task and wake the main loop
    pub fn raise(&self) {
        self.signal.request();
    }
}
