//! Long-lived worker thread plumbing shared by the flushers and the
//! segment allocator: notified wakeup, bounded waits, cooperative shutdown.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Wakeup / shutdown state shared between a service thread and its callers.
#[derive(Default)]
pub(crate) struct ServiceState {
    notified: Mutex<bool>,
    cond: Condvar,
    stopped: AtomicBool,
}

impl ServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nudge the service thread out of its wait. Coalesces with a pending
    /// notification.
    pub fn wakeup(&self) {
        let mut notified = self.notified.lock();
        if !*notified {
            *notified = true;
            self.cond.notify_one();
        }
    }

    /// Park the service thread until notified or `timeout` elapses. A
    /// notification that arrived while the thread was busy is consumed
    /// without waiting.
    pub fn wait_for_running(&self, timeout: Duration) {
        let mut notified = self.notified.lock();
        if *notified {
            *notified = false;
            return;
        }
        let _ = self.cond.wait_for(&mut notified, timeout);
        *notified = false;
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wakeup();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
