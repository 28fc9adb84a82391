//! Wait/notify handle
//!
//! The stripe protocol blocks a caller in exactly one place: the transform
//! side waiting for a stripe the wavelet side has not produced yet. Each
//! component carries one of these handles; the waiter re-tests its
//! condition under the handle's lock so a notification between the test
//! and the wait cannot be lost.

use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct WaitHandle {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every thread currently blocked in [`WaitHandle::wait_until`]
    pub fn notify(&self) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *generation += 1;
        self.cond.notify_all();
    }

    /// Block until `ready` returns true. The predicate is re-evaluated
    /// under the handle's lock after every wakeup.
    pub fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while !ready() {
            generation = self
                .cond
                .wait(generation)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_notify_releases_waiter() {
        let handle = Arc::new(WaitHandle::new());
        let flag = Arc::new(AtomicBool::new(false));
        let (h, f) = (handle.clone(), flag.clone());
        let waiter = std::thread::spawn(move || {
            h.wait_until(|| f.load(Ordering::Acquire));
        });
        flag.store(true, Ordering::Release);
        handle.notify();
        waiter.join().unwrap();
    }

    #[test]
    fn test_ready_predicate_short_circuits() {
        let handle = WaitHandle::new();
        handle.wait_until(|| true);
    }
}
