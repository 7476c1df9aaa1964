//! Counting semaphore.
//!
//! The count carries every post that has not been consumed yet, so a post
//! that lands before the waiter goes to sleep is never lost.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Add one permit and wake a waiter.
    pub fn post(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    #[cfg(test)]
    /// Like [`Semaphore::wait`] but gives up after `timeout`. Returns
    /// whether a permit was taken.
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.available.wait_for(&mut permits, timeout).timed_out() {
                break;
            }
        }
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    #[cfg(test)]
    pub fn permits(&self) -> usize {
        *self.permits.lock()
    }
}
