//! Binary-semaphore mutex and the global interpreter lock helper
//!
//! [`ThreadMutex`] is deliberately not recursive: a thread that already holds
//! it and locks again without waiting gets `false`, and with waiting blocks
//! like any other contender. Any thread may unlock it.

use crate::kernel::Kernel;
use std::sync::{Arc, Condvar, Mutex};

pub struct ThreadMutex {
    locked: Mutex<bool>,
    released: Condvar,
}

impl ThreadMutex {
    pub const fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    /// Take the mutex; with `wait == false` returns `false` instead of blocking
    pub fn lock(&self, wait: bool) -> bool {
        let mut locked = self.locked.lock().unwrap_or_else(|e| e.into_inner());
        if !wait {
            if *locked {
                return false;
            }
            *locked = true;
            return true;
        }

        while *locked {
            locked = self
                .released
                .wait(locked)
                .unwrap_or_else(|e| e.into_inner());
        }
        *locked = true;
        true
    }

    /// Release the mutex; releasing an unlocked mutex has no effect
    pub fn unlock(&self) {
        let mut locked = self.locked.lock().unwrap_or_else(|e| e.into_inner());
        *locked = false;
        drop(locked);
        self.released.notify_one();
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ThreadMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Global interpreter lock
///
/// `exit` yields after releasing so a waiting thread gets a chance to run.
pub struct Gil<K: Kernel> {
    mutex: ThreadMutex,
    kernel: Arc<K>,
}

impl<K: Kernel> Gil<K> {
    pub fn new(kernel: Arc<K>) -> Self {
        Self {
            mutex: ThreadMutex::new(),
            kernel,
        }
    }

    pub fn enter(&self) {
        self.mutex.lock(true);
    }

    pub fn exit(&self) {
        self.mutex.unlock();
        self.kernel.yield_now();
    }

    pub fn is_held(&self) -> bool {
        self.mutex.is_locked()
    }
}
