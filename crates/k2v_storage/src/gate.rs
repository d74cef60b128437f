//! Blocking hand-off primitives built on `Mutex` + `Condvar`.
//!
//! [`Gate`] is a binary semaphore: unlike a mutex guard, the right to pass
//! can be acquired on one thread and released on another, which is what a
//! write transaction shared by several callers needs. [`OneShot`] broadcasts
//! a single value to every thread waiting on it.

use parking_lot::{Condvar, Mutex};

/// Binary semaphore. Waiters are woken one at a time.
pub(crate) struct Gate {
    held: Mutex<bool>,
    released: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    /// Block until the gate is free, then take it.
    pub(crate) fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
    }

    /// Give the gate back. The caller must be the current holder.
    pub(crate) fn release(&self) {
        let mut held = self.held.lock();
        debug_assert!(*held, "releasing a gate that is not held");
        *held = false;
        drop(held);
        self.released.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self) -> bool {
        *self.held.lock()
    }
}

/// Write-once cell whose readers block until it is filled.
pub(crate) struct OneShot<T> {
    value: Mutex<Option<T>>,
    filled: Condvar,
}

impl<T: Clone> OneShot<T> {
    pub(crate) fn new() -> Self {
        Self {
            value: Mutex::new(None),
            filled: Condvar::new(),
        }
    }

    /// Fill the cell. Returns false (and keeps the first value) if it was
    /// already filled.
    pub(crate) fn set(&self, value: T) -> bool {
        let mut slot = self.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        drop(slot);
        self.filled.notify_all();
        true
    }

    pub(crate) fn wait(&self) -> T {
        let mut slot = self.value.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.filled.wait(&mut slot);
        }
    }
}
