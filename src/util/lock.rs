//! Spin lock built on std atomics.
//!
//! Critical sections in this crate are short (list manipulation, counter
//! updates), so a spinning lock is used instead of an OS mutex. When the
//! process runs without application threads the lock degrades to a single
//! uncontended swap; contention in that mode is a bug and panics.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::utils::Backoff;

/// A spin lock protecting a value of type `T`.
pub(crate) struct SpinLock<T> {
    locked: AtomicBool,
    threaded: bool,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by `locked`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new lock. `threaded` selects whether acquisition may spin.
    #[inline]
    pub const fn new(value: T, threaded: bool) -> Self {
        Self {
            locked: AtomicBool::new(false),
            threaded,
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock.
    ///
    /// # Panics
    ///
    /// Panic if the lock is already held and threads are disabled.
    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        if self.threaded {
            let backoff = Backoff::new();
            while self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                backoff.snooze();
            }
        } else if self.locked.swap(true, Ordering::Acquire) {
            contended_without_threads();
        }
        SpinGuard { lock: self }
    }
}

#[cold]
#[inline(never)]
fn contended_without_threads() -> ! {
    panic!("lock contended while threads are disabled");
}

/// RAII guard of a [`SpinLock`].
pub(crate) struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    #[inline(always)]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
