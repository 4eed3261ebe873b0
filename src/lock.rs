//! Locks.
//!
//! Two flavors with one implementation: `SpinLock` for short critical
//! sections (swap-slot free list, frame table, process table) and
//! `SleepLock` for the file-system facade, which is held across disk I/O.
//! Both are thin named wrappers around `spin::Mutex`; the name shows up in
//! diagnostics. On a real machine the sleep flavor would park the thread
//! instead of spinning, which is why call sites already distinguish them.
//!
//! Lock order: procs -> fs -> frames -> swap.

use core::fmt;

use spin::{Mutex, MutexGuard};

/// Mutual exclusion lock that busy waits (spins).
pub struct SpinLock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    /// Acquires the lock and returns a guard that releases it on drop.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpinLock {{ name: {:?} }}", self.name)
    }
}

/// Long-term lock, held across disk I/O.
pub struct SleepLock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for SleepLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SleepLock {{ name: {:?} }}", self.name)
    }
}
