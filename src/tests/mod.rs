//! Whole-system tests: unit checks plus the scheduling, synchronization,
//! and lifecycle scenarios. Each scenario boots its own machine, so tests
//! run independently and in parallel.

mod scenarios;
mod unit;

use std::cell::UnsafeCell;
use std::sync::Once;

pub(crate) fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Interior-mutable cell for data the scenarios protect with a
/// [`crate::Mutex`] (or read single-threaded after the machine is down).
pub(crate) struct GuardedCell<T>(UnsafeCell<T>);

// SAFETY: accesses are serialized by the mutex named at each use site.
unsafe impl<T: Send> Sync for GuardedCell<T> {}

impl<T> GuardedCell<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// # Safety
    ///
    /// The caller must hold the mutex guarding this cell, or be the only
    /// thread able to reach it.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get(&self) -> &mut T {
        unsafe { &mut *self.0.get() }
    }
}
