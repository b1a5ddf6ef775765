//! Condition variables bound to a [`Mutex`] at each call site.

use std::collections::VecDeque;
use std::sync::Arc;

use super::Mutex;
use crate::errors::{SyncError, SyncResult};
use crate::sched;
use crate::sched::cpu::Cpu;
use crate::sched::gate::KernelGuard;
use crate::thread::{Tcb, ThreadState};

/// A condition variable with FIFO wakeups.
///
/// Unlike mutex unlock, signalling does not hand anything off: a woken
/// waiter re-contends for the mutex on resume and may block again there.
pub struct Condvar {
    waiters: spin::Mutex<VecDeque<Arc<Tcb>>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: spin::Mutex::new(VecDeque::new()),
        }
    }

    /// Atomically release `mutex`, block until signalled, and reacquire
    /// `mutex` before returning.
    ///
    /// The release, the move to the waitlist, and the dispatch happen under
    /// a single kernel gate, so no wakeup can be lost between them. Fails
    /// with [`SyncError::NotOwner`] when the caller does not hold `mutex`.
    pub fn wait(&self, mutex: &Mutex) -> SyncResult<()> {
        let kernel = sched::current_kernel().expect("condvar used outside a booted machine");
        let _gate = KernelGuard::enter();

        let me = Cpu::current_thread(&kernel);
        if !mutex.owned_by(me.id()) {
            return Err(SyncError::NotOwner);
        }

        mutex.internal_unlock(&kernel)?;
        me.set_state(ThreadState::Blocked);
        self.waiters.lock().push_back(me.clone());
        log::trace!("thread {} waits on condvar", me.id());
        Cpu::get_next_thread(&kernel);
        mutex.internal_lock(&kernel);
        Ok(())
    }

    /// Wake the first waiter, if any.
    pub fn signal(&self) {
        let kernel = sched::current_kernel().expect("condvar used outside a booted machine");
        let _gate = KernelGuard::enter();
        let waiter = self.waiters.lock().pop_front();
        if let Some(waiter) = waiter {
            Cpu::push_to_queue(&kernel, waiter);
        }
    }

    /// Wake every waiter, in FIFO order.
    pub fn broadcast(&self) {
        let kernel = sched::current_kernel().expect("condvar used outside a booted machine");
        let _gate = KernelGuard::enter();
        loop {
            let waiter = self.waiters.lock().pop_front();
            match waiter {
                Some(waiter) => Cpu::push_to_queue(&kernel, waiter),
                None => break,
            }
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
