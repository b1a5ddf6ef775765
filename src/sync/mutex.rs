//! Blocking mutex with FIFO waiters and direct handoff.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::errors::{SyncError, SyncResult};
use crate::sched::cpu::Cpu;
use crate::sched::gate::KernelGuard;
use crate::sched::{self, Kernel};
use crate::thread::{Tcb, ThreadId, ThreadState};

struct MutexState {
    /// Id of the holding thread; `None` is the unowned sentinel.
    owner: Option<ThreadId>,
    free: bool,
    waiters: VecDeque<Arc<Tcb>>,
}

/// A blocking mutual-exclusion lock.
///
/// Contended lockers block (the CPU dispatches other work) rather than
/// spin. Unlock hands the lock directly to the first waiter: ownership
/// transfers at unlock time, so the lock is never observed free between an
/// unlock and the waiter's acquisition. Waiters are served FIFO.
///
/// The spin lock around the record is interior-mutability plumbing only;
/// the machine-wide kernel guard is what serializes lock state (I3).
pub struct Mutex {
    inner: spin::Mutex<MutexState>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(MutexState {
                owner: None,
                free: true,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire the lock, blocking while another thread holds it.
    ///
    /// Panics when the caller is not running on a booted machine.
    pub fn lock(&self) {
        let kernel = sched::current_kernel().expect("mutex used outside a booted machine");
        let _gate = KernelGuard::enter();
        self.internal_lock(&kernel);
    }

    /// Release the lock, waking the first waiter if any.
    ///
    /// Fails with [`SyncError::NotOwner`] when the calling thread does not
    /// hold the lock.
    pub fn unlock(&self) -> SyncResult<()> {
        let kernel = sched::current_kernel().expect("mutex used outside a booted machine");
        let _gate = KernelGuard::enter();
        self.internal_unlock(&kernel)
    }

    /// Lock body, shared with [`crate::Condvar::wait`]. Kernel mode.
    pub(crate) fn internal_lock(&self, kernel: &Kernel) {
        let me = Cpu::current_thread(kernel);
        let mut state = self.inner.lock();
        if state.free {
            state.owner = Some(me.id());
            state.free = false;
        } else {
            me.set_state(ThreadState::Blocked);
            state.waiters.push_back(me.clone());
            drop(state);
            log::trace!("thread {} blocks on mutex", me.id());
            Cpu::get_next_thread(kernel);
            // Direct handoff: the unlocker already made us the owner.
            debug_assert_eq!(self.inner.lock().owner, Some(me.id()));
        }
    }

    /// Unlock body, shared with [`crate::Condvar::wait`]. Kernel mode.
    pub(crate) fn internal_unlock(&self, kernel: &Kernel) -> SyncResult<()> {
        let me = Cpu::current_thread(kernel);
        let mut state = self.inner.lock();
        if state.owner != Some(me.id()) {
            return Err(SyncError::NotOwner);
        }
        state.owner = None;
        state.free = true;
        if let Some(waiter) = state.waiters.pop_front() {
            assert_eq!(waiter.state(), ThreadState::Blocked);
            state.owner = Some(waiter.id());
            state.free = false;
            drop(state);
            log::trace!("mutex handed to thread {}", waiter.id());
            Cpu::push_to_queue(kernel, waiter);
        }
        Ok(())
    }

    pub(crate) fn owned_by(&self, id: ThreadId) -> bool {
        self.inner.lock().owner == Some(id)
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}
