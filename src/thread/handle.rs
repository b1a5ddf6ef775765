//! The public thread handle.

use std::sync::{Arc, Weak};

use super::{Tcb, ThreadId, ThreadState};
use crate::errors::{SpawnError, SpawnResult};
use crate::sched::cpu::Cpu;
use crate::sched::gate::KernelGuard;
use crate::sched;
use crate::sim;

/// A handle to a spawned thread.
///
/// The handle holds only a weak reference: the scheduler owns the TCB, and
/// once the thread has finished and been reaped, [`Thread::join`] on the
/// stale handle simply returns.
pub struct Thread {
    id: ThreadId,
    tcb: Weak<Tcb>,
}

impl Thread {
    /// Spawn a thread running `body` on the calling thread's machine.
    ///
    /// The new thread is enqueued immediately and an idle CPU, if any, is
    /// woken to run it. Fails with [`SpawnError::NotBooted`] when the caller
    /// is not running on a booted machine.
    pub fn spawn<F>(body: F) -> SpawnResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let kernel = sched::current_kernel().ok_or(SpawnError::NotBooted)?;
        let machine = sim::current_machine().ok_or(SpawnError::NotBooted)?;
        let _gate = KernelGuard::enter();

        // SAFETY: guard held.
        if !unsafe { kernel.state() }.booted {
            return Err(SpawnError::NotBooted);
        }

        let tcb = Tcb::new_user(&kernel, &machine, Box::new(body));
        let handle = Thread {
            id: tcb.id(),
            tcb: Arc::downgrade(&tcb),
        };
        log::trace!("thread {} spawned", handle.id);
        Cpu::push_to_queue(&kernel, tcb);
        Ok(handle)
    }

    /// This thread's identifier.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Block until the thread has finished.
    ///
    /// Returns immediately when the target has already finished or been
    /// reaped. Joining from several threads is allowed; all of them are
    /// woken when the target terminates.
    pub fn join(&self) {
        let Some(kernel) = sched::current_kernel() else {
            return;
        };
        let _gate = KernelGuard::enter();

        let Some(target) = self.tcb.upgrade() else {
            return;
        };
        if target.state() == ThreadState::Finished {
            return;
        }

        let me = Cpu::current_thread(&kernel);
        log::trace!("thread {} joins thread {}", me.id(), target.id());
        me.set_state(ThreadState::Blocked);
        target.joiners.lock().push_back(me);
        Cpu::get_next_thread(&kernel);
    }
}
