//! Thread control blocks and lifecycle.

pub(crate) mod handle;

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use portable_atomic::{AtomicU8, Ordering};

use crate::sched::cpu::Cpu;
use crate::sched::gate::UserGuard;
use crate::sched::{self, Kernel};
use crate::sim::context::{self, Context, ContextShutdown};
use crate::sim::{self, Machine};

pub use handle::Thread;

/// Size of every thread stack, in bytes.
pub const STACK_SIZE: usize = 262_144;

/// Unique, monotonically-assigned thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) u64);

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a thread.
///
/// `New` threads have never been enqueued; `Finished` is terminal. All other
/// transitions happen in kernel mode as the dispatcher moves a thread
/// between the ready queue, a CPU, and waitlists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    New = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Finished = 4,
}

/// Thread control block.
///
/// TCBs are shared-owned: the ready queue, waitlists, a CPU's current-thread
/// slot, and the finished list may each hold a reference, while user handles
/// hold only a weak one. A TCB is released by the deferred finished-list
/// sweep, never by the thread itself — a thread cannot free the stack it is
/// executing on.
pub(crate) struct Tcb {
    id: ThreadId,
    state: AtomicU8,
    context: Context,
    /// Threads blocked on this thread's termination, FIFO.
    pub(crate) joiners: spin::Mutex<VecDeque<Arc<Tcb>>>,
}

impl Tcb {
    /// Create a user TCB whose context will run the trampoline around
    /// `body`. Kernel mode (the id counter lives in guarded state).
    pub(crate) fn new_user(
        kernel: &Arc<Kernel>,
        machine: &Arc<Machine>,
        body: Box<dyn FnOnce() + Send>,
    ) -> Arc<Self> {
        let id = Self::allocate_id(kernel);
        let kernel_ref = kernel.clone();
        let context = Context::spawn(machine, &format!("thread{id}"), STACK_SIZE, move || {
            sched::bind_kernel(kernel_ref);
            thread_execution(body);
        });
        Arc::new(Self {
            id,
            state: AtomicU8::new(ThreadState::New as u8),
            context,
            joiners: spin::Mutex::new(VecDeque::new()),
        })
    }

    /// Create the synthetic idle TCB for one CPU. Its body is the suspend
    /// loop; it is installed as the CPU's current thread whenever no user
    /// thread is runnable, and never enters the ready queue.
    pub(crate) fn new_idle(kernel: &Arc<Kernel>, machine: &Arc<Machine>, cpu: usize) -> Arc<Self> {
        let id = Self::allocate_id(kernel);
        let kernel_ref = kernel.clone();
        let context = Context::spawn(machine, &format!("idle{cpu}"), STACK_SIZE, move || {
            sched::bind_kernel(kernel_ref);
            Cpu::suspend_helper();
        });
        Arc::new(Self {
            id,
            state: AtomicU8::new(ThreadState::New as u8),
            context,
            joiners: spin::Mutex::new(VecDeque::new()),
        })
    }

    fn allocate_id(kernel: &Kernel) -> ThreadId {
        // SAFETY: guard held by every TCB creation site.
        let state = unsafe { kernel.state() };
        let id = ThreadId(state.next_thread_id);
        state.next_thread_id += 1;
        id
    }

    pub(crate) fn id(&self) -> ThreadId {
        self.id
    }

    pub(crate) fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Acquire) {
            0 => ThreadState::New,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Blocked,
            4 => ThreadState::Finished,
            other => unreachable!("corrupt thread state {other}"),
        }
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }
}

/// The trampoline bound into every user TCB's context.
///
/// Entered through a context switch, so the guard is held and interrupts are
/// masked; the body runs inside a user gate so it can be preempted. After
/// the body returns: wake all joiners, move to the finished list, and hand
/// the CPU onward. A finished context is never resumed, so both exit paths
/// abandon it with a jump rather than saving it.
fn thread_execution(body: Box<dyn FnOnce() + Send>) {
    let machine = sim::current_machine().expect("trampoline off-machine");
    let kernel = sched::current_kernel().expect("trampoline off-machine");
    machine.assert_interrupts_disabled();
    debug_assert!(kernel.guard_held());

    {
        let _user = UserGuard::enter();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
            if payload.is::<ContextShutdown>() {
                panic::resume_unwind(payload);
            }
            // The original aborts here; treating the panic as a return lets
            // the rest of the machine drain and report normally.
            log::error!("thread body panicked; treating it as a return");
        }
    }

    machine.assert_interrupts_disabled();
    debug_assert!(kernel.guard_held());

    let cpu = Cpu::current(&kernel);
    let me = cpu
        .current
        .lock()
        .clone()
        .expect("finishing thread is not current");
    log::trace!("thread {} finished on cpu {}", me.id(), cpu.id);

    loop {
        let joiner = me.joiners.lock().pop_front();
        match joiner {
            Some(joiner) => Cpu::push_to_queue(&kernel, joiner),
            None => break,
        }
    }

    me.set_state(ThreadState::Finished);
    // SAFETY: guard held.
    let state = unsafe { kernel.state() };
    state.finished.push(me.clone());

    if let Some(next) = state.ready.pop_front() {
        assert_eq!(next.state(), ThreadState::Ready);
        next.set_state(ThreadState::Running);
        *cpu.current.lock() = Some(next.clone());
        drop(me);
        context::jump_to(next.context());
    } else {
        *cpu.current.lock() = Some(cpu.idle.clone());
        drop(me);
        context::jump_to(cpu.idle.context());
    }
    // The context was handed off above; this worker just winds down.
}
