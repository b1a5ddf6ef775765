//! The per-CPU dispatcher.
//!
//! Every operation here runs in kernel mode (guard held, interrupts masked
//! on the calling CPU) unless noted otherwise. The dispatch discipline
//! follows one rule: a CPU always has a current thread, and when no user
//! thread is runnable that current thread is the CPU's idle TCB, whose body
//! parks the CPU until an IPI delivers work.

use std::sync::Arc;

use super::gate::KernelGuard;
use super::kernel::Kernel;
use crate::sim::interrupts::{Wakeup, IPI, TIMER};
use crate::sim::{self, context};
use crate::thread::{Tcb, ThreadState};

/// Per-CPU dispatcher state: identity, the current-thread slot, and the
/// synthetic idle TCB this CPU falls back to.
pub(crate) struct Cpu {
    pub(crate) id: usize,
    pub(crate) current: spin::Mutex<Option<Arc<Tcb>>>,
    pub(crate) idle: Arc<Tcb>,
}

impl Cpu {
    /// Bring one CPU online: install interrupt handlers, create the idle
    /// TCB, optionally enqueue the machine's initial thread, and start
    /// dispatching. The calling stream is abandoned once the first context
    /// loads; this never returns to its caller.
    pub(crate) fn startup(
        machine: &Arc<crate::sim::Machine>,
        kernel: &Arc<Kernel>,
        id: usize,
        initial: Option<Box<dyn FnOnce() + Send>>,
    ) {
        machine.assert_interrupts_disabled();
        kernel.guard_acquire(machine);

        machine.register_handler(TIMER, Self::timer_interrupt);
        machine.register_handler(IPI, Self::ipi_interrupt);

        // SAFETY: guard held.
        unsafe { kernel.state() }.booted = true;

        let idle = Tcb::new_idle(kernel, machine, id);
        kernel.install_cpu(Arc::new(Cpu {
            id,
            current: spin::Mutex::new(None),
            idle,
        }));

        if let Some(body) = initial {
            let first = Tcb::new_user(kernel, machine, body);
            Self::push_to_queue(kernel, first);
        }

        log::debug!("cpu {id} online");
        Self::begin_process(kernel);
    }

    /// The CPU running the caller.
    pub(crate) fn current(kernel: &Kernel) -> Arc<Cpu> {
        kernel.cpu(sim::current_cpu())
    }

    /// The thread running on the caller's CPU.
    pub(crate) fn current_thread(kernel: &Kernel) -> Arc<Tcb> {
        Self::current(kernel)
            .current
            .lock()
            .clone()
            .expect("cpu has no current thread")
    }

    /// First dispatch after CPU startup: run a ready thread or suspend.
    /// Abandons the calling stream on every path.
    fn begin_process(kernel: &Kernel) {
        // SAFETY: guard held.
        let state = unsafe { kernel.state() };
        if let Some(next) = state.ready.pop_front() {
            assert_eq!(next.state(), ThreadState::Ready);
            next.set_state(ThreadState::Running);
            let cpu = Self::current(kernel);
            *cpu.current.lock() = Some(next.clone());
            log::trace!("cpu {} starts with thread {}", cpu.id, next.id());
            context::jump_to(next.context());
        } else {
            Self::suspend_cpu(kernel);
        }
    }

    /// Called when the current thread has just become `Blocked` and must
    /// give up its CPU: dispatch the next ready thread or suspend. Returns
    /// when the blocked thread is later dispatched again, at which point it
    /// sweeps the finished list.
    pub(crate) fn get_next_thread(kernel: &Kernel) {
        // SAFETY: guard held.
        let state = unsafe { kernel.state() };
        if let Some(next) = state.ready.pop_front() {
            let cpu = Self::current(kernel);
            let prev = cpu
                .current
                .lock()
                .replace(next.clone())
                .expect("cpu has no current thread");
            assert_eq!(next.state(), ThreadState::Ready);
            assert_eq!(prev.state(), ThreadState::Blocked);
            next.set_state(ThreadState::Running);
            log::trace!("cpu {}: {} blocks, {} runs", cpu.id, prev.id(), next.id());
            context::switch_to(prev.context(), next.context());
            Self::sweep_finished(kernel, &prev);
        } else {
            Self::suspend_cpu(kernel);
        }
    }

    /// Voluntarily give up the CPU. If nothing else is ready the caller
    /// simply keeps running. Kernel mode.
    pub(crate) fn yield_current(kernel: &Kernel) {
        // SAFETY: guard held.
        let state = unsafe { kernel.state() };
        assert!(state.booted);
        let Some(next) = state.ready.pop_front() else {
            return;
        };
        let cpu = Self::current(kernel);
        let prev = cpu
            .current
            .lock()
            .replace(next.clone())
            .expect("cpu has no current thread");
        Self::push_to_queue(kernel, prev.clone());
        assert_eq!(next.state(), ThreadState::Ready);
        next.set_state(ThreadState::Running);
        log::trace!("cpu {}: {} yields to {}", cpu.id, prev.id(), next.id());
        context::switch_to(prev.context(), next.context());
        Self::sweep_finished(kernel, &prev);
    }

    /// No ready work: hand the CPU to its idle TCB. When called with a
    /// current thread the outgoing context is saved for a later dispatch;
    /// at CPU startup there is nothing to save and the stream is abandoned.
    fn suspend_cpu(kernel: &Kernel) {
        let cpu = Self::current(kernel);
        let prev = cpu.current.lock().replace(cpu.idle.clone());
        match prev {
            Some(prev) => {
                log::trace!("cpu {} idling away from thread {}", cpu.id, prev.id());
                context::switch_to(prev.context(), cpu.idle.context());
            }
            None => context::jump_to(cpu.idle.context()),
        }
    }

    /// Body of every idle TCB. Entered via context switch, so the guard is
    /// held with interrupts masked; the same holds at the top of every
    /// iteration, because the IPI handler reacquires the guard and leaves
    /// it held when it returns to this loop.
    pub(crate) fn suspend_helper() {
        let machine = sim::current_machine().expect("idle loop off-machine");
        let kernel = super::current_kernel().expect("idle loop off-machine");
        loop {
            machine.assert_interrupts_disabled();
            {
                let cpu = Self::current(&kernel);
                // SAFETY: guard held at the top of each iteration.
                unsafe { kernel.state() }.sleeping.push_back(cpu);
            }
            kernel.guard_release();
            match machine.interrupt_enable_suspend() {
                Wakeup::Ipi => {}
                Wakeup::Shutdown => return,
            }
        }
    }

    /// The sole enqueue point for making a thread runnable. Kernel mode.
    pub(crate) fn push_to_queue(kernel: &Kernel, tcb: Arc<Tcb>) {
        let prior = tcb.state();
        assert!(
            matches!(
                prior,
                ThreadState::New | ThreadState::Running | ThreadState::Blocked
            ),
            "thread {} cannot be enqueued while {prior:?}",
            tcb.id()
        );
        tcb.set_state(ThreadState::Ready);
        // SAFETY: guard held.
        unsafe { kernel.state() }.ready.push_back(tcb);
        Self::fetch_cpu(kernel);
    }

    /// Wake one suspended CPU, if any, to pick up newly-ready work. A
    /// machine with every CPU busy needs no wakeup: some CPU will find the
    /// work at its next dispatch.
    fn fetch_cpu(kernel: &Kernel) {
        // SAFETY: guard held.
        let state = unsafe { kernel.state() };
        if let Some(sleeper) = state.sleeping.pop_front() {
            debug_assert_ne!(sleeper.id, sim::current_cpu());
            let machine = sim::current_machine().expect("dispatch off-machine");
            machine.interrupt_send(sleeper.id);
        }
    }

    /// Drop the scheduler's references to terminated threads. Runs on the
    /// thread that just resumed from a context switch; a thread never
    /// appears on the finished list while it can still resume.
    pub(crate) fn sweep_finished(kernel: &Kernel, resumed: &Arc<Tcb>) {
        // SAFETY: guard held.
        let state = unsafe { kernel.state() };
        for done in state.finished.drain(..) {
            debug_assert_eq!(done.state(), ThreadState::Finished);
            debug_assert!(!Arc::ptr_eq(&done, resumed));
        }
    }

    /// Timer interrupt handler. Idle CPUs ignore preemption; anything else
    /// yields.
    fn timer_interrupt() {
        {
            let gate = KernelGuard::enter();
            let cpu = Self::current(gate.kernel());
            let current = cpu.current.lock().clone();
            let running_idle = match current {
                Some(thread) => Arc::ptr_eq(&thread, &cpu.idle),
                None => true,
            };
            if running_idle {
                return;
            }
        }
        crate::yield_now();
    }

    /// IPI handler: turn the wakeup into a dispatch. The guard is taken
    /// manually rather than through a scoped gate because on the dispatch
    /// path it must stay held across the switch, to be released by the idle
    /// loop when this CPU next suspends.
    fn ipi_interrupt() {
        let machine = sim::current_machine().expect("ipi off-machine");
        let kernel = super::current_kernel().expect("ipi off-machine");
        machine.interrupt_disable();
        kernel.guard_acquire(&machine);

        // SAFETY: guard held.
        let state = unsafe { kernel.state() };
        if let Some(next) = state.ready.pop_front() {
            let cpu = Self::current(&kernel);
            let prev = cpu
                .current
                .lock()
                .replace(next.clone())
                .expect("suspended cpu has no current thread");
            debug_assert!(Arc::ptr_eq(&prev, &cpu.idle));
            assert_eq!(next.state(), ThreadState::Ready);
            next.set_state(ThreadState::Running);
            log::trace!("cpu {} woken for thread {}", cpu.id, next.id());
            context::switch_to(prev.context(), next.context());
            // Resumed: a later suspend switched back to the idle context,
            // guard held again per the switch invariant.
        }
    }
}
