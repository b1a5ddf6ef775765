//! Machine contexts.
//!
//! A [`Context`] is the simulated equivalent of a `ucontext_t`: an
//! independent stream of execution with its own stack, created suspended and
//! entered only through [`switch_to`] (swapcontext) or [`jump_to`]
//! (setcontext). Each context is realized as a parked OS worker thread with
//! a dedicated stack; a hand-off gate moves the single "running" baton of a
//! simulated CPU between contexts. The gate payload carries the id of the
//! CPU the context is being resumed on, since the ready queue is global and
//! a context may be dispatched by any CPU.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use super::machine::Machine;

/// Unwind payload delivered to a parked context when its machine is torn
/// down. Re-raised, never swallowed, until it reaches the worker's rim.
pub(crate) struct ContextShutdown;

enum GateState {
    Parked,
    Resume(usize),
    Shutdown,
}

/// Hand-off point between the context's worker and whoever resumes it.
pub(crate) struct Gate {
    state: Mutex<GateState>,
    wake: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState::Parked),
            wake: Condvar::new(),
        })
    }

    /// Hand the baton to this context. Valid on a parked context only; a
    /// resume may race ahead of the owner's park and is then consumed on
    /// arrival.
    fn resume(&self, cpu: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            GateState::Parked => {
                *state = GateState::Resume(cpu);
                self.wake.notify_one();
            }
            GateState::Shutdown => {}
            GateState::Resume(_) => panic!("context resumed while already runnable"),
        }
    }

    /// Park until resumed; returns the CPU the context now runs on.
    fn park(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match *state {
                GateState::Resume(cpu) => {
                    *state = GateState::Parked;
                    return cpu;
                }
                GateState::Shutdown => {
                    drop(state);
                    panic::resume_unwind(Box::new(ContextShutdown));
                }
                GateState::Parked => state = self.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = GateState::Shutdown;
        self.wake.notify_all();
    }
}

/// A suspended-or-running machine context.
pub(crate) struct Context {
    gate: Arc<Gate>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Context {
    /// The `makecontext` analogue: create a context that will run `entry` on
    /// a fresh stack of `stack_size` bytes when first entered.
    pub(crate) fn spawn(
        machine: &Arc<Machine>,
        name: &str,
        stack_size: usize,
        entry: impl FnOnce() + Send + 'static,
    ) -> Self {
        let gate = Gate::new();
        machine.register_gate(&gate);

        let worker_gate = gate.clone();
        let worker_machine = machine.clone();
        let worker = thread::Builder::new()
            .name(format!("simcpu-{name}"))
            .stack_size(stack_size)
            .spawn(move || {
                let machine = worker_machine.clone();
                let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
                    let cpu = worker_gate.park();
                    super::bind(worker_machine, cpu);
                    entry();
                }));
                if let Err(payload) = outcome {
                    if !payload.is::<ContextShutdown>() {
                        // An invariant assertion escaped the thread library.
                        log::error!("context worker panicked: machine faulted");
                        machine.fault();
                    }
                }
            })
            .expect("failed to allocate a context stack");

        Self {
            gate,
            worker: Mutex::new(Some(worker)),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.gate.shutdown();
        if let Some(worker) = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if worker.thread().id() == thread::current().id() {
                // The final reference can be released by the context's own
                // worker while it winds down; it cannot join itself.
                return;
            }
            let _ = worker.join();
        }
    }
}

/// The `swapcontext` analogue: hand the CPU to `next` and park `prev` until
/// something resumes it. Per the switch invariant, the caller holds the
/// kernel guard with interrupts masked on both sides of this call.
pub(crate) fn switch_to(prev: &Context, next: &Context) {
    next.gate.resume(super::current_cpu());
    let resumed_on = prev.gate.park();
    super::rebind_cpu(resumed_on);
}

/// The `setcontext` analogue: hand the CPU to `next` without saving the
/// calling stream. The caller's stream is abandoned; it must unwind out of
/// the simulation promptly and touch no shared state on the way out.
pub(crate) fn jump_to(next: &Context) {
    next.gate.resume(super::current_cpu());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::TimerMode;
    use portable_atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    fn wait_for(flag: &AtomicBool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !flag.load(Ordering::Acquire) {
            assert!(Instant::now() < deadline, "context never ran");
            thread::yield_now();
        }
    }

    #[test]
    fn jump_enters_a_fresh_context() {
        let machine = Machine::new(1, TimerMode::Disabled);
        crate::sim::bind(machine.clone(), 0);

        let ran = Arc::new(AtomicBool::new(false));
        let ran_inner = ran.clone();
        let ctx = Context::spawn(&machine, "unit", 64 * 1024, move || {
            ran_inner.store(true, Ordering::Release);
        });

        jump_to(&ctx);
        wait_for(&ran);
        drop(ctx);
    }

    #[test]
    fn contexts_chain_through_jumps() {
        let machine = Machine::new(1, TimerMode::Disabled);
        crate::sim::bind(machine.clone(), 0);

        let ran = Arc::new(AtomicBool::new(false));
        let ran_inner = ran.clone();
        let second = Arc::new(Context::spawn(&machine, "unit-b", 64 * 1024, move || {
            ran_inner.store(true, Ordering::Release);
        }));

        let second_ref = second.clone();
        let first = Context::spawn(&machine, "unit-a", 64 * 1024, move || {
            jump_to(&second_ref);
        });

        jump_to(&first);
        wait_for(&ran);
        drop(first);
        drop(second);
    }
}
