//! The simulated machine.
//!
//! This module plays the role of the hardware and boot infrastructure: it
//! owns the machine contexts (the `makecontext`/`swapcontext`/`setcontext`
//! triple), per-CPU interrupt masking and delivery, the timer and IPI
//! generators, and machine bring-up/teardown. The thread library in
//! [`crate::sched`] is written against this surface and nothing else.
//!
//! Simulated CPUs are OS worker threads, but at most one machine context per
//! simulated CPU executes at any instant; control moves between contexts only
//! through [`context::switch_to`] and [`context::jump_to`].

pub(crate) mod context;
pub(crate) mod interrupts;
pub(crate) mod machine;
pub(crate) mod timer;

pub(crate) use machine::Machine;
pub use timer::TimerMode;

use std::cell::{Cell, RefCell};
use std::sync::Arc;

struct SimTls {
    machine: Arc<Machine>,
    cpu: Cell<usize>,
}

thread_local! {
    static SIM_TLS: RefCell<Option<SimTls>> = const { RefCell::new(None) };
}

/// Bind the calling OS thread to a simulated CPU of `machine`.
///
/// Called once at the start of every CPU worker and every machine context;
/// the CPU binding is updated on each context resume, since a context may be
/// dispatched by a different CPU than the one it last ran on.
pub(crate) fn bind(machine: Arc<Machine>, cpu: usize) {
    SIM_TLS.with(|tls| {
        *tls.borrow_mut() = Some(SimTls {
            machine,
            cpu: Cell::new(cpu),
        });
    });
}

pub(crate) fn rebind_cpu(cpu: usize) {
    SIM_TLS.with(|tls| {
        let tls = tls.borrow();
        let tls = tls.as_ref().expect("context resumed off-machine");
        tls.cpu.set(cpu);
    });
}

/// The machine the caller is running on, if any.
pub(crate) fn current_machine() -> Option<Arc<Machine>> {
    SIM_TLS.with(|tls| tls.borrow().as_ref().map(|t| t.machine.clone()))
}

/// The simulated CPU the caller is running on.
///
/// Panics when called from outside a simulation; library entry points check
/// [`current_machine`] first.
pub(crate) fn current_cpu() -> usize {
    SIM_TLS.with(|tls| {
        tls.borrow()
            .as_ref()
            .expect("not running on a simulated CPU")
            .cpu
            .get()
    })
}
