//! Scoped interrupt gates.
//!
//! All kernel-mode work is bracketed by a [`KernelGuard`]: mask interrupts
//! on this CPU, then take the machine-wide guard flag by spinning on an
//! atomic test-and-set. Release is symmetric and reversed (guard first, then
//! unmask) — if the unmask came first, an interrupt handler on this CPU
//! could spin on a guard its own interrupted code still holds.
//!
//! [`UserGuard`] inverts the discipline around user-supplied thread bodies
//! so preemption and IPIs can be delivered while user code runs.
//!
//! Gates nest flat: a scope that already holds one must not open another.

use std::sync::Arc;

use super::kernel::Kernel;
use crate::sim::{self, Machine};

/// RAII kernel-mode section: interrupts masked, guard held.
pub(crate) struct KernelGuard {
    kernel: Arc<Kernel>,
    machine: Arc<Machine>,
}

impl KernelGuard {
    pub(crate) fn enter() -> Self {
        let machine = sim::current_machine().expect("kernel gate opened off-machine");
        let kernel = super::current_kernel().expect("kernel gate opened off-machine");
        machine.interrupt_disable();
        kernel.guard_acquire(&machine);
        Self { kernel, machine }
    }

    pub(crate) fn kernel(&self) -> &Kernel {
        &self.kernel
    }
}

impl Drop for KernelGuard {
    fn drop(&mut self) {
        self.kernel.guard_release();
        self.machine.interrupt_enable();
    }
}

/// RAII user-mode section: guard released, interrupts open. Only valid
/// inside a kernel-mode section, which it temporarily inverts.
pub(crate) struct UserGuard {
    kernel: Arc<Kernel>,
    machine: Arc<Machine>,
}

impl UserGuard {
    pub(crate) fn enter() -> Self {
        let machine = sim::current_machine().expect("user gate opened off-machine");
        let kernel = super::current_kernel().expect("user gate opened off-machine");
        kernel.guard_release();
        machine.interrupt_enable();
        machine.assert_interrupts_enabled();
        Self { kernel, machine }
    }
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        self.machine.interrupt_disable();
        self.kernel.guard_acquire(&self.machine);
    }
}
