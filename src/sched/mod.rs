//! Scheduler: kernel guard, shared dispatch state, and machine boot.

pub(crate) mod cpu;
pub(crate) mod gate;
pub(crate) mod kernel;

use std::cell::RefCell;
use std::sync::Arc;

use crate::errors::BootError;
use crate::sim::{Machine, TimerMode};

pub(crate) use kernel::Kernel;

/// Boot-time machine configuration.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// Number of simulated CPUs.
    pub num_cpus: usize,
    /// Timer interrupt generation.
    pub timer: TimerMode,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

impl BootConfig {
    /// Configuration for `num_cpus` CPUs with preemption disabled.
    pub fn new(num_cpus: usize) -> Self {
        Self {
            num_cpus,
            timer: TimerMode::Disabled,
        }
    }

    pub fn with_timer(mut self, timer: TimerMode) -> Self {
        self.timer = timer;
        self
    }

    /// Whether executions under this configuration are deterministic:
    /// a single CPU and no wall-clock timer.
    pub fn deterministic(&self) -> bool {
        self.timer.deterministic(self.num_cpus)
    }
}

thread_local! {
    static KERNEL_TLS: RefCell<Option<Arc<Kernel>>> = const { RefCell::new(None) };
}

pub(crate) fn bind_kernel(kernel: Arc<Kernel>) {
    KERNEL_TLS.with(|tls| *tls.borrow_mut() = Some(kernel));
}

/// The kernel of the machine the caller runs on, if any.
pub(crate) fn current_kernel() -> Option<Arc<Kernel>> {
    KERNEL_TLS.with(|tls| tls.borrow().clone())
}

/// Boot a simulated machine and run `main` as its initial thread.
///
/// One CPU enqueues `main`; the rest come up idle and are woken by IPI as
/// work appears. The call blocks until the machine quiesces — every CPU
/// suspended with no wakeup in flight, meaning no thread can ever run
/// again — then tears the machine down and returns. Note that quiescence is
/// reached whether the application drained its work or deadlocked; the
/// library does not distinguish the two (deadlocks are application bugs).
///
/// Machines are self-contained: boots may run concurrently or repeatedly
/// within one process.
pub fn boot<F>(config: BootConfig, main: F) -> Result<(), BootError>
where
    F: FnOnce() + Send + 'static,
{
    if config.num_cpus == 0 {
        return Err(BootError::NoCpus);
    }
    log::debug!(
        "booting {} cpu(s), timer {:?}",
        config.num_cpus,
        config.timer
    );

    let machine = Machine::new(config.num_cpus, config.timer);
    let kernel = Kernel::new(config.num_cpus);

    let mut first: Option<Box<dyn FnOnce() + Send>> = Some(Box::new(main));
    for id in 0..config.num_cpus {
        let machine_ref = machine.clone();
        let kernel_ref = kernel.clone();
        let initial = first.take();
        machine.start_cpu(id, move || {
            bind_kernel(kernel_ref.clone());
            cpu::Cpu::startup(&machine_ref, &kernel_ref, id, initial);
        });
    }

    machine.wait_quiescent();
    let faulted = machine.has_faulted();
    machine.shutdown();
    machine.join_cpu_workers();
    if faulted {
        // Workers may still be unwinding; leave the wreckage to the Arcs
        // rather than racing them over the scheduler state.
        return Err(BootError::Faulted);
    }
    kernel.teardown();
    log::debug!("machine down");
    Ok(())
}
