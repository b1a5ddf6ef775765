//! Machine bring-up, quiescence detection, and teardown.

use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use super::context::Gate;
use super::interrupts::{InterruptHandler, IrqState, VECTORS};
use super::timer::{TimerMode, TICK};

/// One simulated multiprocessor: interrupt state, timer generator, and the
/// OS worker threads backing its CPUs and contexts.
///
/// The original design keeps all of this in process-wide statics; grouping
/// it into one object makes every boot self-contained, so simulations can
/// run concurrently and repeatedly within a single process.
pub(crate) struct Machine {
    pub(crate) num_cpus: usize,
    pub(crate) irq: Mutex<IrqState>,
    /// One wakeup condvar per CPU, paired with `irq`.
    pub(crate) cpu_wake: Vec<Condvar>,
    /// Signalled when the machine can never make progress again.
    pub(crate) quiesce: Condvar,
    /// Interrupt vector table shared by all CPUs.
    pub(crate) vectors: spin::Mutex<[Option<InterruptHandler>; VECTORS]>,
    /// Every context gate ever spawned on this machine, for teardown.
    gates: Mutex<Vec<Weak<Gate>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    cpu_workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Machine {
    pub(crate) fn new(num_cpus: usize, timer: TimerMode) -> Arc<Self> {
        assert!(num_cpus > 0);
        let machine = Arc::new(Self {
            num_cpus,
            irq: Mutex::new(IrqState::new(num_cpus, timer)),
            cpu_wake: (0..num_cpus).map(|_| Condvar::new()).collect(),
            quiesce: Condvar::new(),
            vectors: spin::Mutex::new([None; VECTORS]),
            gates: Mutex::new(Vec::new()),
            ticker: Mutex::new(None),
            cpu_workers: Mutex::new(Vec::new()),
        });
        if timer == TimerMode::Interval {
            machine.start_ticker();
        }
        machine
    }

    /// Start the worker thread backing one simulated CPU. The CPU begins
    /// with interrupts masked, as real CPUs do out of reset.
    pub(crate) fn start_cpu(
        self: &Arc<Self>,
        cpu: usize,
        entry: impl FnOnce() + Send + 'static,
    ) {
        let machine = self.clone();
        let worker = thread::Builder::new()
            .name(format!("simcpu-boot{cpu}"))
            .spawn(move || {
                super::bind(machine, cpu);
                entry();
            })
            .expect("failed to start a CPU worker");
        self.cpu_workers.lock().unwrap_or_else(PoisonError::into_inner).push(worker);
    }

    /// Block until the machine can never make progress again: every CPU
    /// suspended with no IPI in flight (which implies an empty ready queue),
    /// or the machine shut down early after a fault.
    pub(crate) fn wait_quiescent(&self) {
        let mut irq = self.irq.lock().unwrap_or_else(PoisonError::into_inner);
        while !irq.shutdown && !(irq.parked == self.num_cpus && irq.ipis_in_flight == 0) {
            irq = self.quiesce.wait(irq).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Tear the machine down: wake every suspended CPU and every parked
    /// context with a shutdown verdict and stop the timer generator.
    pub(crate) fn shutdown(&self) {
        {
            let mut irq = self.irq.lock().unwrap_or_else(PoisonError::into_inner);
            if !irq.shutdown {
                log::debug!("machine shutting down");
                irq.shutdown = true;
                for wake in &self.cpu_wake {
                    wake.notify_all();
                }
                self.quiesce.notify_all();
            }
        }
        for gate in self.gates.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            if let Some(gate) = gate.upgrade() {
                gate.shutdown();
            }
        }
        if let Some(ticker) = self.ticker.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = ticker.join();
        }
    }

    /// Record a fatal library fault and shut the machine down so the booting
    /// thread can surface the failure instead of hanging.
    pub(crate) fn fault(&self) {
        self.irq.lock().unwrap_or_else(PoisonError::into_inner).faulted = true;
        self.shutdown();
    }

    pub(crate) fn has_faulted(&self) -> bool {
        self.irq.lock().unwrap_or_else(PoisonError::into_inner).faulted
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.irq.lock().unwrap_or_else(PoisonError::into_inner).shutdown
    }

    pub(crate) fn join_cpu_workers(&self) {
        for worker in self.cpu_workers.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            let _ = worker.join();
        }
    }

    pub(crate) fn register_gate(&self, gate: &Arc<Gate>) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_shutdown() {
            gate.shutdown();
            return;
        }
        gates.push(Arc::downgrade(gate));
    }

    fn start_ticker(self: &Arc<Self>) {
        let machine = Arc::downgrade(self);
        let ticker = thread::Builder::new()
            .name("simcpu-ticker".into())
            .spawn(move || loop {
                thread::sleep(TICK);
                let Some(machine) = machine.upgrade() else { break };
                let mut irq = machine.irq.lock().unwrap_or_else(PoisonError::into_inner);
                if irq.shutdown {
                    break;
                }
                for cpu in irq.cpus.iter_mut() {
                    // Suspended CPUs ignore the timer; masked CPUs take it
                    // at the next window opening.
                    if !cpu.suspended {
                        cpu.pending_timer = true;
                    }
                }
            })
            .expect("failed to start the timer generator");
        *self.ticker.lock().unwrap_or_else(PoisonError::into_inner) = Some(ticker);
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        // Normal teardown has already run; this is a backstop for machines
        // abandoned on an error path.
        self.shutdown();
    }
}
