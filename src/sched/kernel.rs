//! Machine-wide scheduler state and the big kernel guard.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;

use portable_atomic::{AtomicBool, Ordering};

use super::cpu::Cpu;
use crate::sim::Machine;
use crate::thread::Tcb;

/// Everything the dispatcher shares across CPUs. Only ever touched while
/// the guard flag is held with interrupts masked (invariant I3).
pub(crate) struct SchedState {
    pub(crate) booted: bool,
    /// Runnable threads, FIFO by enqueue time.
    pub(crate) ready: VecDeque<Arc<Tcb>>,
    /// Suspended CPUs awaiting work, FIFO.
    pub(crate) sleeping: VecDeque<Arc<Cpu>>,
    /// Terminated threads awaiting the deferred sweep.
    pub(crate) finished: Vec<Arc<Tcb>>,
    pub(crate) next_thread_id: u64,
}

/// One kernel per booted machine.
///
/// The guard flag is the multiprocessor serializer: every mutation of
/// [`SchedState`], every thread-state transition, and every context switch
/// happens with it held. The original keeps this state in process-wide
/// statics; one object per boot is equivalent and lets simulations coexist.
pub(crate) struct Kernel {
    guard: AtomicBool,
    /// Per-CPU records, installed as each CPU comes up.
    cpus: Vec<spin::Mutex<Option<Arc<Cpu>>>>,
    state: UnsafeCell<SchedState>,
}

// SAFETY: `state` is only reached through `Kernel::state`, whose callers
// hold the guard flag with interrupts masked.
unsafe impl Sync for Kernel {}

impl Kernel {
    pub(crate) fn new(num_cpus: usize) -> Arc<Self> {
        Arc::new(Self {
            guard: AtomicBool::new(false),
            cpus: (0..num_cpus).map(|_| spin::Mutex::new(None)).collect(),
            state: UnsafeCell::new(SchedState {
                booted: false,
                ready: VecDeque::new(),
                sleeping: VecDeque::new(),
                finished: Vec::new(),
                next_thread_id: 0,
            }),
        })
    }

    /// Spin until the guard flag is ours. Interrupts must already be masked
    /// on this CPU, otherwise a handler here could deadlock against its own
    /// interrupted code. Bails out during machine teardown so unwinding
    /// workers cannot spin forever.
    pub(crate) fn guard_acquire(&self, machine: &Machine) {
        machine.assert_interrupts_disabled();
        let mut spins = 0u32;
        while self.guard.swap(true, Ordering::Acquire) {
            spins = spins.wrapping_add(1);
            if spins % 1024 == 0 && machine.is_shutdown() {
                return;
            }
            core::hint::spin_loop();
        }
    }

    pub(crate) fn guard_release(&self) {
        self.guard.store(false, Ordering::Release);
    }

    pub(crate) fn guard_held(&self) -> bool {
        self.guard.load(Ordering::Acquire)
    }

    /// Access the shared scheduler state.
    ///
    /// # Safety
    ///
    /// The caller must be in kernel mode: guard flag held, interrupts masked
    /// on the calling CPU. The returned borrow must not be used after the
    /// calling context switches away.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn state(&self) -> &mut SchedState {
        debug_assert!(self.guard_held());
        unsafe { &mut *self.state.get() }
    }

    pub(crate) fn install_cpu(&self, cpu: Arc<Cpu>) {
        let slot = &self.cpus[cpu.id];
        let previous = slot.lock().replace(cpu);
        debug_assert!(previous.is_none(), "cpu installed twice");
    }

    pub(crate) fn cpu(&self, id: usize) -> Arc<Cpu> {
        self.cpus[id]
            .lock()
            .clone()
            .expect("cpu referenced before startup")
    }

    /// Drop every scheduling reference after the machine has quiesced and
    /// shut down, releasing all remaining TCBs and their contexts.
    pub(crate) fn teardown(&self) {
        // SAFETY: the machine is quiesced and shut down; no CPU worker can
        // enter kernel mode again.
        let state = unsafe { &mut *self.state.get() };
        state.ready.clear();
        state.sleeping.clear();
        state.finished.clear();
        state.booted = false;
        for slot in &self.cpus {
            slot.lock().take();
        }
    }
}
