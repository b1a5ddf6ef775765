//! Per-CPU interrupt masking and delivery.
//!
//! Interrupts are delivered at window openings: the moment a CPU clears its
//! mask in [`Machine::interrupt_enable`], or while it sits unmasked in
//! [`Machine::interrupt_enable_suspend`]. Handlers always run with the mask
//! set. Because the thread library releases the kernel guard before every
//! unmasking, a handler can never find the guard held by its own CPU.

use std::sync::PoisonError;

use super::machine::Machine;
use super::timer::{TimerMode, Xorshift32};

/// Interrupt vector numbers.
pub(crate) const TIMER: usize = 0;
pub(crate) const IPI: usize = 1;
pub(crate) const VECTORS: usize = 2;

pub(crate) type InterruptHandler = fn();

/// How a suspended CPU was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wakeup {
    /// An inter-processor interrupt arrived; its handler has already run.
    Ipi,
    /// The machine is being torn down.
    Shutdown,
}

/// Interrupt state of one simulated CPU. Guarded by [`Machine::irq`].
pub(crate) struct CpuIrq {
    pub(crate) masked: bool,
    pub(crate) suspended: bool,
    pub(crate) pending_timer: bool,
    pub(crate) pending_ipi: bool,
    /// PRNG and countdown for [`TimerMode::Random`]: the timer fires when
    /// the countdown of window openings reaches zero.
    timer_rng: Option<(Xorshift32, u32)>,
}

impl CpuIrq {
    fn new(cpu: usize, timer: TimerMode) -> Self {
        let timer_rng = match timer {
            TimerMode::Random { seed } => {
                let mut rng = Xorshift32::new(seed.wrapping_add(cpu as u32 * 0x9E37_79B9));
                let countdown = rng.next_interval();
                Some((rng, countdown))
            }
            _ => None,
        };
        Self {
            // CPUs start with interrupts disabled.
            masked: true,
            suspended: false,
            pending_timer: false,
            pending_ipi: false,
            timer_rng,
        }
    }

    fn tick_random_timer(&mut self) {
        if let Some((rng, countdown)) = self.timer_rng.as_mut() {
            *countdown -= 1;
            if *countdown == 0 {
                self.pending_timer = true;
                *countdown = rng.next_interval();
            }
        }
    }
}

/// Machine-wide interrupt controller state.
pub(crate) struct IrqState {
    pub(crate) cpus: Vec<CpuIrq>,
    /// CPUs currently waiting inside `interrupt_enable_suspend`.
    pub(crate) parked: usize,
    /// IPIs sent but not yet taken by their target.
    pub(crate) ipis_in_flight: usize,
    pub(crate) shutdown: bool,
    pub(crate) faulted: bool,
}

impl IrqState {
    pub(crate) fn new(num_cpus: usize, timer: TimerMode) -> Self {
        Self {
            cpus: (0..num_cpus).map(|cpu| CpuIrq::new(cpu, timer)).collect(),
            parked: 0,
            ipis_in_flight: 0,
            shutdown: false,
            faulted: false,
        }
    }
}

impl Machine {
    /// Install the handler for an interrupt vector. All CPUs share the
    /// table; installation is idempotent.
    pub(crate) fn register_handler(&self, vector: usize, handler: InterruptHandler) {
        self.vectors.lock()[vector] = Some(handler);
    }

    /// Mask interrupts on the calling CPU.
    pub(crate) fn interrupt_disable(&self) {
        let cpu = super::current_cpu();
        self.irq.lock().unwrap_or_else(PoisonError::into_inner).cpus[cpu].masked = true;
    }

    /// Unmask interrupts on the calling CPU, delivering any pending timer.
    /// The handler runs with the mask set; the mask clears once nothing is
    /// pending.
    ///
    /// Pending IPIs are not taken here: the wake protocol pairs every IPI
    /// with a CPU that has registered itself idle, so they are consumed in
    /// [`Machine::interrupt_enable_suspend`] only.
    pub(crate) fn interrupt_enable(&self) {
        {
            let cpu = super::current_cpu();
            let mut irq = self.irq.lock().unwrap_or_else(PoisonError::into_inner);
            if !irq.shutdown {
                irq.cpus[cpu].tick_random_timer();
            }
        }
        loop {
            // Re-read the CPU on every pass: the handler may have switched
            // this context away, and it can resume on a different CPU.
            let cpu = super::current_cpu();
            let mut irq = self.irq.lock().unwrap_or_else(PoisonError::into_inner);
            if irq.shutdown {
                irq.cpus[cpu].masked = false;
                return;
            }
            let slot = &mut irq.cpus[cpu];
            debug_assert!(!slot.suspended);
            if !slot.pending_timer {
                slot.masked = false;
                return;
            }
            slot.pending_timer = false;
            slot.masked = true;
            let handler = self.vectors.lock()[TIMER];
            drop(irq);
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    /// Atomically unmask interrupts and suspend the calling CPU until an IPI
    /// arrives; the IPI handler runs before this returns. Timer interrupts
    /// are discarded while suspended.
    pub(crate) fn interrupt_enable_suspend(&self) -> Wakeup {
        let cpu = super::current_cpu();
        let mut irq = self.irq.lock().unwrap_or_else(PoisonError::into_inner);
        irq.cpus[cpu].masked = false;
        irq.cpus[cpu].suspended = true;
        log::trace!("cpu {cpu} suspended");
        loop {
            if irq.shutdown {
                irq.cpus[cpu].suspended = false;
                irq.cpus[cpu].masked = true;
                return Wakeup::Shutdown;
            }
            if irq.cpus[cpu].pending_ipi {
                irq.cpus[cpu].pending_ipi = false;
                irq.cpus[cpu].suspended = false;
                irq.cpus[cpu].masked = true;
                irq.ipis_in_flight -= 1;
                log::trace!("cpu {cpu} woken by ipi");
                let handler = self.vectors.lock()[IPI];
                drop(irq);
                if let Some(handler) = handler {
                    handler();
                }
                return Wakeup::Ipi;
            }
            irq.cpus[cpu].pending_timer = false;
            irq.parked += 1;
            if irq.parked == self.num_cpus && irq.ipis_in_flight == 0 {
                self.quiesce.notify_all();
            }
            irq = self.cpu_wake[cpu].wait(irq).unwrap_or_else(PoisonError::into_inner);
            irq.parked -= 1;
        }
    }

    /// Send an inter-processor interrupt to `target`. Coalesces with an IPI
    /// already pending there.
    pub(crate) fn interrupt_send(&self, target: usize) {
        let mut irq = self.irq.lock().unwrap_or_else(PoisonError::into_inner);
        if irq.shutdown {
            return;
        }
        debug_assert_ne!(target, super::current_cpu());
        if !irq.cpus[target].pending_ipi {
            irq.cpus[target].pending_ipi = true;
            irq.ipis_in_flight += 1;
        }
        log::trace!("ipi sent to cpu {target}");
        self.cpu_wake[target].notify_all();
    }

    pub(crate) fn assert_interrupts_disabled(&self) {
        let irq = self.irq.lock().unwrap_or_else(PoisonError::into_inner);
        if irq.shutdown {
            return;
        }
        assert!(
            irq.cpus[super::current_cpu()].masked,
            "interrupts unexpectedly enabled"
        );
    }

    pub(crate) fn assert_interrupts_enabled(&self) {
        let irq = self.irq.lock().unwrap_or_else(PoisonError::into_inner);
        if irq.shutdown {
            return;
        }
        assert!(
            !irq.cpus[super::current_cpu()].masked,
            "interrupts unexpectedly disabled"
        );
    }
}
