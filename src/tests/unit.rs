//! Unit checks for configuration and out-of-machine behavior.

use super::init_logging;
use crate::{boot, yield_now, BootConfig, BootError, SpawnError, Thread, TimerMode};

#[test]
fn boot_rejects_zero_cpus() {
    init_logging();
    let config = BootConfig {
        num_cpus: 0,
        timer: TimerMode::Disabled,
    };
    assert_eq!(boot(config, || {}), Err(BootError::NoCpus));
}

#[test]
fn spawn_requires_a_booted_machine() {
    init_logging();
    let result = Thread::spawn(|| {});
    assert!(matches!(result, Err(SpawnError::NotBooted)));
}

#[test]
fn yield_outside_a_machine_is_a_noop() {
    init_logging();
    yield_now();
}

#[test]
fn determinism_depends_on_cpu_count_and_timer() {
    init_logging();
    assert!(BootConfig::new(1).deterministic());
    assert!(BootConfig::new(1)
        .with_timer(TimerMode::Random { seed: 42 })
        .deterministic());
    assert!(!BootConfig::new(1).with_timer(TimerMode::Interval).deterministic());
    assert!(!BootConfig::new(4).deterministic());
}

#[test]
fn thread_ids_are_monotonic() {
    init_logging();
    boot(BootConfig::new(1), || {
        let a = Thread::spawn(|| {}).expect("spawn");
        let b = Thread::spawn(|| {}).expect("spawn");
        let c = Thread::spawn(|| {}).expect("spawn");
        assert!(a.id() < b.id());
        assert!(b.id() < c.id());
        a.join();
        b.join();
        c.join();
    })
    .expect("machine quiesces");
}

#[test]
fn repeated_boots_are_independent() {
    init_logging();
    for _ in 0..3 {
        boot(BootConfig::new(2), || {
            let t = Thread::spawn(|| yield_now()).expect("spawn");
            t.join();
        })
        .expect("machine quiesces");
    }
}
