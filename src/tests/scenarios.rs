//! Scheduling and synchronization scenarios, each on its own machine.

use std::collections::VecDeque;
use std::sync::Arc;

use portable_atomic::{AtomicBool, AtomicU64, Ordering};

use super::{init_logging, GuardedCell};
use crate::{boot, yield_now, BootConfig, Condvar, Mutex, SyncError, Thread, TimerMode};

/// Bounded buffer: one producer, one consumer, capacity 4. The consumer
/// must observe 0..100 in order regardless of preemption.
#[test]
fn producer_consumer_preserves_order() {
    init_logging();

    struct Buffer {
        lock: Mutex,
        not_full: Condvar,
        not_empty: Condvar,
        items: GuardedCell<VecDeque<u32>>,
    }
    const CAPACITY: usize = 4;
    const COUNT: u32 = 100;

    let buffer = Arc::new(Buffer {
        lock: Mutex::new(),
        not_full: Condvar::new(),
        not_empty: Condvar::new(),
        items: GuardedCell::new(VecDeque::new()),
    });
    let received = Arc::new(GuardedCell::new(Vec::new()));

    let buffer_main = buffer.clone();
    let received_main = received.clone();
    let config = BootConfig::new(2).with_timer(TimerMode::Random { seed: 7 });
    boot(config, move || {
        let b = buffer_main.clone();
        let producer = Thread::spawn(move || {
            for i in 0..COUNT {
                b.lock.lock();
                // SAFETY: buffer mutex held.
                while unsafe { b.items.get() }.len() == CAPACITY {
                    b.not_full.wait(&b.lock).expect("producer owns the lock");
                }
                unsafe { b.items.get() }.push_back(i);
                b.not_empty.signal();
                b.lock.unlock().expect("producer owns the lock");
            }
        })
        .expect("spawn producer");

        let b = buffer_main.clone();
        let out = received_main.clone();
        let consumer = Thread::spawn(move || {
            for _ in 0..COUNT {
                b.lock.lock();
                // SAFETY: buffer mutex held.
                let item = loop {
                    if let Some(item) = unsafe { b.items.get() }.pop_front() {
                        break item;
                    }
                    b.not_empty.wait(&b.lock).expect("consumer owns the lock");
                };
                unsafe { out.get() }.push(item);
                b.not_full.signal();
                b.lock.unlock().expect("consumer owns the lock");
            }
        })
        .expect("spawn consumer");

        producer.join();
        consumer.join();
    })
    .expect("machine quiesces");

    // SAFETY: the machine is down; nothing else can touch the cell.
    let received = unsafe { received.get() };
    assert_eq!(*received, (0..COUNT).collect::<Vec<u32>>());
}

/// Two threads alternating through a turn flag and two condition variables.
/// Completion of all 2000 turn flips proves no wakeup is ever lost.
#[test]
fn ping_pong_alternates_without_lost_wakeups() {
    init_logging();

    struct Court {
        lock: Mutex,
        sides: [Condvar; 2],
        turn: GuardedCell<u8>,
    }
    const ROUNDS: usize = 1000;

    let court = Arc::new(Court {
        lock: Mutex::new(),
        sides: [Condvar::new(), Condvar::new()],
        turn: GuardedCell::new(0),
    });
    let flips = Arc::new(AtomicU64::new(0));
    let waits = Arc::new(AtomicU64::new(0));

    let court_main = court.clone();
    let flips_main = flips.clone();
    let waits_main = waits.clone();
    let config = BootConfig::new(1).with_timer(TimerMode::Random { seed: 42 });
    boot(config, move || {
        let mut players = Vec::new();
        for me in 0..2u8 {
            let c = court_main.clone();
            let flips = flips_main.clone();
            let waits = waits_main.clone();
            let player = Thread::spawn(move || {
                for _ in 0..ROUNDS {
                    c.lock.lock();
                    // SAFETY: court mutex held.
                    while unsafe { *c.turn.get() } != me {
                        c.sides[me as usize].wait(&c.lock).expect("player owns the lock");
                        waits.fetch_add(1, Ordering::Relaxed);
                    }
                    unsafe { *c.turn.get() = 1 - me };
                    flips.fetch_add(1, Ordering::Relaxed);
                    c.sides[1 - me as usize].signal();
                    c.lock.unlock().expect("player owns the lock");
                }
            })
            .expect("spawn player");
            players.push(player);
        }
        for player in &players {
            player.join();
        }
    })
    .expect("machine quiesces");

    assert_eq!(flips.load(Ordering::Relaxed), 2 * ROUNDS as u64);
    assert!(waits.load(Ordering::Relaxed) > 0, "players never blocked");
}

/// Join chain: main joins t1, t1 joins t2; completion order is t2, t1, main.
#[test]
fn join_chain_completes_in_order() {
    init_logging();

    let order = Arc::new(spin::Mutex::new(Vec::new()));

    let order_main = order.clone();
    boot(BootConfig::new(1), move || {
        let order_t1 = order_main.clone();
        let t1 = Thread::spawn(move || {
            let order_t2 = order_t1.clone();
            let t2 = Thread::spawn(move || {
                for _ in 0..100 {
                    yield_now();
                }
                order_t2.lock().push("t2");
            })
            .expect("spawn t2");
            t2.join();
            order_t1.lock().push("t1");
        })
        .expect("spawn t1");
        t1.join();
        order_main.lock().push("main");
    })
    .expect("machine quiesces");

    assert_eq!(*order.lock(), vec!["t2", "t1", "main"]);
}

/// Ten waiters on one condition variable; a single broadcast wakes all of
/// them, and they reacquire the mutex in the order they first waited.
#[test]
fn broadcast_wakes_all_in_fifo_order() {
    init_logging();

    struct Gathering {
        lock: Mutex,
        all_here: Condvar,
        waiting: GuardedCell<usize>,
        order: GuardedCell<Vec<usize>>,
    }
    const WAITERS: usize = 10;

    let gathering = Arc::new(Gathering {
        lock: Mutex::new(),
        all_here: Condvar::new(),
        waiting: GuardedCell::new(0),
        order: GuardedCell::new(Vec::new()),
    });

    let g_main = gathering.clone();
    boot(BootConfig::new(1), move || {
        let mut waiters = Vec::new();
        for i in 0..WAITERS {
            let g = g_main.clone();
            let waiter = Thread::spawn(move || {
                g.lock.lock();
                // SAFETY: gathering mutex held.
                unsafe { *g.waiting.get() += 1 };
                g.all_here.wait(&g.lock).expect("waiter owns the lock");
                unsafe { g.order.get() }.push(i);
                g.lock.unlock().expect("waiter owns the lock");
            })
            .expect("spawn waiter");
            waiters.push(waiter);
        }

        loop {
            g_main.lock.lock();
            // SAFETY: gathering mutex held.
            let waiting = unsafe { *g_main.waiting.get() };
            g_main.lock.unlock().expect("main owns the lock");
            if waiting == WAITERS {
                break;
            }
            yield_now();
        }

        g_main.lock.lock();
        g_main.all_here.broadcast();
        g_main.lock.unlock().expect("main owns the lock");

        for waiter in &waiters {
            waiter.join();
        }
    })
    .expect("machine quiesces");

    // SAFETY: the machine is down.
    let order = unsafe { gathering.order.get() };
    assert_eq!(*order, (0..WAITERS).collect::<Vec<usize>>());
}

/// Four threads on two CPUs each increment a shared counter 10,000 times
/// under a mutex while the wall-clock timer preempts them.
#[test]
fn contended_counter_with_preemption() {
    init_logging();

    struct Tally {
        lock: Mutex,
        value: GuardedCell<u64>,
    }
    const THREADS: usize = 4;
    const INCREMENTS: u64 = 10_000;

    let tally = Arc::new(Tally {
        lock: Mutex::new(),
        value: GuardedCell::new(0),
    });

    let tally_main = tally.clone();
    let config = BootConfig::new(2).with_timer(TimerMode::Interval);
    boot(config, move || {
        let mut workers = Vec::new();
        for _ in 0..THREADS {
            let t = tally_main.clone();
            let worker = Thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    t.lock.lock();
                    // SAFETY: tally mutex held.
                    unsafe { *t.value.get() += 1 };
                    t.lock.unlock().expect("worker owns the lock");
                }
            })
            .expect("spawn worker");
            workers.push(worker);
        }
        for worker in &workers {
            worker.join();
        }
    })
    .expect("machine quiesces");

    // SAFETY: the machine is down.
    assert_eq!(unsafe { *tally.value.get() }, THREADS as u64 * INCREMENTS);
}

/// A second CPU with nothing to do suspends, and an IPI wakes it when work
/// appears; the machine still drains to quiescence afterwards.
#[test]
fn idle_cpu_wakes_for_new_work() {
    init_logging();

    let ran = Arc::new(AtomicU64::new(0));

    let ran_main = ran.clone();
    boot(BootConfig::new(2), move || {
        let ran = ran_main.clone();
        let helper = Thread::spawn(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        })
        .expect("spawn helper");
        yield_now();
        helper.join();
    })
    .expect("machine quiesces");

    assert_eq!(ran.load(Ordering::Relaxed), 1);
}

/// Without preemption, threads run in the order they were enqueued.
#[test]
fn ready_queue_is_fifo() {
    init_logging();

    let order = Arc::new(spin::Mutex::new(Vec::new()));

    let order_main = order.clone();
    boot(BootConfig::new(1), move || {
        let mut threads = Vec::new();
        for i in 0..5 {
            let order = order_main.clone();
            let t = Thread::spawn(move || {
                order.lock().push(i);
            })
            .expect("spawn");
            threads.push(t);
        }
        for t in &threads {
            t.join();
        }
    })
    .expect("machine quiesces");

    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

/// Direct handoff serves mutex waiters in FIFO order.
#[test]
fn mutex_hands_off_in_fifo_order() {
    init_logging();

    struct Contest {
        lock: Mutex,
        order: GuardedCell<Vec<usize>>,
    }

    let contest = Arc::new(Contest {
        lock: Mutex::new(),
        order: GuardedCell::new(Vec::new()),
    });

    let contest_main = contest.clone();
    boot(BootConfig::new(1), move || {
        // Hold the lock so every contender blocks, in spawn order.
        contest_main.lock.lock();

        let mut contenders = Vec::new();
        for i in 0..3 {
            let c = contest_main.clone();
            let contender = Thread::spawn(move || {
                c.lock.lock();
                // SAFETY: contest mutex held.
                unsafe { c.order.get() }.push(i);
                c.lock.unlock().expect("contender owns the lock");
            })
            .expect("spawn contender");
            contenders.push(contender);
        }

        // Let all three reach the waitlist, then release.
        for _ in 0..10 {
            yield_now();
        }
        contest_main.lock.unlock().expect("main owns the lock");

        for contender in &contenders {
            contender.join();
        }
    })
    .expect("machine quiesces");

    // SAFETY: the machine is down.
    assert_eq!(*unsafe { contest.order.get() }, vec![0, 1, 2]);
}

#[test]
fn unlock_requires_ownership() {
    init_logging();

    let saw_error = Arc::new(AtomicBool::new(false));

    let saw_error_main = saw_error.clone();
    boot(BootConfig::new(1), move || {
        let mutex = Mutex::new();
        saw_error_main.store(mutex.unlock() == Err(SyncError::NotOwner), Ordering::Relaxed);
    })
    .expect("machine quiesces");

    assert!(saw_error.load(Ordering::Relaxed));
}

#[test]
fn wait_requires_mutex_ownership() {
    init_logging();

    let saw_error = Arc::new(AtomicBool::new(false));

    let saw_error_main = saw_error.clone();
    boot(BootConfig::new(1), move || {
        let mutex = Mutex::new();
        let condvar = Condvar::new();
        saw_error_main.store(
            condvar.wait(&mutex) == Err(SyncError::NotOwner),
            Ordering::Relaxed,
        );
    })
    .expect("machine quiesces");

    assert!(saw_error.load(Ordering::Relaxed));
}

/// Joining a thread that already finished — and may already have been
/// reaped by the finished-list sweep — returns immediately.
#[test]
fn join_on_finished_thread_returns_immediately() {
    init_logging();

    boot(BootConfig::new(1), || {
        let t = Thread::spawn(|| {}).expect("spawn");
        // Let it run to completion and get swept.
        for _ in 0..10 {
            yield_now();
        }
        t.join();
        t.join();
    })
    .expect("machine quiesces");
}

#[test]
fn yield_with_empty_ready_queue_returns() {
    init_logging();

    let continued = Arc::new(AtomicBool::new(false));

    let continued_main = continued.clone();
    boot(BootConfig::new(1), move || {
        yield_now();
        continued_main.store(true, Ordering::Relaxed);
    })
    .expect("machine quiesces");

    assert!(continued.load(Ordering::Relaxed));
}

/// Identical seeds on a single CPU reproduce identical interleavings.
#[test]
fn identical_seeds_reproduce_identical_traces() {
    init_logging();

    fn run_once() -> Vec<u8> {
        struct Journal {
            lock: Mutex,
            events: GuardedCell<Vec<u8>>,
        }

        let journal = Arc::new(Journal {
            lock: Mutex::new(),
            events: GuardedCell::new(Vec::new()),
        });

        let journal_main = journal.clone();
        let config = BootConfig::new(1).with_timer(TimerMode::Random { seed: 1234 });
        boot(config, move || {
            let mut threads = Vec::new();
            for tag in 0..3u8 {
                let j = journal_main.clone();
                let t = Thread::spawn(move || {
                    for _ in 0..50 {
                        j.lock.lock();
                        // SAFETY: journal mutex held.
                        unsafe { j.events.get() }.push(tag);
                        j.lock.unlock().expect("writer owns the lock");
                        yield_now();
                    }
                })
                .expect("spawn writer");
                threads.push(t);
            }
            for t in &threads {
                t.join();
            }
        })
        .expect("machine quiesces");

        // SAFETY: the machine is down.
        unsafe { journal.events.get() }.clone()
    }

    let first = run_once();
    let second = run_once();
    assert_eq!(first.len(), 150);
    assert_eq!(first, second);
}

/// A panicking thread body is logged and treated as a return; the rest of
/// the machine keeps running and drains normally.
#[test]
fn panicking_body_does_not_wedge_the_machine() {
    init_logging();

    let survivor_ran = Arc::new(AtomicBool::new(false));

    let survivor_main = survivor_ran.clone();
    boot(BootConfig::new(1), move || {
        let doomed = Thread::spawn(|| panic!("scripted failure")).expect("spawn doomed");
        let survivor_flag = survivor_main.clone();
        let survivor = Thread::spawn(move || {
            survivor_flag.store(true, Ordering::Relaxed);
        })
        .expect("spawn survivor");
        doomed.join();
        survivor.join();
    })
    .expect("machine quiesces");

    assert!(survivor_ran.load(Ordering::Relaxed));
}
