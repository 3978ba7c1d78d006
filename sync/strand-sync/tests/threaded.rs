///
/// Threaded Integration Tests
///
/// Many-thread scenarios for every primitive, driven through the
/// `strand-testing` harness: each test hammers shared state from N threads,
/// then validates once they have all joined.
///
/// Iteration counts drop in debug builds so the suite stays fast; release
/// builds (`cargo test --release --test threaded`) run the full counts.
///
/// NOTE: the named-lock scenario with a queued writer deadlocks if the
/// lock ever stops letting readers pass a waiting writer.
///

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use strand_sync::{
    AtomicCounter, Fairness, LockMode, Mailbox, NamedRwLock, RecursiveEngineLock, ThreadLockState,
    WorkerPool,
};
use strand_testing::{init_test_logging, run_threaded, ThreadedTest};

const fn by_profile(debug: usize, release: usize) -> usize {
    if cfg!(debug_assertions) { debug } else { release }
}

// ============================================================================
// AtomicCounter
// ============================================================================

struct CounterIsAtomic {
    iterations: usize,
    target: AtomicCounter,
}

impl ThreadedTest for CounterIsAtomic {
    fn name(&self) -> &str {
        "counter"
    }

    fn subthread(&self, _remaining: usize) {
        for _ in 0..self.iterations {
            self.target.fetch_increment();
        }
    }

    fn validate(&self) {
        assert_eq!(self.target.get() as usize, 10 * self.iterations);
    }
}

#[test]
fn test_counter_increments_are_atomic() {
    run_threaded(
        &mut CounterIsAtomic {
            iterations: by_profile(100_000, 1_000_000),
            target: AtomicCounter::new(0),
        },
        10,
    );
}

// ============================================================================
// Mailbox
// ============================================================================

struct MailboxHandOff {
    iterations: u64,
    target: Mailbox<u64>,
}

impl ThreadedTest for MailboxHandOff {
    fn name(&self) -> &str {
        "mailbox"
    }

    fn subthread(&self, _remaining: usize) {
        for _ in 0..self.iterations {
            let value = self.target.take();
            // widen the window for a lost update
            thread::yield_now();
            self.target.put(value + 1);
        }
    }

    fn validate(&self) {
        assert_eq!(self.target.take(), 10 * self.iterations);
    }
}

#[test]
fn test_mailbox_hand_off_loses_nothing() {
    run_threaded(
        &mut MailboxHandOff {
            iterations: 10_000,
            target: Mailbox::with_value(0),
        },
        10,
    );
}

// ============================================================================
// WorkerPool
// ============================================================================

#[test]
fn test_pool_completes_all_items_before_join_returns() {
    init_test_logging();
    let counter = Arc::new(AtomicCounter::new(0));
    let pool = WorkerPool::new(8).unwrap();

    for _ in 0..10_000 {
        let counter = Arc::clone(&counter);
        pool.schedule(move || {
            for _ in 0..2 {
                counter.fetch_increment();
            }
        })
        .unwrap();
    }

    pool.join();
    assert!(counter.compare_equals(20_000));
}

#[test]
fn test_pool_shared_between_submitters() {
    init_test_logging();
    let counter = Arc::new(AtomicCounter::new(0));
    let pool = Arc::new(WorkerPool::new(4).unwrap());

    let submitters: Vec<_> = (0..4).map(|_| {
        let pool = Arc::clone(&pool);
        let counter = Arc::clone(&counter);
        thread::spawn(move || {
            for _ in 0..1_000 {
                let counter = Arc::clone(&counter);
                pool.schedule(move || {
                    counter.increment();
                })
                .unwrap();
            }
        })
    }).collect();

    for s in submitters {
        s.join().unwrap();
    }
    pool.join();
    assert_eq!(counter.get(), 4_000);
}

// ============================================================================
// NamedRwLock
// ============================================================================

#[test]
fn test_named_lock_scoped_write() {
    let lock = NamedRwLock::new("eliot");
    {
        let _w = lock.try_write_for(Duration::from_millis(1000)).unwrap();
    }
    assert!(!lock.is_write_locked());
}

#[test]
fn test_named_lock_reader_passes_queued_writer() {
    init_test_logging();
    let lock = Arc::new(NamedRwLock::with_default_timeout("eliot2", Duration::from_secs(120)));
    let a = lock.guard(LockMode::Read).unwrap();

    let x1 = Arc::new(AtomicCounter::new(0));
    let t1 = {
        let lock = Arc::clone(&lock);
        let x1 = Arc::clone(&x1);
        thread::spawn(move || {
            x1.increment();
            let _b = lock.guard(LockMode::Write).unwrap();
            x1.increment();
        })
    };

    while !x1.is_positive() {
        thread::yield_now();
    }
    assert!(*x1 == 1);
    thread::sleep(Duration::from_millis(500));
    assert!(*x1 == 1);

    let x2 = Arc::new(AtomicCounter::new(0));
    let t2 = {
        let lock = Arc::clone(&lock);
        let x2 = Arc::clone(&x2);
        thread::spawn(move || {
            let _c = lock.guard(LockMode::Read).unwrap();
            x2.increment();
        })
    };
    t2.join().unwrap();
    assert!(*x2 == 1);

    a.release();

    for _ in 0..2000 {
        if *x1 == 2 {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(*x1 == 2);
    t1.join().unwrap();
}

/// One scheduled acquisition in a randomized lock schedule.
#[derive(Debug, Clone)]
struct Step {
    write: bool,
    timeout_ms: Option<u64>,
    hold_yields: u8,
}

fn arb_step() -> impl Strategy<Value = Step> {
    (
        any::<bool>(),
        prop_oneof![Just(None), (0u64..3).prop_map(Some)],
        0u8..8,
    )
        .prop_map(|(write, timeout_ms, hold_yields)| Step {
            write,
            timeout_ms,
            hold_yields,
        })
}

fn arb_schedule() -> impl Strategy<Value = Vec<Vec<Step>>> {
    prop::collection::vec(prop::collection::vec(arb_step(), 1..40), 2..6)
}

fn arb_fairness() -> impl Strategy<Value = Fairness> {
    prop_oneof![Just(Fairness::ReaderPreferred), Just(Fairness::WriterPreferred)]
}

/// Runs `schedule` with one thread per step list. Each holder checks the
/// exclusion invariant through counters only it may bump. Returns the
/// number of failed (timed out) acquisitions.
fn run_schedule(schedule: Vec<Vec<Step>>, fairness: Fairness) -> usize {
    let lock = Arc::new(NamedRwLock::new("schedule").with_fairness(fairness));
    let readers = Arc::new(AtomicUsize::new(0));
    let writers = Arc::new(AtomicUsize::new(0));
    let timeouts = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = schedule
        .into_iter()
        .map(|steps| {
            let lock = Arc::clone(&lock);
            let readers = Arc::clone(&readers);
            let writers = Arc::clone(&writers);
            let timeouts = Arc::clone(&timeouts);
            thread::spawn(move || {
                for step in steps {
                    let mode = if step.write { LockMode::Write } else { LockMode::Read };
                    let timeout = step.timeout_ms.map(Duration::from_millis);
                    if !lock.acquire(mode, timeout) {
                        timeouts.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }

                    if step.write {
                        assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0, "two writers");
                        assert_eq!(readers.load(Ordering::SeqCst), 0, "writer with readers");
                    } else {
                        readers.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(writers.load(Ordering::SeqCst), 0, "reader with writer");
                    }

                    for _ in 0..step.hold_yields {
                        thread::yield_now();
                    }

                    if step.write {
                        writers.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        readers.fetch_sub(1, Ordering::SeqCst);
                    }
                    lock.release(mode);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.readers(), 0);
    assert!(!lock.is_write_locked());
    timeouts.load(Ordering::SeqCst)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// No schedule ever lets a writer overlap any other holder.
    #[test]
    fn named_lock_excludes_writers(schedule in arb_schedule(), fairness in arb_fairness()) {
        run_schedule(schedule, fairness);
    }

    /// With no writer around, read acquisitions never fail, even try-once ones.
    #[test]
    fn named_lock_readers_never_fail_without_writers(
        schedule in arb_schedule(),
        fairness in arb_fairness(),
    ) {
        let reads_only: Vec<Vec<Step>> = schedule
            .into_iter()
            .map(|steps| steps.into_iter().map(|step| Step { write: false, ..step }).collect())
            .collect();
        prop_assert_eq!(run_schedule(reads_only, fairness), 0);
    }
}

// ============================================================================
// RecursiveEngineLock
// ============================================================================

struct EngineLockStress {
    iterations: usize,
    lock: RecursiveEngineLock,
}

impl EngineLockStress {
    fn step(&self, op: u32) {
        let mm = &self.lock;
        match op {
            0 => {
                mm.lock_shared();
                mm.lock_shared();
                mm.unlock_shared();
                mm.unlock_shared();
            }
            1 => {
                mm.lock_shared();
                assert!(mm.at_least_read_locked());
                mm.unlock_shared();
            }
            2 => {
                mm.lock();
                assert!(mm.is_write_locked());
                mm.unlock();
            }
            3 => {
                mm.lock();
                mm.lock_shared();
                assert!(mm.is_write_locked());
                mm.unlock_shared();
                mm.unlock();
            }
            4 => {
                mm.lock();
                mm.release_early();
                mm.unlock();
            }
            5 => {
                if mm.lock_try(Duration::from_millis(1)) {
                    mm.unlock();
                }
            }
            6 => {
                if mm.lock_shared_try(Duration::ZERO) {
                    mm.unlock_shared();
                }
            }
            _ => {
                mm.lock_shared();
                mm.unlock_shared();
            }
        }
    }
}

impl ThreadedTest for EngineLockStress {
    fn name(&self) -> &str {
        "engine-lock"
    }

    fn subthread(&self, remaining: usize) {
        let mut rng = StdRng::seed_from_u64(remaining as u64);
        thread::yield_now();
        for _ in 0..self.iterations {
            self.step(rng.gen_range(0..8));
            assert_eq!(self.lock.thread_state(), ThreadLockState::Unlocked);
        }
        self.lock.release_thread_state().unwrap();
    }

    fn validate(&self) {
        let mm = &self.lock;
        assert!(!mm.at_least_read_locked());
        mm.check_released().unwrap();
        mm.lock();
        mm.unlock();
        mm.lock_shared();
        mm.unlock_shared();
    }
}

#[test]
fn test_engine_lock_under_heavy_contention() {
    run_threaded(
        &mut EngineLockStress {
            iterations: by_profile(5_000, 40_000),
            lock: RecursiveEngineLock::new("engine-stress"),
        },
        135,
    );
}

struct EngineLockVisibility {
    lock: RecursiveEngineLock,
    holders: AtomicUsize,
}

impl ThreadedTest for EngineLockVisibility {
    fn name(&self) -> &str {
        "engine-visibility"
    }

    fn subthread(&self, _remaining: usize) {
        for _ in 0..500 {
            {
                let _w = self.lock.write_guard();
                assert_eq!(self.holders.fetch_add(1, Ordering::SeqCst), 0);
                assert!(self.lock.is_write_locked());
                thread::yield_now();
                self.holders.fetch_sub(1, Ordering::SeqCst);
            }
            // while someone else writes, this thread must not see itself as a holder
            assert!(!self.lock.is_write_locked());
            let _r = self.lock.read_guard();
            assert_eq!(self.holders.load(Ordering::SeqCst), 0);
            assert_eq!(self.lock.thread_state(), ThreadLockState::ReadHeld { depth: 1 });
        }
    }

    fn validate(&self) {
        assert!(!self.lock.at_least_read_locked());
        self.lock.check_released().unwrap();
    }
}

#[test]
fn test_engine_lock_write_is_exclusive_and_thread_local() {
    run_threaded(
        &mut EngineLockVisibility {
            lock: RecursiveEngineLock::new("visibility"),
            holders: AtomicUsize::new(0),
        },
        8,
    );
}
