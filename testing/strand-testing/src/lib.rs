///
/// strand-testing - Threaded Test Harness
///
/// Runs one test body on many threads at once against shared state, then
/// validates that state after every thread has joined:
///
/// ```rust,ignore
/// struct Counting { counter: AtomicCounter }
///
/// impl ThreadedTest for Counting {
///     fn subthread(&self, _remaining: usize) {
///         for _ in 0..1_000 { self.counter.increment(); }
///     }
///     fn validate(&self) {
///         assert_eq!(self.counter.get(), 10 * 1_000);
///     }
/// }
///
/// run_threaded(&mut Counting { counter: AtomicCounter::new(0) }, 10);
/// ```
///
/// A panic on any subthread fails the run with that thread's panic payload,
/// after all other threads have been joined.
///

use std::panic;
use std::sync::Once;
use std::thread;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

pub trait ThreadedTest: Sync {
    /// Label used for thread names and the timing log line.
    fn name(&self) -> &str {
        "threaded"
    }

    fn setup(&mut self) {}

    /// The per-thread body. `remaining` runs from the thread count down to 1.
    fn subthread(&self, remaining: usize);

    /// Called once all subthreads have finished.
    fn validate(&self);
}

/// Runs `test` on `threads` concurrent threads.
///
/// # Panics
///
/// Panics if a subthread panics, if a thread cannot be spawned, or if
/// `validate` panics.
pub fn run_threaded<T: ThreadedTest>(test: &mut T, threads: usize) {
    init_test_logging();
    test.setup();

    let test: &T = test;
    let start = Instant::now();

    let failure = thread::scope(|scope| {
        let handles: Vec<_> = (1..=threads)
            .rev()
            .map(|remaining| {
                thread::Builder::new()
                    .name(format!("{}-{}", test.name(), remaining))
                    .spawn_scoped(scope, move || test.subthread(remaining))
                    .expect("failed to spawn test thread")
            })
            .collect();

        // Join every handle before reporting, so no panicked thread is left to the scope.
        let mut failures: Vec<_> = handles
            .into_iter()
            .filter_map(|handle| handle.join().err())
            .collect();
        (!failures.is_empty()).then(|| failures.swap_remove(0))
    });

    if let Some(payload) = failure {
        panic::resume_unwind(payload);
    }

    info!(
        test = test.name(),
        threads,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "subthreads finished"
    );
    test.validate();
}

/// Installs a test-writer `tracing` subscriber once per process. Honours
/// `RUST_LOG`; defaults to `warn`.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
