//! Hooking leak checks into a test's lifetime and into a test binary's main.
//!
//! Three entry points:
//!
//! | Entry point | Use from |
//! |---|---|
//! | [`register_leak_detection`] | harnesses with skip/cleanup support ([`TestHandle`]) |
//! | [`LeakGuard`] / [`leak_guard!`](crate::leak_guard) | plain libtest `#[test]` functions |
//! | [`main_with_leak_detection`] | `harness = false` test targets |
//!
//! The registry is process-wide, so tests that use leak detection must not run
//! concurrently with other tests that spawn tracked tasks.

use tracing::warn;

use crate::check::LeakError;
use crate::detector::Detector;

/// Exit status for "all tests passed but tasks leaked". Shares its value with
/// generic failures.
pub const LEAK_EXIT_CODE: i32 = 1;

/// What a test harness exposes to per-test leak detection.
pub trait TestHandle {
    fn name(&self) -> &str;
    /// Whether the test has already failed.
    fn failed(&self) -> bool;
    /// Mark the test as skipped.
    fn skip(&self, reason: &str);
    /// Record a failure without stopping the test.
    fn error(&self, message: &str);
    /// Run `f` after the test body, most recently registered first.
    fn cleanup(&self, f: Box<dyn FnOnce(&dyn TestHandle)>);
}

/// Check before the test body and register a check for after it.
///
/// Leftovers from an earlier test skip this one rather than fail it; the
/// function then returns `false` and the caller should return early. After the
/// body, a test that has not already failed fails if tasks outlive it.
#[must_use = "the test should return early when this returns false"]
pub fn register_leak_detection<T: TestHandle + ?Sized>(t: &T, detector: &Detector) -> bool {
    if let Err(err) = detector.check_after_test(detector.config().pre_test_timeout) {
        t.skip(&format!("found leaked tasks BEFORE test: {err}"));
        return false;
    }

    let detector = detector.clone();
    t.cleanup(Box::new(move |t: &dyn TestHandle| after_test(t, &detector)));
    true
}

fn after_test(t: &dyn TestHandle, detector: &Detector) {
    // A failed test's own unwinding state explains its leftovers; reporting
    // them would bury the real failure.
    if t.failed() {
        return;
    }
    if let Err(err) = detector.check_after_test(detector.config().post_test_timeout) {
        warn!(test = t.name(), leaked = err.count(), "test leaked tasks");
        t.error(&format!("Test {} {err}", t.name()));
    }
}

/// Result of [`LeakGuard::register`].
#[derive(Debug)]
pub enum Registration {
    /// Checking is armed; hold the guard until the end of the test.
    Active(LeakGuard),
    /// Tasks were already leaking before the test started.
    Skipped(LeakError),
}

/// Fails the current libtest test on drop if tasks outlive it.
///
/// The drop check is skipped while unwinding, so a test that already failed
/// reports its own panic rather than its leftovers.
#[derive(Debug)]
#[must_use = "the leak check runs when the guard is dropped"]
pub struct LeakGuard {
    detector: Detector,
    test_name: String,
}

impl LeakGuard {
    /// Register with a detector configured from the environment.
    pub fn register() -> Registration {
        Self::register_with(&Detector::from_env())
    }

    pub fn register_with(detector: &Detector) -> Registration {
        if let Err(err) = detector.check_after_test(detector.config().pre_test_timeout) {
            return Registration::Skipped(err);
        }
        // libtest names each test's thread after the test.
        let test_name = std::thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_string();
        Registration::Active(LeakGuard {
            detector: detector.clone(),
            test_name,
        })
    }
}

impl Drop for LeakGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let timeout = self.detector.config().post_test_timeout;
        if let Err(err) = self.detector.check_after_test(timeout) {
            panic!("Test {} {err}", self.test_name);
        }
    }
}

/// Arm a [`LeakGuard`] for the rest of the enclosing test, or return early
/// from it when tasks were already leaking.
///
/// libtest has no way to skip a test once it is running, so an early return
/// shows up as `ok`. The skip reason goes to stderr; run with `--nocapture`
/// to see it. A leak left by an earlier test can therefore hide behind
/// later tests that pass without checking anything.
///
/// ```rust,no_run
/// #[test]
/// fn closes_its_connections() {
///     taskleak::leak_guard!();
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! leak_guard {
    () => {
        $crate::leak_guard!($crate::Detector::from_env())
    };
    ($detector:expr) => {
        let _leak_guard = match $crate::LeakGuard::register_with(&$detector) {
            $crate::Registration::Active(guard) => guard,
            $crate::Registration::Skipped(err) => {
                eprintln!("skipping: found leaked tasks BEFORE test: {err}");
                return;
            }
        };
    };
}

/// How a test binary should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteOutcome {
    /// The suite's own status, passed through.
    Finished(i32),
    /// The suite passed but tasks were still running afterwards.
    Leaked,
}

impl SuiteOutcome {
    pub fn code(self) -> i32 {
        match self {
            Self::Finished(code) => code,
            Self::Leaked => LEAK_EXIT_CODE,
        }
    }

    /// Terminate the process with [`code`](Self::code).
    pub fn exit(self) -> ! {
        std::process::exit(self.code())
    }
}

impl Detector {
    /// End-of-suite check: give tasks the settle window to exit, then report
    /// whatever is left to stderr. Returns whether anything leaked.
    pub fn must_check_leaked_tasks(&self) -> bool {
        self.pool.close_idle_connections();
        // Only a grace period; the report below decides.
        let _ = self.check_after_test(self.config.suite_settle_timeout);
        self.clock.yield_now();
        self.check_leaked_tasks()
    }
}

/// Run a test suite, then check for leaks if it passed.
pub fn main_with_leak_detection(run: impl FnOnce() -> i32) -> SuiteOutcome {
    main_with_leak_detection_using(&Detector::from_env(), run)
}

pub fn main_with_leak_detection_using(
    detector: &Detector,
    run: impl FnOnce() -> i32,
) -> SuiteOutcome {
    let status = run();
    if status == 0 && detector.must_check_leaked_tasks() {
        return SuiteOutcome::Leaked;
    }
    SuiteOutcome::Finished(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::ManualClock;
    use crate::snapshot::dump_fn;
    use std::cell::{Cell, RefCell};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const LEAKED_TASK: &str = "task 3 [poller] (idle, 1 polls, 0.010s):\n\
                               app::poller::run\ncreated by thread 'main'\n";

    #[derive(Default)]
    struct FakeTest {
        failed: Cell<bool>,
        skipped: RefCell<Option<String>>,
        errors: RefCell<Vec<String>>,
        cleanups: RefCell<Vec<Box<dyn FnOnce(&dyn TestHandle)>>>,
    }

    impl FakeTest {
        fn finish(&self) {
            loop {
                let next = self.cleanups.borrow_mut().pop();
                let Some(f) = next else {
                    break;
                };
                f(self);
            }
        }
    }

    impl TestHandle for FakeTest {
        fn name(&self) -> &str {
            "fake_test"
        }

        fn failed(&self) -> bool {
            self.failed.get()
        }

        fn skip(&self, reason: &str) {
            *self.skipped.borrow_mut() = Some(reason.to_string());
        }

        fn error(&self, message: &str) {
            self.failed.set(true);
            self.errors.borrow_mut().push(message.to_string());
        }

        fn cleanup(&self, f: Box<dyn FnOnce(&dyn TestHandle)>) {
            self.cleanups.borrow_mut().push(f);
        }
    }

    /// A detector whose dump reports a leak only while `leaking` is set.
    fn switchable() -> (Detector, Arc<AtomicBool>) {
        let leaking = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&leaking);
        let detector = Detector::with_dumper(dump_fn(move || {
            if flag.load(Ordering::Relaxed) {
                LEAKED_TASK.to_string()
            } else {
                String::new()
            }
        }))
        .with_clock(ManualClock::new());
        (detector, leaking)
    }

    #[test]
    fn preexisting_leak_skips_test() {
        let (detector, leaking) = switchable();
        leaking.store(true, Ordering::Relaxed);

        let t = FakeTest::default();
        assert!(!register_leak_detection(&t, &detector));

        let reason = t.skipped.borrow().clone().expect("test skipped");
        assert!(reason.starts_with("found leaked tasks BEFORE test"), "{reason}");
        assert!(!t.failed());
        assert!(t.cleanups.borrow().is_empty());
    }

    #[test]
    fn leak_during_test_fails_it() {
        let (detector, leaking) = switchable();
        let t = FakeTest::default();
        assert!(register_leak_detection(&t, &detector));

        leaking.store(true, Ordering::Relaxed);
        t.finish();

        assert!(t.failed());
        let errors = t.errors.borrow();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Test fake_test appears to have leaked tasks:"));
        assert!(errors[0].contains("app::poller::run"));
    }

    #[test]
    fn clean_test_passes() {
        let (detector, _leaking) = switchable();
        let t = FakeTest::default();
        assert!(register_leak_detection(&t, &detector));
        t.finish();
        assert!(!t.failed());
        assert!(t.skipped.borrow().is_none());
    }

    #[test]
    fn failed_test_is_not_checked() {
        let (detector, leaking) = switchable();
        let t = FakeTest::default();
        assert!(register_leak_detection(&t, &detector));

        t.failed.set(true);
        leaking.store(true, Ordering::Relaxed);
        t.finish();
        assert!(t.errors.borrow().is_empty());
    }

    #[test]
    fn guard_is_skipped_when_already_leaking() {
        let (detector, leaking) = switchable();
        leaking.store(true, Ordering::Relaxed);
        match LeakGuard::register_with(&detector) {
            Registration::Skipped(err) => assert_eq!(err.count(), 1),
            Registration::Active(_) => panic!("expected the guard to be skipped"),
        }
    }

    #[test]
    fn guard_panics_on_leak() {
        let (detector, leaking) = switchable();
        let Registration::Active(guard) = LeakGuard::register_with(&detector) else {
            panic!("expected an active guard");
        };
        leaking.store(true, Ordering::Relaxed);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| drop(guard)));
        let payload = result.expect_err("guard should panic");
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(message.contains("appears to have leaked tasks"), "{message}");
    }

    #[test]
    fn guard_passes_when_clean() {
        let (detector, _leaking) = switchable();
        let Registration::Active(guard) = LeakGuard::register_with(&detector) else {
            panic!("expected an active guard");
        };
        drop(guard);
    }

    #[test]
    fn macro_returns_early_when_skipped() {
        fn body(detector: &Detector, reached: &Cell<bool>) {
            crate::leak_guard!(detector.clone());
            reached.set(true);
        }

        let (detector, leaking) = switchable();
        let reached = Cell::new(false);
        leaking.store(true, Ordering::Relaxed);
        body(&detector, &reached);
        assert!(!reached.get());

        leaking.store(false, Ordering::Relaxed);
        body(&detector, &reached);
        assert!(reached.get());
    }

    #[test]
    fn suite_status_passes_through() {
        let (detector, _leaking) = switchable();
        assert_eq!(
            main_with_leak_detection_using(&detector, || 0),
            SuiteOutcome::Finished(0)
        );
        assert_eq!(
            main_with_leak_detection_using(&detector, || 101).code(),
            101
        );
    }

    #[test]
    fn passing_suite_with_leak_exits_with_leak_code() {
        let (detector, leaking) = switchable();
        let detector = detector.with_config(
            crate::DetectorConfig::default().with_suite_settle_timeout(Duration::from_millis(100)),
        );
        let outcome = main_with_leak_detection_using(&detector, || {
            leaking.store(true, Ordering::Relaxed);
            0
        });
        assert_eq!(outcome, SuiteOutcome::Leaked);
        assert_eq!(outcome.code(), LEAK_EXIT_CODE);
    }

    #[test]
    fn failing_suite_skips_leak_report() {
        let (detector, leaking) = switchable();
        let outcome = main_with_leak_detection_using(&detector, || {
            leaking.store(true, Ordering::Relaxed);
            3
        });
        assert_eq!(outcome, SuiteOutcome::Finished(3));
    }
}
