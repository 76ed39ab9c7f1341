//! Polling leak check: retry the snapshot until it comes back clean or the
//! deadline passes.
//!
//! Tasks wind down asynchronously (a connection writer may need a few
//! scheduler turns to notice its peer is gone), so a single snapshot right
//! after a test is flaky. The check polls instead and only reports what is
//! still there once the whole window has elapsed.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::detector::Detector;

/// Time source for the polling loop.
pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;
    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
    /// Give other threads a chance to run.
    fn yield_now(&self);
}

/// Wall-clock time with real sleeps.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// Virtual time that only moves when slept on. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

#[derive(Debug, Default)]
struct ManualState {
    now: Duration,
    sleeps: u32,
    yields: u32,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward without counting a sleep.
    pub fn advance(&self, by: Duration) {
        self.state.lock().now += by;
    }

    pub fn sleeps(&self) -> u32 {
        self.state.lock().sleeps
    }

    pub fn yields(&self) -> u32 {
        self.state.lock().yields
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.state.lock().now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.now += duration;
        state.sleeps += 1;
    }

    fn yield_now(&self) {
        self.state.lock().yields += 1;
    }
}

/// A shared connection pool whose idle connections should be closed before
/// checking, so pooled keep-alive connections don't count as leaks.
pub trait IdlePool: Send + Sync {
    fn close_idle_connections(&self);
}

/// No pool to close.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPool;

impl IdlePool for NoPool {
    fn close_idle_connections(&self) {}
}

impl<F> IdlePool for F
where
    F: Fn() + Send + Sync,
{
    fn close_idle_connections(&self) {
        self()
    }
}

/// Tasks were still running when the check window closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakError {
    what: Option<String>,
    count: usize,
    stacks: String,
}

impl LeakError {
    /// Badness label of the likely culprit, e.g. "a Transport".
    pub fn what(&self) -> Option<&str> {
        self.what.as_deref()
    }

    /// Number of leaked stacks at the last poll.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Leaked stacks at the last poll, joined by blank lines.
    pub fn stacks(&self) -> &str {
        &self.stacks
    }
}

impl fmt::Display for LeakError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "appears to have leaked {}:\n{}",
            self.what.as_deref().unwrap_or("tasks"),
            self.stacks
        )
    }
}

impl Error for LeakError {}

impl Detector {
    /// Poll until no interesting tasks remain or `timeout` has elapsed.
    ///
    /// Idle pooled connections are closed first. At least one poll always
    /// happens, even with a zero timeout.
    pub fn check_after_test(&self, timeout: Duration) -> Result<(), LeakError> {
        self.pool.close_idle_connections();

        let begin = self.clock.now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let snapshot = self.snapshotter.capture();
            if snapshot.is_empty() {
                debug!(attempt, "no leaked tasks");
                return Ok(());
            }

            let stacks = snapshot.joined();
            let what = self.tables().diagnose(&stacks).map(str::to_owned);
            debug!(
                attempt,
                survivors = snapshot.len(),
                what = what.as_deref().unwrap_or("tasks"),
                "tasks still running, waiting for them to exit"
            );

            self.clock.yield_now();
            self.clock.sleep(self.config.poll_interval);

            if self.clock.now().saturating_sub(begin) >= timeout {
                return Err(LeakError {
                    what,
                    count: snapshot.len(),
                    stacks,
                });
            }
        }
    }
}
