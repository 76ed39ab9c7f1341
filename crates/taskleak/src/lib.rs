//! Leaked-task detection for tests.
//!
//! Tasks spawned through [`spawn`], [`spawn_blocking`], [`track`] and
//! [`spawn_thread`] are recorded in a process-wide registry for as long as they
//! are alive. A [`Detector`] dumps that registry as text, throws away the
//! records that are expected to be running (the test harness, runtime
//! workers, the dumping thread itself) and reports the rest.
//!
//! There are two ways to use it:
//!
//! - per test, with [`register_leak_detection`] or [`leak_guard!`]. A test
//!   fails if it leaves tasks behind, and is skipped if an earlier test
//!   already did.
//! - per binary, with [`main_with_leak_detection`]. Once the whole suite has
//!   passed, any surviving tasks are reported to stderr and the process exits
//!   with [`LEAK_EXIT_CODE`].
//!
//! ```rust,no_run
//! #[test]
//! fn server_shuts_down() {
//!     taskleak::leak_guard!();
//!
//!     let rt = tokio::runtime::Runtime::new().unwrap();
//!     rt.block_on(async {
//!         let server = taskleak::spawn("server", async { /* ... */ });
//!         server.await.unwrap();
//!     });
//! }
//! ```
//!
//! The classifier works on the dump text alone, so any [`StackDumper`] that
//! produces records separated by blank lines can be checked the same way.
//!
//! # Configuration
//!
//! [`Detector::from_env`] reads `TASKLEAK_*` variables; see [`DetectorConfig`].

pub mod check;
pub mod classify;
pub mod config;
pub mod detector;
pub mod harness;
pub mod lifecycle;
pub mod registry;
pub mod report;
pub mod snapshot;
pub mod tables;

pub use check::{Clock, IdlePool, LeakError, ManualClock, NoPool, SystemClock};
pub use classify::{StackTrace, classify, normalize};
pub use config::DetectorConfig;
pub use detector::Detector;
pub use lifecycle::{
    LEAK_EXIT_CODE, LeakGuard, Registration, SuiteOutcome, TestHandle, main_with_leak_detection,
    main_with_leak_detection_using, register_leak_detection,
};
pub use registry::{
    Registry, Tracked, capture_spawn_backtraces, live_count, spawn, spawn_backtraces_enabled,
    spawn_blocking, spawn_thread, track,
};
pub use report::{LeakReport, ReportEntry};
pub use snapshot::{Snapshot, Snapshotter, StackDumper, dump_fn};
pub use tables::{Badness, Tables, TablesError};
