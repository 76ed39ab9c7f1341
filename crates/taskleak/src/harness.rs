//! A minimal sequential test runner for `harness = false` test targets.
//!
//! Cases run one at a time on the calling thread, which keeps the process-wide
//! registry free of other tests' tasks. Each case gets a [`TestCtx`], which
//! implements [`TestHandle`] so [`register_leak_detection`] works with it.
//!
//! ```rust,no_run
//! use taskleak::harness::Suite;
//!
//! fn main() {
//!     let detector = taskleak::Detector::from_env();
//!     let checks = detector.clone();
//!     let suite = Suite::new().case("closes_connections", move |t| {
//!         if !taskleak::register_leak_detection(t, &checks) {
//!             return;
//!         }
//!         // ...
//!     });
//!     taskleak::main_with_leak_detection_using(&detector, || suite.run_from_args()).exit()
//! }
//! ```
//!
//! [`register_leak_detection`]: crate::register_leak_detection

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};

use crate::lifecycle::TestHandle;

/// libtest's exit status when any test failed.
pub const FAILURE_EXIT_CODE: i32 = 101;

type CaseFn = Box<dyn Fn(&TestCtx)>;
type Cleanup = Box<dyn FnOnce(&dyn TestHandle)>;

/// Per-case state handed to the case body.
pub struct TestCtx {
    name: String,
    failed: Cell<bool>,
    skipped: RefCell<Option<String>>,
    errors: RefCell<Vec<String>>,
    cleanups: RefCell<Vec<Cleanup>>,
}

impl TestCtx {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failed: Cell::new(false),
            skipped: RefCell::new(None),
            errors: RefCell::new(Vec::new()),
            cleanups: RefCell::new(Vec::new()),
        }
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.borrow().clone()
    }

    pub fn skip_reason(&self) -> Option<String> {
        self.skipped.borrow().clone()
    }

    fn run_cleanups(&self) {
        loop {
            let next = self.cleanups.borrow_mut().pop();
            let Some(cleanup) = next else {
                break;
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| cleanup(self)));
            if let Err(payload) = result {
                self.error(&format!("cleanup panicked: {}", panic_message(&*payload)));
            }
        }
    }

    fn outcome(&self) -> CaseOutcome {
        if self.failed.get() {
            CaseOutcome::Failed
        } else if self.skipped.borrow().is_some() {
            CaseOutcome::Skipped
        } else {
            CaseOutcome::Passed
        }
    }
}

impl TestHandle for TestCtx {
    fn name(&self) -> &str {
        &self.name
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

/// How a single case ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    Failed,
    Skipped,
}

/// Tallies from one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub filtered_out: usize,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            0
        } else {
            FAILURE_EXIT_CODE
        }
    }
}

struct Case {
    name: String,
    body: CaseFn,
}

/// An ordered list of named test cases.
#[derive(Default)]
pub struct Suite {
    cases: Vec<Case>,
}

impl Suite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn case(mut self, name: impl Into<String>, body: impl Fn(&TestCtx) + 'static) -> Self {
        self.cases.push(Case {
            name: name.into(),
            body: Box::new(body),
        });
        self
    }

    /// Run every case whose name contains the first non-flag argument.
    pub fn run_from_args(&self) -> i32 {
        let filter = std::env::args().skip(1).find(|arg| !arg.starts_with('-'));
        self.run_filtered(filter.as_deref(), &mut std::io::stdout().lock())
            .exit_code()
    }

    /// Run every case and return the exit code.
    pub fn run(&self) -> i32 {
        self.run_filtered(None, &mut std::io::stdout().lock())
            .exit_code()
    }

    /// Run matching cases, writing libtest-style progress to `out`.
    pub fn run_filtered(&self, filter: Option<&str>, out: &mut dyn Write) -> RunSummary {
        let selected: Vec<&Case> = self
            .cases
            .iter()
            .filter(|case| filter.is_none_or(|f| case.name.contains(f)))
            .collect();
        let mut summary = RunSummary {
            filtered_out: self.cases.len() - selected.len(),
            ..RunSummary::default()
        };

        let _ = writeln!(out, "\nrunning {} tests", selected.len());
        let mut failures: Vec<(String, Vec<String>)> = Vec::new();
        for case in selected {
            let ctx = TestCtx::new(&case.name);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (case.body)(&ctx))) {
                ctx.error(&panic_message(&*payload));
            }
            ctx.run_cleanups();

            let status = match ctx.outcome() {
                CaseOutcome::Passed => {
                    summary.passed += 1;
                    "ok"
                }
                CaseOutcome::Failed => {
                    summary.failed += 1;
                    failures.push((case.name.clone(), ctx.errors()));
                    "FAILED"
                }
                CaseOutcome::Skipped => {
                    summary.skipped += 1;
                    "ignored"
                }
            };
            let _ = writeln!(out, "test {} ... {status}", case.name);
        }

        if !failures.is_empty() {
            let _ = writeln!(out, "\nfailures:");
            for (name, errors) in &failures {
                let _ = writeln!(out, "\n---- {name} ----");
                for error in errors {
                    let _ = writeln!(out, "{error}");
                }
            }
        }

        let verdict = if summary.failed == 0 { "ok" } else { "FAILED" };
        let _ = writeln!(
            out,
            "\ntest result: {verdict}. {} passed; {} failed; {} ignored; {} filtered out\n",
            summary.passed, summary.failed, summary.skipped, summary.filtered_out
        );
        summary
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test panicked".to_string()
    }
}
