//! One-shot leak report for the end of a test process.
//!
//! Unlike [`Detector::check_after_test`] this neither waits nor retries; run it
//! after everything else has had its chance to shut down.

use std::collections::HashMap;
use std::io::{self, Write};

use facet::Facet;
use tracing::{info, warn};

use crate::detector::Detector;
use crate::snapshot::Snapshot;

/// First line of the stderr report.
pub const REPORT_HEADER: &str = "Unexpected tasks running after all test(s).";

/// One distinct leak signature and how many tasks share it.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct ReportEntry {
    pub count: u32,
    /// Normalized stack text.
    pub signature: String,
}

/// Leaked stacks grouped by normalized signature, in snapshot order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct LeakReport {
    pub entries: Vec<ReportEntry>,
}

impl LeakReport {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut entries: Vec<ReportEntry> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for stack in snapshot.stacks() {
            let signature = stack.normalized();
            match index.get(&signature) {
                Some(&i) => entries[i].count += 1,
                None => {
                    index.insert(signature.clone(), entries.len());
                    entries.push(ReportEntry {
                        count: 1,
                        signature,
                    });
                }
            }
        }

        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of leaked tasks across all signatures.
    pub fn total(&self) -> u32 {
        self.entries.iter().map(|e| e.count).sum()
    }

    /// Write the header and one block per signature.
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "{REPORT_HEADER}")?;
        for entry in &self.entries {
            writeln!(out, "{} instances of:\n{}", entry.count, entry.signature)?;
        }
        out.flush()
    }

    pub fn to_json(&self) -> Result<String, String> {
        facet_json::to_string(self).map_err(|e| e.to_string())
    }
}

impl Detector {
    /// Take one snapshot and, if anything interesting is alive, write a
    /// report to `out`. Returns whether a leak was found.
    pub fn report_leaks(&self, out: &mut dyn Write) -> bool {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return false;
        }

        let report = LeakReport::from_snapshot(&snapshot);
        info!(
            leaked = report.total(),
            signatures = report.entries.len(),
            "tasks still running after all tests"
        );
        if let Err(err) = report.write_to(out) {
            warn!(%err, "failed to write leak report");
        }
        true
    }

    /// [`report_leaks`](Self::report_leaks) to stderr.
    pub fn check_leaked_tasks(&self) -> bool {
        self.report_leaks(&mut io::stderr().lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::ManualClock;

    fn detector(dump: &'static str) -> Detector {
        Detector::with_dumper(dump).with_clock(ManualClock::new())
    }

    #[test]
    fn clean_snapshot_writes_nothing() {
        let mut out = Vec::new();
        assert!(!detector("").report_leaks(&mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn same_signature_is_counted_once() {
        crate::test_support::init_test_logging();
        let dump = "goroutine 7 [select]:\n\
                    app.(*Conn).readLoop(0xc000010000)\ncreated by app.Dial\n\n\
                    goroutine 8 [select]:\n\
                    app.(*Conn).readLoop(0xc0000ff000)\ncreated by app.Dial\n\n\
                    goroutine 9 [sleep]:\napp.ticker()\ncreated by app.Start\n";
        let mut out = Vec::new();
        assert!(detector(dump).report_leaks(&mut out));

        let text = String::from_utf8(out).expect("report is UTF-8");
        assert_eq!(
            text,
            "Unexpected tasks running after all test(s).\n\
             2 instances of:\napp.(*Conn).readLoop(...)\ncreated by app.Dial\n\
             1 instances of:\napp.ticker()\ncreated by app.Start\n"
        );
    }

    #[test]
    fn allowlisted_tasks_are_not_reported() {
        let dump = "goroutine 3 [chan receive]:\ntesting.tRunner()\ncreated by testing.(*T).Run\n";
        let mut out = Vec::new();
        assert!(!detector(dump).report_leaks(&mut out));
    }

    #[test]
    fn report_serializes_to_json() {
        let dump = "task 1 [a]:\napp::loop_a\n\ntask 2 [a]:\napp::loop_a\n";
        let report = LeakReport::from_snapshot(&detector(dump).snapshot());
        assert_eq!(report.total(), 2);
        let json = report.to_json().expect("report serializes");
        assert!(json.contains("app::loop_a"), "{json}");
        let parsed: LeakReport = facet_json::from_str(&json).expect("report parses back");
        assert_eq!(parsed, report);
    }
}
