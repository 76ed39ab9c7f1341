//! Splitting a task dump into per-task stacks and dropping the boring ones.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::snapshot::SELF_FRAME;
use crate::tables::Tables;

/// Parenthesized pointer-argument lists such as `(0xc000123450, 0x1)`.
static POINTER_ARGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(0[0-9a-fx, ]*\)").expect("pointer argument pattern is a valid regex")
});

/// Placeholder substituted for pointer-argument lists.
pub const POINTER_PLACEHOLDER: &str = "(...)";

/// One task's stack: the body of a dump record, header line removed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StackTrace(String);

impl StackTrace {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The stack with pointer-argument lists replaced by `(...)`, so stacks
    /// that differ only in heap addresses compare equal.
    pub fn normalized(&self) -> String {
        normalize(&self.0)
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StackTrace {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Replace pointer-argument lists in `stack` with [`POINTER_PLACEHOLDER`].
pub fn normalize(stack: &str) -> String {
    POINTER_ARGS
        .replace_all(stack, POINTER_PLACEHOLDER)
        .into_owned()
}

/// Split `raw` into records, drop our own record and allowlisted ones, and
/// return the rest sorted.
///
/// Records are separated by a blank line. The first line of a record is its
/// header; records without a body are skipped.
pub fn classify(raw: &str, tables: &Tables) -> Vec<StackTrace> {
    let mut stacks: Vec<StackTrace> = raw
        .split("\n\n")
        .filter_map(|record| {
            let (_header, body) = record.split_once('\n')?;
            let body = body.trim();
            if body.is_empty() || body.contains(SELF_FRAME) || tables.is_uninteresting(body) {
                return None;
            }
            Some(StackTrace::new(body))
        })
        .collect();
    stacks.sort();
    stacks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> Tables {
        Tables::builtin()
    }

    #[test]
    fn allowlisted_records_are_dropped() {
        let dump = "goroutine 1 [running]:\n\
                    testing.(*T).Run(0xc000001a00)\n\tsrc/testing/testing.go:1\n\n\
                    goroutine 7 [chan receive]:\nmain.worker()\ncreated by testing.RunTests\n\n\
                    goroutine 9 [sleep]:\nruntime.goexit()\n";
        assert!(classify(dump, &builtin()).is_empty());
    }

    #[test]
    fn user_task_survives_next_to_test_runner() {
        let dump = "goroutine 5 [chan receive]:\ntesting.tRunner()\ncreated by testing.RunTests\n\n\
                    goroutine 12 [select]:\nexample.com/app.(*conn).serve(0xc0001)\n\
                    created by example.com/app.Listen\n";
        let stacks = classify(dump, &builtin());
        assert_eq!(
            stacks,
            vec![StackTrace::new(
                "example.com/app.(*conn).serve(0xc0001)\ncreated by example.com/app.Listen"
            )]
        );
    }

    #[test]
    fn survivors_are_sorted() {
        let dump = "task 3 [z]:\nzeta::run\n\ntask 1 [a]:\nalpha::run\n\ntask 2 [m]:\nmu::run\n";
        let stacks: Vec<String> = classify(dump, &builtin())
            .into_iter()
            .map(StackTrace::into_string)
            .collect();
        assert_eq!(stacks, ["alpha::run", "mu::run", "zeta::run"]);
    }

    #[test]
    fn headers_without_bodies_are_skipped() {
        let dump = "task 1 [lonely]:\n\ntask 2 [blank]:\n   \n\njust-a-header";
        assert!(classify(dump, &builtin()).is_empty());
    }

    #[test]
    fn matching_is_case_sensitive() {
        let dump = "task 1 [a]:\nRUNTIME.GOEXIT()\n";
        assert_eq!(classify(dump, &builtin()).len(), 1);
    }

    #[test]
    fn normalize_replaces_pointer_arguments() {
        let stack = "net/http.(*persistConn).writeLoop(0xc000122000)\nmain.f(0x1, 0x2)";
        assert_eq!(
            normalize(stack),
            "net/http.(*persistConn).writeLoop(...)\nmain.f(...)"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        let stack = "app.(*Pool).run(0xc0000a2b40, 0x0)\napp.tick()";
        let once = normalize(stack);
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn traces_differing_only_in_addresses_normalize_equal() {
        let a = StackTrace::new("app.(*Conn).readLoop(0xc000010000)");
        let b = StackTrace::new("app.(*Conn).readLoop(0xc0000ff000)");
        assert_ne!(a, b);
        assert_eq!(a.normalized(), b.normalized());
    }
}
