//! Detector settings and their environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::snapshot::DEFAULT_BUFFER_BYTES;

const PRE_TEST_ENV: &str = "TASKLEAK_PRE_TEST_MS";
const POST_TEST_ENV: &str = "TASKLEAK_POST_TEST_MS";
const SUITE_SETTLE_ENV: &str = "TASKLEAK_SUITE_SETTLE_MS";
const POLL_ENV: &str = "TASKLEAK_POLL_MS";
const BUFFER_ENV: &str = "TASKLEAK_BUFFER_BYTES";
const SPAWN_BACKTRACES_ENV: &str = "TASKLEAK_SPAWN_BACKTRACES";
const TABLES_ENV: &str = "TASKLEAK_TABLES";

/// Timeouts and sizes used by a [`Detector`](crate::Detector).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    /// How long to wait for leftovers from earlier tests before skipping.
    pub pre_test_timeout: Duration,
    /// How long a finished test gets to wind down its tasks.
    pub post_test_timeout: Duration,
    /// Grace period before the end-of-suite report.
    pub suite_settle_timeout: Duration,
    /// Sleep between polls.
    pub poll_interval: Duration,
    /// Size of the dump buffer.
    pub buffer_bytes: usize,
    /// Turn spawn-site backtrace capture on or off. `None` leaves the
    /// process-wide setting as it is.
    pub capture_spawn_backtraces: Option<bool>,
    /// Extra tables merged into the builtins.
    pub tables_path: Option<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            pre_test_timeout: Duration::from_millis(10),
            post_test_timeout: Duration::from_secs(1),
            suite_settle_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            capture_spawn_backtraces: None,
            tables_path: None,
        }
    }
}

impl DetectorConfig {
    /// Defaults, overridden by `TASKLEAK_*` environment variables.
    ///
    /// Invalid values are reported and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            pre_test_timeout: millis(&lookup, PRE_TEST_ENV, defaults.pre_test_timeout),
            post_test_timeout: millis(&lookup, POST_TEST_ENV, defaults.post_test_timeout),
            suite_settle_timeout: millis(
                &lookup,
                SUITE_SETTLE_ENV,
                defaults.suite_settle_timeout,
            ),
            poll_interval: millis(&lookup, POLL_ENV, defaults.poll_interval),
            buffer_bytes: buffer_bytes(&lookup, defaults.buffer_bytes),
            capture_spawn_backtraces: lookup(SPAWN_BACKTRACES_ENV).map(|v| truthy(&v)),
            tables_path: lookup(TABLES_ENV)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn with_pre_test_timeout(mut self, timeout: Duration) -> Self {
        self.pre_test_timeout = timeout;
        self
    }

    pub fn with_post_test_timeout(mut self, timeout: Duration) -> Self {
        self.post_test_timeout = timeout;
        self
    }

    pub fn with_suite_settle_timeout(mut self, timeout: Duration) -> Self {
        self.suite_settle_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_buffer_bytes(mut self, buffer_bytes: usize) -> Self {
        self.buffer_bytes = buffer_bytes;
        self
    }

    pub fn with_spawn_backtraces(mut self, enabled: bool) -> Self {
        self.capture_spawn_backtraces = Some(enabled);
        self
    }

    pub fn with_tables_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tables_path = Some(path.into());
        self
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(ms) => Duration::from_millis(ms),
        Err(_) => {
            warn!(
                key,
                value = %raw,
                default_ms = default.as_millis() as u64,
                "invalid duration, using default"
            );
            default
        }
    }
}

fn buffer_bytes(lookup: &impl Fn(&str) -> Option<String>, default: usize) -> usize {
    let Some(raw) = lookup(BUFFER_ENV) else {
        return default;
    };
    match raw.trim().parse::<usize>() {
        Ok(v) if v > 0 => v,
        _ => {
            warn!(key = BUFFER_ENV, value = %raw, default, "invalid buffer size, using default");
            default
        }
    }
}

fn truthy(value: &str) -> bool {
    let v = value.trim().to_ascii_lowercase();
    !(v.is_empty() || v == "0" || v == "false" || v == "off")
}
