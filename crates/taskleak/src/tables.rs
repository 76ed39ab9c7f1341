//! The allowlist of known-benign background tasks and the badness table used
//! to name likely leak causes.
//!
//! Both are plain substring tables. New benign background tasks found in
//! practice get appended to [`BUILTIN_ALLOWED`]; nothing here is derived.

use std::error::Error;
use std::fmt;
use std::path::Path;

use facet::Facet;

/// Substrings marking a stack as uninteresting. Matched case-sensitively
/// anywhere in the stack body.
pub const BUILTIN_ALLOWED: &[&str] = &[
    // Synchronization teardown.
    "sync.(*WaitGroup).Done",
    // Process and file handle cleanup.
    "os.(*file).close",
    "os.(*Process).Release",
    "net.(*netFD).Close(",
    "tokio::process::imp::orphan",
    // Signal handling.
    "created by os/signal.init",
    "tokio::signal::unix",
    "tokio::signal::windows",
    // Test runner scaffolding.
    "created by testing.RunTests",
    "created by testing.runTests",
    "created by testing.(*T).Run",
    "testing.Main(",
    "testing.(*T).Run",
    // Panic and unwinding.
    "runtime/panic.go",
    "runtime.goexit",
    // Runtime background workers.
    "created by runtime.gc",
    "runtime.MHeap_Scavenger",
    "tokio::runtime::blocking::pool",
    // Logging flush loops.
    "logutil.(*MergeLogger).outputLoop",
    "github.com/golang/glog.(*loggingT).flushDaemon",
    "tracing_appender::non_blocking",
    // Template lexers.
    "created by text/template/parse.lex",
    // Crypto finalizers and cache eviction.
    "crypto/internal/boring.(*PublicKeyRSA).finalize",
    "crypto/tls.(*certCache).evict",
];

/// Substrings whose presence in a leaked stack names the likely culprit.
/// When several match, the last one in this order wins.
pub const BUILTIN_BADNESS: &[(&str, &str)] = &[
    (").writeLoop(", "a Transport"),
    (
        "created by net/http/httptest.(*Server).Start",
        "an httptest.Server",
    ),
    ("timeoutHandler", "a TimeoutHandler"),
    ("net.(*netFD).connect(", "a timing out dial"),
    (").noteClientGone(", "a closenotifier sender"),
    (").readLoop(", "a Transport"),
    (".grpc", "a gRPC resource"),
    (").sendCloseSubstream(", "a stream closing routine"),
    ("hyper::proto::h1::dispatcher", "an HTTP/1 connection"),
    ("h2::proto::connection", "an HTTP/2 connection"),
    ("hyper_util::client::legacy::pool", "a Transport"),
    ("tokio::net::tcp::stream::TcpStream::connect", "a timing out dial"),
    ("tonic::transport", "a gRPC resource"),
    ("axum::serve", "a test HTTP server"),
];

/// A badness table entry.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Badness {
    /// Substring to look for in the joined leaked stacks.
    pub pattern: String,
    /// What to call the leak, e.g. "a Transport".
    pub label: String,
}

/// The allowlist and badness table used by one detector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct Tables {
    #[facet(default)]
    pub allowed: Vec<String>,
    #[facet(default)]
    pub badness: Vec<Badness>,
}

impl Tables {
    /// The compiled-in tables.
    pub fn builtin() -> Self {
        Self {
            allowed: BUILTIN_ALLOWED.iter().map(|s| s.to_string()).collect(),
            badness: BUILTIN_BADNESS
                .iter()
                .map(|(pattern, label)| Badness {
                    pattern: pattern.to_string(),
                    label: label.to_string(),
                })
                .collect(),
        }
    }

    /// Append one allowlist pattern.
    pub fn with_allowed(mut self, pattern: impl Into<String>) -> Self {
        self.allowed.push(pattern.into());
        self
    }

    /// Append one badness entry. It takes precedence over earlier entries.
    pub fn with_badness(mut self, pattern: impl Into<String>, label: impl Into<String>) -> Self {
        self.badness.push(Badness {
            pattern: pattern.into(),
            label: label.into(),
        });
        self
    }

    /// Append everything in `other` after our own entries.
    pub fn merge(mut self, other: Tables) -> Self {
        self.allowed.extend(other.allowed);
        self.badness.extend(other.badness);
        self
    }

    pub fn is_uninteresting(&self, stack: &str) -> bool {
        self.allowed.iter().any(|pattern| stack.contains(pattern.as_str()))
    }

    /// The label of the last badness entry found in `stacks`.
    pub fn diagnose(&self, stacks: &str) -> Option<&str> {
        self.badness
            .iter()
            .rev()
            .find(|entry| stacks.contains(entry.pattern.as_str()))
            .map(|entry| entry.label.as_str())
    }

    pub fn from_json(json: &str) -> Result<Self, TablesError> {
        facet_json::from_str(json).map_err(|e| TablesError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, TablesError> {
        facet_json::to_string(self).map_err(|e| TablesError::Serialize(e.to_string()))
    }

    /// Load tables from a JSON file.
    pub fn load(path: &Path) -> Result<Self, TablesError> {
        let json = std::fs::read_to_string(path).map_err(|source| TablesError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }
}

#[derive(Debug)]
pub enum TablesError {
    Read {
        path: String,
        source: std::io::Error,
    },
    Parse(String),
    Serialize(String),
}

impl fmt::Display for TablesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "failed to read tables from {path}: {source}"),
            Self::Parse(msg) => write!(f, "invalid tables JSON: {msg}"),
            Self::Serialize(msg) => write!(f, "failed to serialize tables: {msg}"),
        }
    }
}

impl Error for TablesError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse(_) | Self::Serialize(_) => None,
        }
    }
}
