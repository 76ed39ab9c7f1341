//! Capturing a classified snapshot of the live task stacks.

use std::sync::Arc;

use tracing::warn;

use crate::classify::{StackTrace, classify};
use crate::tables::Tables;

/// Frame marking the dumping thread's own record. Records containing it are
/// never reported.
pub const SELF_FRAME: &str = "taskleak::snapshot::Snapshotter::capture";

/// Default dump buffer size. Dumps larger than this are truncated.
pub const DEFAULT_BUFFER_BYTES: usize = 2 << 20;

/// Source of the textual task dump.
///
/// `dump` writes as much of the dump as fits into `buf` and returns the number
/// of bytes written. A return value equal to `buf.len()` means the dump may
/// have been cut short.
pub trait StackDumper: Send + Sync {
    fn dump(&self, buf: &mut [u8]) -> usize;
}

/// Copy `text` into `buf`, truncating at the buffer's end.
pub fn copy_into(text: &str, buf: &mut [u8]) -> usize {
    let n = text.len().min(buf.len());
    buf[..n].copy_from_slice(&text.as_bytes()[..n]);
    n
}

impl StackDumper for str {
    fn dump(&self, buf: &mut [u8]) -> usize {
        copy_into(self, buf)
    }
}

impl StackDumper for String {
    fn dump(&self, buf: &mut [u8]) -> usize {
        copy_into(self, buf)
    }
}

impl<T: StackDumper + ?Sized> StackDumper for &T {
    fn dump(&self, buf: &mut [u8]) -> usize {
        (**self).dump(buf)
    }
}

impl<T: StackDumper + ?Sized> StackDumper for Arc<T> {
    fn dump(&self, buf: &mut [u8]) -> usize {
        (**self).dump(buf)
    }
}

/// A [`StackDumper`] backed by a closure producing the whole dump.
pub struct FnDumper<F>(F);

impl<F> StackDumper for FnDumper<F>
where
    F: Fn() -> String + Send + Sync,
{
    fn dump(&self, buf: &mut [u8]) -> usize {
        copy_into(&(self.0)(), buf)
    }
}

/// Wrap a closure as a [`StackDumper`].
pub fn dump_fn<F>(f: F) -> FnDumper<F>
where
    F: Fn() -> String + Send + Sync,
{
    FnDumper(f)
}

/// Interesting stacks observed at one instant, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    stacks: Vec<StackTrace>,
    truncated: bool,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn stacks(&self) -> &[StackTrace] {
        &self.stacks
    }

    /// Whether the dump filled the whole buffer and may be missing records.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// All stacks joined by blank lines, as they appear in failure messages.
    pub fn joined(&self) -> String {
        self.stacks
            .iter()
            .map(StackTrace::as_str)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Takes dumps from a [`StackDumper`] and classifies them.
#[derive(Clone)]
pub struct Snapshotter {
    dumper: Arc<dyn StackDumper>,
    tables: Arc<Tables>,
    buffer_bytes: usize,
}

impl Snapshotter {
    pub fn new(dumper: Arc<dyn StackDumper>, tables: Arc<Tables>) -> Self {
        Self {
            dumper,
            tables,
            buffer_bytes: DEFAULT_BUFFER_BYTES,
        }
    }

    pub fn with_buffer_bytes(mut self, buffer_bytes: usize) -> Self {
        self.buffer_bytes = buffer_bytes;
        self
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn dumper(&self) -> Arc<dyn StackDumper> {
        Arc::clone(&self.dumper)
    }

    /// Dump every live task and keep the interesting ones.
    pub fn capture(&self) -> Snapshot {
        let mut buf = vec![0u8; self.buffer_bytes];
        let n = self.dumper.dump(&mut buf).min(buf.len());
        let truncated = n == buf.len();
        if truncated {
            warn!(
                buffer_bytes = self.buffer_bytes,
                "task dump filled the whole buffer, snapshot may be missing tasks"
            );
        }

        let raw = String::from_utf8_lossy(&buf[..n]);
        Snapshot {
            stacks: classify(&raw, &self.tables),
            truncated,
        }
    }
}

impl std::fmt::Debug for Snapshotter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshotter")
            .field("buffer_bytes", &self.buffer_bytes)
            .finish_non_exhaustive()
    }
}
