//! Registry of live tracked tasks and threads.
//!
//! Tasks spawned through [`spawn`] / [`spawn_blocking`], futures wrapped with
//! [`track`], and threads started with [`spawn_thread`] are registered for as
//! long as they are alive. An entry is removed when its future completes or is
//! dropped (abort, runtime shutdown) and when its thread closure returns.
//!
//! [`Registry`] renders the live entries as a text dump, one record per entry,
//! which the [`Snapshotter`](crate::Snapshotter) classifies.

use std::any::type_name;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::future::Future;
use std::io;
use std::panic::Location;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::thread;
use std::time::Instant;

use backtrace::Backtrace;
use parking_lot::Mutex;

use crate::snapshot::{SELF_FRAME, StackDumper, copy_into};

/// Global entry ID counter. ID 0 is reserved for the dumping thread.
static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Whether new entries capture a backtrace of their spawn site.
static CAPTURE_SPAWN_BACKTRACES: AtomicBool = AtomicBool::new(false);

/// Global registry of live entries, in spawn order.
static REGISTRY: Mutex<Vec<Arc<Entry>>> = parking_lot::const_mutex(Vec::new());

/// Upper bound on spawn-site frames rendered per record.
const MAX_SPAWN_FRAMES: usize = 16;

thread_local! {
    /// The tracked task currently being polled on this thread, if any.
    static CURRENT_TASK: RefCell<Option<Arc<Entry>>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Task,
    Blocking,
    Thread,
}

struct Entry {
    id: u64,
    kind: EntryKind,
    name: String,
    type_name: &'static str,
    location: &'static Location<'static>,
    /// "task 3 [accept-loop]" or "thread 'main'".
    parent: String,
    spawned_at: Instant,
    /// Unresolved until the first dump that renders it.
    spawn_backtrace: Option<Mutex<Backtrace>>,
    polls: AtomicU64,
    polling: AtomicBool,
}

impl Entry {
    fn render(&self, out: &mut String, now: Instant) {
        let age = now.saturating_duration_since(self.spawned_at).as_secs_f64();
        let _ = match self.kind {
            EntryKind::Task => {
                let state = if self.polling.load(Ordering::Acquire) {
                    "running"
                } else {
                    "idle"
                };
                writeln!(
                    out,
                    "task {} [{}] ({state}, {} polls, {age:.3}s):",
                    self.id,
                    self.name,
                    self.polls.load(Ordering::Relaxed),
                )
            }
            EntryKind::Blocking => {
                writeln!(out, "task {} [{}] (blocking, {age:.3}s):", self.id, self.name)
            }
            EntryKind::Thread => {
                writeln!(out, "thread {} [{}] (running, {age:.3}s):", self.id, self.name)
            }
        };
        let _ = writeln!(out, "{}", self.type_name);
        let _ = writeln!(
            out,
            "\tat {}:{}:{}",
            self.location.file(),
            self.location.line(),
            self.location.column()
        );
        if let Some(backtrace) = &self.spawn_backtrace {
            let mut backtrace = backtrace.lock();
            backtrace.resolve();
            for frame in spawn_frames(&backtrace) {
                let _ = writeln!(out, "{frame}");
            }
        }
        let _ = writeln!(out, "created by {}", self.parent);
        out.push('\n');
    }
}

/// Frames of a spawn backtrace worth showing: runtime, std and our own
/// machinery are dropped so only application frames remain.
fn spawn_frames(backtrace: &Backtrace) -> Vec<String> {
    let noise = [
        "backtrace::",
        "taskleak::registry",
        "std::",
        "core::",
        "alloc::",
        "tokio::runtime",
        "tokio::task",
        "test::",
        "__rust",
        "<unknown>",
    ];

    let mut frames = Vec::new();
    for frame in backtrace.frames() {
        for symbol in frame.symbols() {
            let Some(name) = symbol.name() else {
                continue;
            };
            let name = name.to_string();
            if noise.iter().any(|n| name.contains(n)) {
                continue;
            }
            let mut rendered = name;
            if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                let _ = write!(rendered, "\n\t{}:{line}", file.display());
            }
            frames.push(rendered);
            if frames.len() >= MAX_SPAWN_FRAMES {
                return frames;
            }
        }
    }
    frames
}

/// Replaces newlines so a name can never contain the record delimiter.
fn sanitize(name: String) -> String {
    if name.contains(['\n', '\r']) {
        name.replace(['\n', '\r'], " ")
    } else {
        name
    }
}

fn describe_parent() -> String {
    CURRENT_TASK.with(|current| match current.borrow().as_ref() {
        Some(entry) => format!("task {} [{}]", entry.id, entry.name),
        None => {
            let thread = thread::current();
            format!("thread '{}'", thread.name().unwrap_or("<unnamed>"))
        }
    })
}

fn register(
    kind: EntryKind,
    name: String,
    type_name: &'static str,
    location: &'static Location<'static>,
) -> Registration {
    let spawn_backtrace = CAPTURE_SPAWN_BACKTRACES
        .load(Ordering::Relaxed)
        .then(|| Mutex::new(Backtrace::new_unresolved()));

    let entry = Arc::new(Entry {
        id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
        kind,
        name: sanitize(name),
        type_name,
        location,
        parent: describe_parent(),
        spawned_at: Instant::now(),
        spawn_backtrace,
        polls: AtomicU64::new(0),
        polling: AtomicBool::new(false),
    });

    REGISTRY.lock().push(Arc::clone(&entry));
    Registration { entry }
}

/// Keeps an entry registered until dropped or released.
struct Registration {
    entry: Arc<Entry>,
}

impl Registration {
    fn release(&self) {
        let id = self.entry.id;
        REGISTRY.lock().retain(|e| e.id != id);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

/// Restores the previously-current task when a poll returns or unwinds.
struct CurrentTaskGuard {
    previous: Option<Arc<Entry>>,
}

impl CurrentTaskGuard {
    fn enter(entry: &Arc<Entry>) -> Self {
        let previous = CURRENT_TASK.with(|current| current.replace(Some(Arc::clone(entry))));
        Self { previous }
    }
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TASK.with(|current| *current.borrow_mut() = previous);
    }
}

/// A future registered in the task registry while it is alive.
///
/// Created by [`track`]. The entry is removed once the future resolves or is
/// dropped, whichever happens first.
pub struct Tracked<F> {
    inner: F,
    registration: Registration,
}

impl<F: Future> Future for Tracked<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `inner` is never moved out of `Tracked`, and nothing in
        // `Tracked`'s drop glue touches it beyond dropping it in place.
        let this = unsafe { self.get_unchecked_mut() };
        let inner = unsafe { Pin::new_unchecked(&mut this.inner) };

        let entry = &this.registration.entry;
        entry.polls.fetch_add(1, Ordering::Relaxed);
        entry.polling.store(true, Ordering::Release);

        let result = {
            let _current = CurrentTaskGuard::enter(entry);
            inner.poll(cx)
        };

        entry.polling.store(false, Ordering::Release);
        if result.is_ready() {
            this.registration.release();
        }
        result
    }
}

/// Wrap `future` so it shows up in the registry until it completes or is
/// dropped. Use this with spawners other than [`spawn`], e.g. a `JoinSet`.
#[track_caller]
pub fn track<F: Future>(name: impl Into<String>, future: F) -> Tracked<F> {
    let registration = register(
        EntryKind::Task,
        name.into(),
        type_name::<F>(),
        Location::caller(),
    );
    Tracked {
        inner: future,
        registration,
    }
}

/// Spawn a tracked task on the current tokio runtime.
///
/// Panics outside a runtime, like [`tokio::spawn`].
#[track_caller]
pub fn spawn<F>(name: impl Into<String>, future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(track(name, future))
}

/// Run a tracked closure on tokio's blocking pool.
#[track_caller]
pub fn spawn_blocking<F, R>(name: impl Into<String>, f: F) -> tokio::task::JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let registration = register(
        EntryKind::Blocking,
        name.into(),
        type_name::<F>(),
        Location::caller(),
    );
    tokio::task::spawn_blocking(move || {
        let _registration = registration;
        f()
    })
}

/// Spawn a named OS thread that stays registered until `f` returns.
#[track_caller]
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let registration = register(
        EntryKind::Thread,
        name.into(),
        type_name::<F>(),
        Location::caller(),
    );
    let thread_name = registration.entry.name.clone();
    thread::Builder::new().name(thread_name).spawn(move || {
        let _registration = registration;
        f()
    })
}

/// Turn spawn-site backtrace capture on or off for entries registered from
/// now on. Off by default; capturing costs a stack walk per spawn.
pub fn capture_spawn_backtraces(enabled: bool) {
    CAPTURE_SPAWN_BACKTRACES.store(enabled, Ordering::Relaxed);
}

/// Whether entries registered now capture a spawn backtrace.
pub fn spawn_backtraces_enabled() -> bool {
    CAPTURE_SPAWN_BACKTRACES.load(Ordering::Relaxed)
}

/// Number of live registered tasks and threads.
pub fn live_count() -> usize {
    REGISTRY.lock().len()
}

/// Render the dump of all live entries, preceded by the calling thread's own
/// record.
pub fn render_dump() -> String {
    // Clone the entries so rendering (and backtrace resolution) happens
    // without holding the registry lock.
    let entries: Vec<Arc<Entry>> = REGISTRY.lock().clone();
    let now = Instant::now();

    let current = thread::current();
    let current_name = current.name().unwrap_or("<unnamed>");
    let mut out = String::with_capacity(256 * (entries.len() + 1));
    let _ = writeln!(out, "thread 0 [{current_name}] (running):");
    let _ = writeln!(out, "{SELF_FRAME}");
    let _ = writeln!(out, "created by thread '{current_name}'");
    out.push('\n');

    for entry in &entries {
        entry.render(&mut out, now);
    }
    out
}

/// The process-wide registry as a [`StackDumper`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Registry;

impl StackDumper for Registry {
    fn dump(&self, buf: &mut [u8]) -> usize {
        copy_into(&render_dump(), buf)
    }
}
