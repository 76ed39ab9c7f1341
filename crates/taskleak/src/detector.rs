//! The [`Detector`]: snapshotter, tables, idle pool, clock and settings in one
//! cloneable handle.

use std::sync::Arc;

use tracing::warn;

use crate::check::{Clock, IdlePool, NoPool, SystemClock};
use crate::config::DetectorConfig;
use crate::registry::{self, Registry};
use crate::snapshot::{Snapshot, Snapshotter, StackDumper};
use crate::tables::Tables;

/// Leak detector. Cheap to clone; clones share their collaborators.
#[derive(Clone)]
pub struct Detector {
    pub(crate) snapshotter: Snapshotter,
    pub(crate) pool: Arc<dyn IdlePool>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: DetectorConfig,
}

impl Detector {
    /// A detector over the process-wide [`Registry`] with builtin tables and
    /// default settings.
    pub fn new() -> Self {
        Self::with_dumper(Registry)
    }

    /// A detector over an arbitrary dump source.
    pub fn with_dumper(dumper: impl StackDumper + 'static) -> Self {
        let config = DetectorConfig::default();
        Self {
            snapshotter: Snapshotter::new(Arc::new(dumper), Arc::new(Tables::builtin()))
                .with_buffer_bytes(config.buffer_bytes),
            pool: Arc::new(NoPool),
            clock: Arc::new(SystemClock::new()),
            config,
        }
    }

    /// A registry detector configured from `TASKLEAK_*` variables.
    ///
    /// Also applies the spawn-backtrace setting to the registry and merges the
    /// tables file, if one is named. A tables file that fails to load is
    /// reported and skipped.
    pub fn from_env() -> Self {
        Self::from_config(DetectorConfig::from_env())
    }

    /// A registry detector using `config`, with the same side effects as
    /// [`from_env`](Self::from_env). The spawn-backtrace setting is only
    /// changed when `config` sets it.
    pub fn from_config(config: DetectorConfig) -> Self {
        if let Some(enabled) = config.capture_spawn_backtraces {
            registry::capture_spawn_backtraces(enabled);
        }

        let mut tables = Tables::builtin();
        if let Some(path) = &config.tables_path {
            match Tables::load(path) {
                Ok(extra) => tables = tables.merge(extra),
                Err(err) => warn!(path = %path.display(), %err, "ignoring leak tables file"),
            }
        }

        Self::new().with_tables(tables).with_config(config)
    }

    pub fn with_config(mut self, config: DetectorConfig) -> Self {
        self.snapshotter = self.snapshotter.with_buffer_bytes(config.buffer_bytes);
        self.config = config;
        self
    }

    pub fn with_tables(mut self, tables: Tables) -> Self {
        self.snapshotter = Snapshotter::new(self.snapshotter.dumper(), Arc::new(tables))
            .with_buffer_bytes(self.config.buffer_bytes);
        self
    }

    /// Use `pool` to drop idle pooled connections before each check.
    pub fn with_pool(mut self, pool: impl IdlePool + 'static) -> Self {
        self.pool = Arc::new(pool);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn tables(&self) -> &Tables {
        self.snapshotter.tables()
    }

    /// One classified snapshot, no retries.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshotter.capture()
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector")
            .field("snapshotter", &self.snapshotter)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
