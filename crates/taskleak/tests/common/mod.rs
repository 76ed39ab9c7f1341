#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, Once};
use std::time::Duration;

use taskleak::{Detector, DetectorConfig};

static INIT_LOGGING: Once = Once::new();
static REGISTRY_LOCK: Mutex<()> = Mutex::new(());

pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "taskleak=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Serializes tests that spawn into the process-wide registry.
pub fn lock_registry() -> MutexGuard<'static, ()> {
    REGISTRY_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A registry detector with short windows so failing checks stay quick.
pub fn quick_detector() -> Detector {
    Detector::new().with_config(
        DetectorConfig::default()
            .with_pre_test_timeout(Duration::from_millis(10))
            .with_post_test_timeout(Duration::from_millis(200))
            .with_suite_settle_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(10)),
    )
}

pub fn current_thread_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime should build")
}
