//! One-time, thread-safe initialization of the indexing backend.
//!
//! [`SubsystemLoader::ensure_loaded`] checks an atomic flag without
//! locking; on a miss it takes the init lock and checks again before
//! running the initializer, so concurrent first callers run it once.
//! A failed initialization, including one that panics, is returned to its
//! caller as `DependencyLoadFailure` and leaves the loader empty; the next
//! call retries.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::error::{panic_message, BridgeError, Result};

type Init<T> = Box<dyn Fn() -> anyhow::Result<T> + Send + Sync>;

pub struct SubsystemLoader<T> {
    ready: AtomicBool,
    lock: Mutex<()>,
    value: OnceLock<T>,
    init: Init<T>,
    attempts: AtomicUsize,
}

impl<T: Send + Sync> SubsystemLoader<T> {
    pub fn new(init: impl Fn() -> anyhow::Result<T> + Send + Sync + 'static) -> Self {
        Self {
            ready: AtomicBool::new(false),
            lock: Mutex::new(()),
            value: OnceLock::new(),
            init: Box::new(init),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// How many times the initializer has run, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The loaded value, initializing it on first use.
    pub fn ensure_loaded(&self) -> Result<&T> {
        if self.ready.load(Ordering::Acquire) {
            if let Some(value) = self.value.get() {
                return Ok(value);
            }
        }

        // The lock guards no data, so a poisoned lock is still usable.
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Loading indexing subsystem");
        let started = std::time::Instant::now();
        let loaded = catch_unwind(AssertUnwindSafe(|| (self.init)()))
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "initializer panicked: {}",
                    panic_message(panic.as_ref())
                ))
            })
            .map_err(|e| {
                tracing::error!("Indexing subsystem failed to load: {:#}", e);
                BridgeError::DependencyLoad(e)
            })?;

        let value = self.value.get_or_init(|| loaded);
        self.ready.store(true, Ordering::Release);
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Indexing subsystem ready"
        );
        Ok(value)
    }
}
