//! Core cache types and structures

use crate::config::CacheSettings;
use crate::drivers::{Capabilities, Driver};
use crate::errors::{CacheError, Result};
use crate::events::{EventEmitter, EventEnvelope};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;

/// Pluggable cache facade
///
/// Cloning is cheap; every clone shares the same bound driver, events and
/// auto-clean timer.
#[derive(Clone)]
pub struct Cache {
    pub(crate) inner: Arc<CacheInner>,
}

/// The driver selected by `init()`
pub struct ActiveModule {
    pub id: String,
    pub driver: Arc<dyn Driver>,
    /// Computed once when the driver is bound
    pub capabilities: Capabilities,
}

impl std::fmt::Debug for ActiveModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveModule")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities.names())
            .finish()
    }
}

/// Lifecycle of a cache instance
#[derive(Debug, Clone)]
pub enum Lifecycle {
    Uninitialized,
    Probing,
    Ready(Arc<ActiveModule>),
    Failed,
    Destroyed,
}

impl Lifecycle {
    pub fn name(&self) -> &'static str {
        match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Probing => "probing",
            Lifecycle::Ready(_) => "ready",
            Lifecycle::Failed => "failed",
            Lifecycle::Destroyed => "destroyed",
        }
    }
}

/// Memoized result of the one and only probe run
#[derive(Debug, Clone)]
pub(crate) enum InitOutcome {
    Ready,
    Failed { candidates: Vec<String> },
}

pub(crate) struct CacheInner {
    pub settings: CacheSettings,
    pub state: RwLock<Lifecycle>,
    pub init: OnceCell<InitOutcome>,
    pub events: EventEmitter,
    /// Writes currently travelling to the driver
    pub in_flight: AtomicUsize,
    /// Auto-clean timer task
    pub clean_handle: RwLock<Option<JoinHandle<()>>>,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Some(handle) = self.clean_handle.write().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("state", &self.inner.state.read().name())
            .field("modules", &self.inner.settings.modules)
            .field("in_flight", &self.inner.in_flight.load(Ordering::Acquire))
            .finish()
    }
}

/// Decrements the in-flight counter when dropped, even if the write future is cancelled
pub(crate) struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    pub fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Cache {
    /// Create a cache without probing any driver
    ///
    /// Call [`Cache::init`] before any other operation, or use
    /// [`Cache::open`] to honour `settings.init`.
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                settings,
                state: RwLock::new(Lifecycle::Uninitialized),
                init: OnceCell::new(),
                events: EventEmitter::default(),
                in_flight: AtomicUsize::new(0),
                clean_handle: RwLock::new(None),
            }),
        }
    }

    /// Create a cache and run `init()` if `settings.init` is set
    pub async fn open(settings: CacheSettings) -> Result<Self> {
        let run_init = settings.init;
        let cache = Self::new(settings);
        if run_init {
            cache.init().await?;
        }
        Ok(cache)
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.state.read(), Lifecycle::Ready(_))
    }

    /// Id of the bound driver, if any
    pub fn driver_id(&self) -> Option<String> {
        match &*self.inner.state.read() {
            Lifecycle::Ready(active) => Some(active.id.clone()),
            _ => None,
        }
    }

    /// Receive lifecycle events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.events.subscribe()
    }

    /// Number of writes that have not completed yet
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// The bound driver, or `NotReady` naming the attempted operation
    pub(crate) fn active(&self, operation: &'static str) -> Result<Arc<ActiveModule>> {
        match &*self.inner.state.read() {
            Lifecycle::Ready(active) => Ok(Arc::clone(active)),
            _ => Err(CacheError::not_ready(operation)),
        }
    }

    pub(crate) fn track_write(&self) -> InFlightGuard<'_> {
        InFlightGuard::new(&self.inner.in_flight)
    }
}
