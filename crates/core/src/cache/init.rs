//! Driver negotiation

use super::types::{ActiveModule, Cache, InitOutcome, Lifecycle};
use crate::drivers::{Capabilities, Driver};
use crate::errors::{CacheError, Result};
use crate::events::CacheEvent;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Cache {
    /// Probe the configured drivers and bind the first loadable one
    ///
    /// Runs at most once per cache. Concurrent callers await the same probe
    /// and later callers receive the memoized outcome, success or failure.
    /// A destroyed cache stays destroyed: `init()` then fails with
    /// [`CacheError::Destroyed`].
    pub async fn init(&self) -> Result<()> {
        if matches!(*self.inner.state.read(), Lifecycle::Destroyed) {
            return Err(CacheError::Destroyed);
        }
        let outcome = self.inner.init.get_or_init(|| self.probe()).await;
        match outcome {
            InitOutcome::Ready => Ok(()),
            InitOutcome::Failed { candidates } => Err(CacheError::NoDriverAvailable {
                candidates: candidates.clone(),
            }),
        }
    }

    async fn probe(&self) -> InitOutcome {
        *self.inner.state.write() = Lifecycle::Probing;
        let candidates = self.inner.settings.modules.clone();
        debug!(?candidates, "probing cache drivers");

        for name in &candidates {
            let driver = match self.load_driver(name).await {
                Ok(driver) => driver,
                Err(reason) => {
                    warn!(driver = %name, %reason, "cache driver rejected");
                    self.inner.events.publish(CacheEvent::DriverRejected {
                        driver: name.clone(),
                        reason,
                    });
                    continue;
                }
            };

            let active = Arc::new(ActiveModule {
                id: name.clone(),
                capabilities: Capabilities::of(driver.as_ref()),
                driver,
            });
            info!(
                driver = %name,
                capabilities = ?active.capabilities.names(),
                "cache driver loaded"
            );
            *self.inner.state.write() = Lifecycle::Ready(active);
            self.inner.events.publish(CacheEvent::DriverLoaded {
                driver: name.clone(),
            });

            self.after_init().await;
            return InitOutcome::Ready;
        }

        warn!(?candidates, "no cache driver available");
        *self.inner.state.write() = Lifecycle::Failed;
        self.inner.events.publish(CacheEvent::NoDriversAvailable {
            candidates: candidates.clone(),
        });
        InitOutcome::Failed { candidates }
    }

    /// Instantiate and probe one candidate, isolating every fault it can raise
    async fn load_driver(&self, name: &str) -> std::result::Result<Arc<dyn Driver>, String> {
        let settings = &self.inner.settings;
        let created = std::panic::catch_unwind(AssertUnwindSafe(|| {
            settings.registry.create(name, settings)
        }));
        let driver = match created {
            Ok(Ok(driver)) => driver,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err("driver factory panicked".to_string()),
        };

        match AssertUnwindSafe(driver.can_load()).catch_unwind().await {
            Ok(Ok(true)) => Ok(driver),
            Ok(Ok(false)) => Err("driver reported itself unavailable".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("driver panicked while probing".to_string()),
        }
    }

    /// Best-effort hooks; failures are logged and never un-ready the cache
    async fn after_init(&self) {
        let settings = &self.inner.settings;
        if settings.clean_init {
            if let Err(e) = self.clean().await {
                warn!(error = %e, "clean on init failed");
            }
        }
        if settings.clean_auto {
            self.auto_clean(Some(settings.clean_auto_interval));
        }
    }
}
