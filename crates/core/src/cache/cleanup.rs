//! Auto-clean timer management

use std::sync::Arc;
use std::time::Duration;

use super::types::Cache;
use crate::events::CacheEvent;
use tracing::{debug, warn};

impl Cache {
    /// Enable (`Some`) or cancel (`None`) periodic cleaning
    ///
    /// The timer restarts after each pass completes, so passes never overlap.
    /// Enabling replaces any previous timer.
    pub fn auto_clean(&self, interval: Option<Duration>) {
        self.inner
            .events
            .publish(CacheEvent::AutoCleanScheduled { interval });
        self.stop_auto_clean();

        // Zero would spin, treat it as cancel
        let Some(interval) = interval.filter(|i| !i.is_zero()) else {
            debug!("auto-clean disabled");
            return;
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "cannot schedule auto-clean outside a tokio runtime");
                return;
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                // Stop once every handle to the cache is gone
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let cache = Cache { inner };

                cache.inner.events.publish(CacheEvent::AutoCleanStarted);
                let error = match cache.clean().await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(error = %e, "auto-clean pass failed");
                        Some(e.to_string())
                    }
                };
                cache
                    .inner
                    .events
                    .publish(CacheEvent::AutoCleanCompleted { error });
            }
        });

        debug!(?interval, "auto-clean scheduled");
        *self.inner.clean_handle.write() = Some(handle);
    }

    /// Whether an auto-clean timer is currently scheduled
    pub fn auto_clean_enabled(&self) -> bool {
        self.inner
            .clean_handle
            .read()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub(super) fn stop_auto_clean(&self) {
        if let Some(handle) = self.inner.clean_handle.write().take() {
            handle.abort();
        }
    }
}
