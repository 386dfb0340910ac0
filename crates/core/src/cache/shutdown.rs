//! Graceful shutdown

use super::types::{Cache, Lifecycle};
use crate::errors::{CacheError, Result};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DRAIN_INITIAL_DELAY: Duration = Duration::from_millis(100);

impl Cache {
    /// Release the bound driver and wait for outstanding writes
    ///
    /// Stops auto-clean, calls the driver's `destroy` if it has one, then polls
    /// the in-flight write counter with a doubling delay until it reaches
    /// zero or `destroy_timeout` elapses. Every later operation fails with
    /// `NotReady`. Destroying a cache with no bound driver does nothing.
    pub async fn destroy(&self) -> Result<()> {
        self.stop_auto_clean();

        let active = {
            let mut state = self.inner.state.write();
            match std::mem::replace(&mut *state, Lifecycle::Destroyed) {
                Lifecycle::Ready(active) => active,
                previous => {
                    *state = previous;
                    debug!("destroy called without a bound driver");
                    return Ok(());
                }
            }
        };

        let released = match active.driver.as_destroyable() {
            Some(destroyable) => destroyable.destroy().await,
            None => Ok(()),
        };
        if let Err(e) = &released {
            warn!(driver = %active.id, error = %e, "driver destroy failed");
        }

        self.drain_in_flight().await?;
        info!(driver = %active.id, "cache destroyed");
        released
    }

    async fn drain_in_flight(&self) -> Result<()> {
        let limit = self.inner.settings.destroy_timeout;
        let started = Instant::now();
        let mut delay = DRAIN_INITIAL_DELAY;
        let mut attempt = 0u32;

        loop {
            let pending = self.in_flight();
            if pending == 0 {
                return Ok(());
            }

            let mut wait = delay;
            if let Some(limit) = limit {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    warn!(pending, ?limit, "in-flight writes did not drain");
                    return Err(CacheError::timeout("destroy", limit));
                }
                wait = wait.min(limit - elapsed);
            }

            attempt += 1;
            debug!(attempt, pending, ?wait, "waiting for in-flight writes");
            tokio::time::sleep(wait).await;
            delay = delay.saturating_mul(2);
        }
    }
}
