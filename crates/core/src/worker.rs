//! Get-or-compute memoization with a retry policy

use crate::cache::Cache;
use crate::errors::{CacheError, Result};
use crate::expiry::Expiry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Default delay between producer retries
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Delay between producer attempts
#[derive(Clone)]
pub enum RetryDelay {
    Fixed(Duration),
    /// Computed from the 1-based number of the attempt that just failed
    PerAttempt(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RetryDelay {
    fn after(&self, attempt: u32) -> Duration {
        match self {
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::PerAttempt(delay) => delay(attempt),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Fixed(DEFAULT_RETRY_DELAY)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            RetryDelay::PerAttempt(_) => f.write_str("PerAttempt(..)"),
        }
    }
}

/// What to do after a failed producer attempt
#[derive(Debug)]
pub enum RetryDecision<T> {
    /// Keep retrying while attempts remain
    Continue,
    /// Stop and return this value without caching it
    Resolve(T),
    /// Stop and fail with this error
    Abort(anyhow::Error),
}

type OnCached<T> = Arc<dyn Fn(&T) -> Option<T> + Send + Sync>;
type OnRetry<T> = Arc<dyn Fn(&anyhow::Error, u32) -> RetryDecision<T> + Send + Sync>;

/// Options for [`Cache::worker`]
#[derive(Clone)]
pub struct WorkerOptions<T> {
    /// Cache key holding the memoized result
    pub id: String,
    /// When false the producer runs every time and nothing is cached
    pub enabled: bool,
    pub expiry: Expiry,
    /// Cached and returned in place of a producer failure
    pub reject_as: Option<T>,
    /// Extra producer attempts after the first failure
    pub retry: u32,
    pub retry_delay: RetryDelay,
    /// Transform a cache hit; `None` keeps the cached value
    pub on_cached: Option<OnCached<T>>,
    /// Observer for each retryable failure; defaults to logging a warning
    pub on_retry: Option<OnRetry<T>>,
}

impl<T> WorkerOptions<T> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            expiry: Expiry::Relative("1h".to_string()),
            reject_as: None,
            retry: 0,
            retry_delay: RetryDelay::default(),
            on_cached: None,
            on_retry: None,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_expiry(mut self, expiry: impl Into<Expiry>) -> Self {
        self.expiry = expiry.into();
        self
    }

    pub fn with_reject_as(mut self, value: T) -> Self {
        self.reject_as = Some(value);
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = RetryDelay::Fixed(delay);
        self
    }

    pub fn with_retry_delay_fn<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.retry_delay = RetryDelay::PerAttempt(Arc::new(delay));
        self
    }

    pub fn on_cached<F>(mut self, transform: F) -> Self
    where
        F: Fn(&T) -> Option<T> + Send + Sync + 'static,
    {
        self.on_cached = Some(Arc::new(transform));
        self
    }

    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(&anyhow::Error, u32) -> RetryDecision<T> + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }
}

impl<T> From<&str> for WorkerOptions<T> {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl<T> From<String> for WorkerOptions<T> {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl<T: fmt::Debug> fmt::Debug for WorkerOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("expiry", &self.expiry)
            .field("reject_as", &self.reject_as)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Return the memoized result for `options.id`, or run `producer` and cache it
    ///
    /// `producer` is a future factory so it can be retried. A cached value is
    /// a hit even when it serializes to `null`.
    pub async fn worker<T, F, Fut>(
        &self,
        options: impl Into<WorkerOptions<T>>,
        mut producer: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let options = options.into();
        if options.id.is_empty() {
            return Err(CacheError::configuration("worker id must not be empty"));
        }

        if !options.enabled {
            return producer().await.map_err(|source| CacheError::Worker {
                id: options.id.clone(),
                source,
            });
        }

        if let Some(cached) = self.get::<T>(&options.id).await? {
            debug!(id = %options.id, "worker cache hit");
            let transformed = options.on_cached.as_ref().and_then(|f| f(&cached));
            return Ok(transformed.unwrap_or(cached));
        }

        let mut attempt = 0u32;
        loop {
            debug!(id = %options.id, attempt, "running worker");
            let error = match producer().await {
                Ok(value) => {
                    self.set(&options.id, &value, options.expiry.clone()).await?;
                    return Ok(value);
                }
                Err(error) => error,
            };

            if let Some(fallback) = &options.reject_as {
                debug!(id = %options.id, error = %error, "worker failed, caching fallback");
                self.set(&options.id, fallback, options.expiry.clone()).await?;
                return Ok(fallback.clone());
            }

            attempt += 1;
            if attempt > options.retry {
                return Err(CacheError::Worker {
                    id: options.id,
                    source: error,
                });
            }

            let decision = match &options.on_retry {
                Some(observer) => observer(&error, attempt),
                None => {
                    warn!(id = %options.id, attempt, error = %error, "worker attempt failed");
                    RetryDecision::Continue
                }
            };
            match decision {
                RetryDecision::Continue => {}
                RetryDecision::Resolve(value) => return Ok(value),
                RetryDecision::Abort(source) => {
                    return Err(CacheError::Worker {
                        id: options.id,
                        source,
                    })
                }
            }

            sleep(options.retry_delay.after(attempt)).await;
        }
    }
}
