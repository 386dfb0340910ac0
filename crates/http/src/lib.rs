//! axum middleware built on [`polycache_core::Cache`].
//!
//! - [`cache_middleware`] stores whole responses and answers conditional
//!   requests with `304 Not Modified`.
//! - [`semaphore_middleware`] collapses identical concurrent requests so the
//!   protected handler runs once per fingerprint, even across processes that
//!   share a cache backend.

mod middleware;
mod response;
mod semaphore;

pub use self::{
    middleware::{
        cache_middleware, etag_for, CacheFilter, ResponseCacheOptions, ResponseCacheState,
        ResponseKey,
    },
    response::{CachedResponse, Capture, MAX_BODY_SIZE},
    semaphore::{
        fingerprint, result_key, semaphore_middleware, SemaphoreError, SemaphoreKey,
        SemaphoreOptions, SemaphoreState,
    },
};
