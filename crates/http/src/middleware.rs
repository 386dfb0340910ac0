//! Response caching middleware with conditional request support
//!
//! Cached responses carry an `ETag` derived from their cache key. A request
//! whose `If-None-Match` matches the tag of a live entry gets `304 Not Modified`
//! without touching the handler.

use crate::response::{CachedResponse, Capture, MAX_BODY_SIZE};
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use polycache_core::hashing::hash_bytes;
use polycache_core::{Cache, Expiry};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Derives the cache key from the request head
pub type ResponseKey = Arc<dyn Fn(&Parts) -> String + Send + Sync>;

/// Decides whether a handler response is stored
pub type CacheFilter = Arc<dyn Fn(&Parts, &CachedResponse) -> bool + Send + Sync>;

/// Configuration for [`cache_middleware`]
#[derive(Clone)]
pub struct ResponseCacheOptions {
    pub expiry: Expiry,
    /// Explicit cache key; defaults to `<METHOD> <path?query>`
    pub key: Option<ResponseKey>,
    /// Defaults to storing 2xx responses only
    pub filter: Option<CacheFilter>,
    pub max_body: usize,
}

impl ResponseCacheOptions {
    pub fn new(expiry: impl Into<Expiry>) -> Self {
        Self {
            expiry: expiry.into(),
            key: None,
            filter: None,
            max_body: MAX_BODY_SIZE,
        }
    }

    pub fn with_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&Parts) -> String + Send + Sync + 'static,
    {
        self.key = Some(Arc::new(key));
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Parts, &CachedResponse) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    fn key_for(&self, parts: &Parts) -> String {
        match &self.key {
            Some(key) => key(parts),
            None => format!("{} {}", parts.method, parts.uri),
        }
    }

    fn should_store(&self, parts: &Parts, response: &CachedResponse) -> bool {
        match &self.filter {
            Some(filter) => filter(parts, response),
            None => response.is_success(),
        }
    }
}

impl fmt::Debug for ResponseCacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCacheOptions")
            .field("expiry", &self.expiry)
            .field("key", &self.key.is_some())
            .field("filter", &self.filter.is_some())
            .field("max_body", &self.max_body)
            .finish()
    }
}

/// Shared state for [`cache_middleware`]
#[derive(Debug, Clone)]
pub struct ResponseCacheState {
    pub cache: Cache,
    pub options: Arc<ResponseCacheOptions>,
}

impl ResponseCacheState {
    pub fn new(cache: Cache, options: ResponseCacheOptions) -> Self {
        Self {
            cache,
            options: Arc::new(options),
        }
    }
}

/// Entity tag for a cache key
pub fn etag_for(key: &str) -> String {
    format!("\"{}\"", hash_bytes(key.as_bytes()))
}

fn if_none_match(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
}

/// Whether an `If-None-Match` header value names `etag`
fn matches_etag(header: &str, etag: &str) -> bool {
    header
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate.trim_start_matches("W/") == etag)
}

fn put_etag(response: &mut Response, etag: &str) {
    if let Ok(value) = HeaderValue::from_str(etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
}

/// Axum middleware serving and storing whole responses
///
/// Cache failures never fail the request; the handler runs uncached instead.
pub async fn cache_middleware(
    State(state): State<ResponseCacheState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let key = state.options.key_for(&parts);
    let etag = etag_for(&key);

    let cached = match state.cache.get::<CachedResponse>(&key).await {
        Ok(cached) => cached,
        Err(e) => {
            warn!(key = %key, error = %e, "response cache read failed");
            None
        }
    };

    if let Some(cached) = cached {
        let mut response = match if_none_match(&parts.headers) {
            Some(header) if matches_etag(header, &etag) => {
                debug!(key = %key, "not modified");
                StatusCode::NOT_MODIFIED.into_response()
            }
            _ => {
                debug!(key = %key, "serving cached response");
                cached.to_response()
            }
        };
        put_etag(&mut response, &etag);
        return response;
    }

    let request_parts = parts.clone();
    let response = next.run(Request::from_parts(parts, body)).await;
    let captured = match CachedResponse::capture(response, state.options.max_body).await {
        Ok(Capture::Complete(captured)) => captured,
        Ok(Capture::Oversized(response)) => {
            debug!(key = %key, limit = state.options.max_body, "response too large to cache");
            return response;
        }
        Err(e) => {
            warn!(key = %key, error = %e, "failed to read response body");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read response body",
            )
                .into_response();
        }
    };

    let mut response = captured.to_response();
    if state.options.should_store(&request_parts, &captured) {
        match state
            .cache
            .set(&key, &captured, state.options.expiry.clone())
            .await
        {
            Ok(()) => put_etag(&mut response, &etag),
            Err(e) => warn!(key = %key, error = %e, "response cache write failed"),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_is_quoted_and_stable() {
        let tag = etag_for("GET /a");
        assert!(tag.starts_with('"') && tag.ends_with('"'));
        assert_eq!(tag, etag_for("GET /a"));
        assert_ne!(tag, etag_for("GET /b"));
    }

    #[test]
    fn test_if_none_match_lists() {
        let tag = etag_for("k");
        assert!(matches_etag(&tag, &tag));
        assert!(matches_etag(&format!("\"other\", W/{tag}"), &tag));
        assert!(matches_etag("*", &tag));
        assert!(!matches_etag("\"other\"", &tag));
    }
}
