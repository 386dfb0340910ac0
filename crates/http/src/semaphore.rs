//! Request-collapsing semaphore middleware
//!
//! Concurrent requests with the same fingerprint run the protected handler
//! once; everybody else receives a replay of that response.
//!
//! Within one process, requests attach to a shared in-flight future. Across
//! processes they coordinate through the cache: the first request writes a
//! lock whose value is a fresh session id, runs the handler and stores the
//! response under `semaphore:result:<session>` before releasing the lock.
//! Waiters poll until the lock clears and then read that result.
//!
//! A winner whose handler panics releases the lock without a result and
//! answers `500`. A winner whose response is too large to buffer streams it
//! to its own caller only; waiters answer `503`.
//!
//! ```ignore
//! use axum::{middleware, routing::get, Router};
//! use polycache_http::{semaphore_middleware, SemaphoreOptions, SemaphoreState};
//!
//! let state = SemaphoreState::new(cache, SemaphoreOptions::default());
//! let app = Router::new()
//!     .route("/report", get(build_report))
//!     .layer(middleware::from_fn_with_state(state, semaphore_middleware));
//! ```

use crate::response::{CachedResponse, Capture, MAX_BODY_SIZE};
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use polycache_core::hashing::hash_bytes;
use polycache_core::{Cache, Capability, Expiry};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Derives the request fingerprint from the request head and buffered body
pub type SemaphoreKey = Arc<dyn Fn(&Parts, &Bytes) -> String + Send + Sync>;

type Outcome = Result<CachedResponse, SemaphoreError>;
type InFlight = Shared<BoxFuture<'static, Outcome>>;

/// In-process future for one fingerprint
///
/// Held weakly so a future every caller has abandoned is dropped, and its
/// slot with it.
struct Governing {
    id: Uuid,
    future: WeakShared<BoxFuture<'static, Outcome>>,
}

/// What the winning request hands back to its own caller
enum Reply {
    /// Buffered and stored, so every waiter can replay it
    Replay(CachedResponse),
    /// Too large to buffer; only the caller that ran the handler gets it
    Direct(Response),
}

/// Configuration for [`semaphore_middleware`]
#[derive(Clone)]
pub struct SemaphoreOptions {
    /// Explicit fingerprint; defaults to method, path, query and body
    pub key: Option<SemaphoreKey>,
    /// Attach to an in-process future for the same fingerprint before touching the cache
    pub use_local: bool,
    /// Lifetime of the lock record, bounding how long a crashed winner blocks others
    pub lock_ttl: Duration,
    /// Lifetime of the stored result waiters read back
    pub result_ttl: Duration,
    /// Polls a waiter makes before giving up
    pub retries: u32,
    pub retry_delay: Duration,
    /// Largest request body buffered for fingerprinting
    pub max_request_body: usize,
    /// Largest response body buffered for replay
    pub max_response_body: usize,
}

impl Default for SemaphoreOptions {
    fn default() -> Self {
        Self {
            key: None,
            use_local: true,
            lock_ttl: Duration::from_secs(60),
            result_ttl: Duration::from_secs(60),
            retries: 240,
            retry_delay: Duration::from_millis(250),
            max_request_body: 1024 * 1024,
            max_response_body: MAX_BODY_SIZE,
        }
    }
}

impl fmt::Debug for SemaphoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreOptions")
            .field("key", &self.key.is_some())
            .field("use_local", &self.use_local)
            .field("lock_ttl", &self.lock_ttl)
            .field("result_ttl", &self.result_ttl)
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl SemaphoreOptions {
    pub fn with_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&Parts, &Bytes) -> String + Send + Sync + 'static,
    {
        self.key = Some(Arc::new(key));
        self
    }

    pub fn with_use_local(mut self, use_local: bool) -> Self {
        self.use_local = use_local;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }
}

/// Shared state for [`semaphore_middleware`]
#[derive(Clone)]
pub struct SemaphoreState {
    pub cache: Cache,
    pub options: Arc<SemaphoreOptions>,
    local: Arc<DashMap<String, Governing>>,
}

impl SemaphoreState {
    pub fn new(cache: Cache, options: SemaphoreOptions) -> Self {
        Self {
            cache,
            options: Arc::new(options),
            local: Arc::new(DashMap::new()),
        }
    }

    /// Fingerprints with a governing future in this process
    pub fn in_flight(&self) -> usize {
        self.local.len()
    }
}

impl fmt::Debug for SemaphoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreState")
            .field("options", &self.options)
            .field("in_flight", &self.local.len())
            .finish()
    }
}

/// Failures surfaced to a single caller of the semaphore
#[derive(Debug, Clone, thiserror::Error)]
pub enum SemaphoreError {
    #[error("failed to buffer request body: {0}")]
    RequestBody(String),

    #[error("failed to buffer response body: {0}")]
    ResponseBody(String),

    #[error("semaphore cache operation failed: {0}")]
    Cache(String),

    /// The lock was still held after every poll
    #[error("semaphore for '{hash}' still locked after {attempts} attempts")]
    Exhausted { hash: String, attempts: u32 },

    /// The lock cleared but the winner left no result behind
    #[error("no stored result for semaphore session '{session}'")]
    ResultMissing { session: String },

    /// The winner's response went to its own caller only
    #[error("response for '{hash}' was too large to share")]
    NotShared { hash: String },

    #[error("protected handler panicked")]
    HandlerPanicked,
}

impl From<polycache_core::CacheError> for SemaphoreError {
    fn from(error: polycache_core::CacheError) -> Self {
        SemaphoreError::Cache(error.to_string())
    }
}

impl IntoResponse for SemaphoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            SemaphoreError::RequestBody(_) => StatusCode::PAYLOAD_TOO_LARGE,
            SemaphoreError::ResponseBody(_)
            | SemaphoreError::Cache(_)
            | SemaphoreError::HandlerPanicked => StatusCode::INTERNAL_SERVER_ERROR,
            SemaphoreError::Exhausted { .. }
            | SemaphoreError::ResultMissing { .. }
            | SemaphoreError::NotShared { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        warn!(error = %self, %status, "semaphore request failed");
        (status, self.to_string()).into_response()
    }
}

/// Fingerprint of method, path, query and body
pub fn fingerprint(parts: &Parts, body: &Bytes) -> String {
    let mut input = Vec::with_capacity(body.len() + 64);
    input.extend_from_slice(parts.method.as_str().as_bytes());
    input.push(b'|');
    input.extend_from_slice(parts.uri.path().as_bytes());
    input.push(b'|');
    input.extend_from_slice(parts.uri.query().unwrap_or_default().as_bytes());
    input.push(b'|');
    input.extend_from_slice(body);
    hash_bytes(&input)
}

/// Key holding the response stored by a session
pub fn result_key(session: &str) -> String {
    format!("semaphore:result:{session}")
}

/// Axum middleware collapsing identical concurrent requests
pub async fn semaphore_middleware(
    State(state): State<SemaphoreState>,
    request: Request,
    next: Next,
) -> Result<Response, SemaphoreError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, state.options.max_request_body)
        .await
        .map_err(|e| SemaphoreError::RequestBody(e.to_string()))?;
    let hash = match &state.options.key {
        Some(key) => key(&parts, &body),
        None => fingerprint(&parts, &body),
    };
    let request = Request::from_parts(parts, Body::from(body));

    if state.options.use_local {
        return run_local(&state, hash, request, next).await;
    }
    match run_remote(state, hash, request, next).await? {
        Reply::Replay(cached) => Ok(cached.to_response()),
        Reply::Direct(response) => Ok(response),
    }
}

/// Removes a fingerprint's slot however its future ends
struct LocalEntry {
    local: Arc<DashMap<String, Governing>>,
    hash: String,
    id: Uuid,
}

impl Drop for LocalEntry {
    fn drop(&mut self) {
        self.local.remove_if(&self.hash, |_, slot| slot.id == self.id);
    }
}

/// Attach to the in-process future for `hash`, creating it if needed
async fn run_local(
    state: &SemaphoreState,
    hash: String,
    request: Request,
    next: Next,
) -> Result<Response, SemaphoreError> {
    let slot = match state.local.entry(hash.clone()) {
        Entry::Occupied(existing) => match existing.get().future.upgrade() {
            Some(governing) => Err(governing),
            None => Ok(Entry::Occupied(existing)),
        },
        vacant => Ok(vacant),
    };
    let (governing, direct) = match slot {
        Err(governing) => {
            debug!(hash = %hash, "attaching to in-flight request");
            (governing, None)
        }
        Ok(slot) => {
            let id = Uuid::new_v4();
            let (direct_tx, direct_rx) = oneshot::channel();
            let governing =
                governing_future(state.clone(), hash.clone(), id, request, next, direct_tx);
            if let Some(future) = governing.downgrade() {
                slot.insert(Governing { id, future });
            }
            (governing, Some(direct_rx))
        }
    };

    match governing.await {
        Ok(cached) => Ok(cached.to_response()),
        Err(SemaphoreError::NotShared { hash }) => direct
            .and_then(|mut rx| rx.try_recv().ok())
            .ok_or(SemaphoreError::NotShared { hash }),
        Err(e) => Err(e),
    }
}

fn governing_future(
    state: SemaphoreState,
    hash: String,
    id: Uuid,
    request: Request,
    next: Next,
    direct: oneshot::Sender<Response>,
) -> InFlight {
    async move {
        let _entry = LocalEntry {
            local: Arc::clone(&state.local),
            hash: hash.clone(),
            id,
        };
        // A panic here would poison the shared future for every waiter
        let outcome = AssertUnwindSafe(run_remote(state, hash.clone(), request, next))
            .catch_unwind()
            .await
            .unwrap_or(Err(SemaphoreError::HandlerPanicked));
        match outcome? {
            Reply::Replay(cached) => Ok(cached),
            Reply::Direct(response) => {
                let _ = direct.send(response);
                Err(SemaphoreError::NotShared { hash })
            }
        }
    }
    .boxed()
    .shared()
}

/// Cross-process protocol, coordinated through the cache
async fn run_remote(
    state: SemaphoreState,
    hash: String,
    request: Request,
    next: Next,
) -> Result<Reply, SemaphoreError> {
    let locks = SessionLock::new(&state);
    let mut known = locks.holder(&hash).await?;

    if known.is_none() {
        let session = Uuid::new_v4().to_string();
        if locks.claim(&hash, &session).await? {
            return run_winner(&state, &locks, &hash, &session, request, next).await;
        }
        known = locks.holder(&hash).await?;
    }

    for attempt in 1..=state.options.retries {
        tokio::time::sleep(state.options.retry_delay).await;
        match locks.holder(&hash).await? {
            Some(session) => known = Some(session),
            None => {
                if let Some(session) = known.as_deref() {
                    return read_result(&state, session).await.map(Reply::Replay);
                }
                // Never saw a holder, so nobody will publish a result
                let session = Uuid::new_v4().to_string();
                if locks.claim(&hash, &session).await? {
                    return run_winner(&state, &locks, &hash, &session, request, next).await;
                }
            }
        }
        debug!(hash = %hash, attempt, "semaphore still locked");
    }

    Err(SemaphoreError::Exhausted {
        hash,
        attempts: state.options.retries,
    })
}

async fn run_winner(
    state: &SemaphoreState,
    locks: &SessionLock,
    hash: &str,
    session: &str,
    request: Request,
    next: Next,
) -> Result<Reply, SemaphoreError> {
    debug!(hash = %hash, session = %session, "running protected handler");
    let mut abandoned = AbandonedRelease {
        locks: Some(locks.clone()),
        hash: hash.to_string(),
    };
    let captured = match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => CachedResponse::capture(response, state.options.max_response_body)
            .await
            .map_err(|e| SemaphoreError::ResponseBody(e.to_string())),
        Err(_) => {
            warn!(hash = %hash, session = %session, "protected handler panicked");
            Err(SemaphoreError::HandlerPanicked)
        }
    };

    if let Ok(Capture::Complete(cached)) = &captured {
        let expiry = Expiry::from(state.options.result_ttl);
        if let Err(e) = state.cache.set(&result_key(session), cached, expiry).await {
            warn!(session = %session, error = %e, "failed to store semaphore result");
        }
    }
    // Waiters see the lock clear; without a stored result they answer 503
    abandoned.locks = None;
    if let Err(e) = locks.release(hash).await {
        warn!(hash = %hash, error = %e, "failed to release semaphore lock");
    }

    match captured? {
        Capture::Complete(cached) => Ok(Reply::Replay(cached)),
        Capture::Oversized(response) => {
            debug!(hash = %hash, "response too large to share with waiters");
            Ok(Reply::Direct(response))
        }
    }
}

/// Releases the lock in the background if the winner is dropped mid-run
struct AbandonedRelease {
    locks: Option<SessionLock>,
    hash: String,
}

impl Drop for AbandonedRelease {
    fn drop(&mut self) {
        let Some(locks) = self.locks.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let hash = std::mem::take(&mut self.hash);
        runtime.spawn(async move {
            debug!(hash = %hash, "releasing lock of abandoned request");
            if let Err(e) = locks.release(&hash).await {
                warn!(hash = %hash, error = %e, "failed to release semaphore lock");
            }
        });
    }
}

async fn read_result(state: &SemaphoreState, session: &str) -> Outcome {
    state
        .cache
        .get::<CachedResponse>(&result_key(session))
        .await?
        .ok_or_else(|| SemaphoreError::ResultMissing {
            session: session.to_string(),
        })
}

/// Lock whose value is the owning session id
///
/// Uses the driver's atomic conditional writes when it has them; otherwise
/// falls back to plain get/set, which only collapses best-effort.
#[derive(Clone)]
struct SessionLock {
    cache: Cache,
    ttl: Duration,
    atomic: bool,
}

impl SessionLock {
    fn new(state: &SemaphoreState) -> Self {
        Self {
            cache: state.cache.clone(),
            ttl: state.options.lock_ttl,
            atomic: state.cache.can(Capability::Lock),
        }
    }

    fn plain_key(hash: &str) -> String {
        format!("semaphore:lock:{hash}")
    }

    async fn holder(&self, hash: &str) -> Result<Option<String>, SemaphoreError> {
        let holder = if self.atomic {
            self.cache.lock_data::<String, _>(hash).await?
        } else {
            self.cache.get::<String>(&Self::plain_key(hash)).await?
        };
        Ok(holder)
    }

    async fn claim(&self, hash: &str, session: &str) -> Result<bool, SemaphoreError> {
        if self.atomic {
            return Ok(self
                .cache
                .lock_acquire_with(hash, session, Expiry::from(self.ttl))
                .await?);
        }
        self.cache
            .set(&Self::plain_key(hash), session, Expiry::from(self.ttl))
            .await?;
        Ok(true)
    }

    async fn release(&self, hash: &str) -> Result<(), SemaphoreError> {
        if self.atomic {
            self.cache.lock_release(hash).await?;
        } else {
            self.cache.unset(&Self::plain_key(hash)).await?;
        }
        Ok(())
    }
}
