//! Pluggable async cache facade.
//!
//! A [`Cache`] probes an ordered list of storage drivers, binds the first one
//! that reports itself loadable, and dispatches every operation through a
//! capability-checked adapter layer.
//!
//! ## Key Components
//!
//! - **`cache`**: the facade itself; driver negotiation, operation dispatch,
//!   auto-clean and graceful shutdown.
//! - **`drivers`**: the driver contract, capability traits and the built-in
//!   memory, filesystem, Redis and Supabase drivers.
//! - **`lock`**: distributed locks on top of a driver's conditional writes.
//! - **`worker`**: get-or-compute memoization with retries.
//! - **`expiry`**: absolute and relative expiry resolution.
//! - **`errors`**: the [`CacheError`] enum and [`Result`] alias.
//!
//! ```no_run
//! # async fn demo() -> polycache_core::Result<()> {
//! use polycache_core::{Cache, CacheSettings};
//!
//! let cache = Cache::open(CacheSettings::builder().with_modules(["redis", "memory"]).build()).await?;
//! cache.set("greeting", "hello", "10m").await?;
//! let greeting: Option<String> = cache.get("greeting").await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod drivers;
pub mod errors;
pub mod events;
pub mod expiry;
mod from_file;
pub mod hashing;
pub mod lock;
pub mod worker;

pub use self::{
    cache::{ActiveModule, Cache, Lifecycle},
    codec::{Codec, JsonCodec},
    config::{CacheSettings, CacheSettingsBuilder, DriverSettings},
    drivers::{Capabilities, Capability, Driver, DriverFactory, DriverRegistry, ListEntry},
    errors::{CacheError, Error, Result},
    events::{CacheEvent, EventEnvelope},
    expiry::{parse_relative_ms, resolve_expiry, Expiry},
    hashing::hash,
    lock::{lock_key, SpinOptions},
    worker::{RetryDecision, RetryDelay, WorkerOptions},
};
