//! Cache facade: driver negotiation, operation dispatch and lifecycle
//!
//! - `init` probes the configured drivers once, strictly in order
//! - operations are dispatched through the bound driver's capabilities
//! - `destroy` releases the driver and drains in-flight writes

mod cleanup;
mod init;
mod operations;
mod shutdown;
mod types;

pub use types::{ActiveModule, Cache, Lifecycle};
