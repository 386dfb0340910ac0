use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Re-export CacheError as Error for callers that prefer the short name
pub use CacheError as Error;

/// Direction of a codec failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationOp {
    Encode,
    Decode,
}

/// Error type for every cache facade operation
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An operation was invoked before `init()` bound a driver, or after `destroy()`
    #[error("no cache driver is loaded, call init() before {operation}()")]
    NotReady { operation: &'static str },

    /// `init()` was called on a cache that has been destroyed
    #[error("cache was destroyed and cannot be initialized again, create a new cache")]
    Destroyed,

    /// The bound driver lacks the capability an operation needs
    #[error("{operation}() is not supported by the '{driver}' cache driver")]
    Unsupported {
        operation: &'static str,
        driver: String,
    },

    /// Every candidate driver was rejected during init
    #[error("no cache driver available to load from list: {}", .candidates.join(", "))]
    NoDriverAvailable { candidates: Vec<String> },

    /// A single driver could not be instantiated or reported itself unavailable
    #[error("cache driver '{driver}' is unavailable: {reason}")]
    DriverUnavailable { driver: String, reason: String },

    /// A resolved expiry lies strictly before the current time
    #[error("cache entry expiry {expiry} cannot be in the past")]
    ExpiryInPast { expiry: chrono::DateTime<chrono::Utc> },

    /// An expiry value could not be turned into a timestamp
    #[error("invalid expiry '{value}': {reason}")]
    InvalidExpiry { value: String, reason: String },

    /// A lock spin ran out of attempts while the lock stayed held
    #[error("lock '{key}' still held after {attempts} attempts")]
    LockExhausted { key: String, attempts: u32 },

    /// Encoding or decoding a stored payload failed
    #[error("{}", format_serialization_error(.key, .operation, .path, .message))]
    Serialization {
        key: String,
        operation: SerializationOp,
        path: Option<PathBuf>,
        message: String,
    },

    /// File system operations
    #[error("file system {operation} operation failed for '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Backend I/O failure reported by a driver
    #[error("{driver} driver failed during {operation}: {message}")]
    Backend {
        driver: String,
        operation: &'static str,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A memoized worker failed after its retry budget
    #[error("worker '{id}' failed: {source}")]
    Worker {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Operation timeout errors
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },
}

fn format_serialization_error(
    key: &str,
    operation: &SerializationOp,
    path: &Option<PathBuf>,
    message: &str,
) -> String {
    let verb = match operation {
        SerializationOp::Encode => "encode",
        SerializationOp::Decode => "decode",
    };
    match path {
        Some(path) => format!(
            "failed to {verb} cache entry '{key}' (file \"{}\"): {message}",
            path.display()
        ),
        None => format!("failed to {verb} cache entry '{key}': {message}"),
    }
}

impl From<std::io::Error> for CacheError {
    fn from(error: std::io::Error) -> Self {
        CacheError::FileSystem {
            path: PathBuf::new(),
            operation: "unknown".to_string(),
            source: error,
        }
    }
}

// Helper methods for creating errors with context
impl CacheError {
    /// Create a not-ready error for the named operation
    #[must_use]
    pub fn not_ready(operation: &'static str) -> Self {
        CacheError::NotReady { operation }
    }

    /// Create an unsupported-capability error
    #[must_use]
    pub fn unsupported(operation: &'static str, driver: impl Into<String>) -> Self {
        CacheError::Unsupported {
            operation,
            driver: driver.into(),
        }
    }

    /// Create a driver probe failure
    #[must_use]
    pub fn driver_unavailable(driver: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::DriverUnavailable {
            driver: driver.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid expiry error
    #[must_use]
    pub fn invalid_expiry(value: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::InvalidExpiry {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an encode failure for a key
    #[must_use]
    pub fn encode(key: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::Serialization {
            key: key.into(),
            operation: SerializationOp::Encode,
            path: None,
            message: message.into(),
        }
    }

    /// Create a decode failure for a key
    #[must_use]
    pub fn decode(key: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::Serialization {
            key: key.into(),
            operation: SerializationOp::Decode,
            path: None,
            message: message.into(),
        }
    }

    /// Create a decode failure for data read from a file
    #[must_use]
    pub fn decode_file(
        key: impl Into<String>,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        CacheError::Serialization {
            key: key.into(),
            operation: SerializationOp::Decode,
            path: Some(path.into()),
            message: message.into(),
        }
    }

    /// Create a file system error with context
    #[must_use]
    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        CacheError::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a backend error without an underlying source
    #[must_use]
    pub fn backend(
        driver: impl Into<String>,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        CacheError::Backend {
            driver: driver.into(),
            operation,
            message: message.into(),
            source: None,
        }
    }

    /// Create a backend error wrapping the client library's error
    #[must_use]
    pub fn backend_with_source(
        driver: impl Into<String>,
        operation: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CacheError::Backend {
            driver: driver.into(),
            operation,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        CacheError::Configuration {
            message: message.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        CacheError::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Whether this error means the facade has no bound driver
    pub fn is_not_ready(&self) -> bool {
        matches!(self, CacheError::NotReady { .. })
    }

    /// Whether this error means the bound driver lacks a capability
    pub fn is_unsupported(&self) -> bool {
        matches!(self, CacheError::Unsupported { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_driver_message_lists_candidates() {
        let err = CacheError::NoDriverAvailable {
            candidates: vec!["redis".to_string(), "memory".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "no cache driver available to load from list: redis, memory"
        );
    }

    #[test]
    fn test_decode_file_names_the_path() {
        let err = CacheError::decode_file("badjson", "/tmp/cache/badjson.cache.json", "expected value");
        let message = err.to_string();
        assert!(message.contains("badjson"));
        assert!(message.contains("file \"/tmp/cache/badjson.cache.json\""));
        assert!(message.contains("expected value"));
    }

    #[test]
    fn test_predicates() {
        assert!(CacheError::not_ready("get").is_not_ready());
        assert!(CacheError::unsupported("size", "filesystem").is_unsupported());
        assert!(!CacheError::configuration("bad").is_unsupported());
    }
}
