//! Error types for the cache internals.
//!
//! These never cross the [`ImageCache`](crate::ImageCache) boundary; every
//! cache operation degrades to a safe value instead.

use thiserror::Error;

/// Result alias used inside the library.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Everything that can go wrong below the cache facade.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure (cache directory, part files, deletes)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("HTTP {0}")]
    Status(u16),

    /// Durable key-value store failure
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Index or counters blob could not be (de)serialized
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(CacheError::Status(404).to_string(), "HTTP 404");
    }

    #[test]
    fn test_io_from() {
        let err: CacheError = std::io::Error::other("disk full").into();
        assert!(matches!(err, CacheError::Io(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
