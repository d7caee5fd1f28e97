//! Error types for the cache directory.
//!
//! ## Key Components
//!
//! - [`CacheError`]: returned by the request-path operations (`insert`,
//!   `lookup_or_create`, `Builder::commit`) and delivered to waiters.
//! - [`PersistError`]: returned while saving or loading a persisted segment.
//!   Version and format problems never escape `load_from`; they turn into a
//!   cold start.
//! - [`ConfigError`]: returned when builder parameters are invalid.
//!
//! ## Example Usage
//!
//! ```
//! use cachedir::CacheBuilder;
//! use cachedir::error::ConfigError;
//!
//! let bad = CacheBuilder::new().shards(0).try_build();
//! assert!(matches!(bad, Err(ConfigError { .. })));
//! ```

use std::fmt;

use crate::persist::PersistedHeader;

// ---------------------------------------------------------------------------
// CacheError
// ---------------------------------------------------------------------------

/// Errors surfaced on the request path.
///
/// None of these are fatal: callers treat them as a miss, a slower rebuild, or
/// a rejected insert.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The shard's entry arena or payload byte budget is exhausted.
    #[error("cache shard is full (limit {limit})")]
    OutOfMemory { limit: usize },

    /// A builder is active for the key; go through `lookup_or_create`.
    #[error("key has an active builder")]
    KeyInUse,

    /// The builder this waiter joined failed or was cancelled.
    #[error("build aborted")]
    BuildAborted,
}

// ---------------------------------------------------------------------------
// PersistError
// ---------------------------------------------------------------------------

/// Errors raised while reading or writing a persisted segment.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Stored header does not match what this build can read.
    #[error("incompatible segment header: stored {stored}, expected {expected}")]
    VersionIncompatible {
        stored: PersistedHeader,
        expected: PersistedHeader,
    },

    /// The segment is truncated or a record is malformed.
    #[error("corrupt segment: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PersistError {
    /// Whether the error means "start cold" rather than "report upward".
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::VersionIncompatible { .. } | Self::Corrupt(_))
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when cache configuration parameters are invalid.
///
/// Carries a human-readable description of which parameter failed validation.
///
/// ```
/// use cachedir::CacheBuilder;
///
/// let err = CacheBuilder::new().shards(4).capacity(0).try_build().unwrap_err();
/// assert!(err.to_string().contains("capacity"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{FORMAT_VERSION, Version};

    // -- CacheError -------------------------------------------------------

    #[test]
    fn cache_error_display() {
        assert_eq!(
            CacheError::OutOfMemory { limit: 8 }.to_string(),
            "cache shard is full (limit 8)"
        );
        assert_eq!(CacheError::KeyInUse.to_string(), "key has an active builder");
        assert_eq!(CacheError::BuildAborted.to_string(), "build aborted");
    }

    #[test]
    fn cache_error_implements_std_error() {
        fn assert_error<T: std::error::Error + Send + Sync + 'static>() {}
        assert_error::<CacheError>();
        assert_error::<PersistError>();
    }

    // -- PersistError -----------------------------------------------------

    #[test]
    fn persist_error_recoverability() {
        let header = PersistedHeader::current(Version::new(1, 0));
        let mismatch = PersistError::VersionIncompatible {
            stored: header,
            expected: PersistedHeader::current(Version::new(2, 0)),
        };
        assert!(mismatch.is_recoverable());
        assert!(mismatch.to_string().contains("object 2.0"));
        assert!(PersistError::Corrupt("short record".into()).is_recoverable());

        let io = PersistError::from(std::io::Error::other("disk gone"));
        assert!(!io.is_recoverable());
        assert_eq!(io.to_string(), "disk gone");
        assert_eq!(FORMAT_VERSION.major, header.format_version.major);
    }

    // -- ConfigError ------------------------------------------------------

    #[test]
    fn config_display_shows_message() {
        let err = ConfigError::new("shards must be > 0");
        assert_eq!(err.to_string(), "shards must be > 0");
        assert_eq!(err.message(), "shards must be > 0");
    }

    #[test]
    fn config_clone_and_eq() {
        let a = ConfigError::new("x");
        let b = a.clone();
        assert_eq!(a, b);
    }
}
