//! Versioned on-disk segments.
//!
//! A segment is a [`PersistedHeader`] followed by [`Record`]s. Readers check
//! [`PersistedHeader::compatible`] before touching any record bytes; a
//! mismatch, or any malformed record, means the whole segment is ignored and
//! the cache starts cold. See [`DirCache::load_from`](crate::DirCache::load_from).

pub mod header;
pub mod segment;

pub use header::{CACHE_MAGIC, FORMAT_VERSION, HEADER_LEN, PersistedHeader, Version};
pub use segment::{Record, read_segment, write_segment};

/// Outcome of loading a persisted segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadReport {
    /// The segment was accepted.
    Loaded {
        /// Records installed into the cache.
        installed: usize,
        /// Records whose deadline had already passed.
        expired: usize,
        /// Records refused by the cache (active builder or shard full).
        skipped: usize,
    },
    /// Nothing was loaded; the cache keeps only what it already held.
    Cold { reason: String },
}

impl LoadReport {
    pub fn installed(&self) -> usize {
        match self {
            Self::Loaded { installed, .. } => *installed,
            Self::Cold { .. } => 0,
        }
    }

    pub fn is_cold(&self) -> bool {
        matches!(self, Self::Cold { .. })
    }
}
