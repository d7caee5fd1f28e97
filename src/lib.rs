//! cachedir: the directory core of a caching proxy.
//!
//! Maps keys to reference-counted entries in independently locked shards,
//! coalesces concurrent misses for the same key into a single build, expires
//! entries by deadline, and snapshots Ready entries to versioned segments.
//!
//! ```
//! use cachedir::CacheBuilder;
//!
//! let cache = CacheBuilder::new().shards(4).capacity(1024).try_build().unwrap();
//! let handle = cache.insert("key", &b"value"[..], None).unwrap();
//! assert_eq!(cache.lookup("key").unwrap().payload(), b"value");
//! cache.release(handle);
//! ```

pub mod builder;
pub mod cache;
pub mod ds;
pub mod error;
pub mod key;
pub mod metrics;
pub mod persist;
pub mod prelude;
pub mod store;
pub mod time;

pub use crate::builder::{CacheBuilder, CacheConfig};
pub use crate::cache::{Builder, DirCache, Handle, Lookup};
pub use crate::error::{CacheError, ConfigError, PersistError};
pub use crate::key::CacheKey;
pub use crate::metrics::CacheMetricsSnapshot;
pub use crate::persist::LoadReport;
pub use crate::store::{EntryRef, EntryState, WaitToken};
pub use crate::time::Timestamp;
