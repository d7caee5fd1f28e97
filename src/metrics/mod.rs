//! Operation counters and point-in-time snapshots.
//!
//! Recording is split from reading: the cache bumps counters on its hot
//! paths with relaxed atomics, and [`DirCache::metrics`](crate::DirCache::metrics)
//! assembles a [`CacheMetricsSnapshot`] with gauges sampled shard by shard.

pub(crate) mod counters;
pub mod snapshot;

pub use snapshot::CacheMetricsSnapshot;
