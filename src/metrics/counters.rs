use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::snapshot::CacheMetricsSnapshot;

/// Lock-free operation counters for one cache instance.
///
/// Uses `AtomicU64` with relaxed ordering. Counters may be slightly stale in
/// concurrent reads but are eventually consistent.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    insert_failures: AtomicU64,
    invalidations: AtomicU64,
    builds_started: AtomicU64,
    builds_committed: AtomicU64,
    builds_aborted: AtomicU64,
    waiters_registered: AtomicU64,
    expired: AtomicU64,
    stale_expiry_nodes: AtomicU64,
    reclaimed: AtomicU64,
}

macro_rules! counter_incs {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl CacheCounters {
    counter_incs! {
        inc_lookup => lookups,
        inc_hit => hits,
        inc_miss => misses,
        inc_insert => inserts,
        inc_insert_failure => insert_failures,
        inc_invalidation => invalidations,
        inc_build_started => builds_started,
        inc_build_committed => builds_committed,
        inc_build_aborted => builds_aborted,
        inc_waiter => waiters_registered,
        inc_expired => expired,
        inc_stale_expiry_node => stale_expiry_nodes,
        inc_reclaimed => reclaimed,
    }

    /// Counter values; gauges are filled in by the caller.
    pub(crate) fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            insert_failures: self.insert_failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            builds_started: self.builds_started.load(Ordering::Relaxed),
            builds_committed: self.builds_committed.load(Ordering::Relaxed),
            builds_aborted: self.builds_aborted.load(Ordering::Relaxed),
            waiters_registered: self.waiters_registered.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            stale_expiry_nodes: self.stale_expiry_nodes.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            ..CacheMetricsSnapshot::default()
        }
    }
}
