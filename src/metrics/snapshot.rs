#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,

    pub inserts: u64,
    pub insert_failures: u64, // OutOfMemory and KeyInUse
    pub invalidations: u64,

    pub builds_started: u64,
    pub builds_committed: u64,
    pub builds_aborted: u64,
    pub waiters_registered: u64,

    pub expired: u64,
    pub stale_expiry_nodes: u64, // queue nodes whose entry was already gone
    pub reclaimed: u64,          // arena slots returned on release/expiry

    // gauges captured at snapshot time
    pub entries: usize,
    pub resident_bytes: usize,
    pub open_builds: usize,
    pub expiry_queue_len: usize,
}

impl CacheMetricsSnapshot {
    /// Hits over lookups, or `0.0` before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}
