//! The cache directory: public API over sharded entry storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────────┐
//! │ DirCache (Arc<CacheInner>, cheap to clone, Send + Sync)                    │
//! │                                                                            │
//! │   key ──► ShardSelector ──► shards[i]: Mutex<Shard>                        │
//! │                                ├─ entry arena + key index   (store)        │
//! │                                └─ open slots + waiters      (open dir)     │
//! │                                                                            │
//! │   expiry: Mutex<ExpiryQueue<Timestamp, EntryRef>>   weak refs only         │
//! │   counters: CacheCounters                           relaxed atomics        │
//! └────────────────────────────────────────────────────────────────────────────┘
//!
//! lookup_or_create("A")                 lookup_or_create("A")   (concurrent)
//!   │ shard lock: miss, open slot         │ shard lock: slot is Building
//!   ▼                                     ▼
//! Lookup::Build(builder)                Lookup::Pending(token) ── closure queued
//!   │
//!   ▼ builder.commit(payload, ttl)
//! shard lock: slot torn down, entry Ready + indexed, one ref per waiter
//!   │ unlock
//!   ├─► expiry.schedule(entry_ref, deadline)
//!   └─► waiter closures run in registration order with Ok(handle)
//! ```
//!
//! ## Lock discipline
//!
//! At most one lock is held at a time: a single shard lock, or the expiry
//! queue lock. Waiter closures and handle drops always run with no lock held.
//!
//! ## Example Usage
//!
//! ```
//! use std::sync::mpsc;
//! use cachedir::{CacheBuilder, Lookup};
//!
//! let cache = CacheBuilder::new().shards(4).try_build().unwrap();
//!
//! let (tx, rx) = mpsc::channel();
//! let Lookup::Build(builder) = cache.lookup_or_create("A", |_| {}).unwrap() else {
//!     unreachable!("first caller builds");
//! };
//! // A second caller joins the in-flight build instead of starting its own.
//! let joined = cache.lookup_or_create("A", move |result| tx.send(result).unwrap()).unwrap();
//! assert!(joined.is_pending());
//!
//! let mine = builder.commit(&b"payload"[..], None).unwrap();
//! let theirs = rx.recv().unwrap().unwrap();
//! assert!(mine.same_entry(&theirs));
//! assert_eq!(theirs.payload(), b"payload");
//! ```

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, IntoInnerError, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::builder::CacheConfig;
use crate::ds::{ExpiryQueue, ShardSelector, SlotId};
use crate::error::{CacheError, ConfigError, PersistError};
use crate::key::CacheKey;
use crate::metrics::CacheMetricsSnapshot;
use crate::metrics::counters::CacheCounters;
use crate::persist::{LoadReport, PersistedHeader, read_segment, write_segment};
use crate::store::entry::{EntryRef, EntryState, EntryView};
use crate::store::open_dir::{WaitToken, Waiter};
use crate::store::shard::{Expired, Shard, ShardLookup};
use crate::time::Timestamp;

struct CacheInner {
    shards: Box<[Mutex<Shard>]>,
    selector: ShardSelector,
    expiry: Mutex<ExpiryQueue<Timestamp, EntryRef>>,
    counters: CacheCounters,
    config: CacheConfig,
}

impl CacheInner {
    fn shard_of(&self, key: &[u8]) -> u32 {
        self.selector.shard_for_key(key) as u32
    }

    fn shard(&self, index: u32) -> &Mutex<Shard> {
        &self.shards[index as usize]
    }

    fn schedule(&self, entry: EntryRef, deadline: Timestamp) {
        self.expiry.lock().schedule(entry, deadline);
    }

    fn release(&self, entry: EntryRef) {
        let freed = self.shard(entry.shard).lock().release(entry.id);
        if freed {
            self.counters.inc_reclaimed();
        }
    }
}

/// Sharded, reference-counted cache directory.
///
/// Cloning is cheap and yields another view of the same cache.
#[derive(Clone)]
pub struct DirCache {
    inner: Arc<CacheInner>,
}

/// Outcome of [`DirCache::lookup_or_create`].
#[must_use]
#[derive(Debug)]
pub enum Lookup {
    /// A Ready entry; the closure was dropped without being called.
    Hit(Handle),
    /// The caller is the key's only builder and must commit or abort; the
    /// closure was dropped without being called.
    Build(Builder),
    /// Another caller is building the key; the closure will be called once.
    Pending(WaitToken),
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn is_build(&self) -> bool {
        matches!(self, Self::Build(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    pub fn into_handle(self) -> Option<Handle> {
        match self {
            Self::Hit(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_builder(self) -> Option<Builder> {
        match self {
            Self::Build(builder) => Some(builder),
            _ => None,
        }
    }
}

impl DirCache {
    /// Builds a cache from a validated configuration.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let per_shard_capacity = config.per_shard_capacity();
        let per_shard_bytes = config.per_shard_bytes();
        let shards = (0..config.shards)
            .map(|_| Mutex::new(Shard::new(per_shard_capacity, per_shard_bytes)))
            .collect();
        Ok(Self {
            inner: Arc::new(CacheInner {
                shards,
                selector: ShardSelector::new(config.shards, config.shard_seed),
                expiry: Mutex::new(ExpiryQueue::new()),
                counters: CacheCounters::default(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    // -- Lookups ----------------------------------------------------------

    /// Returns a new reference to the Ready entry for `key`.
    ///
    /// `None` if the key is absent, still building, or being removed.
    pub fn lookup(&self, key: impl AsRef<[u8]>) -> Option<Handle> {
        let key = key.as_ref();
        let shard = self.inner.shard_of(key);
        self.inner.counters.inc_lookup();
        let found = self.inner.shard(shard).lock().lookup(key);
        match found {
            Some((id, view)) => {
                self.inner.counters.inc_hit();
                Some(Handle::new(&self.inner, EntryRef { shard, id }, view))
            },
            None => {
                self.inner.counters.inc_miss();
                None
            },
        }
    }

    /// Returns the Ready entry, joins an in-flight build, or makes the caller
    /// the builder.
    ///
    /// `on_complete` is called exactly once if and only if the result is
    /// [`Lookup::Pending`]: with a new handle when the build commits, or with
    /// [`CacheError::BuildAborted`] when it fails or is invalidated. It runs on
    /// the thread that finishes the build, with no cache lock held.
    ///
    /// Fails with [`CacheError::OutOfMemory`] if a new build cannot be
    /// allocated.
    pub fn lookup_or_create<F>(
        &self,
        key: impl Into<CacheKey>,
        on_complete: F,
    ) -> Result<Lookup, CacheError>
    where
        F: FnOnce(Result<Handle, CacheError>) + Send + 'static,
    {
        let key = key.into();
        let shard = self.inner.shard_of(key.as_bytes());
        let waiter: Waiter = Box::new(on_complete);
        self.inner.counters.inc_lookup();

        let outcome = self
            .inner
            .shard(shard)
            .lock()
            .lookup_or_create(key.clone(), waiter);

        match outcome {
            ShardLookup::Hit { id, view, unused } => {
                drop(unused);
                self.inner.counters.inc_hit();
                Ok(Lookup::Hit(Handle::new(
                    &self.inner,
                    EntryRef { shard, id },
                    view,
                )))
            },
            ShardLookup::Build {
                entry,
                slot,
                unused,
            } => {
                drop(unused);
                self.inner.counters.inc_miss();
                self.inner.counters.inc_build_started();
                debug!(key = %key, shard, "build started");
                Ok(Lookup::Build(Builder {
                    inner: Arc::clone(&self.inner),
                    key,
                    shard,
                    entry,
                    slot,
                    finished: false,
                }))
            },
            ShardLookup::Pending { ticket } => {
                self.inner.counters.inc_waiter();
                trace!(key = %key, shard, ticket, "joined in-flight build");
                Ok(Lookup::Pending(WaitToken { key, ticket }))
            },
            ShardLookup::Rejected { error, unused } => {
                drop(unused);
                self.inner.counters.inc_miss();
                debug!(key = %key, shard, error = %error, "cannot start build");
                Err(error)
            },
        }
    }

    pub fn contains(&self, key: impl AsRef<[u8]>) -> bool {
        let key = key.as_ref();
        self.inner.shard(self.inner.shard_of(key)).lock().contains(key)
    }

    // -- Mutations --------------------------------------------------------

    /// Installs a Ready entry that expires `ttl` from now.
    ///
    /// See [`insert_at`](Self::insert_at).
    pub fn insert(
        &self,
        key: impl Into<CacheKey>,
        payload: impl Into<Arc<[u8]>>,
        ttl: Option<Duration>,
    ) -> Result<Handle, CacheError> {
        let expiry = ttl.map(|ttl| Timestamp::now() + ttl);
        self.insert_at(key, payload, expiry)
    }

    /// Installs a Ready entry with an absolute deadline, replacing any prior
    /// entry for the key.
    ///
    /// The returned handle is the caller's reference (refcount 1). Fails with
    /// [`CacheError::KeyInUse`] while a build is in flight for the key, and with
    /// [`CacheError::OutOfMemory`] when the shard is full; neither failure
    /// disturbs existing entries.
    pub fn insert_at(
        &self,
        key: impl Into<CacheKey>,
        payload: impl Into<Arc<[u8]>>,
        expiry: Option<Timestamp>,
    ) -> Result<Handle, CacheError> {
        let key = key.into();
        let shard = self.inner.shard_of(key.as_bytes());
        let inserted = self
            .inner
            .shard(shard)
            .lock()
            .insert(key, payload.into(), expiry);

        match inserted {
            Ok((id, view)) => {
                self.inner.counters.inc_insert();
                let entry = EntryRef { shard, id };
                if let Some(deadline) = expiry {
                    self.inner.schedule(entry, deadline);
                }
                Ok(Handle::new(&self.inner, entry, view))
            },
            Err(err) => {
                self.inner.counters.inc_insert_failure();
                Err(err)
            },
        }
    }

    /// Gives back a reference. Equivalent to dropping the handle.
    pub fn release(&self, handle: Handle) {
        drop(handle);
    }

    /// Retires the Ready entry (or in-flight build) for `key`.
    ///
    /// Outstanding handles stay readable; the entry is freed when the last one
    /// is released. Returns `false` if the key was absent or already retired.
    pub fn invalidate(&self, key: impl AsRef<[u8]>) -> bool {
        let key = key.as_ref();
        let invalidated = self.inner.shard(self.inner.shard_of(key)).lock().invalidate(key);
        if invalidated {
            self.inner.counters.inc_invalidation();
        }
        invalidated
    }

    /// Retires every Ready entry; returns how many.
    pub fn clear(&self) -> usize {
        let mut cleared = 0;
        for shard in self.inner.shards.iter() {
            cleared += shard.lock().clear();
        }
        debug!(cleared, "cache cleared");
        cleared
    }

    // -- Expiry -----------------------------------------------------------

    /// Retires every entry whose deadline is `<= now`.
    ///
    /// Returns the number of entries expired. Unreferenced ones are freed at
    /// once; the rest when their last handle is released. Queue nodes for
    /// entries that are already gone are dropped silently.
    pub fn sweep(&self, now: Timestamp) -> usize {
        let due = self.inner.expiry.lock().pop_expired(&now);
        let mut expired = 0;
        for entry in due {
            let outcome = self.inner.shard(entry.shard).lock().expire(entry.id);
            match outcome {
                Expired::Retired { freed } => {
                    expired += 1;
                    self.inner.counters.inc_expired();
                    if freed {
                        self.inner.counters.inc_reclaimed();
                    }
                },
                Expired::Stale => {
                    self.inner.counters.inc_stale_expiry_node();
                    trace!(shard = entry.shard, slot = entry.id.index(), "stale expiry node");
                },
            }
        }
        if expired > 0 {
            debug!(expired, %now, "sweep expired entries");
        }
        expired
    }

    /// Earliest pending deadline, stale nodes included.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.inner.expiry.lock().peek_next().copied()
    }

    /// Drops expiry nodes whose entries were already replaced or retired.
    ///
    /// The queue is empty while live nodes are being checked, so a `sweep`
    /// running concurrently finds nothing due; those entries expire on the
    /// following sweep. Returns how many nodes were dropped.
    pub fn compact_expiry(&self) -> usize {
        let nodes = self.inner.expiry.lock().drain();
        let total = nodes.len();
        let live: Vec<(EntryRef, Timestamp)> = nodes
            .into_iter()
            .filter(|(entry, _)| self.inner.shard(entry.shard).lock().is_live(entry.id))
            .collect();
        let dropped = total - live.len();

        let mut queue = self.inner.expiry.lock();
        for (entry, deadline) in live {
            queue.schedule(entry, deadline);
        }
        drop(queue);

        if dropped > 0 {
            debug!(dropped, "compacted expiry queue");
        }
        dropped
    }

    // -- Introspection ----------------------------------------------------

    /// Number of Ready entries.
    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resident_bytes(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.lock().resident_bytes())
            .sum()
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        let mut snapshot = self.inner.counters.snapshot();
        for shard in self.inner.shards.iter() {
            let shard = shard.lock();
            snapshot.entries += shard.len();
            snapshot.resident_bytes += shard.resident_bytes();
            snapshot.open_builds += shard.open_builds();
        }
        snapshot.expiry_queue_len = self.inner.expiry.lock().len();
        snapshot
    }

    /// Arena slots in use across shards, Removing and Building entries included.
    #[cfg(any(test, debug_assertions))]
    pub fn debug_allocated(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.lock().allocated())
            .sum()
    }

    /// Validates every shard's invariants (debug/test builds only).
    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        for shard in self.inner.shards.iter() {
            shard.lock().debug_validate_invariants();
        }
    }

    // -- Persistence ------------------------------------------------------

    /// Writes every Ready entry as a segment; returns the record count.
    ///
    /// Shards are snapshotted one at a time, so the segment is consistent per
    /// key but not across keys.
    pub fn save_to<W: Write>(&self, writer: &mut W) -> Result<usize, PersistError> {
        let mut records = Vec::new();
        for shard in self.inner.shards.iter() {
            records.extend(shard.lock().snapshot());
        }
        let header = PersistedHeader::current(self.inner.config.object_version);
        let written = write_segment(writer, &header, &records)?;
        info!(records = written, "saved cache segment");
        Ok(written)
    }

    /// Loads a segment written by [`save_to`](Self::save_to).
    ///
    /// An incompatible header or a malformed record means nothing is loaded
    /// and [`LoadReport::Cold`] is returned; only I/O failures are errors.
    /// Records already past `now` are skipped, as are keys with a build in
    /// flight and records that do not fit.
    pub fn load_from<R: Read>(
        &self,
        reader: &mut R,
        now: Timestamp,
    ) -> Result<LoadReport, PersistError> {
        let expected = PersistedHeader::current(self.inner.config.object_version);
        let records = match read_segment(reader, &expected) {
            Ok(records) => records,
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "discarding persisted cache segment, starting cold");
                return Ok(LoadReport::Cold {
                    reason: err.to_string(),
                });
            },
            Err(err) => return Err(err),
        };

        let (mut installed, mut expired, mut skipped) = (0, 0, 0);
        for record in records {
            if record.expiry.is_some_and(|deadline| deadline <= now) {
                expired += 1;
                continue;
            }
            let key = record.key.clone();
            match self.insert_at(record.key, record.payload, record.expiry) {
                Ok(handle) => {
                    drop(handle);
                    installed += 1;
                },
                Err(err) => {
                    trace!(key = %key, error = %err, "skipped persisted record");
                    skipped += 1;
                },
            }
        }
        info!(installed, expired, skipped, "loaded cache segment");
        Ok(LoadReport::Loaded {
            installed,
            expired,
            skipped,
        })
    }

    /// Saves to `path` via a temporary file and an atomic rename.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<usize, PersistError> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");
        let written = self
            .write_segment_file(&temp_path)
            .and_then(|written| {
                fs::rename(&temp_path, path)?;
                Ok(written)
            })
            .inspect_err(|err| {
                warn!(path = %path.display(), error = %err, "failed to persist cache segment");
                let _ = fs::remove_file(&temp_path);
            })?;
        Ok(written)
    }

    fn write_segment_file(&self, path: &Path) -> Result<usize, PersistError> {
        let mut writer = BufWriter::new(File::create(path)?);
        let written = self.save_to(&mut writer)?;
        let file = writer.into_inner().map_err(IntoInnerError::into_error)?;
        file.sync_all()?;
        Ok(written)
    }

    /// Loads from `path`; a missing file is a cold start.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<LoadReport, PersistError> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no persisted cache segment, starting cold");
                return Ok(LoadReport::Cold {
                    reason: format!("no segment at {}", path.display()),
                });
            },
            Err(err) => return Err(err.into()),
        };
        self.load_from(&mut BufReader::new(file), Timestamp::now())
    }
}

impl fmt::Debug for DirCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirCache")
            .field("shards", &self.shard_count())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// A counted reference to a cache entry.
///
/// Holding a handle keeps the entry's payload alive even after it is
/// invalidated, replaced, or expired. Dropping it (or passing it to
/// [`DirCache::release`]) gives the reference back; cloning takes another.
pub struct Handle {
    inner: Arc<CacheInner>,
    entry: EntryRef,
    view: EntryView,
}

impl Handle {
    fn new(inner: &Arc<CacheInner>, entry: EntryRef, view: EntryView) -> Self {
        Self {
            inner: Arc::clone(inner),
            entry,
            view,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.view.key
    }

    pub fn payload(&self) -> &[u8] {
        &self.view.payload
    }

    pub fn expiry(&self) -> Option<Timestamp> {
        self.view.expiry
    }

    /// Weak reference to the underlying entry.
    pub fn entry_ref(&self) -> EntryRef {
        self.entry
    }

    /// Whether both handles refer to the same entry (not merely the same key).
    pub fn same_entry(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) && self.entry == other.entry
    }

    /// Current lifecycle state. Never `Building` for a handle.
    pub fn state(&self) -> EntryState {
        self.inner
            .shard(self.entry.shard)
            .lock()
            .state(self.entry.id)
            .unwrap_or(EntryState::Removing)
    }

    /// Current reference count, this handle included.
    pub fn ref_count(&self) -> u32 {
        self.inner
            .shard(self.entry.shard)
            .lock()
            .refcount(self.entry.id)
            .unwrap_or(0)
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        let added = self
            .inner
            .shard(self.entry.shard)
            .lock()
            .add_ref(self.entry.id);
        debug_assert!(added, "cloned a handle to a freed entry");
        Self {
            inner: Arc::clone(&self.inner),
            entry: self.entry,
            view: self.view.clone(),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.inner.release(self.entry);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.view.key)
            .field("shard", &self.entry.shard)
            .field("slot", &self.entry.id)
            .field("payload_len", &self.view.payload.len())
            .field("expiry", &self.view.expiry)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Exclusive right to populate one key.
///
/// Other callers that ask for the key while this exists wait on it. Commit to
/// publish the entry; abort (or drop) to fail every waiter with
/// [`CacheError::BuildAborted`].
#[must_use = "dropping a Builder aborts the build"]
pub struct Builder {
    inner: Arc<CacheInner>,
    key: CacheKey,
    shard: u32,
    entry: SlotId,
    slot: SlotId,
    finished: bool,
}

impl Builder {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Publishes the entry with a deadline `ttl` from now.
    pub fn commit(
        self,
        payload: impl Into<Arc<[u8]>>,
        ttl: Option<Duration>,
    ) -> Result<Handle, CacheError> {
        let expiry = ttl.map(|ttl| Timestamp::now() + ttl);
        self.commit_at(payload, expiry)
    }

    /// Publishes the entry and hands the builder its reference.
    ///
    /// Waiters get their own references, in registration order. If the key
    /// was invalidated while building, the entry completes unseen: the
    /// builder's handle still reads the payload, waiters get
    /// [`CacheError::BuildAborted`], and the entry is freed on release.
    /// Fails with [`CacheError::OutOfMemory`] if the payload exceeds the
    /// shard's byte budget; the build is then aborted.
    pub fn commit_at(
        mut self,
        payload: impl Into<Arc<[u8]>>,
        expiry: Option<Timestamp>,
    ) -> Result<Handle, CacheError> {
        self.finished = true;
        let inner = &self.inner;
        let entry = EntryRef {
            shard: self.shard,
            id: self.entry,
        };
        let outcome = inner
            .shard(self.shard)
            .lock()
            .commit(self.entry, self.slot, payload.into(), expiry);

        let done = match outcome {
            Ok(done) => done,
            Err(rejected) => {
                inner.counters.inc_build_aborted();
                debug!(key = %self.key, error = %rejected.error, "build rejected on commit");
                fail_waiters(rejected.waiters);
                return Err(rejected.error);
            },
        };

        let builder = Handle::new(inner, entry, done.builder);
        if !done.visible {
            inner.counters.inc_build_aborted();
            debug!(key = %self.key, waiters = done.waiters.len(), "build finished after invalidation");
            fail_waiters(done.waiters);
            return Ok(builder);
        }

        inner.counters.inc_build_committed();
        if let Some(deadline) = expiry {
            inner.schedule(entry, deadline);
        }
        debug!(key = %self.key, waiters = done.waiters.len(), "build committed");

        let handles: Vec<Handle> = done
            .waiter_views
            .into_iter()
            .map(|view| Handle::new(inner, entry, view))
            .collect();
        for ((ticket, waiter), handle) in done.waiters.into_iter().zip(handles) {
            trace!(key = %self.key, ticket, "notifying waiter");
            waiter(Ok(handle));
        }
        Ok(builder)
    }

    /// Discards the build and fails every waiter.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let waiters = self
            .inner
            .shard(self.shard)
            .lock()
            .abort(self.entry, self.slot);
        self.inner.counters.inc_build_aborted();
        debug!(key = %self.key, waiters = waiters.len(), "build aborted");
        fail_waiters(waiters);
    }
}

impl Drop for Builder {
    fn drop(&mut self) {
        self.abort_in_place();
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("key", &self.key)
            .field("shard", &self.shard)
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

fn fail_waiters(waiters: Vec<(u64, Waiter)>) {
    for (_, waiter) in waiters {
        waiter(Err(CacheError::BuildAborted));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::builder::CacheBuilder;

    fn cache() -> DirCache {
        CacheBuilder::new().shards(4).try_build().unwrap()
    }

    fn bytes(b: &[u8]) -> Arc<[u8]> {
        Arc::from(b)
    }

    #[test]
    fn insert_then_lookup_shares_the_entry() {
        let cache = cache();
        let inserted = cache.insert("k", bytes(b"v"), None).unwrap();
        let found = cache.lookup("k").unwrap();

        assert!(inserted.same_entry(&found));
        assert_eq!(found.payload(), b"v");
        assert_eq!(found.ref_count(), 2);
        assert_eq!(found.state(), EntryState::Ready);

        cache.release(inserted);
        assert_eq!(found.ref_count(), 1);
    }

    #[test]
    fn released_entry_is_retained_until_invalidated() {
        let cache = cache();
        drop(cache.insert("k", bytes(b"v"), None).unwrap());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.debug_allocated(), 1);

        assert!(cache.invalidate("k"));
        assert_eq!(cache.debug_allocated(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_keeps_outstanding_handle_readable() {
        let cache = cache();
        assert!(!cache.invalidate("C"));

        let handle = cache.insert("C", bytes(b"payload"), None).unwrap();
        assert!(cache.invalidate("C"));
        assert!(!cache.invalidate("C"));
        assert!(cache.lookup("C").is_none());

        assert_eq!(handle.payload(), b"payload");
        assert_eq!(handle.state(), EntryState::Removing);
        assert_eq!(cache.debug_allocated(), 1);

        drop(handle);
        assert_eq!(cache.debug_allocated(), 0);
        assert_eq!(cache.metrics().reclaimed, 1);
    }

    #[test]
    fn clone_takes_another_reference() {
        let cache = cache();
        let a = cache.insert("k", bytes(b"v"), None).unwrap();
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);
        drop(a);
        assert_eq!(b.ref_count(), 1);
    }

    #[test]
    fn lookup_or_create_hit_drops_closure_uncalled() {
        let cache = cache();
        drop(cache.insert("k", bytes(b"v"), None).unwrap());

        let (tx, rx) = mpsc::channel::<()>();
        let lookup = cache
            .lookup_or_create("k", move |_| tx.send(()).unwrap())
            .unwrap();
        assert!(lookup.is_hit());
        assert!(rx.recv().is_err());
    }

    #[test]
    fn waiters_are_notified_in_registration_order() {
        let cache = cache();
        let builder = cache
            .lookup_or_create("A", |_| {})
            .unwrap()
            .into_builder()
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let mut tickets = Vec::new();
        for n in 0..3 {
            let tx = tx.clone();
            match cache
                .lookup_or_create("A", move |result| tx.send((n, result)).unwrap())
                .unwrap()
            {
                Lookup::Pending(token) => tickets.push(token.ticket()),
                other => panic!("expected pending, got {other:?}"),
            }
        }
        assert!(tickets.windows(2).all(|w| w[0] < w[1]));

        let mine = builder.commit(bytes(b"built"), None).unwrap();
        let order: Vec<usize> = (0..3)
            .map(|_| {
                let (n, result) = rx.recv().unwrap();
                assert!(result.unwrap().same_entry(&mine));
                n
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
        cache.debug_validate_invariants();
    }

    #[test]
    fn aborted_build_fails_waiters_and_allows_rebuild() {
        let cache = cache();
        let builder = cache
            .lookup_or_create("D", |_| {})
            .unwrap()
            .into_builder()
            .unwrap();
        let (tx, rx) = mpsc::channel();
        let joined = cache
            .lookup_or_create("D", move |result| tx.send(result).unwrap())
            .unwrap();
        assert!(joined.is_pending());

        builder.abort();
        assert_eq!(rx.recv().unwrap().unwrap_err(), CacheError::BuildAborted);
        assert!(cache.lookup_or_create("D", |_| {}).unwrap().is_build());
    }

    #[test]
    fn dropping_builder_aborts() {
        let cache = cache();
        let builder = cache.lookup_or_create("x", |_| {}).unwrap();
        let (tx, rx) = mpsc::channel();
        let _ = cache
            .lookup_or_create("x", move |result| tx.send(result).unwrap())
            .unwrap();
        drop(builder);

        assert_eq!(rx.recv().unwrap().unwrap_err(), CacheError::BuildAborted);
        assert_eq!(cache.metrics().builds_aborted, 1);
        assert_eq!(cache.debug_allocated(), 0);
    }

    #[test]
    fn insert_during_build_is_key_in_use() {
        let cache = cache();
        let _builder = cache.lookup_or_create("k", |_| {}).unwrap();
        assert_eq!(
            cache.insert("k", bytes(b"v"), None).unwrap_err(),
            CacheError::KeyInUse
        );
        assert_eq!(cache.metrics().insert_failures, 1);
    }

    #[test]
    fn sweep_expires_zero_ttl_entry() {
        let cache = cache();
        let handle = cache.insert("B", bytes(b"v"), Some(Duration::ZERO)).unwrap();
        cache.release(handle);

        assert_eq!(cache.sweep(Timestamp::now()), 1);
        assert!(cache.lookup("B").is_none());
        assert_eq!(cache.debug_allocated(), 0);
        assert_eq!(cache.sweep(Timestamp::now()), 0);
    }

    #[test]
    fn sweep_skips_replaced_entries() {
        let cache = cache();
        let t0 = Timestamp::from_millis(1_000);
        drop(cache.insert_at("k", bytes(b"old"), Some(t0)).unwrap());
        drop(cache.insert_at("k", bytes(b"new"), None).unwrap());

        assert_eq!(cache.sweep(t0), 0);
        assert_eq!(cache.metrics().stale_expiry_nodes, 1);
        assert_eq!(cache.lookup("k").unwrap().payload(), b"new");
    }

    #[test]
    fn compact_expiry_drops_dead_nodes() {
        let cache = cache();
        let far = Timestamp::from_millis(u64::MAX / 2);
        drop(cache.insert_at("a", bytes(b"1"), Some(far)).unwrap());
        drop(cache.insert_at("b", bytes(b"2"), Some(far)).unwrap());
        assert!(cache.invalidate("a"));

        assert_eq!(cache.compact_expiry(), 1);
        assert_eq!(cache.metrics().expiry_queue_len, 1);
        assert_eq!(cache.next_deadline(), Some(far));
    }

    #[test]
    fn capacity_is_a_hard_limit() {
        let cache = CacheBuilder::new().shards(1).capacity(2).try_build().unwrap();
        let _a = cache.insert("a", bytes(b"1"), None).unwrap();
        let _b = cache.insert("b", bytes(b"2"), None).unwrap();
        assert_eq!(
            cache.insert("c", bytes(b"3"), None).unwrap_err(),
            CacheError::OutOfMemory { limit: 2 }
        );
        assert!(matches!(
            cache.lookup_or_create("d", |_| {}),
            Err(CacheError::OutOfMemory { limit: 2 })
        ));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn rejected_build_drops_closure_outside_the_lock() {
        let cache = CacheBuilder::new().shards(1).capacity(1).try_build().unwrap();
        let held = cache.insert("a", bytes(b"1"), None).unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                // The closure owns a handle into the same (full) shard.
                let result = cache.lookup_or_create("b", move |_| drop(held));
                tx.send(result.map(|lookup| lookup.is_build())).unwrap();
            })
        };

        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("lookup_or_create returned");
        assert_eq!(result, Err(CacheError::OutOfMemory { limit: 1 }));
        worker.join().unwrap();

        let a = cache.lookup("a").unwrap();
        assert_eq!(a.ref_count(), 1, "closure's handle was released");
        cache.debug_validate_invariants();
    }

    #[test]
    fn failed_persist_removes_temp_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("cache.seg");
        // A non-empty directory at the target makes the final rename fail.
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("occupied"), b"x").unwrap();

        let cache = cache();
        drop(cache.insert("k", bytes(b"v"), None).unwrap());
        let err = cache.persist(&target).unwrap_err();

        assert!(matches!(err, PersistError::Io(_)));
        assert!(!target.with_extension("tmp").exists());
        assert!(target.join("occupied").exists());
    }

    #[test]
    fn metrics_track_hits_and_misses() {
        let cache = cache();
        drop(cache.insert("k", bytes(b"v"), None).unwrap());
        let _ = cache.lookup("k");
        let _ = cache.lookup("missing");

        let snap = cache.metrics();
        assert_eq!(snap.lookups, 2);
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.entries, 1);
        assert_eq!(snap.resident_bytes, 1);
        assert!((snap.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
