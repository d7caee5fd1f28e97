//! One key-space partition of the cache directory.
//!
//! Everything a key's lifecycle touches lives in the same shard and is
//! mutated under that shard's single lock:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ Shard                                                                │
//! │                                                                      │
//! │  index: FxHashMap<CacheKey, SlotId> ──► entries: SlotArena<Entry>    │
//! │         (current Ready entry per key)     Building / Ready / Removing│
//! │                                                ▲                     │
//! │  open_index: FxHashMap<CacheKey, SlotId>       │ entry               │
//! │         │                                      │                     │
//! │         └──────────────► open: SlotArena<OpenDirSlot> (waiters)      │
//! │                                                                      │
//! │  resident_bytes / max_bytes                                          │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Methods here never run callbacks and never build handles; they return
//! plain outcomes, and the caller acts on them after dropping the lock.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::ds::{SlotArena, SlotId};
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::persist::Record;
use crate::store::entry::{EntryRecord, EntryState, EntryView};
use crate::store::open_dir::{OpenDirSlot, Waiter};
use crate::time::Timestamp;

/// Result of [`Shard::lookup_or_create`].
pub(crate) enum ShardLookup {
    Hit { id: SlotId, view: EntryView, unused: Waiter },
    Build { entry: SlotId, slot: SlotId, unused: Waiter },
    Pending { ticket: u64 },
    /// No room for a Building entry; the waiter comes back uncalled.
    Rejected { error: CacheError, unused: Waiter },
}

/// Result of [`Shard::commit`].
pub(crate) struct Committed {
    pub(crate) builder: EntryView,
    /// `false` when an invalidation won the race; the entry completed as Removing.
    pub(crate) visible: bool,
    pub(crate) waiters: Vec<(u64, Waiter)>,
    /// One acquired view per waiter, same order; empty unless `visible`.
    pub(crate) waiter_views: Vec<EntryView>,
}

/// Result of [`Shard::commit`] when the payload does not fit.
pub(crate) struct CommitRejected {
    pub(crate) error: CacheError,
    pub(crate) waiters: Vec<(u64, Waiter)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expired {
    /// Entry retired; `freed` if no handle was outstanding.
    Retired { freed: bool },
    /// Slot already freed, reused, or retired by someone else.
    Stale,
}

#[derive(Debug)]
pub(crate) struct Shard {
    entries: SlotArena<EntryRecord>,
    index: FxHashMap<CacheKey, SlotId>,
    open: SlotArena<OpenDirSlot>,
    open_index: FxHashMap<CacheKey, SlotId>,
    resident_bytes: usize,
    max_bytes: Option<usize>,
    next_ticket: u64,
}

impl Shard {
    pub(crate) fn new(max_entries: Option<usize>, max_bytes: Option<usize>) -> Self {
        let entries = match max_entries {
            Some(limit) => SlotArena::with_limit(limit),
            None => SlotArena::new(),
        };
        Self {
            entries,
            index: FxHashMap::default(),
            open: SlotArena::new(),
            open_index: FxHashMap::default(),
            resident_bytes: 0,
            max_bytes,
            next_ticket: 0,
        }
    }

    // -- Cache store ------------------------------------------------------

    /// New reference to the Ready entry for `key`.
    pub(crate) fn lookup(&mut self, key: &[u8]) -> Option<(SlotId, EntryView)> {
        let id = *self.index.get(key)?;
        let entry = self.entries.get_mut(id)?;
        debug_assert_eq!(entry.state, EntryState::Ready);
        Some((id, entry.acquire()))
    }

    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    /// Installs a Ready entry with refcount 1, retiring any prior one.
    ///
    /// Nothing is modified unless the insert succeeds.
    pub(crate) fn insert(
        &mut self,
        key: CacheKey,
        payload: Arc<[u8]>,
        expiry: Option<Timestamp>,
    ) -> Result<(SlotId, EntryView), CacheError> {
        if self.has_active_builder(&key) {
            return Err(CacheError::KeyInUse);
        }

        // Bytes and slot the prior entry gives back if it goes away right now.
        let prior = self.index.get(key.as_bytes()).copied();
        let (freed_bytes, frees_slot) = prior
            .and_then(|id| self.entries.get(id))
            .filter(|entry| entry.refcount == 0)
            .map_or((0, false), |entry| (entry.payload.len(), true));

        self.check_bytes(payload.len(), freed_bytes)?;
        if let Some(limit) = self.entries.limit() {
            if self.entries.len() >= limit && !frees_slot {
                return Err(CacheError::OutOfMemory { limit });
            }
        }

        self.detach_retired_build(&key);
        if let Some(prior) = prior {
            self.retire(prior);
        }

        let len = payload.len();
        let record = EntryRecord::ready(key.clone(), payload, expiry);
        let view = record.view();
        let id = self
            .entries
            .try_insert(record)
            .map_err(|full| CacheError::OutOfMemory { limit: full.limit })?;
        self.resident_bytes += len;
        self.index.insert(key, id);
        Ok((id, view))
    }

    /// Adds a reference to a live entry (handle clone).
    pub(crate) fn add_ref(&mut self, id: SlotId) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.refcount += 1;
                true
            },
            None => false,
        }
    }

    /// Drops one reference; returns `true` if the entry was freed.
    pub(crate) fn release(&mut self, id: SlotId) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            debug_assert!(false, "release of a freed entry");
            return false;
        };
        debug_assert!(entry.refcount > 0, "refcount underflow");
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 && entry.state == EntryState::Removing {
            self.free(id);
            return true;
        }
        false
    }

    /// Retires the Ready entry or the in-flight build for `key`.
    ///
    /// Returns `false` if there was nothing live to retire.
    pub(crate) fn invalidate(&mut self, key: &[u8]) -> bool {
        if let Some(id) = self.index.get(key).copied() {
            self.retire(id);
            return true;
        }
        let building = self
            .open_index
            .get(key)
            .and_then(|slot| self.open.get(*slot))
            .map(|slot| slot.entry);
        if let Some(entry) = building.and_then(|id| self.entries.get_mut(id)) {
            if entry.state == EntryState::Building {
                entry.state = EntryState::Removing;
                return true;
            }
        }
        false
    }

    /// Retires a Ready entry through a weak reference.
    pub(crate) fn expire(&mut self, id: SlotId) -> Expired {
        if !self.is_live(id) {
            return Expired::Stale;
        }
        Expired::Retired {
            freed: self.retire(id),
        }
    }

    pub(crate) fn is_live(&self, id: SlotId) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.state == EntryState::Ready)
    }

    pub(crate) fn state(&self, id: SlotId) -> Option<EntryState> {
        self.entries.get(id).map(|entry| entry.state)
    }

    pub(crate) fn refcount(&self, id: SlotId) -> Option<u32> {
        self.entries.get(id).map(|entry| entry.refcount)
    }

    /// Retires every Ready entry; returns how many.
    pub(crate) fn clear(&mut self) -> usize {
        let ids: Vec<SlotId> = self.index.values().copied().collect();
        for id in &ids {
            self.retire(*id);
        }
        ids.len()
    }

    /// Ready entries as persistable records.
    pub(crate) fn snapshot(&self) -> Vec<Record> {
        self.index
            .values()
            .filter_map(|id| self.entries.get(*id))
            .map(|entry| Record {
                key: entry.key.clone(),
                payload: Arc::clone(&entry.payload),
                expiry: entry.expiry,
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Arena slots in use, Building and Removing entries included.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn allocated(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn open_builds(&self) -> usize {
        self.open.len()
    }

    pub(crate) fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    // -- Open directory ---------------------------------------------------

    /// Joins, starts, or short-circuits a build for `key`.
    pub(crate) fn lookup_or_create(
        &mut self,
        key: CacheKey,
        waiter: Waiter,
    ) -> ShardLookup {
        if let Some(slot_id) = self.open_index.get(key.as_bytes()).copied() {
            let building = self
                .open
                .get(slot_id)
                .and_then(|slot| self.entries.get(slot.entry))
                .is_some_and(|entry| entry.state == EntryState::Building);
            if building {
                let ticket = self.next_ticket;
                self.next_ticket += 1;
                if let Some(slot) = self.open.get_mut(slot_id) {
                    slot.waiters.push((ticket, waiter));
                }
                return ShardLookup::Pending { ticket };
            }
            // Invalidated mid-build: leave the old build to finish unseen.
            self.open_index.remove(key.as_bytes());
        }

        if let Some((id, view)) = self.lookup(key.as_bytes()) {
            return ShardLookup::Hit {
                id,
                view,
                unused: waiter,
            };
        }

        let entry = match self.entries.try_insert(EntryRecord::building(key.clone())) {
            Ok(entry) => entry,
            Err(full) => {
                return ShardLookup::Rejected {
                    error: CacheError::OutOfMemory { limit: full.limit },
                    unused: waiter,
                };
            },
        };
        let slot = self.open.insert(OpenDirSlot::new(key.clone(), entry));
        self.open_index.insert(key, slot);
        ShardLookup::Build {
            entry,
            slot,
            unused: waiter,
        }
    }

    /// Completes a build: tears down its slot and, unless invalidated,
    /// publishes the entry, all in one critical section.
    pub(crate) fn commit(
        &mut self,
        entry_id: SlotId,
        slot_id: SlotId,
        payload: Arc<[u8]>,
        expiry: Option<Timestamp>,
    ) -> Result<Committed, CommitRejected> {
        let waiters = self.close_slot(slot_id);

        let Some(state) = self.state(entry_id) else {
            return Err(CommitRejected {
                error: CacheError::BuildAborted,
                waiters,
            });
        };

        let prior = (state == EntryState::Building)
            .then(|| self.index.get(self.key_of(entry_id)?).copied())
            .flatten();
        let freed_bytes = prior
            .and_then(|id| self.entries.get(id))
            .filter(|entry| entry.refcount == 0)
            .map_or(0, |entry| entry.payload.len());
        if let Err(error) = self.check_bytes(payload.len(), freed_bytes) {
            self.entries.remove(entry_id);
            return Err(CommitRejected { error, waiters });
        }

        if let Some(prior) = prior {
            self.retire(prior);
        }

        let len = payload.len();
        self.resident_bytes += len;
        let Some(entry) = self.entries.get_mut(entry_id) else {
            self.resident_bytes -= len;
            return Err(CommitRejected {
                error: CacheError::BuildAborted,
                waiters,
            });
        };
        entry.payload = payload;
        entry.expiry = expiry;

        if entry.state != EntryState::Building {
            // The builder's own reference carries over to its handle.
            return Ok(Committed {
                builder: entry.view(),
                visible: false,
                waiters,
                waiter_views: Vec::new(),
            });
        }

        entry.state = EntryState::Ready;
        let builder = entry.view();
        let waiter_views = waiters.iter().map(|_| entry.acquire()).collect();
        let key = entry.key.clone();
        self.index.insert(key, entry_id);

        Ok(Committed {
            builder,
            visible: true,
            waiters,
            waiter_views,
        })
    }

    /// Discards a build; returns its waiters so they can be failed.
    pub(crate) fn abort(&mut self, entry_id: SlotId, slot_id: SlotId) -> Vec<(u64, Waiter)> {
        let waiters = self.close_slot(slot_id);
        if self.entries.remove(entry_id).is_none() {
            debug_assert!(false, "aborted build lost its entry");
        }
        waiters
    }

    // -- Internals --------------------------------------------------------

    fn has_active_builder(&self, key: &CacheKey) -> bool {
        self.open_index
            .get(key.as_bytes())
            .and_then(|slot| self.open.get(*slot))
            .and_then(|slot| self.entries.get(slot.entry))
            .is_some_and(|entry| entry.state == EntryState::Building)
    }

    /// Unindexes the open slot for `key` if its build was invalidated.
    fn detach_retired_build(&mut self, key: &CacheKey) {
        if self.open_index.contains_key(key.as_bytes()) && !self.has_active_builder(key) {
            self.open_index.remove(key.as_bytes());
        }
    }

    fn key_of(&self, id: SlotId) -> Option<&[u8]> {
        self.entries.get(id).map(|entry| entry.key.as_bytes())
    }

    fn close_slot(&mut self, slot_id: SlotId) -> Vec<(u64, Waiter)> {
        let Some(slot) = self.open.remove(slot_id) else {
            return Vec::new();
        };
        if self.open_index.get(slot.key.as_bytes()) == Some(&slot_id) {
            self.open_index.remove(slot.key.as_bytes());
        }
        slot.waiters
    }

    fn check_bytes(&self, incoming: usize, freed: usize) -> Result<(), CacheError> {
        match self.max_bytes {
            Some(limit) if self.resident_bytes - freed + incoming > limit => {
                Err(CacheError::OutOfMemory { limit })
            },
            _ => Ok(()),
        }
    }

    /// Marks an entry Removing and unindexes it; frees it if unreferenced.
    fn retire(&mut self, id: SlotId) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        entry.state = EntryState::Removing;
        let unreferenced = entry.refcount == 0;
        if self.index.get(entry.key.as_bytes()) == Some(&id) {
            self.index.remove(entry.key.as_bytes());
        }
        if unreferenced {
            self.free(id);
        }
        unreferenced
    }

    fn free(&mut self, id: SlotId) {
        if let Some(entry) = self.entries.remove(id) {
            self.resident_bytes -= entry.payload.len();
        }
    }

    /// Validates cross-structure invariants (debug/test builds only).
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn debug_validate_invariants(&self) {
        self.entries.debug_validate_invariants();
        for (key, id) in &self.index {
            let entry = self.entries.get(*id).expect("indexed entry is live");
            assert_eq!(entry.state, EntryState::Ready);
            assert_eq!(&entry.key, key);
        }
        for (key, slot_id) in &self.open_index {
            let slot = self.open.get(*slot_id).expect("indexed slot is live");
            assert_eq!(&slot.key, key);
            assert!(self.entries.contains(slot.entry));
            assert!(!self.index.contains_key(key.as_bytes()));
        }
        let bytes: usize = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state != EntryState::Building)
            .map(|(_, entry)| entry.payload.len())
            .sum();
        assert_eq!(bytes, self.resident_bytes);
        for (_, entry) in self.entries.iter() {
            assert!(
                entry.state != EntryState::Removing || entry.refcount > 0,
                "unreferenced Removing entry {:?} was not reclaimed",
                entry.key
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Waiter {
        Box::new(|_| {})
    }

    fn payload(bytes: &[u8]) -> Arc<[u8]> {
        Arc::from(bytes)
    }

    fn start_build(shard: &mut Shard, key: &str) -> (SlotId, SlotId) {
        match shard.lookup_or_create(CacheKey::from(key), noop()) {
            ShardLookup::Build { entry, slot, .. } => (entry, slot),
            _ => panic!("expected to become the builder"),
        }
    }

    #[test]
    fn insert_lookup_release_keeps_ready_entry() {
        let mut shard = Shard::new(None, None);
        let (id, view) = shard.insert("a".into(), payload(b"1"), None).unwrap();
        assert_eq!(&*view.payload, b"1");
        assert_eq!(shard.refcount(id), Some(1));

        assert!(!shard.release(id));
        assert_eq!(shard.refcount(id), Some(0));
        assert!(shard.lookup(b"a").is_some());
        shard.debug_validate_invariants();
    }

    #[test]
    fn replace_retires_prior_entry() {
        let mut shard = Shard::new(None, None);
        let (old, _) = shard.insert("a".into(), payload(b"old"), None).unwrap();
        let (new, _) = shard.insert("a".into(), payload(b"new"), None).unwrap();

        assert_eq!(shard.state(old), Some(EntryState::Removing));
        assert_eq!(shard.len(), 1);
        assert!(shard.release(old));
        assert_eq!(shard.state(old), None);
        assert_eq!(shard.state(new), Some(EntryState::Ready));
        shard.debug_validate_invariants();
    }

    #[test]
    fn invalidate_defers_free_until_release() {
        let mut shard = Shard::new(None, None);
        let (id, _) = shard.insert("c".into(), payload(b"x"), None).unwrap();

        assert!(shard.invalidate(b"c"));
        assert!(!shard.invalidate(b"c"));
        assert!(shard.lookup(b"c").is_none());
        assert_eq!(shard.allocated(), 1);

        assert!(shard.release(id));
        assert_eq!(shard.allocated(), 0);
        assert_eq!(shard.resident_bytes(), 0);
        shard.debug_validate_invariants();
    }

    #[test]
    fn entry_limit_rejects_without_dropping() {
        let mut shard = Shard::new(Some(1), None);
        let (a, _) = shard.insert("a".into(), payload(b"1"), None).unwrap();
        let err = shard.insert("b".into(), payload(b"2"), None).unwrap_err();
        assert_eq!(err, CacheError::OutOfMemory { limit: 1 });
        assert_eq!(shard.state(a), Some(EntryState::Ready));

        // Replacing an unreferenced entry frees its slot first.
        shard.release(a);
        assert!(shard.insert("a".into(), payload(b"3"), None).is_ok());
        shard.debug_validate_invariants();
    }

    #[test]
    fn byte_budget_is_enforced() {
        let mut shard = Shard::new(None, Some(4));
        shard.insert("a".into(), payload(b"abc"), None).unwrap();
        let err = shard.insert("b".into(), payload(b"de"), None).unwrap_err();
        assert_eq!(err, CacheError::OutOfMemory { limit: 4 });
        assert_eq!(shard.resident_bytes(), 3);
    }

    #[test]
    fn second_caller_joins_the_build() {
        let mut shard = Shard::new(None, None);
        let (entry, slot) = start_build(&mut shard, "A");

        match shard.lookup_or_create("A".into(), noop()) {
            ShardLookup::Pending { ticket } => assert_eq!(ticket, 0),
            _ => panic!("expected to wait"),
        }
        assert_eq!(
            shard.insert("A".into(), payload(b"x"), None).unwrap_err(),
            CacheError::KeyInUse
        );

        let done = shard.commit(entry, slot, payload(b"built"), None).ok().unwrap();
        assert!(done.visible);
        assert_eq!(done.waiters.len(), 1);
        assert_eq!(done.waiter_views.len(), 1);
        assert_eq!(shard.refcount(entry), Some(2));
        assert_eq!(shard.open_builds(), 0);
        shard.debug_validate_invariants();
    }

    #[test]
    fn abort_frees_entry_and_slot() {
        let mut shard = Shard::new(None, None);
        let (entry, slot) = start_build(&mut shard, "D");
        let _ = shard.lookup_or_create("D".into(), noop());

        let waiters = shard.abort(entry, slot);
        assert_eq!(waiters.len(), 1);
        assert_eq!(shard.allocated(), 0);
        assert_eq!(shard.open_builds(), 0);

        let (fresh, _) = start_build(&mut shard, "D");
        assert_ne!(fresh, entry);
    }

    #[test]
    fn invalidate_during_build_wins() {
        let mut shard = Shard::new(None, None);
        let (entry, slot) = start_build(&mut shard, "E");
        let _ = shard.lookup_or_create("E".into(), noop());

        assert!(shard.invalidate(b"E"));
        assert!(!shard.invalidate(b"E"));

        // A new caller starts over instead of joining the doomed build.
        let (entry2, slot2) = start_build(&mut shard, "E");

        let done = shard.commit(entry, slot, payload(b"late"), None).ok().unwrap();
        assert!(!done.visible);
        assert_eq!(done.waiters.len(), 1);
        assert!(shard.lookup(b"E").is_none());
        assert!(shard.release(entry));

        let done2 = shard.commit(entry2, slot2, payload(b"fresh"), None).ok().unwrap();
        assert!(done2.visible);
        let (_, view) = shard.lookup(b"E").unwrap();
        assert_eq!(&*view.payload, b"fresh");
        shard.debug_validate_invariants();
    }

    #[test]
    fn commit_over_budget_is_rejected() {
        let mut shard = Shard::new(None, Some(2));
        let (entry, slot) = start_build(&mut shard, "F");
        let rejected = shard.commit(entry, slot, payload(b"too big"), None).err().unwrap();
        assert_eq!(rejected.error, CacheError::OutOfMemory { limit: 2 });
        assert_eq!(shard.allocated(), 0);
        assert_eq!(shard.open_builds(), 0);
    }

    #[test]
    fn full_arena_hands_the_waiter_back() {
        let mut shard = Shard::new(Some(1), None);
        shard.insert("a".into(), payload(b"1"), None).unwrap();

        match shard.lookup_or_create("b".into(), noop()) {
            ShardLookup::Rejected { error, unused } => {
                assert_eq!(error, CacheError::OutOfMemory { limit: 1 });
                drop(unused);
            },
            _ => panic!("expected the build to be rejected"),
        }
        assert_eq!(shard.open_builds(), 0);
        assert_eq!(shard.allocated(), 1);
    }

    #[test]
    fn expire_is_generation_checked() {
        let mut shard = Shard::new(None, None);
        let (old, _) = shard.insert("g".into(), payload(b"1"), None).unwrap();
        shard.release(old);
        shard.insert("g".into(), payload(b"2"), None).unwrap();

        assert_eq!(shard.expire(old), Expired::Stale);
        assert!(shard.lookup(b"g").is_some());
    }

    #[test]
    fn expire_unreferenced_frees_immediately() {
        let mut shard = Shard::new(None, None);
        let (id, _) = shard.insert("b".into(), payload(b"1"), None).unwrap();
        shard.release(id);
        assert_eq!(shard.expire(id), Expired::Retired { freed: true });
        assert_eq!(shard.expire(id), Expired::Stale);
        assert_eq!(shard.allocated(), 0);
    }
}
