//! Entry records as stored in a shard's arena.

use std::fmt;
use std::sync::Arc;

use crate::ds::SlotId;
use crate::key::CacheKey;
use crate::time::Timestamp;

/// Lifecycle state of a cache entry.
///
/// ```text
///   lookup_or_create ──► Building ──commit──► Ready ──invalidate/expire/replace──► Removing
///                           │                                                      │
///                           └──invalidate (mid-build)──────────────────────────────┤
///                                                                                  ▼
///                                                              freed when refcount hits 0
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Payload is still being produced by its builder.
    Building,
    /// Visible to every lookup.
    Ready,
    /// Retired; outstanding handles keep it alive, new lookups never see it.
    Removing,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Removing => "removing",
        })
    }
}

/// Weak reference to an entry: shard plus generation-checked arena slot.
///
/// Never keeps the entry alive. Resolving it after the slot was freed (or
/// reused) yields nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryRef {
    pub(crate) shard: u32,
    pub(crate) id: SlotId,
}

impl EntryRef {
    pub fn shard(&self) -> usize {
        self.shard as usize
    }

    pub fn slot(&self) -> SlotId {
        self.id
    }
}

#[derive(Debug)]
pub(crate) struct EntryRecord {
    pub(crate) key: CacheKey,
    pub(crate) payload: Arc<[u8]>,
    pub(crate) refcount: u32,
    pub(crate) state: EntryState,
    pub(crate) expiry: Option<Timestamp>,
}

impl EntryRecord {
    pub(crate) fn ready(key: CacheKey, payload: Arc<[u8]>, expiry: Option<Timestamp>) -> Self {
        Self {
            key,
            payload,
            refcount: 1,
            state: EntryState::Ready,
            expiry,
        }
    }

    pub(crate) fn building(key: CacheKey) -> Self {
        Self {
            key,
            payload: Arc::from(&[] as &[u8]),
            refcount: 1,
            state: EntryState::Building,
            expiry: None,
        }
    }

    /// What a new handle carries; taking one bumps the refcount.
    pub(crate) fn acquire(&mut self) -> EntryView {
        self.refcount += 1;
        self.view()
    }

    /// Snapshot without touching the refcount (the caller already owns one).
    pub(crate) fn view(&self) -> EntryView {
        EntryView {
            key: self.key.clone(),
            payload: Arc::clone(&self.payload),
            expiry: self.expiry,
        }
    }
}

/// Immutable data a handle exposes without taking the shard lock.
#[derive(Debug, Clone)]
pub(crate) struct EntryView {
    pub(crate) key: CacheKey,
    pub(crate) payload: Arc<[u8]>,
    pub(crate) expiry: Option<Timestamp>,
}
