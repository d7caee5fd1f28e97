//! Open-directory slots: one per key with a build in flight.
//!
//! A slot records which arena entry is being built and who is waiting for it.
//! Waiters are completion closures, kept in registration order and invoked
//! exactly once by the cache after the shard lock is released.

use crate::ds::SlotId;
use crate::error::CacheError;
use crate::key::CacheKey;

/// Completion closure registered by a latecomer to an in-flight build.
///
/// Receives a new handle to the finished entry, or
/// [`CacheError::BuildAborted`] if the build failed or was invalidated.
pub type Waiter = Box<dyn FnOnce(Result<crate::Handle, CacheError>) + Send + 'static>;

pub(crate) struct OpenDirSlot {
    pub(crate) key: CacheKey,
    pub(crate) entry: SlotId,
    pub(crate) waiters: Vec<(u64, Waiter)>,
}

impl OpenDirSlot {
    pub(crate) fn new(key: CacheKey, entry: SlotId) -> Self {
        Self {
            key,
            entry,
            waiters: Vec::new(),
        }
    }
}

impl std::fmt::Debug for OpenDirSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenDirSlot")
            .field("key", &self.key)
            .field("entry", &self.entry)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

/// Registration returned to a caller that joined an in-flight build.
///
/// The result arrives through the closure passed to
/// [`DirCache::lookup_or_create`](crate::DirCache::lookup_or_create); the token
/// identifies that registration for logging and correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitToken {
    pub(crate) key: CacheKey,
    pub(crate) ticket: u64,
}

impl WaitToken {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Per-shard registration number, increasing in registration order.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}
