//! Sharded, reference-counted entry storage and the open-directory table.
//!
//! [`shard`] holds the per-partition state machine; [`entry`] and
//! [`open_dir`] define what it stores. The public surface built on top of
//! these is [`DirCache`](crate::DirCache).

pub mod entry;
pub mod open_dir;
pub(crate) mod shard;

pub use entry::{EntryRef, EntryState};
pub use open_dir::{WaitToken, Waiter};
