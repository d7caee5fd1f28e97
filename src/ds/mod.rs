pub mod expiry_queue;
pub mod shard;
pub mod slot_arena;

pub use expiry_queue::ExpiryQueue;
pub use shard::ShardSelector;
pub use slot_arena::{ArenaFull, SlotArena, SlotId};
