//! shardstore storage engine
//!
//! This crate implements the object store:
//! - Shard runtime (one single-threaded worker per shard, FIFO message queues)
//! - Storage interface (`ObjectStore`, `Collection`, `Object`)
//! - In-memory engine with sparse page-granular object data

pub mod interface;
pub mod mem;
pub mod shard;

// Re-exports
pub use interface::{
    AllocHint, AttrCursor, Collection, KeyPage, KvPage, Object, ObjectStat, ObjectStore,
};
pub use mem::{MemCollection, MemObject, MemStore};
pub use shard::{Pending, ShardRuntime, current_shard};
