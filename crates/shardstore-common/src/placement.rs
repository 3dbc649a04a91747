//! Shard placement
//!
//! Collections and objects are pinned to a home shard by hashing their
//! name. The hash is xxHash64 with seed 0: stable for the lifetime of a
//! process, not promised stable across releases.

use crate::types::ShardId;

/// Hash an id for placement
#[must_use]
pub fn placement_hash(id: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(id, 0)
}

/// Home shard of an id among `shard_count` shards
///
/// # Panics
///
/// Panics if `shard_count` is zero.
#[must_use]
pub fn shard_for(id: &[u8], shard_count: usize) -> ShardId {
    assert!(shard_count > 0, "shard count must be positive");
    ShardId::new((placement_hash(id) % shard_count as u64) as usize)
}
