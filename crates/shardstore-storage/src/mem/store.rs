//! In-memory store handle

use super::collection::MemCollection;
use super::state::ShardState;
use crate::interface::ObjectStore;
use crate::shard::{Pending, ShardRuntime};
use async_trait::async_trait;
use futures::future::join_all;
use shardstore_common::{CollectionId, ObjectId, Result, ShardId, StoreConfig};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// In-memory, shard-per-core object store
///
/// Cloning the handle takes a reference; dropping it releases one. When the
/// last handle (including collection and object handles) is gone, the
/// shard workers stop and every object is freed.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: StoreConfig,
    runtime: ShardRuntime<ShardState>,
    next_incarnation: AtomicU64,
}

impl MemStore {
    /// Start a store with `config.shards` workers
    pub fn open(config: StoreConfig) -> Result<Self> {
        let runtime = ShardRuntime::start(&config)?;
        info!(
            shards = config.shards,
            page_size = config.page_size,
            "memory store opened"
        );
        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                runtime,
                next_incarnation: AtomicU64::new(1),
            }),
        })
    }

    /// Number of shards
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.inner.runtime.shard_count()
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Number of live handles sharing this store
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Home shard of a collection
    #[must_use]
    pub fn collection_home(&self, cid: &CollectionId) -> ShardId {
        self.inner.runtime.shard_for(cid.as_bytes())
    }

    /// Home shard of an object
    #[must_use]
    pub fn object_home(&self, oid: &ObjectId) -> ShardId {
        self.inner.runtime.shard_for(oid.as_bytes())
    }

    /// Shard of this store the caller is running on, if any
    #[must_use]
    pub fn local_shard(&self) -> Option<ShardId> {
        self.inner.runtime.local_shard()
    }

    /// Run the future produced by `f` as a task on `shard`
    ///
    /// Store operations issued from that task against objects or
    /// collections homed on `shard` run inline.
    pub fn submit_to<T, F, Fut>(&self, shard: ShardId, f: F) -> Pending<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        self.inner.runtime.submit_to(shard, f)
    }

    /// Number of objects held across all shards
    pub async fn object_count(&self) -> Result<usize> {
        let counts = join_all(
            (0..self.shard_count())
                .map(|index| self.exec(ShardId::new(index), |state| Ok(state.object_count()))),
        )
        .await;
        counts.into_iter().sum()
    }

    pub(crate) fn page_size(&self) -> usize {
        self.inner.config.page_size
    }

    pub(crate) fn next_incarnation(&self) -> u64 {
        self.inner.next_incarnation.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `f` against the state of `shard`, inline when already there
    pub(crate) async fn exec<T, F>(&self, shard: ShardId, f: F) -> Result<T>
    where
        F: FnOnce(&mut ShardState) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.runtime.run_on(shard, f).await?
    }

    /// Run `f` against the state of `shard` behind everything queued there
    pub(crate) async fn exec_queued<T, F>(&self, shard: ShardId, f: F) -> Result<T>
    where
        F: FnOnce(&mut ShardState) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.runtime.run_queued(shard, f).await?
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    type Collection = MemCollection;

    async fn lookup_collection(&self, cid: CollectionId) -> Result<MemCollection> {
        let home = self.collection_home(&cid);
        let key = cid.clone();
        self.exec(home, move |state| state.collection(&key).map(|_| ()))
            .await?;
        Ok(MemCollection::new(self.clone(), cid, home))
    }

    async fn create_collection(&self, cid: CollectionId) -> Result<MemCollection> {
        let home = self.collection_home(&cid);
        let key = cid.clone();
        self.exec(home, move |state| state.create_collection(&key))
            .await?;
        debug!(collection = %cid, shard = %home, "collection created");
        Ok(MemCollection::new(self.clone(), cid, home))
    }

    async fn list_collections(&self) -> Result<Vec<CollectionId>> {
        let per_shard = join_all(
            (0..self.shard_count())
                .map(|index| self.exec(ShardId::new(index), |state| Ok(state.collection_ids()))),
        )
        .await;

        let mut ids = Vec::new();
        for shard_ids in per_shard {
            ids.extend(shard_ids?);
        }
        ids.sort();
        Ok(ids)
    }
}

impl fmt::Debug for MemStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemStore")
            .field("shards", &self.shard_count())
            .field("page_size", &self.page_size())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::Collection;
    use shardstore_common::ErrorKind;

    fn open(shards: usize) -> MemStore {
        MemStore::open(StoreConfig::with_shards(shards).page_size(256)).unwrap()
    }

    fn cid(name: &str) -> CollectionId {
        CollectionId::new(name).unwrap()
    }

    #[test]
    fn test_open_rejects_bad_config() {
        let err = MemStore::open(StoreConfig::with_shards(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(MemStore::open(StoreConfig::with_shards(1).page_size(1000)).is_err());
    }

    #[tokio::test]
    async fn test_create_and_lookup_collection() {
        let store = open(4);
        let coll = store.create_collection(cid("pg_1.0")).await.unwrap();
        assert_eq!(coll.home_shard(), store.collection_home(&cid("pg_1.0")));

        let err = store.create_collection(cid("pg_1.0")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let found = store.lookup_collection(cid("pg_1.0")).await.unwrap();
        assert_eq!(found.id(), &cid("pg_1.0"));

        let err = store.lookup_collection(cid("missing")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_collections_sorted() {
        let store = open(3);
        for name in ["c", "a", "e", "b", "d"] {
            store.create_collection(cid(name)).await.unwrap();
        }
        let ids = store.list_collections().await.unwrap();
        assert_eq!(ids, ["a", "b", "c", "d", "e"].map(cid).to_vec());
    }

    #[tokio::test]
    async fn test_routing_is_stable() {
        let store = open(8);
        for i in 0..50 {
            let name = cid(&format!("coll-{i}"));
            let home = store.collection_home(&name);
            assert_eq!(home, store.collection_home(&name));
            assert!(home.index() < 8);
            let coll = store.create_collection(name).await.unwrap();
            assert_eq!(coll.home_shard(), home);
        }
    }

    #[tokio::test]
    async fn test_ref_count_tracks_handles() {
        let store = open(2);
        assert_eq!(store.ref_count(), 1);
        let other = store.clone();
        assert_eq!(store.ref_count(), 2);

        let coll = other.create_collection(cid("c")).await.unwrap();
        assert_eq!(store.ref_count(), 3);
        drop(coll);
        drop(other);
        assert_eq!(store.ref_count(), 1);
    }

    #[tokio::test]
    async fn test_last_handle_dropped_on_shard() {
        let store = open(2);
        let shard = ShardId::new(1);
        let moved = store.clone();
        drop(store);
        // The final reference goes away on one of the store's own workers.
        let seen = moved
            .clone()
            .submit_to(shard, move || async move {
                let here = moved.local_shard();
                drop(moved);
                here
            });
        assert_eq!(seen.await.unwrap(), Some(shard));
    }
}
