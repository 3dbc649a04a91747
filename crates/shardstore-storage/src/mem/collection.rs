//! In-memory collection handle

use super::object::MemObject;
use super::state::ObjectState;
use super::store::MemStore;
use crate::interface::Collection;
use async_trait::async_trait;
use shardstore_common::{CollectionId, ObjectId, Result, ShardId};
use std::fmt;
use tracing::debug;

/// Handle to a collection
///
/// The object map lives on the collection's home shard; every operation is
/// routed there.
#[derive(Clone)]
pub struct MemCollection {
    store: MemStore,
    cid: CollectionId,
    home: ShardId,
}

impl MemCollection {
    pub(crate) fn new(store: MemStore, cid: CollectionId, home: ShardId) -> Self {
        Self { store, cid, home }
    }

    pub(crate) fn store(&self) -> &MemStore {
        &self.store
    }

    /// Bind a reserved name to its object, or drop the reservation
    pub(crate) async fn finish_reservation(
        &self,
        oid: &ObjectId,
        incarnation: Option<u64>,
    ) -> Result<()> {
        let cid = self.cid.clone();
        let oid = oid.clone();
        self.store
            .exec(self.home, move |state| {
                let coll = state.collection_mut(&cid)?;
                match incarnation {
                    Some(incarnation) => coll.publish(&oid, incarnation),
                    None => coll.release(&oid),
                }
                Ok(())
            })
            .await
    }

    pub(crate) async fn reserve(&self, oid: &ObjectId) -> Result<()> {
        let cid = self.cid.clone();
        let oid = oid.clone();
        self.store
            .exec(self.home, move |state| state.collection_mut(&cid)?.reserve(&oid))
            .await
    }

    /// Incarnation currently bound to `oid`
    pub(crate) async fn live(&self, oid: &ObjectId) -> Result<u64> {
        let cid = self.cid.clone();
        let oid = oid.clone();
        self.store
            .exec(self.home, move |state| state.collection(&cid)?.live(&oid))
            .await
    }

    /// Unbind `oid` if it still names `incarnation`
    pub(crate) async fn detach_if(&self, oid: &ObjectId, incarnation: u64) -> Result<bool> {
        let cid = self.cid.clone();
        let oid = oid.clone();
        self.store
            .exec(self.home, move |state| {
                Ok(state.collection_mut(&cid)?.detach_if(&oid, incarnation))
            })
            .await
    }
}

#[async_trait]
impl Collection for MemCollection {
    type Object = MemObject;

    fn id(&self) -> &CollectionId {
        &self.cid
    }

    fn home_shard(&self) -> ShardId {
        self.home
    }

    async fn create_object(&self, oid: ObjectId) -> Result<MemObject> {
        self.reserve(&oid).await?;

        let home = self.store.object_home(&oid);
        let incarnation = self.store.next_incarnation();
        let page_size = self.store.page_size();
        let installed = self
            .store
            .exec(home, move |state| {
                state.insert_object(incarnation, ObjectState::new(page_size));
                Ok(())
            })
            .await;
        if let Err(e) = installed {
            self.finish_reservation(&oid, None).await?;
            return Err(e);
        }
        self.finish_reservation(&oid, Some(incarnation)).await?;

        debug!(collection = %self.cid, oid = %oid, shard = %home, "object created");
        Ok(MemObject::new(self.clone(), oid, home, incarnation))
    }

    async fn lookup_object(&self, oid: ObjectId) -> Result<MemObject> {
        let incarnation = self.live(&oid).await?;
        let home = self.store.object_home(&oid);
        Ok(MemObject::new(self.clone(), oid, home, incarnation))
    }

    async fn remove_object(&self, oid: ObjectId) -> Result<()> {
        let cid = self.cid.clone();
        let name = oid.clone();
        let incarnation = self
            .store
            .exec(self.home, move |state| state.collection_mut(&cid)?.detach(&name))
            .await?;

        // Free the state only after everything already queued against it.
        let home = self.store.object_home(&oid);
        self.store
            .exec_queued(home, move |state| {
                state.take_object(incarnation);
                Ok(())
            })
            .await?;

        debug!(collection = %self.cid, oid = %oid, "object removed");
        Ok(())
    }

    async fn list_objects(
        &self,
        start_after: Option<ObjectId>,
        limit: usize,
    ) -> Result<(Vec<ObjectId>, bool)> {
        let cid = self.cid.clone();
        self.store
            .exec(self.home, move |state| {
                Ok(state.collection(&cid)?.list(start_after.as_ref(), limit))
            })
            .await
    }
}

impl fmt::Debug for MemCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemCollection")
            .field("cid", &self.cid)
            .field("home", &self.home)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Object, ObjectStore};
    use bytes::Bytes;
    use shardstore_common::{ByteRange, ErrorKind, StoreConfig};

    async fn collection(shards: usize) -> (MemStore, MemCollection) {
        let store = MemStore::open(StoreConfig::with_shards(shards)).unwrap();
        let coll = store
            .create_collection(CollectionId::new("meta").unwrap())
            .await
            .unwrap();
        (store, coll)
    }

    fn oid(name: &str) -> ObjectId {
        ObjectId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_create_duplicate_lookup() {
        let (store, coll) = collection(4).await;
        let obj = coll.create_object(oid("a")).await.unwrap();
        assert_eq!(obj.home_shard(), store.object_home(&oid("a")));

        let err = coll.create_object(oid("a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let found = coll.lookup_object(oid("a")).await.unwrap();
        assert_eq!(found.oid(), &oid("a"));
        assert_eq!(found.collection_id(), coll.id());

        let err = coll.lookup_object(oid("b")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_remove_invalidates_handles() {
        let (store, coll) = collection(3).await;
        let obj = coll.create_object(oid("victim")).await.unwrap();
        obj.write(0, Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(store.object_count().await.unwrap(), 1);

        coll.remove_object(oid("victim")).await.unwrap();
        assert_eq!(store.object_count().await.unwrap(), 0);

        let err = obj.read(ByteRange::new(0, 4)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = coll.remove_object(oid("victim")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // A new object under the same name is not reachable through the
        // old handle.
        let fresh = coll.create_object(oid("victim")).await.unwrap();
        assert!(obj.stat().await.unwrap_err().is_not_found());
        assert_eq!(fresh.stat().await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_list_objects_paginates() {
        let (_store, coll) = collection(2).await;
        for i in 0..25 {
            coll.create_object(oid(&format!("obj{i:02}"))).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut after = None;
        loop {
            let (page, more) = coll.list_objects(after.clone(), 10).await.unwrap();
            after = page.last().cloned();
            seen.extend(page);
            if !more {
                break;
            }
        }
        let expected: Vec<_> = (0..25).map(|i| oid(&format!("obj{i:02}"))).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_concurrent_creates_of_one_name() {
        let (_store, coll) = collection(4).await;
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let coll = coll.clone();
                tokio::spawn(async move { coll.create_object(oid("contended")).await })
            })
            .collect();

        let mut created = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(e.is_already_exists()),
            }
        }
        assert_eq!(created, 1);
    }
}
