//! In-memory object handle
//!
//! A handle names one incarnation of an object: its collection, id, home
//! shard and incarnation number. Every operation is shipped to the home
//! shard (or run inline when the caller is already there) and resolves the
//! incarnation in that shard's state. Once the object is removed or moved
//! away, the incarnation is gone and the handle fails `NotFound`.

use super::collection::MemCollection;
use super::state::ObjectState;
use super::store::MemStore;
use crate::interface::{AllocHint, AttrCursor, Collection, KeyPage, KvPage, Object, ObjectStat};
use async_trait::async_trait;
use bytes::Bytes;
use shardstore_common::{AttrNamespace, ByteRange, CollectionId, Error, ObjectId, Result, ShardId};
use std::fmt;
use tracing::{debug, warn};

/// Handle to an object
#[derive(Clone)]
pub struct MemObject {
    collection: MemCollection,
    oid: ObjectId,
    home: ShardId,
    incarnation: u64,
}

impl MemObject {
    pub(crate) fn new(
        collection: MemCollection,
        oid: ObjectId,
        home: ShardId,
        incarnation: u64,
    ) -> Self {
        Self {
            collection,
            oid,
            home,
            incarnation,
        }
    }

    fn store(&self) -> &MemStore {
        self.collection.store()
    }

    fn not_found(&self) -> Error {
        Error::object_not_found(self.collection.id().as_str(), self.oid.as_str())
    }

    async fn with_state<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ObjectState) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let incarnation = self.incarnation;
        self.store()
            .exec(self.home, move |state| Ok(state.object(incarnation).map(f)))
            .await?
            .unwrap_or_else(|| Err(self.not_found()))
    }

    async fn with_state_mut<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ObjectState) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let incarnation = self.incarnation;
        self.store()
            .exec(self.home, move |state| {
                Ok(state.object_mut(incarnation).map(f))
            })
            .await?
            .unwrap_or_else(|| Err(self.not_found()))
    }

    fn check_same_collection(&self, dest: &Self, op: &str) -> Result<()> {
        if dest.collection.id() != self.collection.id() {
            return Err(Error::invalid_argument(format!(
                "{op} from {} into {}: objects must share a collection",
                self.collection.id(),
                dest.collection.id()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Object for MemObject {
    type Collection = MemCollection;

    fn collection_id(&self) -> &CollectionId {
        self.collection.id()
    }

    fn oid(&self) -> &ObjectId {
        &self.oid
    }

    fn home_shard(&self) -> ShardId {
        self.home
    }

    async fn read(&self, range: ByteRange) -> Result<Bytes> {
        self.with_state(move |object| object.read(range)).await
    }

    async fn write(&self, offset: u64, data: Bytes) -> Result<()> {
        self.with_state_mut(move |object| object.write(offset, &data))
            .await
    }

    async fn zero(&self, range: ByteRange) -> Result<()> {
        self.with_state_mut(move |object| object.zero(range)).await
    }

    async fn hole_punch(&self, range: ByteRange) -> Result<()> {
        self.with_state_mut(move |object| object.hole_punch(range))
            .await
    }

    async fn truncate(&self, length: u64) -> Result<()> {
        self.with_state_mut(move |object| {
            object.truncate(length);
            Ok(())
        })
        .await
    }

    async fn getattr(&self, ns: AttrNamespace, key: String) -> Result<Bytes> {
        self.with_state(move |object| object.getattr(ns, &key)).await
    }

    async fn getattrs(&self, ns: AttrNamespace, keys: Vec<String>) -> Result<Vec<Bytes>> {
        self.with_state(move |object| object.getattrs(ns, &keys))
            .await
    }

    async fn setattr(&self, ns: AttrNamespace, key: String, value: Bytes) -> Result<()> {
        self.with_state_mut(move |object| {
            object.setattr(ns, key, value);
            Ok(())
        })
        .await
    }

    async fn setattrs(&self, ns: AttrNamespace, pairs: Vec<(String, Bytes)>) -> Result<()> {
        self.with_state_mut(move |object| {
            object.setattrs(ns, pairs);
            Ok(())
        })
        .await
    }

    async fn rmattr(&self, ns: AttrNamespace, key: String) -> Result<()> {
        self.with_state_mut(move |object| {
            object.rmattr(ns, &key);
            Ok(())
        })
        .await
    }

    async fn rmattrs(&self, ns: AttrNamespace, keys: Vec<String>) -> Result<()> {
        self.with_state_mut(move |object| {
            object.rmattrs(ns, &keys);
            Ok(())
        })
        .await
    }

    async fn rmattr_range(
        &self,
        ns: AttrNamespace,
        _lower: AttrCursor,
        _upper: AttrCursor,
    ) -> Result<()> {
        Err(Error::unsupported(format!("rmattr_range on {ns}")))
    }

    async fn enumerate_attr_keys(
        &self,
        ns: AttrNamespace,
        cursor: Option<AttrCursor>,
        limit: usize,
    ) -> Result<KeyPage> {
        let tag = self.incarnation;
        self.with_state(move |object| {
            object.enumerate(ns, tag, cursor.as_ref(), limit, |key, _| key.clone())
        })
        .await
    }

    async fn enumerate_attr_kvs(
        &self,
        ns: AttrNamespace,
        cursor: Option<AttrCursor>,
        limit: usize,
    ) -> Result<KvPage> {
        let tag = self.incarnation;
        self.with_state(move |object| {
            object.enumerate(ns, tag, cursor.as_ref(), limit, |key, value| {
                (key.clone(), value.clone())
            })
        })
        .await
    }

    async fn attr_cursor(&self, ns: AttrNamespace, key: String) -> Result<AttrCursor> {
        let tag = self.incarnation;
        self.with_state(move |_| Ok(AttrCursor::new(ns, tag, Some(key))))
            .await
    }

    async fn clone_to(&self, dest: &Self) -> Result<()> {
        self.check_same_collection(dest, "clone")?;
        if dest.incarnation == self.incarnation {
            return self.with_state(|_| Ok(())).await;
        }

        let snapshot = self.with_state(|object| Ok(object.clone())).await?;
        dest.with_state_mut(move |object| {
            object.replace_content(snapshot);
            Ok(())
        })
        .await?;

        debug!(
            collection = %self.collection.id(),
            src = %self.oid,
            dest = %dest.oid,
            "object cloned"
        );
        Ok(())
    }

    async fn clone_range(&self, src: ByteRange, dest: &Self, dest_offset: u64) -> Result<()> {
        self.check_same_collection(dest, "clone_range")?;
        if dest_offset.checked_add(src.length).is_none() {
            return Err(Error::invalid_argument(format!(
                "destination range {dest_offset}~{} overflows",
                src.length
            )));
        }

        let segments = self.with_state(move |object| object.segments(src)).await?;
        dest.with_state_mut(move |object| object.apply_segments(dest_offset, &segments))
            .await
    }

    async fn set_alloc_hint(&self, object_size: u64, write_size: u64) -> Result<()> {
        self.with_state_mut(move |object| {
            object.set_alloc_hint(AllocHint {
                object_size,
                write_size,
            });
            Ok(())
        })
        .await
    }

    async fn get_header(&self) -> Result<Bytes> {
        self.with_state(|object| Ok(object.header())).await
    }

    async fn set_header(&self, header: Bytes) -> Result<()> {
        self.with_state_mut(move |object| {
            object.set_header(header);
            Ok(())
        })
        .await
    }

    async fn get_extents(&self, range: ByteRange) -> Result<Vec<ByteRange>> {
        self.with_state(move |object| object.extents(range)).await
    }

    async fn move_to_collection(self, dest: &MemCollection, dest_oid: ObjectId) -> Result<Self> {
        if self.collection.live(&self.oid).await? != self.incarnation {
            return Err(self.not_found());
        }
        dest.reserve(&dest_oid).await?;

        // Queued behind every operation already submitted to the object.
        let incarnation = self.incarnation;
        let taken = self
            .store()
            .exec_queued(self.home, move |state| Ok(state.take_object(incarnation)))
            .await;
        let object = match taken {
            Ok(Some(object)) => object,
            Ok(None) => {
                dest.finish_reservation(&dest_oid, None).await?;
                return Err(self.not_found());
            }
            Err(e) => {
                dest.finish_reservation(&dest_oid, None).await?;
                return Err(e);
            }
        };

        let store = self.store().clone();
        let home = store.object_home(&dest_oid);
        let new_incarnation = store.next_incarnation();
        if let Err(e) = store
            .exec(home, move |state| {
                state.insert_object(new_incarnation, object);
                Ok(())
            })
            .await
        {
            warn!(oid = %self.oid, "object state lost while moving: {}", e);
            dest.finish_reservation(&dest_oid, None).await?;
            return Err(e);
        }
        dest.finish_reservation(&dest_oid, Some(new_incarnation))
            .await?;
        self.collection.detach_if(&self.oid, incarnation).await?;

        debug!(
            collection = %self.collection.id(),
            oid = %self.oid,
            dest_collection = %dest.id(),
            dest_oid = %dest_oid,
            shard = %home,
            "object moved"
        );
        Ok(Self::new(dest.clone(), dest_oid, home, new_incarnation))
    }

    async fn commit(&self) -> Result<()> {
        let incarnation = self.incarnation;
        let present = self
            .store()
            .exec_queued(self.home, move |state| {
                Ok(state.object(incarnation).is_some())
            })
            .await?;
        if present {
            Ok(())
        } else {
            Err(self.not_found())
        }
    }

    async fn stat(&self) -> Result<ObjectStat> {
        self.with_state(|object| Ok(object.stat())).await
    }
}

impl fmt::Debug for MemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemObject")
            .field("cid", self.collection.id())
            .field("oid", &self.oid)
            .field("home", &self.home)
            .field("incarnation", &self.incarnation)
            .finish()
    }
}
