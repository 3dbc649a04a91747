//! Storage engine interface
//!
//! Capability traits every engine implements: [`ObjectStore`] (registry of
//! collections), [`Collection`] (named set of objects) and [`Object`]
//! (data, attributes and header of one object). The in-memory engine in
//! [`crate::mem`] is the only implementation today; on-disk engines plug in
//! behind the same traits.
//!
//! Every operation returns its outcome through the returned future. Errors
//! carry one of the kinds in [`shardstore_common::ErrorKind`].

use async_trait::async_trait;
use bytes::Bytes;
use shardstore_common::{
    AttrNamespace, ByteRange, CollectionId, Error, ObjectId, Result, ShardId,
};

/// Resumption point of a sorted attribute enumeration
///
/// Positions an enumeration strictly after `after` (or at the beginning
/// when `after` is `None`). A cursor is tied to one namespace of one object
/// incarnation and is rejected anywhere else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttrCursor {
    ns: AttrNamespace,
    object_tag: u64,
    after: Option<String>,
}

impl AttrCursor {
    pub(crate) fn new(ns: AttrNamespace, object_tag: u64, after: Option<String>) -> Self {
        Self {
            ns,
            object_tag,
            after,
        }
    }

    /// Last key yielded before this position
    #[must_use]
    pub fn after(&self) -> Option<&str> {
        self.after.as_deref()
    }

    /// Check that the cursor belongs to `ns` of object `object_tag`
    pub(crate) fn check(&self, ns: AttrNamespace, object_tag: u64) -> Result<()> {
        if self.ns != ns {
            return Err(Error::invalid_argument(format!(
                "cursor for namespace {} used on {}",
                self.ns, ns
            )));
        }
        if self.object_tag != object_tag {
            return Err(Error::invalid_argument("cursor belongs to another object"));
        }
        Ok(())
    }
}

/// Allocation hint given by `set_alloc_hint`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocHint {
    /// Expected total size of the object
    pub object_size: u64,
    /// Expected size of write operations
    pub write_size: u64,
}

/// Point-in-time summary of one object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    /// Logical length
    pub size: u64,
    /// Bytes holding written data
    pub allocated: u64,
    /// Pages backing the data
    pub pages: usize,
    /// Number of extended attributes
    pub xattrs: usize,
    /// Number of omap entries
    pub omap_keys: usize,
    /// Header length
    pub header_len: usize,
    /// Last allocation hint, if any
    pub alloc_hint: Option<AllocHint>,
}

/// Page of attribute keys plus the cursor to continue from
pub type KeyPage = (Vec<String>, Option<AttrCursor>);

/// Page of attribute key/value pairs plus the cursor to continue from
pub type KvPage = (Vec<(String, Bytes)>, Option<AttrCursor>);

/// Registry of collections
#[async_trait]
pub trait ObjectStore: Send + Sync {
    type Collection: Collection;

    /// Find an existing collection
    async fn lookup_collection(&self, cid: CollectionId) -> Result<Self::Collection>;

    /// Create a collection; fails if the name is taken
    async fn create_collection(&self, cid: CollectionId) -> Result<Self::Collection>;

    /// All collection names, sorted
    async fn list_collections(&self) -> Result<Vec<CollectionId>>;
}

/// Named set of objects
#[async_trait]
pub trait Collection: Send + Sync + Sized {
    type Object: Object;

    /// Collection name
    fn id(&self) -> &CollectionId;

    /// Shard owning this collection's object map
    fn home_shard(&self) -> ShardId;

    /// Create an empty object; fails if the name is taken
    async fn create_object(&self, oid: ObjectId) -> Result<Self::Object>;

    /// Find an existing object
    async fn lookup_object(&self, oid: ObjectId) -> Result<Self::Object>;

    /// Detach an object and release its storage
    async fn remove_object(&self, oid: ObjectId) -> Result<()>;

    /// Up to `limit` object names after `start_after`, sorted, and whether
    /// more remain
    async fn list_objects(
        &self,
        start_after: Option<ObjectId>,
        limit: usize,
    ) -> Result<(Vec<ObjectId>, bool)>;
}

/// Data, attributes and header of one object
#[async_trait]
pub trait Object: Send + Sync + Sized {
    type Collection: Collection;

    /// Collection this handle addresses the object in
    fn collection_id(&self) -> &CollectionId;

    /// Object name
    fn oid(&self) -> &ObjectId;

    /// Shard owning this object's state
    fn home_shard(&self) -> ShardId;

    /// Read a range; fails `OutOfRange` past the object's length
    ///
    /// Engines may cap the length of a single read and fail larger ones with
    /// `InvalidArgument`.
    async fn read(&self, range: ByteRange) -> Result<Bytes>;

    /// Write at `offset`, growing the object as needed
    async fn write(&self, offset: u64, data: Bytes) -> Result<()>;

    /// Zero a range; never fails for ranges past the object's length
    async fn zero(&self, range: ByteRange) -> Result<()>;

    /// Deallocate a range; fails `OutOfRange` past the object's length
    async fn hole_punch(&self, range: ByteRange) -> Result<()>;

    /// Set the object's length
    async fn truncate(&self, length: u64) -> Result<()>;

    /// Get one attribute
    async fn getattr(&self, ns: AttrNamespace, key: String) -> Result<Bytes>;

    /// Get several attributes; fails as a whole on the first missing key
    async fn getattrs(&self, ns: AttrNamespace, keys: Vec<String>) -> Result<Vec<Bytes>>;

    /// Set one attribute, overwriting any previous value
    async fn setattr(&self, ns: AttrNamespace, key: String, value: Bytes) -> Result<()>;

    /// Set several attributes
    async fn setattrs(&self, ns: AttrNamespace, pairs: Vec<(String, Bytes)>) -> Result<()>;

    /// Remove one attribute; absent keys are ignored
    async fn rmattr(&self, ns: AttrNamespace, key: String) -> Result<()>;

    /// Remove several attributes; absent keys are ignored
    async fn rmattrs(&self, ns: AttrNamespace, keys: Vec<String>) -> Result<()>;

    /// Remove the attributes between two cursors
    async fn rmattr_range(
        &self,
        ns: AttrNamespace,
        lower: AttrCursor,
        upper: AttrCursor,
    ) -> Result<()>;

    /// Up to `limit` keys after `cursor`, sorted
    async fn enumerate_attr_keys(
        &self,
        ns: AttrNamespace,
        cursor: Option<AttrCursor>,
        limit: usize,
    ) -> Result<KeyPage>;

    /// Up to `limit` key/value pairs after `cursor`, sorted
    async fn enumerate_attr_kvs(
        &self,
        ns: AttrNamespace,
        cursor: Option<AttrCursor>,
        limit: usize,
    ) -> Result<KvPage>;

    /// Cursor that resumes an enumeration right after `key`
    async fn attr_cursor(&self, ns: AttrNamespace, key: String) -> Result<AttrCursor>;

    /// Replace `dest`'s data, attributes and header with a copy of this
    /// object's
    async fn clone_to(&self, dest: &Self) -> Result<()>;

    /// Copy a data range of this object into `dest` at `dest_offset`
    async fn clone_range(&self, src: ByteRange, dest: &Self, dest_offset: u64) -> Result<()>;

    /// Advise the engine of the expected object and write sizes
    async fn set_alloc_hint(&self, object_size: u64, write_size: u64) -> Result<()>;

    /// Get the header blob
    async fn get_header(&self) -> Result<Bytes>;

    /// Replace the header blob
    async fn set_header(&self, header: Bytes) -> Result<()>;

    /// Written sub-ranges of a range
    async fn get_extents(&self, range: ByteRange) -> Result<Vec<ByteRange>>;

    /// Move the object to `dest_oid` in `dest`, returning the new handle
    ///
    /// Waits for operations already submitted against the object, after
    /// which the old handle no longer resolves.
    async fn move_to_collection(self, dest: &Self::Collection, dest_oid: ObjectId)
    -> Result<Self>;

    /// Wait until every operation submitted before this call has finished
    async fn commit(&self) -> Result<()>;

    /// Summary of the object
    async fn stat(&self) -> Result<ObjectStat>;
}
