//! Shard-local state of the in-memory engine
//!
//! Every shard worker owns one [`ShardState`]: the collections homed on
//! that shard and the objects homed on it. Objects are keyed by
//! incarnation, so a handle that outlives its object (removed, moved, or
//! replaced under the same name) resolves to nothing instead of to the new
//! object.

use super::pages::{DataSegments, PageStore};
use crate::interface::{AllocHint, AttrCursor, ObjectStat};
use bytes::Bytes;
use shardstore_common::{AttrNamespace, ByteRange, CollectionId, Error, ObjectId, Result};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// Largest range a single read may return
pub const MAX_READ_LEN: u64 = 1 << 30;

/// State owned by one shard
#[derive(Debug, Default)]
pub struct ShardState {
    collections: HashMap<CollectionId, CollectionState>,
    objects: HashMap<u64, ObjectState>,
}

impl ShardState {
    pub fn create_collection(&mut self, cid: &CollectionId) -> Result<()> {
        if self.collections.contains_key(cid) {
            return Err(Error::CollectionAlreadyExists(cid.to_string()));
        }
        self.collections
            .insert(cid.clone(), CollectionState::new(cid.clone()));
        Ok(())
    }

    pub fn collection(&self, cid: &CollectionId) -> Result<&CollectionState> {
        self.collections
            .get(cid)
            .ok_or_else(|| Error::CollectionNotFound(cid.to_string()))
    }

    pub fn collection_mut(&mut self, cid: &CollectionId) -> Result<&mut CollectionState> {
        self.collections
            .get_mut(cid)
            .ok_or_else(|| Error::CollectionNotFound(cid.to_string()))
    }

    /// Names of the collections homed here, unordered
    pub fn collection_ids(&self) -> Vec<CollectionId> {
        self.collections.keys().cloned().collect()
    }

    pub fn object(&self, incarnation: u64) -> Option<&ObjectState> {
        self.objects.get(&incarnation)
    }

    pub fn object_mut(&mut self, incarnation: u64) -> Option<&mut ObjectState> {
        self.objects.get_mut(&incarnation)
    }

    pub fn insert_object(&mut self, incarnation: u64, object: ObjectState) {
        let previous = self.objects.insert(incarnation, object);
        debug_assert!(previous.is_none(), "incarnation {incarnation} reused");
    }

    pub fn take_object(&mut self, incarnation: u64) -> Option<ObjectState> {
        self.objects.remove(&incarnation)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

/// Name slot in a collection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    /// Claimed by a create or move still in flight
    Reserved,
    /// Bound to the object with this incarnation
    Live(u64),
}

/// Object map of one collection, kept on the collection's home shard
#[derive(Debug)]
pub struct CollectionState {
    id: CollectionId,
    objects: BTreeMap<ObjectId, Slot>,
}

impl CollectionState {
    fn new(id: CollectionId) -> Self {
        Self {
            id,
            objects: BTreeMap::new(),
        }
    }

    fn not_found(&self, oid: &ObjectId) -> Error {
        Error::object_not_found(self.id.as_str(), oid.as_str())
    }

    /// Claim `oid` for an object about to be installed
    pub fn reserve(&mut self, oid: &ObjectId) -> Result<()> {
        if self.objects.contains_key(oid) {
            return Err(Error::object_exists(self.id.as_str(), oid.as_str()));
        }
        self.objects.insert(oid.clone(), Slot::Reserved);
        Ok(())
    }

    /// Bind a reserved name to its object
    pub fn publish(&mut self, oid: &ObjectId, incarnation: u64) {
        let slot = self.objects.insert(oid.clone(), Slot::Live(incarnation));
        debug_assert_eq!(slot, Some(Slot::Reserved), "publish without reserve");
    }

    /// Drop a reservation that will not be published
    pub fn release(&mut self, oid: &ObjectId) {
        if self.objects.get(oid) == Some(&Slot::Reserved) {
            self.objects.remove(oid);
        }
    }

    /// Incarnation bound to `oid`
    pub fn live(&self, oid: &ObjectId) -> Result<u64> {
        match self.objects.get(oid) {
            Some(Slot::Live(incarnation)) => Ok(*incarnation),
            _ => Err(self.not_found(oid)),
        }
    }

    /// Unbind `oid`, returning the incarnation it named
    pub fn detach(&mut self, oid: &ObjectId) -> Result<u64> {
        let incarnation = self.live(oid)?;
        self.objects.remove(oid);
        Ok(incarnation)
    }

    /// Unbind `oid` only if it still names `incarnation`
    pub fn detach_if(&mut self, oid: &ObjectId, incarnation: u64) -> bool {
        if self.objects.get(oid) == Some(&Slot::Live(incarnation)) {
            self.objects.remove(oid);
            return true;
        }
        false
    }

    /// Up to `limit` live names after `start_after`, and whether more remain
    pub fn list(&self, start_after: Option<&ObjectId>, limit: usize) -> (Vec<ObjectId>, bool) {
        let lower = start_after.map_or(Bound::Unbounded, Bound::Excluded);
        let mut live = self
            .objects
            .range::<ObjectId, _>((lower, Bound::Unbounded))
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(oid, _)| oid.clone());
        let page: Vec<ObjectId> = live.by_ref().take(limit).collect();
        let more = live.next().is_some();
        (page, more)
    }
}

type AttrMap = BTreeMap<String, Bytes>;

/// Data, attributes and header of one object
#[derive(Clone, Debug)]
pub struct ObjectState {
    data: PageStore,
    data_len: u64,
    attrs: [AttrMap; AttrNamespace::COUNT],
    header: Bytes,
    alloc_hint: Option<AllocHint>,
}

impl ObjectState {
    pub fn new(page_size: usize) -> Self {
        Self {
            data: PageStore::new(page_size),
            data_len: 0,
            attrs: Default::default(),
            header: Bytes::new(),
            alloc_hint: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.data_len
    }

    /// Validate that `range` lies within the object
    fn check_range(&self, range: ByteRange) -> Result<()> {
        let end = checked_end(range.offset, range.length)?;
        if end > self.data_len {
            return Err(Error::OutOfRange {
                offset: range.offset,
                length: range.length,
                size: self.len(),
            });
        }
        Ok(())
    }

    pub fn read(&self, range: ByteRange) -> Result<Bytes> {
        self.check_range(range)?;
        if range.length > MAX_READ_LEN {
            return Err(Error::invalid_argument(format!(
                "read of {} bytes exceeds the {MAX_READ_LEN} byte limit",
                range.length
            )));
        }
        Ok(self.data.read(range.offset, range.length))
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = checked_end(offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }
        self.data.write(offset, data);
        self.data_len = self.data_len.max(end);
        Ok(())
    }

    /// Zero a range, growing the object to cover it
    pub fn zero(&mut self, range: ByteRange) -> Result<()> {
        let end = checked_end(range.offset, range.length)?;
        if range.is_empty() {
            return Ok(());
        }
        self.data.punch(range.offset, range.length);
        self.data_len = self.data_len.max(end);
        Ok(())
    }

    pub fn hole_punch(&mut self, range: ByteRange) -> Result<()> {
        self.check_range(range)?;
        self.data.punch(range.offset, range.length);
        Ok(())
    }

    pub fn truncate(&mut self, length: u64) {
        if length < self.data_len {
            self.data.truncate(length);
        }
        self.data_len = length;
    }

    fn attrs(&self, ns: AttrNamespace) -> &AttrMap {
        &self.attrs[ns.index()]
    }

    fn attrs_mut(&mut self, ns: AttrNamespace) -> &mut AttrMap {
        &mut self.attrs[ns.index()]
    }

    pub fn getattr(&self, ns: AttrNamespace, key: &str) -> Result<Bytes> {
        self.attrs(ns)
            .get(key)
            .cloned()
            .ok_or_else(|| Error::AttrNotFound {
                ns,
                key: key.to_string(),
            })
    }

    /// Values for `keys` in request order; fails on the first missing key
    pub fn getattrs(&self, ns: AttrNamespace, keys: &[String]) -> Result<Vec<Bytes>> {
        keys.iter().map(|key| self.getattr(ns, key)).collect()
    }

    pub fn setattr(&mut self, ns: AttrNamespace, key: String, value: Bytes) {
        self.attrs_mut(ns).insert(key, value);
    }

    pub fn setattrs(&mut self, ns: AttrNamespace, pairs: Vec<(String, Bytes)>) {
        self.attrs_mut(ns).extend(pairs);
    }

    pub fn rmattr(&mut self, ns: AttrNamespace, key: &str) {
        self.attrs_mut(ns).remove(key);
    }

    pub fn rmattrs(&mut self, ns: AttrNamespace, keys: &[String]) {
        let attrs = self.attrs_mut(ns);
        for key in keys {
            attrs.remove(key);
        }
    }

    /// One page of a sorted enumeration, mapped through `f`
    ///
    /// `tag` identifies the object for cursor validation.
    pub fn enumerate<T>(
        &self,
        ns: AttrNamespace,
        tag: u64,
        cursor: Option<&AttrCursor>,
        limit: usize,
        f: impl Fn(&String, &Bytes) -> T,
    ) -> Result<(Vec<T>, Option<AttrCursor>)> {
        let after = match cursor {
            Some(cursor) => {
                cursor.check(ns, tag)?;
                cursor.after()
            }
            None => None,
        };
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let mut entries = self
            .attrs(ns)
            .range::<str, _>((lower, Bound::Unbounded));

        let mut last = after.map(str::to_string);
        let mut page = Vec::with_capacity(limit.min(64));
        for (key, value) in entries.by_ref().take(limit) {
            page.push(f(key, value));
            last = Some(key.clone());
        }
        let next = entries
            .next()
            .is_some()
            .then(|| AttrCursor::new(ns, tag, last));
        Ok((page, next))
    }

    pub fn header(&self) -> Bytes {
        self.header.clone()
    }

    pub fn set_header(&mut self, header: Bytes) {
        self.header = header;
    }

    pub fn extents(&self, range: ByteRange) -> Result<Vec<ByteRange>> {
        self.check_range(range)?;
        Ok(self.data.extents(range.offset, range.length))
    }

    pub fn set_alloc_hint(&mut self, hint: AllocHint) {
        self.alloc_hint = Some(hint);
    }

    /// Take over data, attributes and header of `source`
    ///
    /// Pages are shared with `source` until either side writes them. The
    /// allocation hint stays with this object.
    pub fn replace_content(&mut self, source: ObjectState) {
        let hint = self.alloc_hint;
        *self = source;
        self.alloc_hint = hint;
    }

    /// Capture the written data of an in-range span
    pub fn segments(&self, range: ByteRange) -> Result<DataSegments> {
        self.check_range(range)?;
        Ok(self.data.segments(range.offset, range.length))
    }

    /// Overwrite `[dest_offset, dest_offset + data.length)` with `data`
    pub fn apply_segments(&mut self, dest_offset: u64, data: &DataSegments) -> Result<()> {
        let end = checked_end(dest_offset, data.length)?;
        if data.length == 0 {
            return Ok(());
        }
        self.data.apply_segments(dest_offset, data);
        self.data_len = self.data_len.max(end);
        Ok(())
    }

    pub fn stat(&self) -> ObjectStat {
        ObjectStat {
            size: self.len(),
            allocated: self.data.allocated_bytes(),
            pages: self.data.page_count(),
            xattrs: self.attrs(AttrNamespace::Xattr).len(),
            omap_keys: self.attrs(AttrNamespace::Omap).len(),
            header_len: self.header.len(),
            alloc_hint: self.alloc_hint,
        }
    }
}

fn checked_end(offset: u64, length: u64) -> Result<u64> {
    offset.checked_add(length).ok_or_else(|| {
        Error::invalid_argument(format!("range {offset}~{length} overflows"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardstore_common::ErrorKind;

    const PAGE: usize = 64;

    fn oid(name: &str) -> ObjectId {
        ObjectId::new(name).unwrap()
    }

    fn object_with_attrs(keys: &[&str]) -> ObjectState {
        let mut object = ObjectState::new(PAGE);
        for key in keys {
            object.setattr(
                AttrNamespace::Omap,
                (*key).to_string(),
                Bytes::from(key.to_uppercase()),
            );
        }
        object
    }

    fn keys_of(object: &ObjectState, cursor: Option<&AttrCursor>, limit: usize) -> (Vec<String>, Option<AttrCursor>) {
        object
            .enumerate(AttrNamespace::Omap, 1, cursor, limit, |k, _| k.clone())
            .unwrap()
    }

    #[test]
    fn test_collection_slots() {
        let mut state = ShardState::default();
        let cid = CollectionId::new("c").unwrap();
        state.create_collection(&cid).unwrap();
        assert!(state.create_collection(&cid).unwrap_err().is_already_exists());

        let coll = state.collection_mut(&cid).unwrap();
        coll.reserve(&oid("a")).unwrap();
        assert!(coll.reserve(&oid("a")).unwrap_err().is_already_exists());
        // Reserved names are invisible.
        assert!(coll.live(&oid("a")).unwrap_err().is_not_found());
        assert!(coll.list(None, 10).0.is_empty());

        coll.publish(&oid("a"), 9);
        assert_eq!(coll.live(&oid("a")).unwrap(), 9);
        coll.release(&oid("a"));
        assert_eq!(coll.live(&oid("a")).unwrap(), 9);

        assert!(!coll.detach_if(&oid("a"), 8));
        assert!(coll.detach_if(&oid("a"), 9));
        assert!(coll.detach(&oid("a")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_collection_list_pages() {
        let mut state = ShardState::default();
        let cid = CollectionId::new("c").unwrap();
        state.create_collection(&cid).unwrap();
        let coll = state.collection_mut(&cid).unwrap();
        for (i, name) in ["d", "b", "a", "c"].iter().enumerate() {
            coll.reserve(&oid(name)).unwrap();
            coll.publish(&oid(name), i as u64);
        }
        coll.reserve(&oid("bb")).unwrap();

        let (page, more) = coll.list(None, 2);
        assert_eq!(page, vec![oid("a"), oid("b")]);
        assert!(more);
        let (page, more) = coll.list(Some(&oid("b")), 2);
        assert_eq!(page, vec![oid("c"), oid("d")]);
        assert!(!more);
    }

    #[test]
    fn test_missing_collection() {
        let state = ShardState::default();
        let err = state.collection(&CollectionId::new("x").unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_write_extends_and_read_checks_range() {
        let mut object = ObjectState::new(PAGE);
        object.write(100, b"abc").unwrap();
        assert_eq!(object.len(), 103);
        assert_eq!(&object.read(ByteRange::new(100, 3)).unwrap()[..], b"abc");
        assert_eq!(&object.read(ByteRange::new(0, 2)).unwrap()[..], &[0, 0]);

        let err = object.read(ByteRange::new(100, 4)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        let err = object.read(ByteRange::new(u64::MAX, 2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_read_length_limit() {
        let mut object = ObjectState::new(PAGE);
        object.truncate(1 << 62);
        let err = object.read(ByteRange::new(0, 1 << 62)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = object.read(ByteRange::new(0, MAX_READ_LEN + 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        // Past the end is reported before the size limit.
        let err = object.read(ByteRange::new(1 << 62, 1 << 61)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        object.write((1 << 62) - 3, b"end").unwrap();
        assert_eq!(
            &object.read(ByteRange::new((1 << 62) - 3, 3)).unwrap()[..],
            b"end"
        );
        assert_eq!(object.stat().pages, 1);
    }

    #[test]
    fn test_zero_past_end_extends() {
        let mut object = ObjectState::new(PAGE);
        object.write(0, &[1u8; 10]).unwrap();
        object.zero(ByteRange::new(5, 100)).unwrap();
        object.zero(ByteRange::new(5, 100)).unwrap();
        assert_eq!(object.len(), 105);
        let data = object.read(ByteRange::new(0, 105)).unwrap();
        assert_eq!(&data[..5], &[1u8; 5]);
        assert!(data[5..].iter().all(|&b| b == 0));
        assert_eq!(
            object.extents(ByteRange::new(0, 105)).unwrap(),
            vec![ByteRange::new(0, 5)]
        );
    }

    #[test]
    fn test_hole_punch_bounds() {
        let mut object = ObjectState::new(PAGE);
        object.write(0, &[4u8; 200]).unwrap();
        let err = object.hole_punch(ByteRange::new(150, 51)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        object.hole_punch(ByteRange::new(64, 64)).unwrap();
        assert!(object.extents(ByteRange::new(64, 64)).unwrap().is_empty());
        assert_eq!(object.len(), 200);
        assert_eq!(object.stat().pages, 3);
    }

    #[test]
    fn test_truncate_shrink_then_grow() {
        let mut object = ObjectState::new(PAGE);
        object.write(0, &[8u8; 100]).unwrap();
        object.truncate(10);
        let err = object.read(ByteRange::new(10, 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        let err = object.extents(ByteRange::new(10, 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(object.read(ByteRange::new(0, 10)).unwrap().len(), 10);

        object.truncate(50);
        assert_eq!(object.len(), 50);
        let data = object.read(ByteRange::new(0, 50)).unwrap();
        assert_eq!(&data[..10], &[8u8; 10]);
        assert!(data[10..].iter().all(|&b| b == 0));
        assert_eq!(object.stat().allocated, 10);
    }

    #[test]
    fn test_attrs_overwrite_and_batch() {
        let mut object = ObjectState::new(PAGE);
        object.setattr(AttrNamespace::Xattr, "k".into(), Bytes::from_static(b"1"));
        object.setattr(AttrNamespace::Xattr, "k".into(), Bytes::from_static(b"2"));
        assert_eq!(&object.getattr(AttrNamespace::Xattr, "k").unwrap()[..], b"2");
        // Namespaces are independent.
        assert!(object.getattr(AttrNamespace::Omap, "k").unwrap_err().is_not_found());

        object.setattrs(
            AttrNamespace::Xattr,
            vec![("a".into(), Bytes::from_static(b"x")), ("b".into(), Bytes::from_static(b"y"))],
        );
        let values = object
            .getattrs(AttrNamespace::Xattr, &["b".into(), "a".into()])
            .unwrap();
        assert_eq!(values, vec![Bytes::from_static(b"y"), Bytes::from_static(b"x")]);

        let err = object
            .getattrs(AttrNamespace::Xattr, &["a".into(), "zz".into(), "yy".into()])
            .unwrap_err();
        assert!(matches!(err, Error::AttrNotFound { ref key, .. } if key == "zz"));

        object.rmattrs(AttrNamespace::Xattr, &["a".into(), "missing".into()]);
        object.rmattr(AttrNamespace::Xattr, "missing");
        assert_eq!(object.stat().xattrs, 2);
    }

    #[test]
    fn test_enumerate_cursor_continuity() {
        let object = object_with_attrs(&["e", "a", "d", "b", "c"]);
        let (first, cursor) = keys_of(&object, None, 2);
        assert_eq!(first, vec!["a", "b"]);
        let cursor = cursor.unwrap();

        let (second, cursor) = keys_of(&object, Some(&cursor), 2);
        assert_eq!(second, vec!["c", "d"]);
        let (third, cursor) = keys_of(&object, cursor.as_ref(), 2);
        assert_eq!(third, vec!["e"]);
        assert!(cursor.is_none());

        let (all, cursor) = keys_of(&object, None, 5);
        assert_eq!(all.len(), 5);
        assert!(cursor.is_none());
    }

    #[test]
    fn test_enumerate_from_explicit_cursor() {
        let object = object_with_attrs(&["a", "c", "e"]);
        // The key does not need to exist.
        let cursor = AttrCursor::new(AttrNamespace::Omap, 1, Some("b".into()));
        let (keys, _) = keys_of(&object, Some(&cursor), 10);
        assert_eq!(keys, vec!["c", "e"]);

        let (pairs, _) = object
            .enumerate(AttrNamespace::Omap, 1, Some(&cursor), 1, |k, v| (k.clone(), v.clone()))
            .unwrap();
        assert_eq!(pairs, vec![("c".to_string(), Bytes::from_static(b"C"))]);

        let foreign = AttrCursor::new(AttrNamespace::Omap, 2, None);
        let err = object
            .enumerate(AttrNamespace::Omap, 1, Some(&foreign), 1, |k, _| k.clone())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_enumerate_zero_limit_keeps_position() {
        let object = object_with_attrs(&["a", "b"]);
        let (keys, cursor) = keys_of(&object, None, 0);
        assert!(keys.is_empty());
        let (keys, _) = keys_of(&object, cursor.as_ref(), 10);
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_replace_content_keeps_hint_and_isolates() {
        let mut src = object_with_attrs(&["k"]);
        src.write(0, b"source").unwrap();
        src.set_header(Bytes::from_static(b"hdr"));

        let mut dst = ObjectState::new(PAGE);
        dst.write(0, &[1u8; 500]).unwrap();
        dst.set_alloc_hint(AllocHint {
            object_size: 4096,
            write_size: 512,
        });
        dst.replace_content(src.clone());

        assert_eq!(dst.len(), 6);
        assert_eq!(dst.header(), Bytes::from_static(b"hdr"));
        assert!(dst.stat().alloc_hint.is_some());

        dst.write(0, b"S").unwrap();
        assert_eq!(&src.read(ByteRange::new(0, 6)).unwrap()[..], b"source");
        assert_eq!(&dst.read(ByteRange::new(0, 6)).unwrap()[..], b"Source");
    }

    #[test]
    fn test_segments_into_other_object() {
        let mut src = ObjectState::new(PAGE);
        src.write(0, b"0123456789").unwrap();
        let err = src.segments(ByteRange::new(5, 10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        let captured = src.segments(ByteRange::new(2, 4)).unwrap();
        let mut dst = ObjectState::new(PAGE);
        dst.apply_segments(300, &captured).unwrap();
        assert_eq!(dst.len(), 304);
        assert_eq!(&dst.read(ByteRange::new(300, 4)).unwrap()[..], b"2345");
        assert!(
            dst.apply_segments(u64::MAX - 1, &captured)
                .unwrap_err()
                .kind()
                == ErrorKind::InvalidArgument
        );
    }
}
