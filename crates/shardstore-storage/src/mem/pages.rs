//! Sparse page store
//!
//! Object data is kept as a sparse map of fixed-size pages. Only pages that
//! hold written bytes exist; everything else reads as zero. Alongside the
//! pages, an [`ExtentMap`] records exactly which bytes were written and not
//! since erased, which is what `extents` reports.
//!
//! Invariants:
//! - a page exists iff some written extent intersects it
//! - every byte of an existing page outside the written extents is zero
//!
//! Pages are reference counted, so cloning a `PageStore` shares every page
//! and a later write copies only the page it touches.

use bytes::{Bytes, BytesMut};
use shardstore_common::ByteRange;
use std::collections::BTreeMap;
use std::sync::Arc;

type Page = Arc<Vec<u8>>;

/// Set of disjoint, non-adjacent byte intervals
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtentMap {
    /// start -> end (exclusive)
    map: BTreeMap<u64, u64>,
}

impl ExtentMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `[start, end)`, coalescing with touching intervals
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let touching: Vec<(u64, u64)> = self
            .map
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();

        let (mut start, mut end) = (start, end);
        for (s, e) in touching {
            self.map.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }
        self.map.insert(start, end);
    }

    /// Remove `[start, end)`, splitting intervals that straddle it
    pub fn remove(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let overlapping: Vec<(u64, u64)> = self
            .map
            .range(..end)
            .rev()
            .take_while(|&(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in overlapping {
            self.map.remove(&s);
            if s < start {
                self.map.insert(s, start);
            }
            if e > end {
                self.map.insert(end, e);
            }
        }
    }

    /// Intervals clipped to `[start, end)`, ascending
    #[must_use]
    pub fn intersect(&self, start: u64, end: u64) -> Vec<ByteRange> {
        if start >= end {
            return Vec::new();
        }
        let first = self
            .map
            .range(..start)
            .next_back()
            .filter(|&(_, &e)| e > start)
            .map_or(start, |(&s, _)| s);

        self.map
            .range(first..end)
            .map(|(&s, &e)| {
                let from = s.max(start);
                ByteRange::new(from, e.min(end) - from)
            })
            .collect()
    }

    /// Whether any interval intersects `[start, end)`
    #[must_use]
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return false;
        }
        if self
            .map
            .range(..start)
            .next_back()
            .is_some_and(|(_, &e)| e > start)
        {
            return true;
        }
        self.map.range(start..end).next().is_some()
    }

    /// Total number of bytes covered
    #[must_use]
    pub fn total(&self) -> u64 {
        self.map.iter().map(|(s, e)| e - s).sum()
    }

    /// Whether the map is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Written data of a byte range, detached from its page store
///
/// Segment offsets are relative to the start of the captured range.
#[derive(Clone, Debug, Default)]
pub struct DataSegments {
    /// Length of the captured range
    pub length: u64,
    /// Written segments, ascending and disjoint
    pub segments: Vec<(u64, Bytes)>,
}

/// Sparse, page-granular byte store
#[derive(Clone, Debug)]
pub struct PageStore {
    page_size: u64,
    pages: BTreeMap<u64, Page>,
    written: ExtentMap,
}

impl PageStore {
    /// Create an empty store
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a positive power of two.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two(),
            "page size must be a power of two"
        );
        Self {
            page_size: page_size as u64,
            pages: BTreeMap::new(),
            written: ExtentMap::new(),
        }
    }

    /// Page size in bytes
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of allocated pages
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Number of written bytes
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.written.total()
    }

    /// Page indices `[first, last)` touched by `[start, end)`
    fn page_span(&self, start: u64, end: u64) -> (u64, u64) {
        (start / self.page_size, end.div_ceil(self.page_size))
    }

    /// Byte range `[start, end)` of page `index`
    ///
    /// The last page of the address space ends at `u64::MAX`; its final
    /// byte lies past every representable range end and is never stored.
    fn page_bounds(&self, index: u64) -> (u64, u64) {
        let start = index * self.page_size;
        (start, start.saturating_add(self.page_size))
    }

    /// Read `length` bytes at `offset`; holes read as zero
    #[must_use]
    pub fn read(&self, offset: u64, length: u64) -> Bytes {
        let mut buf = BytesMut::zeroed(length as usize);
        if length == 0 {
            return buf.freeze();
        }
        let end = offset + length;
        let (first, last) = self.page_span(offset, end);

        for (&index, page) in self.pages.range(first..last) {
            let (page_start, page_end) = self.page_bounds(index);
            let from = offset.max(page_start);
            let to = end.min(page_end);
            buf[(from - offset) as usize..(to - offset) as usize]
                .copy_from_slice(&page[(from - page_start) as usize..(to - page_start) as usize]);
        }
        buf.freeze()
    }

    /// Write `data` at `offset`, allocating pages as needed
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let page_size = self.page_size;
        let end = offset + data.len() as u64;
        let (first, last) = self.page_span(offset, end);

        for index in first..last {
            let (page_start, page_end) = self.page_bounds(index);
            let from = offset.max(page_start);
            let to = end.min(page_end);
            let page = self
                .pages
                .entry(index)
                .or_insert_with(|| Arc::new(vec![0u8; page_size as usize]));
            Arc::make_mut(page)[(from - page_start) as usize..(to - page_start) as usize]
                .copy_from_slice(&data[(from - offset) as usize..(to - offset) as usize]);
        }
        self.written.insert(offset, end);
    }

    /// Erase `length` bytes at `offset`
    ///
    /// Fully covered pages are released; partially covered pages are
    /// zero-filled over the covered part and released once nothing written
    /// remains in them.
    pub fn punch(&mut self, offset: u64, length: u64) {
        self.erase(offset, offset.saturating_add(length));
    }

    /// Drop everything at or beyond `new_len`
    pub fn truncate(&mut self, new_len: u64) {
        self.erase(new_len, u64::MAX);
    }

    fn erase(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        self.written.remove(start, end);

        let (first, last) = self.page_span(start, end);
        let touched: Vec<u64> = self.pages.range(first..last).map(|(&i, _)| i).collect();

        for index in touched {
            let (page_start, page_end) = self.page_bounds(index);
            let covered = start <= page_start && end >= page_end;
            if covered || !self.written.overlaps(page_start, page_end) {
                self.pages.remove(&index);
                continue;
            }
            let from = start.max(page_start);
            let to = end.min(page_end);
            if let Some(page) = self.pages.get_mut(&index) {
                Arc::make_mut(page)[(from - page_start) as usize..(to - page_start) as usize]
                    .fill(0);
            }
        }
    }

    /// Written sub-ranges of `[offset, offset + length)`
    #[must_use]
    pub fn extents(&self, offset: u64, length: u64) -> Vec<ByteRange> {
        self.written.intersect(offset, offset.saturating_add(length))
    }

    /// Capture the written data of a range
    #[must_use]
    pub fn segments(&self, offset: u64, length: u64) -> DataSegments {
        let segments = self
            .extents(offset, length)
            .into_iter()
            .map(|r| (r.offset - offset, self.read(r.offset, r.length)))
            .collect();
        DataSegments { length, segments }
    }

    /// Replace `[dest_offset, dest_offset + captured length)` with `data`
    pub fn apply_segments(&mut self, dest_offset: u64, data: &DataSegments) {
        self.punch(dest_offset, data.length);
        for (rel, bytes) in &data.segments {
            self.write(dest_offset + rel, bytes);
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for (&index, page) in &self.pages {
            let (page_start, page_end) = self.page_bounds(index);
            assert!(
                self.written.overlaps(page_start, page_end),
                "page {index} has no written bytes"
            );
            let mut cursor = page_start;
            for extent in self.written.intersect(page_start, page_end) {
                for off in cursor..extent.offset {
                    assert_eq!(page[(off - page_start) as usize], 0, "dirty hole at {off}");
                }
                cursor = extent.end();
            }
            for off in cursor..page_end {
                assert_eq!(page[(off - page_start) as usize], 0, "dirty hole at {off}");
            }
        }
        for extent in self.written.intersect(0, u64::MAX) {
            let (first, last) = self.page_span(extent.offset, extent.end());
            for index in first..last {
                assert!(self.pages.contains_key(&index), "missing page {index}");
            }
        }
    }
}
