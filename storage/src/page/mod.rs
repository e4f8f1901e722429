//! Slotted page.
//!
//! One page of `size` bytes is laid out as:
//!
//! ```text
//! +----------+-----+-----+----------------+ ... +-----------------+
//! | PageMeta | min | max | record heap -> |     | <- slot entries |
//! +----------+-----+-----+----------------+ ... +-----------------+
//! 0          40    57    82         heap_top    size - 2*slots    size
//! ```
//!
//! Live records form a singly linked chain in key order from the `min`
//! sentinel to the `max` sentinel. Every few records one of them is a slot
//! anchor: the slot directory at the end of the page points at the anchors,
//! so a lookup is a binary search over anchors followed by a short walk of
//! one bucket. Erased records move to a tombstone chain and their bytes are
//! reclaimed by [`Page::tidy`].
//!
//! All offsets are `u16` and every read is bounds checked against the heap;
//! a bad offset surfaces as [`StorageError::Corrupted`].

pub mod record;

use crate::codec::{decode_u64, encode_u64, read_u16, read_u32, write_u16, write_u32};
use crate::config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::{KeyComparator, PageId, Result, StorageError};
use record::{Record, RecordIter, RecordMeta, DELETED, RECORD_META_SIZE};
use std::fmt;

pub const PAGE_META_SIZE: usize = 40;

/// Offset of the `min` sentinel record.
pub const MIN_RECORD_ADDR: u16 = PAGE_META_SIZE as u16;

/// Offset of the `max` sentinel record.
pub const MAX_RECORD_ADDR: u16 = MIN_RECORD_ADDR + (RECORD_META_SIZE + MIN_KEY.len()) as u16;

/// Both sentinels: two headers, two 3-byte keys and the 8-byte child slot
/// carried by `max`.
pub const SENTINEL_SIZE: usize = 2 * RECORD_META_SIZE + MIN_KEY.len() + MAX_KEY.len() + 8;

/// Offset of the first byte of the record heap.
pub const FIRST_RECORD_ADDR: usize = PAGE_META_SIZE + SENTINEL_SIZE;

/// Anchors own fewer than this many records; reaching it splits the bucket.
pub const BUCKET_CAPACITY: u16 = 8;

const SLOT_WIDTH: usize = 2;

/// Contiguous bytes kept free beyond a new record so the slot directory can
/// grow by one entry.
const ALLOC_RESERVE: usize = 4;

const MIN_KEY: &[u8] = b"min";
const MAX_KEY: &[u8] = b"max";

// PageMeta field offsets
const OFF_SELF: usize = 0;
const OFF_PARENT: usize = 4;
const OFF_PREV: usize = 8;
const OFF_NEXT: usize = 12;
const OFF_HEAP_TOP: usize = 16;
const OFF_FREE: usize = 18;
const OFF_USE: usize = 20;
const OFF_SLOTS: usize = 22;
const OFF_TYPE: usize = 24;
const OFF_NODE_SIZE: usize = 26;
const OFF_FREE_SIZE: usize = 28;
const OFF_SIZE: usize = 32;
const OFF_CHECKSUM: usize = 36;

/// Largest record (header included) a page of `page_size` bytes accepts.
///
/// A quarter of the usable space, so a full page always holds at least
/// three records and a split always leaves room for the pending insert.
pub fn max_record_size(page_size: usize) -> usize {
    page_size.saturating_sub(FIRST_RECORD_ADDR + ALLOC_RESERVE + 16) / 4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PageType {
    Leaf = 0,
    Internal = 1,
    Free = 2,
}

impl PageType {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(PageType::Leaf),
            1 => Some(PageType::Internal),
            2 => Some(PageType::Free),
            _ => None,
        }
    }

    /// Number of values an insert into a page of this type carries.
    pub fn value_arity(self) -> usize {
        match self {
            PageType::Internal => 2,
            PageType::Leaf | PageType::Free => 1,
        }
    }
}

/// Value half of an insert.
#[derive(Debug, Clone, Copy)]
pub enum RecordValue<'a> {
    /// Payload stored next to the key in a leaf.
    Leaf(&'a [u8]),
    /// Separator for an internal page: `left` holds keys up to and
    /// including the separator, `right` the keys after it.
    Separator { left: PageId, right: PageId },
}

impl RecordValue<'_> {
    pub fn arity(&self) -> usize {
        match self {
            RecordValue::Leaf(_) => 1,
            RecordValue::Separator { .. } => 2,
        }
    }
}

/// Decoded copy of the page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageMeta {
    pub self_id: PageId,
    pub parent: PageId,
    pub prev: PageId,
    pub next: PageId,
    pub heap_top: u16,
    pub free: u16,
    pub live_head: u16,
    pub slots: u16,
    pub page_type: PageType,
    pub node_size: u16,
    pub free_size: u32,
    pub size: u32,
    pub checksum: u32,
}

impl fmt::Display for PageMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[self={}, parent={}, prev={}, next={}, heap_top={}, free={}, use={}, slots={}, \
             type={:?}, node_size={}, free_size={}, size={}]",
            self.self_id,
            self.parent,
            self.prev,
            self.next,
            self.heap_top,
            self.free,
            self.live_head,
            self.slots,
            self.page_type,
            self.node_size,
            self.free_size,
            self.size
        )
    }
}

/// Result of a bucket walk: `prev` is the last record sorting strictly
/// before the key, `cur` its successor in the live chain.
#[derive(Debug, Clone, Copy)]
struct Position {
    slot: usize,
    prev: u16,
    cur: u16,
}

#[derive(Clone)]
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    pub fn new(page_id: PageId, page_type: PageType, page_size: usize) -> Self {
        debug_assert!((MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size));

        let mut page = Self {
            data: vec![0u8; page_size].into_boxed_slice(),
        };

        write_u32(&mut page.data, OFF_SELF, page_id);
        write_u16(&mut page.data, OFF_HEAP_TOP, FIRST_RECORD_ADDR as u16);
        write_u16(&mut page.data, OFF_USE, MIN_RECORD_ADDR);
        write_u16(&mut page.data, OFF_SLOTS, 2);
        write_u16(&mut page.data, OFF_TYPE, page_type as u16);
        write_u32(&mut page.data, OFF_SIZE, page_size as u32);
        write_u32(
            &mut page.data,
            OFF_FREE_SIZE,
            (page_size - FIRST_RECORD_ADDR - 2 * SLOT_WIDTH) as u32,
        );

        let mut min = RecordMeta::new(MIN_KEY.len(), 0);
        min.next = MAX_RECORD_ADDR;
        min.owned = 1;
        page.write_record(MIN_RECORD_ADDR, &min, MIN_KEY, &[]);

        let mut max = RecordMeta::new(MAX_KEY.len(), 8);
        max.owned = 1;
        max.slot_no = 1;
        page.write_record(MAX_RECORD_ADDR, &max, MAX_KEY, &[0u8; 8]);

        page.set_slot(0, MIN_RECORD_ADDR);
        page.set_slot(1, MAX_RECORD_ADDR);
        page
    }

    /// Wraps raw page bytes read from storage, checking the header for
    /// consistency. The checksum is verified separately.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&bytes.len()) {
            return Err(StorageError::Corrupted {
                page_id: 0,
                reason: format!("page buffer of {} bytes", bytes.len()),
            });
        }

        let page = Self {
            data: bytes.to_vec().into_boxed_slice(),
        };
        page.validate_header()?;
        Ok(page)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn validate_header(&self) -> Result<()> {
        let size = self.size() as usize;
        if size != self.data.len() {
            return Err(self.corrupted(format!(
                "header size {} but buffer holds {} bytes",
                size,
                self.data.len()
            )));
        }

        if PageType::from_u16(read_u16(&self.data, OFF_TYPE)).is_none() {
            return Err(self.corrupted(format!(
                "unknown page type {}",
                read_u16(&self.data, OFF_TYPE)
            )));
        }

        let slots = self.slots() as usize;
        let heap_top = self.heap_top() as usize;
        if slots < 2 || heap_top < FIRST_RECORD_ADDR || heap_top + slots * SLOT_WIDTH > size {
            return Err(self.corrupted(format!(
                "heap_top {} and {} slots do not fit a {} byte page",
                heap_top, slots, size
            )));
        }

        if self.slot(0)? != MIN_RECORD_ADDR || self.slot(slots - 1)? != MAX_RECORD_ADDR {
            return Err(self.corrupted("slot directory does not start at min and end at max".into()));
        }

        Ok(())
    }

    fn corrupted(&self, reason: String) -> StorageError {
        StorageError::Corrupted {
            page_id: self.self_id(),
            reason,
        }
    }

    pub fn meta(&self) -> PageMeta {
        PageMeta {
            self_id: self.self_id(),
            parent: self.parent(),
            prev: self.prev(),
            next: self.next(),
            heap_top: self.heap_top(),
            free: self.free_head(),
            live_head: read_u16(&self.data, OFF_USE),
            slots: self.slots(),
            page_type: self.page_type(),
            node_size: self.node_size(),
            free_size: self.free_size(),
            size: self.size(),
            checksum: read_u32(&self.data, OFF_CHECKSUM),
        }
    }

    pub fn self_id(&self) -> PageId {
        read_u32(&self.data, OFF_SELF)
    }

    pub fn parent(&self) -> PageId {
        read_u32(&self.data, OFF_PARENT)
    }

    pub fn set_parent(&mut self, parent: PageId) {
        write_u32(&mut self.data, OFF_PARENT, parent);
    }

    pub fn prev(&self) -> PageId {
        read_u32(&self.data, OFF_PREV)
    }

    pub fn set_prev(&mut self, prev: PageId) {
        write_u32(&mut self.data, OFF_PREV, prev);
    }

    pub fn next(&self) -> PageId {
        read_u32(&self.data, OFF_NEXT)
    }

    pub fn set_next(&mut self, next: PageId) {
        write_u32(&mut self.data, OFF_NEXT, next);
    }

    pub fn page_type(&self) -> PageType {
        // Validated on construction.
        PageType::from_u16(read_u16(&self.data, OFF_TYPE)).unwrap_or(PageType::Free)
    }

    pub fn is_leaf(&self) -> bool {
        self.page_type() == PageType::Leaf
    }

    pub fn node_size(&self) -> u16 {
        read_u16(&self.data, OFF_NODE_SIZE)
    }

    pub fn slots(&self) -> u16 {
        read_u16(&self.data, OFF_SLOTS)
    }

    pub fn heap_top(&self) -> u16 {
        read_u16(&self.data, OFF_HEAP_TOP)
    }

    pub fn free_head(&self) -> u16 {
        read_u16(&self.data, OFF_FREE)
    }

    /// Bytes not taken by live records, sentinels or slot entries.
    /// Includes tombstoned bytes that only [`Page::tidy`] makes reusable.
    pub fn free_size(&self) -> u32 {
        read_u32(&self.data, OFF_FREE_SIZE)
    }

    pub fn size(&self) -> u32 {
        read_u32(&self.data, OFF_SIZE)
    }

    pub fn free_ratio(&self) -> f64 {
        self.free_size() as f64 / self.size() as f64
    }

    /// Bytes held by live records, headers included.
    pub fn valid_data_size(&self) -> usize {
        (self.size() as usize).saturating_sub(
            FIRST_RECORD_ADDR + self.slots() as usize * SLOT_WIDTH + self.free_size() as usize,
        )
    }

    fn set_heap_top(&mut self, value: u16) {
        write_u16(&mut self.data, OFF_HEAP_TOP, value);
    }

    fn set_free_head(&mut self, value: u16) {
        write_u16(&mut self.data, OFF_FREE, value);
    }

    fn set_slots(&mut self, value: u16) {
        write_u16(&mut self.data, OFF_SLOTS, value);
    }

    fn set_node_size(&mut self, value: u16) {
        write_u16(&mut self.data, OFF_NODE_SIZE, value);
    }

    fn set_free_size(&mut self, value: u32) {
        write_u32(&mut self.data, OFF_FREE_SIZE, value);
    }

    fn record_meta(&self, addr: u16) -> Result<RecordMeta> {
        let start = addr as usize;
        let heap_top = self.heap_top() as usize;
        if start < PAGE_META_SIZE || start + RECORD_META_SIZE > heap_top {
            return Err(self.corrupted(format!("record offset {} outside the heap", addr)));
        }

        let meta = RecordMeta::decode(&self.data[start..start + RECORD_META_SIZE]);
        if meta.key_len as usize + meta.val_len as usize != meta.len as usize
            || start + meta.occupy_size() > heap_top
        {
            return Err(self.corrupted(format!("record at {} has header {}", addr, meta)));
        }
        Ok(meta)
    }

    /// Reads the record at `addr`.
    pub fn record(&self, addr: u16) -> Result<Record<'_>> {
        let meta = self.record_meta(addr)?;
        let key_start = addr as usize + RECORD_META_SIZE;
        let val_start = key_start + meta.key_len as usize;
        Ok(Record {
            address: addr,
            meta,
            key: &self.data[key_start..val_start],
            value: &self.data[val_start..val_start + meta.val_len as usize],
        })
    }

    fn key_at(&self, addr: u16) -> Result<&[u8]> {
        Ok(self.record(addr)?.key)
    }

    fn write_record_meta(&mut self, addr: u16, meta: &RecordMeta) {
        let start = addr as usize;
        meta.encode(&mut self.data[start..start + RECORD_META_SIZE]);
    }

    fn write_record(&mut self, addr: u16, meta: &RecordMeta, key: &[u8], value: &[u8]) {
        let start = addr as usize;
        let key_start = start + RECORD_META_SIZE;
        let val_start = key_start + key.len();
        meta.encode(&mut self.data[start..key_start]);
        self.data[key_start..val_start].copy_from_slice(key);
        self.data[val_start..val_start + value.len()].copy_from_slice(value);
    }

    /// Overwrites a record's value in place; the length must not change.
    fn write_value(&mut self, addr: u16, value: &[u8]) -> Result<()> {
        let meta = self.record_meta(addr)?;
        if meta.val_len as usize != value.len() {
            return Err(self.corrupted(format!(
                "record at {} holds a {} byte value, cannot store {}",
                addr,
                meta.val_len,
                value.len()
            )));
        }
        let start = addr as usize + RECORD_META_SIZE + meta.key_len as usize;
        self.data[start..start + value.len()].copy_from_slice(value);
        Ok(())
    }

    /// Offsets of the live records in key order, sentinels excluded.
    fn live_addresses(&self) -> Result<Vec<u16>> {
        let node_size = self.node_size() as usize;
        let mut addrs = Vec::with_capacity(node_size);
        let mut addr = self.record_meta(MIN_RECORD_ADDR)?.next;

        while addr != MAX_RECORD_ADDR {
            if addrs.len() >= node_size {
                return Err(self.corrupted("live chain longer than node_size".into()));
            }
            addrs.push(addr);
            addr = self.record_meta(addr)?.next;
        }

        if addrs.len() != node_size {
            return Err(self.corrupted(format!(
                "live chain holds {} records, node_size is {}",
                addrs.len(),
                node_size
            )));
        }
        Ok(addrs)
    }

    pub fn iter(&self) -> RecordIter<'_> {
        RecordIter::new(self, false)
    }

    pub fn iter_with_sentinels(&self) -> RecordIter<'_> {
        RecordIter::new(self, true)
    }

    pub fn first_key(&self) -> Result<Option<&[u8]>> {
        let first = self.record_meta(MIN_RECORD_ADDR)?.next;
        if first == MAX_RECORD_ADDR {
            return Ok(None);
        }
        Ok(Some(self.key_at(first)?))
    }

    pub fn last_record(&self) -> Result<Option<Record<'_>>> {
        let tail = self.tail_address()?;
        if tail == MIN_RECORD_ADDR {
            return Ok(None);
        }
        Ok(Some(self.record(tail)?))
    }

    /// Predecessor of the `max` sentinel.
    fn tail_address(&self) -> Result<u16> {
        let last_slot = self.slots() as usize - 1;
        let mut addr = self.slot(last_slot - 1)?;
        for _ in 0..BUCKET_CAPACITY {
            let next = self.record_meta(addr)?.next;
            if next == MAX_RECORD_ADDR {
                return Ok(addr);
            }
            addr = next;
        }
        Err(self.corrupted("last bucket does not reach the max sentinel".into()))
    }

    fn slot_dir_start(&self) -> usize {
        self.size() as usize - self.slots() as usize * SLOT_WIDTH
    }

    /// Anchor offset held by slot `index`.
    pub fn slot(&self, index: usize) -> Result<u16> {
        if index >= self.slots() as usize {
            return Err(self.corrupted(format!(
                "slot {} out of {}",
                index,
                self.slots()
            )));
        }
        Ok(read_u16(&self.data, self.slot_dir_start() + index * SLOT_WIDTH))
    }

    fn set_slot(&mut self, index: usize, addr: u16) {
        let offset = self.slot_dir_start() + index * SLOT_WIDTH;
        write_u16(&mut self.data, offset, addr);
    }

    fn insert_slot(&mut self, index: usize, addr: u16) -> Result<()> {
        let start = self.slot_dir_start();
        if start < self.heap_top() as usize + SLOT_WIDTH {
            return Err(StorageError::PageFull(self.self_id()));
        }

        let new_start = start - SLOT_WIDTH;
        self.data
            .copy_within(start..start + index * SLOT_WIDTH, new_start);
        write_u16(&mut self.data, new_start + index * SLOT_WIDTH, addr);
        self.set_slots(self.slots() + 1);
        self.set_free_size(self.free_size() - SLOT_WIDTH as u32);
        Ok(())
    }

    fn remove_slot(&mut self, index: usize) {
        let start = self.slot_dir_start();
        self.data
            .copy_within(start..start + index * SLOT_WIDTH, start + SLOT_WIDTH);
        write_u16(&mut self.data, start, 0);
        self.set_slots(self.slots() - 1);
        self.set_free_size(self.free_size() + SLOT_WIDTH as u32);
    }

    /// Binary search over the slot directory for the first slot whose
    /// anchor sorts at or after `key`. Slot 0 always compares smaller and
    /// the last slot always larger, so the result lies in `1..slots`.
    pub fn locate_slot(&self, key: &[u8], cmp: &dyn KeyComparator) -> Result<usize> {
        let slots = self.slots() as usize;
        let (mut lo, mut hi) = (0, slots);

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let ord = if mid == 0 {
                1
            } else if mid == slots - 1 {
                -1
            } else {
                cmp.compare(self.key_at(self.slot(mid)?)?, key)
            };

            if ord > 0 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn position(&self, key: &[u8], cmp: &dyn KeyComparator) -> Result<Position> {
        let slot = self.locate_slot(key, cmp)?;
        let mut prev = self.slot(slot - 1)?;

        for _ in 0..BUCKET_CAPACITY {
            let cur = self.record_meta(prev)?.next;
            let record = self.record(cur)?;
            if record.meta.is_anchor() || !cmp.less(record.key, key) {
                return Ok(Position { slot, prev, cur });
            }
            prev = cur;
        }
        Err(self.corrupted(format!("bucket {} does not end in an anchor", slot)))
    }

    fn cache_slot_no(&mut self, addr: u16, slot: usize) -> Result<()> {
        let mut meta = self.record_meta(addr)?;
        meta.slot_no = slot as u16;
        self.write_record_meta(addr, &meta);
        Ok(())
    }

    /// Last record sorting strictly before `key` (possibly the `min`
    /// sentinel) and the bucket the key falls into.
    pub fn floor_search(&mut self, key: &[u8], cmp: &dyn KeyComparator) -> Result<(u16, usize)> {
        let pos = self.position(key, cmp)?;
        let prev_slot = if self.record_meta(pos.prev)?.is_anchor() {
            pos.slot - 1
        } else {
            pos.slot
        };
        self.cache_slot_no(pos.prev, prev_slot)?;
        Ok((pos.prev, pos.slot))
    }

    /// First record sorting at or after `key`, possibly the `max` sentinel.
    pub fn lower_bound(&mut self, key: &[u8], cmp: &dyn KeyComparator) -> Result<u16> {
        let pos = self.position(key, cmp)?;
        self.cache_slot_no(pos.cur, pos.slot)?;
        Ok(pos.cur)
    }

    pub fn search(&self, key: &[u8], cmp: &dyn KeyComparator) -> Result<Option<&[u8]>> {
        let pos = self.position(key, cmp)?;
        if pos.cur == MAX_RECORD_ADDR {
            return Ok(None);
        }

        let record = self.record(pos.cur)?;
        if cmp.equal(record.key, key) {
            Ok(Some(record.value))
        } else {
            Ok(None)
        }
    }

    /// Makes `size` contiguous bytes available above `heap_top`,
    /// compacting the page when the space exists but is fragmented.
    /// Returns `false` when the page cannot hold `size` more bytes.
    pub fn try_alloc(&mut self, size: usize) -> Result<bool> {
        let contiguous = self.slot_dir_start() - self.heap_top() as usize;
        if contiguous >= size {
            return Ok(true);
        }

        if self.free_size() as usize >= size {
            self.tidy()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn alloc(&mut self, size: usize) -> Result<u16> {
        let heap_top = self.heap_top() as usize;
        if self.slot_dir_start() - heap_top < size {
            return Err(StorageError::PageFull(self.self_id()));
        }
        self.set_heap_top((heap_top + size) as u16);
        Ok(heap_top as u16)
    }

    fn link_after(&mut self, prev: u16, addr: u16, key: &[u8], value: &[u8]) -> Result<()> {
        let mut prev_meta = self.record_meta(prev)?;
        let mut meta = RecordMeta::new(key.len(), value.len());
        meta.next = prev_meta.next;
        self.write_record(addr, &meta, key, value);

        prev_meta.next = addr;
        self.write_record_meta(prev, &prev_meta);

        self.set_free_size(self.free_size() - meta.occupy_size() as u32);
        self.set_node_size(self.node_size() + 1);
        Ok(())
    }

    /// Counts one more record in bucket `slot`, splitting it when full.
    fn grow_bucket(&mut self, slot: usize) -> Result<()> {
        let anchor = self.slot(slot)?;
        let mut meta = self.record_meta(anchor)?;
        meta.owned += 1;
        self.write_record_meta(anchor, &meta);

        if meta.owned >= BUCKET_CAPACITY {
            self.split_slot(slot)?;
        }
        Ok(())
    }

    /// Splits bucket `slot` in two: the middle record becomes the marked
    /// anchor of the lower half.
    fn split_slot(&mut self, slot: usize) -> Result<()> {
        let anchor = self.slot(slot)?;
        let mut anchor_meta = self.record_meta(anchor)?;
        let owned = anchor_meta.owned;
        let half = owned / 2;
        if half == 0 {
            return Ok(());
        }

        let mut cursor = self.slot(slot - 1)?;
        for _ in 0..half {
            cursor = self.record_meta(cursor)?.next;
        }

        let mut mid = self.record_meta(cursor)?;
        mid.owned = half;
        mid.slot_no = slot as u16;
        mid.set_split_anchor(true);
        self.write_record_meta(cursor, &mid);

        anchor_meta.owned = owned - half;
        self.write_record_meta(anchor, &anchor_meta);

        self.insert_slot(slot, cursor)?;

        // Marked neighbours may now pair with too few records.
        self.settle_split_mark(slot - 1)?;
        self.settle_split_mark(slot + 1)
    }

    /// Clears the split mark of bucket `left` when it and the next bucket
    /// no longer own [`BUCKET_CAPACITY`] records together.
    fn settle_split_mark(&mut self, left: usize) -> Result<()> {
        if left == 0 || left + 1 >= self.slots() as usize {
            return Ok(());
        }
        let left_addr = self.slot(left)?;
        let mut left_meta = self.record_meta(left_addr)?;
        if !left_meta.is_split_anchor() {
            return Ok(());
        }
        let right_meta = self.record_meta(self.slot(left + 1)?)?;
        if left_meta.owned + right_meta.owned < BUCKET_CAPACITY {
            left_meta.set_split_anchor(false);
            self.write_record_meta(left_addr, &left_meta);
        }
        Ok(())
    }

    pub fn insert(&mut self, key: &[u8], value: RecordValue<'_>, cmp: &dyn KeyComparator) -> Result<()> {
        let page_type = self.page_type();
        let left_child: [u8; 8];
        let (val, right): (&[u8], Option<PageId>) = match (page_type, value) {
            (PageType::Leaf, RecordValue::Leaf(bytes)) => (bytes, None),
            (PageType::Internal, RecordValue::Separator { left, right }) => {
                left_child = encode_u64(left as u64);
                (&left_child[..], Some(right))
            }
            (page_type, value) => {
                debug_assert!(false, "{:?} page cannot take {:?}", page_type, value);
                return Err(StorageError::ValueArity {
                    page_type,
                    expected: page_type.value_arity(),
                    got: value.arity(),
                });
            }
        };

        let occupy = RECORD_META_SIZE + key.len() + val.len();
        let limit = max_record_size(self.size() as usize);
        if occupy > limit {
            return Err(StorageError::RecordTooLarge {
                size: occupy,
                limit,
            });
        }

        let pos = self.position(key, cmp)?;
        let existing = pos.cur != MAX_RECORD_ADDR && cmp.equal(self.key_at(pos.cur)?, key);

        let target = if existing {
            if page_type == PageType::Leaf {
                return Err(StorageError::KeyExists);
            }
            self.write_value(pos.cur, val)?;
            pos.cur
        } else {
            if !self.try_alloc(occupy + ALLOC_RESERVE)? {
                return Err(StorageError::PageFull(self.self_id()));
            }

            // Compaction may have moved every record.
            let (prev, slot) = self.floor_search(key, cmp)?;
            let addr = self.alloc(occupy)?;
            self.link_after(prev, addr, key, val)?;
            self.grow_bucket(slot)?;
            addr
        };

        if let Some(right) = right {
            let successor = self.record_meta(target)?.next;
            self.write_value(successor, &encode_u64(right as u64))?;
        }
        Ok(())
    }

    pub fn erase(&mut self, key: &[u8], cmp: &dyn KeyComparator) -> Result<()> {
        let slot = self.locate_slot(key, cmp)?;
        let mut prev = self.slot(slot - 1)?;

        let mut found = None;
        for _ in 0..BUCKET_CAPACITY {
            let cur = self.record_meta(prev)?.next;
            let record = self.record(cur)?;
            if cur != MAX_RECORD_ADDR && cmp.equal(record.key, key) {
                found = Some(cur);
                break;
            }
            if record.meta.is_anchor() || !cmp.less(record.key, key) {
                return Err(StorageError::KeyNotFound);
            }
            prev = cur;
        }
        let cur = found.ok_or_else(|| self.corrupted(format!("bucket {} does not end in an anchor", slot)))?;

        let mut cur_meta = self.record_meta(cur)?;
        let mut prev_meta = self.record_meta(prev)?;
        prev_meta.next = cur_meta.next;

        let mut bucket_removed = false;
        if cur_meta.is_anchor() && prev_meta.is_anchor() {
            // The bucket held only this record.
            self.write_record_meta(prev, &prev_meta);
            self.remove_slot(slot);
            bucket_removed = true;
        } else if cur_meta.is_anchor() {
            prev_meta.owned = cur_meta.owned - 1;
            prev_meta.set_split_anchor(cur_meta.is_split_anchor());
            self.write_record_meta(prev, &prev_meta);
            self.set_slot(slot, prev);
        } else {
            self.write_record_meta(prev, &prev_meta);
            let anchor = self.slot(slot)?;
            let mut anchor_meta = self.record_meta(anchor)?;
            anchor_meta.owned -= 1;
            self.write_record_meta(anchor, &anchor_meta);
        }

        cur_meta.next = self.free_head();
        cur_meta.owned = 0;
        cur_meta.delete_mask = DELETED;
        self.write_record_meta(cur, &cur_meta);
        self.set_free_head(cur);

        self.set_free_size(self.free_size() + cur_meta.occupy_size() as u32);
        self.set_node_size(self.node_size() - 1);

        if !bucket_removed {
            self.rejoin_split(slot)?;
        }
        Ok(())
    }

    /// Joins bucket `slot` with the half it was split from once the pair
    /// owns fewer than [`BUCKET_CAPACITY`] records. Only marked pairs join,
    /// so erasing a key undoes exactly the split its insert caused.
    fn rejoin_split(&mut self, mut slot: usize) -> Result<()> {
        if slot >= 2 && self.joinable(slot - 1)? {
            self.join_buckets(slot - 1)?;
            slot -= 1;
        }
        if self.joinable(slot)? {
            self.join_buckets(slot)?;
        }
        Ok(())
    }

    fn joinable(&self, left: usize) -> Result<bool> {
        if left == 0 || left + 1 >= self.slots() as usize {
            return Ok(false);
        }
        let left_meta = self.record_meta(self.slot(left)?)?;
        if !left_meta.is_split_anchor() {
            return Ok(false);
        }
        let right_meta = self.record_meta(self.slot(left + 1)?)?;
        Ok(left_meta.owned + right_meta.owned < BUCKET_CAPACITY)
    }

    /// Folds bucket `left` into bucket `left + 1`. The right anchor keeps
    /// its own mark.
    fn join_buckets(&mut self, left: usize) -> Result<()> {
        let left_addr = self.slot(left)?;
        let right_addr = self.slot(left + 1)?;
        let mut left_meta = self.record_meta(left_addr)?;
        let mut right_meta = self.record_meta(right_addr)?;

        right_meta.owned += left_meta.owned;
        left_meta.owned = 0;
        left_meta.set_split_anchor(false);
        self.write_record_meta(left_addr, &left_meta);
        self.write_record_meta(right_addr, &right_meta);
        self.remove_slot(left);
        Ok(())
    }

    /// Compacts live records to the bottom of the heap in key order,
    /// rebuilds the slot directory and drops the tombstone chain.
    pub fn tidy(&mut self) -> Result<()> {
        let addrs = self.live_addresses()?;
        let mut heap = Vec::with_capacity(self.heap_top() as usize - FIRST_RECORD_ADDR);
        let mut anchors = Vec::with_capacity(self.slots() as usize);
        let mut first = MAX_RECORD_ADDR;

        for (i, &addr) in addrs.iter().enumerate() {
            let record = self.record(addr)?;
            let new_addr = (FIRST_RECORD_ADDR + heap.len()) as u16;
            if i == 0 {
                first = new_addr;
            }

            let mut meta = record.meta;
            meta.next = if i + 1 == addrs.len() {
                MAX_RECORD_ADDR
            } else {
                new_addr + meta.occupy_size() as u16
            };
            if meta.is_anchor() {
                anchors.push(new_addr);
            }

            let mut header = [0u8; RECORD_META_SIZE];
            meta.encode(&mut header);
            heap.extend_from_slice(&header);
            heap.extend_from_slice(record.key);
            heap.extend_from_slice(record.value);
        }

        if anchors.len() + 2 != self.slots() as usize {
            return Err(self.corrupted(format!(
                "{} anchors for {} slots",
                anchors.len(),
                self.slots()
            )));
        }

        let heap_end = FIRST_RECORD_ADDR + heap.len();
        let dir_start = self.slot_dir_start();
        self.data[FIRST_RECORD_ADDR..heap_end].copy_from_slice(&heap);
        self.data[heap_end..dir_start].fill(0);

        let mut min = self.record_meta(MIN_RECORD_ADDR)?;
        min.next = first;
        self.write_record_meta(MIN_RECORD_ADDR, &min);

        for (i, anchor) in anchors.into_iter().enumerate() {
            self.set_slot(i + 1, anchor);
        }

        let free_size = self.free_size();
        self.set_heap_top(heap_end as u16);
        self.set_free_head(0);
        self.set_free_size((dir_start - heap_end) as u32);
        debug_assert_eq!(free_size, self.free_size());
        Ok(())
    }

    /// Appends one record after the last live record. The key must sort
    /// after every key already in the page.
    pub fn append(&mut self, key: &[u8], value: &[u8], cmp: &dyn KeyComparator) -> Result<()> {
        if let Some(last) = self.last_record()? {
            if !cmp.less(last.key, key) {
                return Err(StorageError::ConstraintNotMatched(
                    "appended key must sort after the last record",
                ));
            }
        }
        self.push_back(key, value)
    }

    fn push_back(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let occupy = RECORD_META_SIZE + key.len() + value.len();
        if !self.try_alloc(occupy + ALLOC_RESERVE)? {
            return Err(StorageError::SpaceNotEnough {
                needed: occupy + ALLOC_RESERVE,
                available: self.free_size() as usize,
            });
        }

        let prev = self.tail_address()?;
        let addr = self.alloc(occupy)?;
        self.link_after(prev, addr, key, value)?;
        self.grow_bucket(self.slots() as usize - 1)
    }

    /// Appends every live record of `other` after our last record.
    ///
    /// Space and ordering are checked before anything is written, so an
    /// error leaves the page untouched.
    pub fn append_page(&mut self, other: &Page, cmp: &dyn KeyComparator) -> Result<()> {
        let addrs = other.live_addresses()?;
        let Some(&first) = addrs.first() else {
            return Ok(());
        };

        let mut payload = 0;
        for &addr in &addrs {
            payload += other.record_meta(addr)?.occupy_size();
        }
        let needed = payload + SLOT_WIDTH * (addrs.len().div_ceil(4) + 1) + ALLOC_RESERVE;
        let available = self.free_size() as usize;
        if available < needed {
            return Err(StorageError::SpaceNotEnough { needed, available });
        }

        if let Some(last) = self.last_record()? {
            if !cmp.less(last.key, other.key_at(first)?) {
                return Err(StorageError::ConstraintNotMatched(
                    "appended page must sort after the last record",
                ));
            }
        }

        self.tidy()?;
        for addr in addrs {
            let record = other.record(addr)?;
            self.push_back(record.key, record.value)?;
        }
        Ok(())
    }

    /// Builds a fresh page of the same type and size holding the records at
    /// `addrs`, which must be in key order.
    pub fn copy_records_to_new_page(&self, addrs: &[u16], page_id: PageId) -> Result<Page> {
        let mut page = Page::new(page_id, self.page_type(), self.size() as usize);
        for &addr in addrs {
            let record = self.record(addr)?;
            page.push_back(record.key, record.value)?;
        }
        Ok(page)
    }

    /// Splits the page around its median record and returns the separator
    /// key and the new right sibling.
    ///
    /// A leaf keeps the median (copy-up). An internal page promotes it:
    /// the median's child becomes the left page's rightmost child and the
    /// old rightmost child moves to the sibling (push-up).
    pub fn split(&mut self, sibling_id: PageId) -> Result<(Vec<u8>, Page)> {
        let node_size = self.node_size() as usize;
        if node_size < 3 {
            return Err(StorageError::ConstraintNotMatched(
                "split needs at least three records",
            ));
        }

        let addrs = self.live_addresses()?;
        let h = node_size / 2;
        let separator = self.key_at(addrs[h])?.to_vec();

        let (mut left, mut sibling) = match self.page_type() {
            PageType::Leaf => (
                self.copy_records_to_new_page(&addrs[..=h], self.self_id())?,
                self.copy_records_to_new_page(&addrs[h + 1..], sibling_id)?,
            ),
            PageType::Internal => {
                let mut left = self.copy_records_to_new_page(&addrs[..h], self.self_id())?;
                let mut sibling = self.copy_records_to_new_page(&addrs[h + 1..], sibling_id)?;
                left.set_max_child(self.child_of(addrs[h])?)?;
                sibling.set_max_child(self.max_child()?)?;
                (left, sibling)
            }
            PageType::Free => {
                return Err(StorageError::ConstraintNotMatched("free pages cannot split"));
            }
        };

        left.set_parent(self.parent());
        left.set_prev(self.prev());
        left.set_next(self.next());
        sibling.set_parent(self.parent());

        log::debug!(
            "page {} split: kept {}, moved {} to page {}",
            self.self_id(),
            left.node_size(),
            sibling.node_size(),
            sibling_id
        );

        *self = left;
        Ok((separator, sibling))
    }

    pub fn child_of(&self, addr: u16) -> Result<PageId> {
        let record = self.record(addr)?;
        decode_u64(record.value)
            .map(|child| child as PageId)
            .ok_or_else(|| self.corrupted(format!("record at {} carries no child", addr)))
    }

    pub fn set_child(&mut self, addr: u16, child: PageId) -> Result<()> {
        self.write_value(addr, &encode_u64(child as u64))
    }

    /// Rightmost child, carried by the `max` sentinel.
    pub fn max_child(&self) -> Result<PageId> {
        self.child_of(MAX_RECORD_ADDR)
    }

    pub fn set_max_child(&mut self, child: PageId) -> Result<()> {
        self.set_child(MAX_RECORD_ADDR, child)
    }

    /// Every child in key order, the rightmost last.
    pub fn children(&self) -> Result<Vec<PageId>> {
        let mut children = Vec::with_capacity(self.node_size() as usize + 1);
        for addr in self.live_addresses()? {
            children.push(self.child_of(addr)?);
        }
        children.push(self.max_child()?);
        Ok(children)
    }

    /// Offset of the record (or `max` sentinel) pointing at `child`.
    pub fn find_child(&self, child: PageId) -> Result<Option<u16>> {
        let mut addrs = self.live_addresses()?;
        addrs.push(MAX_RECORD_ADDR);
        for addr in addrs {
            if self.child_of(addr)? == child {
                return Ok(Some(addr));
            }
        }
        Ok(None)
    }

    pub fn replace_child(&mut self, old: PageId, new: PageId) -> Result<bool> {
        match self.find_child(old)? {
            Some(addr) => {
                self.set_child(addr, new)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..OFF_CHECKSUM]);
        hasher.update(&self.data[OFF_CHECKSUM + 4..]);
        hasher.finalize()
    }

    pub fn update_checksum(&mut self) {
        let checksum = self.compute_checksum();
        write_u32(&mut self.data, OFF_CHECKSUM, checksum);
    }

    pub fn verify_checksum(&self) -> Result<()> {
        if read_u32(&self.data, OFF_CHECKSUM) != self.compute_checksum() {
            return Err(StorageError::ChecksumMismatch(self.self_id()));
        }
        Ok(())
    }

    /// Walks the whole page and checks its structural invariants: strict key
    /// order, bucket sizes against anchors, split marks, slot directory and
    /// space accounting.
    pub fn check_integrity(&self, cmp: &dyn KeyComparator) -> Result<()> {
        let addrs = self.live_addresses()?;

        let mut live_bytes = 0;
        let mut run = 0u16;
        let mut anchors = vec![MIN_RECORD_ADDR];
        let mut owned = vec![1u16];
        let mut marked = vec![false];
        let mut prev_key: Option<&[u8]> = None;

        for &addr in &addrs {
            let record = self.record(addr)?;
            if let Some(prev_key) = prev_key {
                if !cmp.less(prev_key, record.key) {
                    return Err(self.corrupted(format!("keys out of order at {}", addr)));
                }
            }
            prev_key = Some(record.key);
            live_bytes += record.meta.occupy_size();

            run += 1;
            if record.meta.is_anchor() {
                if record.meta.owned != run || run >= BUCKET_CAPACITY {
                    return Err(self.corrupted(format!(
                        "anchor at {} owns {} but its bucket holds {}",
                        addr, record.meta.owned, run
                    )));
                }
                anchors.push(addr);
                owned.push(run);
                marked.push(record.meta.is_split_anchor());
                run = 0;
            } else if record.meta.is_split_anchor() {
                return Err(self.corrupted(format!("split mark on non-anchor at {}", addr)));
            }
        }

        let max = self.record_meta(MAX_RECORD_ADDR)?;
        if max.owned != run + 1 || max.owned > BUCKET_CAPACITY {
            return Err(self.corrupted(format!(
                "max sentinel owns {} but its bucket holds {}",
                max.owned,
                run + 1
            )));
        }
        anchors.push(MAX_RECORD_ADDR);
        owned.push(max.owned);

        if max.is_split_anchor() || self.record_meta(MIN_RECORD_ADDR)?.is_split_anchor() {
            return Err(self.corrupted("split mark on a sentinel".to_string()));
        }
        for (i, &mark) in marked.iter().enumerate() {
            if mark && owned[i] + owned[i + 1] < BUCKET_CAPACITY {
                return Err(self.corrupted(format!(
                    "split pair at slot {} owns {} records",
                    i,
                    owned[i] + owned[i + 1]
                )));
            }
        }

        if anchors.len() != self.slots() as usize {
            return Err(self.corrupted(format!(
                "{} anchors for {} slots",
                anchors.len(),
                self.slots()
            )));
        }
        for (i, anchor) in anchors.into_iter().enumerate() {
            if self.slot(i)? != anchor {
                return Err(self.corrupted(format!("slot {} does not point at its anchor", i)));
            }
        }

        let expected = self.size() as usize
            - FIRST_RECORD_ADDR
            - live_bytes
            - SLOT_WIDTH * self.slots() as usize;
        if expected != self.free_size() as usize {
            return Err(self.corrupted(format!(
                "free_size {} but records leave {}",
                self.free_size(),
                expected
            )));
        }
        Ok(())
    }

    pub fn debug_layout(&self) {
        log::debug!("page {} layout: {}", self.self_id(), self.meta());
        for record in self.iter_with_sentinels() {
            log::debug!("  @{} {} {}", record.address, record.meta, record);
        }
        log::debug!(
            "  contiguous free range: {}..{}",
            self.heap_top(),
            self.slot_dir_start()
        );
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").field("meta", &self.meta()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BytewiseComparator;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const PAGE_SIZE: usize = 16 * 1024;

    fn key(i: usize) -> Vec<u8> {
        format!("key{}", 10000 + i).into_bytes()
    }

    fn val(i: usize) -> Vec<u8> {
        format!("val{}", 10000 + i).into_bytes()
    }

    fn leaf_with(n: usize) -> Page {
        let cmp = BytewiseComparator;
        let mut page = Page::new(1, PageType::Leaf, PAGE_SIZE);
        for i in 0..n {
            page.insert(&key(i), RecordValue::Leaf(&val(i)), &cmp).unwrap();
        }
        page
    }

    fn internal_with(n: usize) -> Page {
        let cmp = BytewiseComparator;
        let mut page = Page::new(1, PageType::Internal, PAGE_SIZE);
        for i in 0..n {
            let value = RecordValue::Separator {
                left: 100 + i as PageId,
                right: 101 + i as PageId,
            };
            page.insert(&key(i), value, &cmp).unwrap();
        }
        page
    }

    fn keys_of(page: &Page) -> Vec<Vec<u8>> {
        page.iter().map(|r| r.key.to_vec()).collect()
    }

    #[test]
    fn test_new_page_layout() {
        let page = Page::new(42, PageType::Leaf, PAGE_SIZE);
        let meta = page.meta();

        assert_eq!(meta.self_id, 42);
        assert_eq!(meta.page_type, PageType::Leaf);
        assert_eq!(meta.slots, 2);
        assert_eq!(meta.node_size, 0);
        assert_eq!(meta.heap_top as usize, FIRST_RECORD_ADDR);
        assert_eq!(meta.free_size as usize, PAGE_SIZE - FIRST_RECORD_ADDR - 4);
        assert_eq!(page.slot(0).unwrap(), MIN_RECORD_ADDR);
        assert_eq!(page.slot(1).unwrap(), MAX_RECORD_ADDR);
        assert_eq!(page.iter().count(), 0);
        assert_eq!(page.iter_with_sentinels().count(), 2);
        page.check_integrity(&BytewiseComparator).unwrap();
    }

    #[test]
    fn test_sentinel_sizes() {
        assert_eq!(MAX_RECORD_ADDR, 57);
        assert_eq!(SENTINEL_SIZE, 42);
        assert_eq!(FIRST_RECORD_ADDR, 82);
    }

    #[test]
    fn test_insert_and_search() {
        let cmp = BytewiseComparator;
        let page = leaf_with(100);

        assert_eq!(page.node_size(), 100);
        for i in 0..100 {
            assert_eq!(page.search(&key(i), &cmp).unwrap(), Some(&val(i)[..]));
        }
        assert_eq!(page.search(b"key0", &cmp).unwrap(), None);
        assert_eq!(page.search(b"key99999", &cmp).unwrap(), None);
        page.check_integrity(&cmp).unwrap();
    }

    #[test]
    fn test_reverse_insert_keeps_order() {
        let cmp = BytewiseComparator;
        let mut page = Page::new(1, PageType::Leaf, PAGE_SIZE);
        for i in (0..64).rev() {
            page.insert(&key(i), RecordValue::Leaf(&val(i)), &cmp).unwrap();
        }

        let expected: Vec<Vec<u8>> = (0..64).map(key).collect();
        assert_eq!(keys_of(&page), expected);
        page.check_integrity(&cmp).unwrap();
    }

    #[test]
    fn test_user_keys_named_like_sentinels() {
        let cmp = BytewiseComparator;
        let mut page = Page::new(1, PageType::Leaf, PAGE_SIZE);
        page.insert(b"max", RecordValue::Leaf(b"1"), &cmp).unwrap();
        page.insert(b"min", RecordValue::Leaf(b"2"), &cmp).unwrap();

        assert_eq!(page.search(b"max", &cmp).unwrap(), Some(&b"1"[..]));
        assert_eq!(page.search(b"min", &cmp).unwrap(), Some(&b"2"[..]));
        page.erase(b"max", &cmp).unwrap();
        assert_eq!(page.search(b"max", &cmp).unwrap(), None);
        page.check_integrity(&cmp).unwrap();
    }

    #[test]
    fn test_duplicate_leaf_key() {
        let cmp = BytewiseComparator;
        let mut page = leaf_with(10);
        let before = page.meta();

        let result = page.insert(&key(3), RecordValue::Leaf(b"other"), &cmp);
        assert!(matches!(result, Err(StorageError::KeyExists)));
        assert_eq!(page.meta(), before);
        assert_eq!(page.search(&key(3), &cmp).unwrap(), Some(&val(3)[..]));
    }

    #[test]
    fn test_internal_insert_sets_successor_child() {
        let cmp = BytewiseComparator;
        let mut page = Page::new(1, PageType::Internal, PAGE_SIZE);
        page.set_max_child(7).unwrap();

        page.insert(b"m", RecordValue::Separator { left: 7, right: 8 }, &cmp)
            .unwrap();
        assert_eq!(page.children().unwrap(), vec![7, 8]);

        page.insert(b"f", RecordValue::Separator { left: 7, right: 9 }, &cmp)
            .unwrap();
        assert_eq!(page.children().unwrap(), vec![7, 9, 8]);
    }

    #[test]
    fn test_internal_duplicate_overwrites_child() {
        let cmp = BytewiseComparator;
        let mut page = internal_with(5);
        let before = page.node_size();

        page.insert(&key(2), RecordValue::Separator { left: 500, right: 501 }, &cmp)
            .unwrap();
        assert_eq!(page.node_size(), before);

        let addr = page.find_child(500).unwrap().unwrap();
        assert_eq!(page.record(addr).unwrap().key, &key(2)[..]);
        assert_eq!(page.child_of(page.record(addr).unwrap().meta.next).unwrap(), 501);
    }

    #[test]
    fn test_lower_bound() {
        let cmp = BytewiseComparator;
        let mut page = leaf_with(100);

        let exact = page.lower_bound(&key(40), &cmp).unwrap();
        assert_eq!(page.record(exact).unwrap().key, &key(40)[..]);

        let between = page.lower_bound(b"key10040a", &cmp).unwrap();
        assert_eq!(page.record(between).unwrap().key, &key(41)[..]);

        let below = page.lower_bound(b"a", &cmp).unwrap();
        assert_eq!(page.record(below).unwrap().key, &key(0)[..]);

        let above = page.lower_bound(b"zzz", &cmp).unwrap();
        assert_eq!(above, MAX_RECORD_ADDR);
    }

    #[test]
    fn test_floor_search() {
        let cmp = BytewiseComparator;
        let mut page = leaf_with(100);

        let (prev, _) = page.floor_search(&key(40), &cmp).unwrap();
        assert_eq!(page.record(prev).unwrap().key, &key(39)[..]);

        let (prev, slot) = page.floor_search(b"a", &cmp).unwrap();
        assert_eq!(prev, MIN_RECORD_ADDR);
        assert_eq!(slot, 1);
    }

    #[test]
    fn test_erase() {
        let cmp = BytewiseComparator;
        let mut page = leaf_with(100);

        for i in (0..100).step_by(3) {
            page.erase(&key(i), &cmp).unwrap();
        }
        for i in 0..100 {
            let found = page.search(&key(i), &cmp).unwrap();
            assert_eq!(found.is_some(), i % 3 != 0, "key {}", i);
        }
        assert!(matches!(page.erase(&key(0), &cmp), Err(StorageError::KeyNotFound)));
        assert!(page.free_head() != 0);
        page.check_integrity(&cmp).unwrap();
    }

    #[test]
    fn test_erase_everything() {
        let cmp = BytewiseComparator;
        let mut page = leaf_with(50);
        for i in 0..50 {
            page.erase(&key(i), &cmp).unwrap();
        }

        assert_eq!(page.node_size(), 0);
        assert_eq!(page.slots(), 2);
        assert_eq!(page.free_size() as usize, PAGE_SIZE - FIRST_RECORD_ADDR - 4);
        page.check_integrity(&cmp).unwrap();
    }

    #[test]
    fn test_erase_rejoins_split_bucket() {
        let cmp = BytewiseComparator;
        let mut page = leaf_with(6);
        assert_eq!(page.slots(), 2);

        page.insert(&key(6), RecordValue::Leaf(&val(6)), &cmp).unwrap();
        assert_eq!(page.slots(), 3);
        assert!(page.record_meta(page.slot(1).unwrap()).unwrap().is_split_anchor());

        page.erase(&key(6), &cmp).unwrap();
        assert_eq!(page.slots(), 2);
        page.check_integrity(&cmp).unwrap();
    }

    #[test]
    fn test_insert_then_erase_after_mixed_history() {
        let cmp = BytewiseComparator;
        let mut page = Page::new(1, PageType::Leaf, PAGE_SIZE);
        for i in [12, 70, 58, 10, 4, 20, 14, 32, 18] {
            page.insert(&key(i), RecordValue::Leaf(&val(i)), &cmp).unwrap();
        }
        page.erase(&key(4), &cmp).unwrap();
        for i in [78, 68] {
            page.insert(&key(i), RecordValue::Leaf(&val(i)), &cmp).unwrap();
        }
        // Buckets of 3, 4 and 4 records where only the upper pair came
        // from one split.
        assert_eq!(page.slots(), 4);
        page.check_integrity(&cmp).unwrap();

        let before = (page.node_size(), page.free_size(), page.slots());
        page.insert(&key(0), RecordValue::Leaf(&val(0)), &cmp).unwrap();
        page.erase(&key(0), &cmp).unwrap();
        assert_eq!((page.node_size(), page.free_size(), page.slots()), before);
        page.check_integrity(&cmp).unwrap();
    }

    #[test]
    fn test_check_integrity_rejects_underfull_split_pair() {
        let cmp = BytewiseComparator;
        let mut page = leaf_with(7);
        let anchor = page.slot(1).unwrap();
        let mut meta = page.record_meta(anchor).unwrap();
        assert!(meta.is_split_anchor());

        // Unmarked buckets never join, whatever they own.
        meta.set_split_anchor(false);
        page.write_record_meta(anchor, &meta);
        page.erase(&key(0), &cmp).unwrap();
        assert_eq!(page.slots(), 3);
        page.check_integrity(&cmp).unwrap();

        let mut meta = page.record_meta(anchor).unwrap();
        meta.set_split_anchor(true);
        page.write_record_meta(anchor, &meta);
        assert!(matches!(
            page.check_integrity(&cmp),
            Err(StorageError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_tidy_keeps_free_size_and_order() {
        let cmp = BytewiseComparator;
        let mut page = leaf_with(100);
        for i in (1..100).step_by(2) {
            page.erase(&key(i), &cmp).unwrap();
        }

        let free_size = page.free_size();
        let keys = keys_of(&page);
        page.tidy().unwrap();

        assert_eq!(page.free_size(), free_size);
        assert_eq!(page.free_head(), 0);
        assert_eq!(keys_of(&page), keys);
        assert_eq!(
            page.heap_top() as usize,
            FIRST_RECORD_ADDR + page.valid_data_size()
        );
        page.check_integrity(&cmp).unwrap();
    }

    #[test]
    fn test_page_full() {
        let cmp = BytewiseComparator;
        let mut page = Page::new(1, PageType::Leaf, 512);
        let mut inserted = 0;
        loop {
            match page.insert(&key(inserted), RecordValue::Leaf(&val(inserted)), &cmp) {
                Ok(()) => inserted += 1,
                Err(StorageError::PageFull(1)) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert!(inserted >= 3);
        assert_eq!(page.node_size() as usize, inserted);
        page.check_integrity(&cmp).unwrap();
    }

    #[test]
    fn test_record_too_large() {
        let cmp = BytewiseComparator;
        let mut page = Page::new(1, PageType::Leaf, 512);
        let big = vec![b'x'; 200];

        let result = page.insert(b"k", RecordValue::Leaf(&big), &cmp);
        assert!(matches!(result, Err(StorageError::RecordTooLarge { .. })));
    }

    #[test]
    fn test_split_leaf() {
        let cmp = BytewiseComparator;
        let mut page = leaf_with(100);
        page.set_parent(9);

        let (separator, sibling) = page.split(2).unwrap();

        assert_eq!(separator, key(50));
        assert_eq!(page.node_size(), 51);
        assert_eq!(sibling.node_size(), 49);
        assert_eq!(sibling.self_id(), 2);
        assert_eq!(sibling.parent(), 9);
        assert_eq!(page.last_record().unwrap().unwrap().key, &key(50)[..]);
        assert_eq!(sibling.first_key().unwrap(), Some(&key(51)[..]));
        page.check_integrity(&cmp).unwrap();
        sibling.check_integrity(&cmp).unwrap();
    }

    #[test]
    fn test_split_internal() {
        let cmp = BytewiseComparator;
        let mut page = internal_with(100);
        let old_max_child = page.max_child().unwrap();

        let (separator, sibling) = page.split(2).unwrap();

        assert_eq!(separator, key(50));
        assert_eq!(page.node_size(), 50);
        assert_eq!(sibling.node_size(), 49);
        // key(50) carried child 150; it now closes the left page.
        assert_eq!(page.max_child().unwrap(), 150);
        assert_eq!(sibling.max_child().unwrap(), old_max_child);
        assert_eq!(sibling.first_key().unwrap(), Some(&key(51)[..]));
        page.check_integrity(&cmp).unwrap();
        sibling.check_integrity(&cmp).unwrap();
    }

    #[test]
    fn test_split_needs_three_records() {
        let mut page = leaf_with(2);
        assert!(matches!(
            page.split(2),
            Err(StorageError::ConstraintNotMatched(_))
        ));
    }

    #[test]
    fn test_append_page() {
        let cmp = BytewiseComparator;
        let mut left = leaf_with(30);
        let mut right = Page::new(2, PageType::Leaf, PAGE_SIZE);
        for i in 30..60 {
            right.insert(&key(i), RecordValue::Leaf(&val(i)), &cmp).unwrap();
        }

        left.append_page(&right, &cmp).unwrap();

        assert_eq!(left.node_size(), 60);
        let expected: Vec<Vec<u8>> = (0..60).map(key).collect();
        assert_eq!(keys_of(&left), expected);
        left.check_integrity(&cmp).unwrap();
    }

    #[test]
    fn test_append_page_rejects_overlap() {
        let cmp = BytewiseComparator;
        let mut left = leaf_with(30);
        let right = leaf_with(5);
        let before = left.meta();

        assert!(matches!(
            left.append_page(&right, &cmp),
            Err(StorageError::ConstraintNotMatched(_))
        ));
        assert_eq!(left.meta(), before);
    }

    #[test]
    fn test_append_page_rejects_overflow() {
        let cmp = BytewiseComparator;
        let mut left = Page::new(1, PageType::Leaf, 512);
        let mut right = Page::new(2, PageType::Leaf, 512);
        for i in 0..8 {
            left.insert(&key(i), RecordValue::Leaf(&val(i)), &cmp).unwrap();
            right.insert(&key(100 + i), RecordValue::Leaf(&val(i)), &cmp).unwrap();
        }

        assert!(matches!(
            left.append_page(&right, &cmp),
            Err(StorageError::SpaceNotEnough { .. })
        ));
        assert_eq!(left.node_size(), 8);
    }

    #[test]
    fn test_append_requires_order() {
        let cmp = BytewiseComparator;
        let mut page = leaf_with(3);
        page.append(&key(10), b"v", &cmp).unwrap();
        assert!(matches!(
            page.append(&key(5), b"v", &cmp),
            Err(StorageError::ConstraintNotMatched(_))
        ));
        assert_eq!(page.node_size(), 4);
    }

    #[test]
    fn test_replace_child() {
        let mut page = internal_with(4);
        assert!(page.replace_child(102, 900).unwrap());
        assert!(!page.replace_child(102, 901).unwrap());
        assert!(page.children().unwrap().contains(&900));
    }

    #[test]
    fn test_checksum() {
        let mut page = leaf_with(10);
        page.update_checksum();
        page.verify_checksum().unwrap();

        let mut bytes = page.as_bytes().to_vec();
        bytes[200] ^= 0xFF;
        let tampered = Page::from_bytes(&bytes).unwrap();
        assert!(matches!(
            tampered.verify_checksum(),
            Err(StorageError::ChecksumMismatch(1))
        ));
    }

    #[test]
    fn test_from_bytes_roundtrip() {
        let cmp = BytewiseComparator;
        let page = leaf_with(20);
        let copy = Page::from_bytes(page.as_bytes()).unwrap();
        assert_eq!(copy.meta(), page.meta());
        assert_eq!(copy.search(&key(7), &cmp).unwrap(), Some(&val(7)[..]));
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(Page::from_bytes(&[0u8; 100]).is_err());
        assert!(Page::from_bytes(&vec![0xAB; 1024]).is_err());
        // An all-zero page claims size 0.
        assert!(Page::from_bytes(&vec![0u8; 1024]).is_err());
    }

    proptest! {
        #[test]
        fn prop_insert_then_erase_restores_accounting(
            ops in proptest::collection::vec((0usize..150, any::<bool>()), 1..400),
            extra in 0usize..150,
        ) {
            let cmp = BytewiseComparator;
            let mut page = Page::new(1, PageType::Leaf, PAGE_SIZE);
            for (i, insert) in ops {
                let k = key(2 * i);
                if insert {
                    let _ = page.insert(&k, RecordValue::Leaf(&val(i)), &cmp);
                } else {
                    let _ = page.erase(&k, &cmp);
                }
            }
            page.check_integrity(&cmp).unwrap();

            // Odd keys never appear in the history.
            let absent = key(2 * extra + 1);
            let before = (page.node_size(), page.free_size(), page.slots());
            page.insert(&absent, RecordValue::Leaf(b"payload"), &cmp).unwrap();
            page.erase(&absent, &cmp).unwrap();

            prop_assert_eq!((page.node_size(), page.free_size(), page.slots()), before);
            page.check_integrity(&cmp).unwrap();
        }

        #[test]
        fn prop_random_ops_match_model(ops in proptest::collection::vec((0usize..200, any::<bool>()), 1..400)) {
            let cmp = BytewiseComparator;
            let mut page = Page::new(1, PageType::Leaf, PAGE_SIZE);
            let mut model = std::collections::BTreeMap::new();

            for (i, insert) in ops {
                if insert {
                    let result = page.insert(&key(i), RecordValue::Leaf(&val(i)), &cmp);
                    if model.insert(key(i), val(i)).is_some() {
                        prop_assert!(matches!(result, Err(StorageError::KeyExists)));
                    } else {
                        prop_assert!(result.is_ok());
                    }
                } else {
                    let result = page.erase(&key(i), &cmp);
                    prop_assert_eq!(result.is_ok(), model.remove(&key(i)).is_some());
                }
            }

            page.check_integrity(&cmp).unwrap();
            let keys: Vec<Vec<u8>> = model.keys().cloned().collect();
            prop_assert_eq!(keys_of(&page), keys);
        }
    }
}
