use super::{Page, MAX_RECORD_ADDR, MIN_RECORD_ADDR};
use crate::codec::{read_u16, write_u16};
use std::fmt;

/// Size of the fixed record header that precedes key and value bytes.
pub const RECORD_META_SIZE: usize = 14;

/// `delete_mask` bit: the record sits on the tombstone chain.
pub const DELETED: u16 = 0x1;

/// `delete_mask` bit: the anchor closes the lower half of a bucket split.
/// Its bucket and the next one together own at least
/// [`BUCKET_CAPACITY`](super::BUCKET_CAPACITY) records.
pub const SPLIT_ANCHOR: u16 = 0x2;

/// Record header, decoded by value out of the page arena.
///
/// `owned > 0` marks a slot anchor: the last record of its bucket, with
/// `owned` counting every record of the bucket including itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordMeta {
    pub next: u16,        // offset of the next record in its chain, 0 = end
    pub owned: u16,       // bucket size when this record is a slot anchor
    pub delete_mask: u16, // DELETED / SPLIT_ANCHOR bits
    pub len: u16,         // key_len + val_len
    pub key_len: u16,
    pub val_len: u16,
    pub slot_no: u16, // cached bucket index from the last search
}

impl RecordMeta {
    pub fn new(key_len: usize, val_len: usize) -> Self {
        Self {
            next: 0,
            owned: 0,
            delete_mask: 0,
            len: (key_len + val_len) as u16,
            key_len: key_len as u16,
            val_len: val_len as u16,
            slot_no: 0,
        }
    }

    pub(crate) fn decode(bytes: &[u8]) -> Self {
        Self {
            next: read_u16(bytes, 0),
            owned: read_u16(bytes, 2),
            delete_mask: read_u16(bytes, 4),
            len: read_u16(bytes, 6),
            key_len: read_u16(bytes, 8),
            val_len: read_u16(bytes, 10),
            slot_no: read_u16(bytes, 12),
        }
    }

    pub(crate) fn encode(&self, bytes: &mut [u8]) {
        write_u16(bytes, 0, self.next);
        write_u16(bytes, 2, self.owned);
        write_u16(bytes, 4, self.delete_mask);
        write_u16(bytes, 6, self.len);
        write_u16(bytes, 8, self.key_len);
        write_u16(bytes, 10, self.val_len);
        write_u16(bytes, 12, self.slot_no);
    }

    /// Bytes the record occupies in the heap, header included.
    pub fn occupy_size(&self) -> usize {
        RECORD_META_SIZE + self.len as usize
    }

    pub fn is_anchor(&self) -> bool {
        self.owned > 0
    }

    pub fn is_deleted(&self) -> bool {
        self.delete_mask & DELETED != 0
    }

    pub fn is_split_anchor(&self) -> bool {
        self.delete_mask & SPLIT_ANCHOR != 0
    }

    pub fn set_split_anchor(&mut self, on: bool) {
        if on {
            self.delete_mask |= SPLIT_ANCHOR;
        } else {
            self.delete_mask &= !SPLIT_ANCHOR;
        }
    }
}

impl fmt::Display for RecordMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[next={}, owned={}, delete_mask={}, len={}, key_len={}, val_len={}, slot_no={}]",
            self.next,
            self.owned,
            self.delete_mask,
            self.len,
            self.key_len,
            self.val_len,
            self.slot_no
        )
    }
}

/// A borrowed view of one record inside a page.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub address: u16,
    pub meta: RecordMeta,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl Record<'_> {
    pub fn is_sentinel(&self) -> bool {
        self.address == MIN_RECORD_ADDR || self.address == MAX_RECORD_ADDR
    }
}

impl fmt::Display for Record<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[key={}, val={}]",
            String::from_utf8_lossy(self.key),
            String::from_utf8_lossy(self.value)
        )
    }
}

/// Walks the live chain in key order.
///
/// Sentinels are skipped unless the iterator was built with
/// [`Page::iter_with_sentinels`]. A malformed chain ends the iteration.
pub struct RecordIter<'a> {
    page: &'a Page,
    next: u16,
    with_sentinels: bool,
    remaining: usize,
}

impl<'a> RecordIter<'a> {
    pub(crate) fn new(page: &'a Page, with_sentinels: bool) -> Self {
        Self {
            page,
            next: MIN_RECORD_ADDR,
            with_sentinels,
            // Live records plus both sentinels; guards against cycles.
            remaining: page.node_size() as usize + 2,
        }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.next == 0 || self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;

            let record = match self.page.record(self.next) {
                Ok(record) => record,
                Err(err) => {
                    log::error!("record chain walk stopped: {}", err);
                    self.next = 0;
                    return None;
                }
            };
            self.next = record.meta.next;

            if self.with_sentinels || !record.is_sentinel() {
                return Some(record);
            }
        }
    }
}
