//! Storage engine for leafdb
//!
//! This crate provides the storage primitives of an embedded ordered
//! key-value index: slotted pages, a buffer pool with pluggable page
//! replacement, and a disk-resident B+Tree built on top of both.

pub mod btree;
pub mod buffer;
pub mod codec;
pub mod compare;
pub mod config;
pub mod file;
pub mod page;

pub use btree::{BPlusTreeIndex, IndexMeta, PageSummary};
pub use buffer::{BufferPool, Frame, FrameHandle, FrameId, LruBufferPool, PagePosition};
pub use buffer::replacer::{ClockReplacer, LruReplacer, Replacer};
pub use compare::{BytewiseComparator, KeyComparator};
pub use config::{IndexConfig, PoolConfig, ReplacerKind};
pub use file::space::{FileSpaceManager, MemorySpaceManager, SpaceManager};
pub use file::{IndexFile, IndexHeader};
pub use page::record::{Record, RecordMeta};
pub use page::{Page, PageMeta, PageType, RecordValue};

use thiserror::Error;

/// Page identifier inside one index file. `0` is the nil page.
pub type PageId = u32;

/// The nil page id: no parent, no sibling, empty tree.
pub const NIL_PAGE: PageId = 0;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page {0} not found")]
    PageNotFound(u32),

    #[error("Page {0} is full")]
    PageFull(u32),

    #[error("Key already exists")]
    KeyExists,

    #[error("Key does not exist")]
    KeyNotFound,

    #[error("Not enough space: needed {needed} bytes, {available} available")]
    SpaceNotEnough { needed: usize, available: usize },

    #[error("Constraint not matched: {0}")]
    ConstraintNotMatched(&'static str),

    #[error("Record of {size} bytes exceeds the {limit} byte limit")]
    RecordTooLarge { size: usize, limit: usize },

    #[error("Page type {page_type:?} expects {expected} value(s), got {got}")]
    ValueArity {
        page_type: PageType,
        expected: usize,
        got: usize,
    },

    #[error("Buffer pool exhausted: all {0} frames are pinned")]
    PoolExhausted(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Corrupted page {page_id}: {reason}")]
    Corrupted { page_id: u32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch for page {0}")]
    ChecksumMismatch(u32),

    #[error("{0}")]
    Fail(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
