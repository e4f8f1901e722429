pub mod space;

use crate::config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::page::Page;
use crate::{PageId, Result, StorageError, NIL_PAGE};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic number identifying index files
const INDEX_MAGIC: [u8; 4] = *b"BPTI";

const FORMAT_VERSION: u32 = 1;

/// Bytes reserved for the header at the start of the file. Page `id`
/// starts at `INDEX_HEADER_SIZE + page_size * id`; id 0 is never stored.
pub const INDEX_HEADER_SIZE: usize = 64;

const CHECKSUM_OFFSET: usize = 40;

/// Tree-level metadata persisted in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexMeta {
    pub root: PageId,        // 0 while the tree is empty
    pub leaf: PageId,        // head of the leaf chain
    pub free: PageId,        // head of the freed-page list
    pub max_page_id: PageId, // last id handed out
    pub crc: u32,            // CRC32 of the header as last written
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexHeader {
    // Identification (16 bytes)
    magic: [u8; 4],   // "BPTI"
    version: u32,     // File format version
    header_size: u32, // Size of this header (64)
    page_size: u32,   // Fixed for the life of the file

    // Tree (16 bytes)
    pub meta: IndexMeta,

    // Bookkeeping (8 bytes)
    created_at: u64,
}

impl IndexHeader {
    fn new(page_size: usize) -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            magic: INDEX_MAGIC,
            version: FORMAT_VERSION,
            header_size: INDEX_HEADER_SIZE as u32,
            page_size: page_size as u32,
            meta: IndexMeta::default(),
            created_at: now,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size as usize
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    fn validate(&self) -> Result<()> {
        if self.magic != INDEX_MAGIC {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid index file: wrong magic number",
            )));
        }

        if self.version > FORMAT_VERSION {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported index format version: {}", self.version),
            )));
        }

        if self.header_size as usize != INDEX_HEADER_SIZE
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size())
        {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Invalid index layout: header {} bytes, page {} bytes",
                    self.header_size, self.page_size
                ),
            )));
        }

        Ok(())
    }

    fn to_bytes(&self) -> [u8; INDEX_HEADER_SIZE] {
        let mut bytes = [0u8; INDEX_HEADER_SIZE];

        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.header_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.page_size.to_le_bytes());

        bytes[16..20].copy_from_slice(&self.meta.root.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.meta.leaf.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.meta.free.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.meta.max_page_id.to_le_bytes());

        bytes[32..40].copy_from_slice(&self.created_at.to_le_bytes());
        bytes[40..44].copy_from_slice(&self.meta.crc.to_le_bytes());

        bytes
    }

    fn from_bytes(bytes: &[u8; INDEX_HEADER_SIZE]) -> Result<Self> {
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        let mut created_at = [0u8; 8];
        created_at.copy_from_slice(&bytes[32..40]);

        let header = Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            version: u32_at(4),
            header_size: u32_at(8),
            page_size: u32_at(12),
            meta: IndexMeta {
                root: u32_at(16),
                leaf: u32_at(20),
                free: u32_at(24),
                max_page_id: u32_at(28),
                crc: u32_at(40),
            },
            created_at: u64::from_le_bytes(created_at),
        };

        header.validate()?;
        Ok(header)
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..CHECKSUM_OFFSET]); // Everything before the checksum field
        hasher.update(&bytes[CHECKSUM_OFFSET + 4..]); // Everything after it
        hasher.finalize()
    }

    fn update_checksum(&mut self) {
        self.meta.crc = self.compute_checksum();
    }

    fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.meta.crc
    }
}

/// An index file: a 64-byte header followed by fixed-size pages.
pub struct IndexFile {
    file: File,
    path: PathBuf,
    header: IndexHeader,
}

impl IndexFile {
    pub fn create_new(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Self::initialize(file, path, page_size)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = Self::read_header(&mut file)?;
        log::debug!(
            "opened index {} (page size {}, root {}, {} pages)",
            path.display(),
            header.page_size,
            header.meta.root,
            header.meta.max_page_id
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
        })
    }

    /// Opens `path`, creating it with `page_size` when missing or empty.
    /// An existing file keeps the page size it was created with.
    pub fn open_or_create(path: &Path, page_size: usize) -> Result<Self> {
        match fs::metadata(path) {
            Ok(metadata) if metadata.len() > 0 => {
                let index = Self::open(path)?;
                if index.page_size() != page_size {
                    log::warn!(
                        "index {} was created with {} byte pages, ignoring configured {}",
                        path.display(),
                        index.page_size(),
                        page_size
                    );
                }
                Ok(index)
            }
            _ => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                Self::initialize(file, path, page_size)
            }
        }
    }

    fn initialize(file: File, path: &Path, page_size: usize) -> Result<Self> {
        let mut index = Self {
            file,
            path: path.to_path_buf(),
            header: IndexHeader::new(page_size),
        };
        index.write_header()?;
        log::debug!("created index {} with {} byte pages", path.display(), page_size);
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn meta(&self) -> IndexMeta {
        self.header.meta
    }

    pub fn meta_mut(&mut self) -> &mut IndexMeta {
        &mut self.header.meta
    }

    pub fn page_size(&self) -> usize {
        self.header.page_size()
    }

    /// Byte offset of page `page_id` inside the file.
    pub fn page_offset(&self, page_id: PageId) -> u64 {
        INDEX_HEADER_SIZE as u64 + self.header.page_size as u64 * page_id as u64
    }

    /// Hands out the next page id. Ids are never reused.
    pub fn allocate_page(&mut self) -> PageId {
        self.header.meta.max_page_id += 1;
        self.header.meta.max_page_id
    }

    pub(crate) fn check_page_id(&self, page_id: PageId) -> Result<()> {
        if page_id == NIL_PAGE || page_id > self.header.meta.max_page_id {
            return Err(StorageError::PageNotFound(page_id));
        }
        Ok(())
    }

    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        let page_id = page.self_id();
        self.check_page_id(page_id)?;

        if page.as_bytes().len() != self.page_size() {
            return Err(StorageError::Corrupted {
                page_id,
                reason: format!(
                    "page of {} bytes in a file of {} byte pages",
                    page.as_bytes().len(),
                    self.page_size()
                ),
            });
        }

        let offset = self.page_offset(page_id);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(page.as_bytes())?;
        log::trace!("wrote page {} at offset {}", page_id, offset);
        Ok(())
    }

    pub fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        self.check_page_id(page_id)?;

        let offset = self.page_offset(page_id);
        self.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; self.page_size()];
        self.file.read_exact(&mut buffer)?;
        log::trace!("read page {} at offset {}", page_id, offset);

        let page = Page::from_bytes(&buffer)?;
        page.verify_checksum()?;
        if page.self_id() != page_id {
            return Err(StorageError::Corrupted {
                page_id,
                reason: format!("slot holds page {}", page.self_id()),
            });
        }
        Ok(page)
    }

    pub fn write_header(&mut self) -> Result<()> {
        self.header.update_checksum();
        let bytes = self.header.to_bytes();

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    fn read_header(file: &mut File) -> Result<IndexHeader> {
        file.seek(SeekFrom::Start(0))?;

        let mut buffer = [0u8; INDEX_HEADER_SIZE];
        file.read_exact(&mut buffer)?;

        let header = IndexHeader::from_bytes(&buffer)?;
        if !header.verify_checksum() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "Index header checksum mismatch",
            )));
        }

        Ok(header)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
