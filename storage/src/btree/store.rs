//! Page I/O for the tree.
//!
//! Pages are copied out of storage on load and copied back on store, so
//! the tree always works on owned `Page` values. Storage is either the
//! index file itself or a buffer pool sitting in front of it.

use crate::buffer::{BufferPool, FrameHandle, PagePosition};
use crate::file::{IndexFile, IndexMeta};
use crate::page::Page;
use crate::{PageId, Result, StorageError};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

/// Loads and stores tree pages.
///
/// With a pool the store is write-through: `store` copies the page into its
/// frame and flushes that frame before returning, so frames stay clean and
/// eviction never has to write them. The pool still serves loads and keeps
/// pages resident.
pub(crate) struct PageStore {
    file: Mutex<IndexFile>,
    pool: Option<Arc<dyn BufferPool>>,
    /// Space name of the index file inside the pool.
    space: Arc<str>,
    page_size: usize,
}

impl PageStore {
    pub(crate) fn direct(file: IndexFile) -> Self {
        let space: Arc<str> = file.path().to_string_lossy().into();
        let page_size = file.page_size();
        Self {
            file: Mutex::new(file),
            pool: None,
            space,
            page_size,
        }
    }

    pub(crate) fn buffered(file: IndexFile, pool: Arc<dyn BufferPool>) -> Result<Self> {
        if pool.page_size() != file.page_size() {
            return Err(StorageError::InvalidConfig(format!(
                "buffer pool frames hold {} bytes, index pages are {}",
                pool.page_size(),
                file.page_size()
            )));
        }

        let mut store = Self::direct(file);
        store.pool = Some(pool);
        Ok(store)
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn is_buffered(&self) -> bool {
        self.pool.is_some()
    }

    pub(crate) fn path(&self) -> PathBuf {
        self.file.lock().path().to_path_buf()
    }

    pub(crate) fn meta(&self) -> IndexMeta {
        self.file.lock().meta()
    }

    pub(crate) fn update_meta(&self, f: impl FnOnce(&mut IndexMeta)) {
        f(self.file.lock().meta_mut());
    }

    pub(crate) fn allocate(&self) -> PageId {
        self.file.lock().allocate_page()
    }

    fn position(&self, page_id: PageId) -> Result<PagePosition> {
        let file = self.file.lock();
        file.check_page_id(page_id)?;
        Ok(PagePosition::new(Arc::clone(&self.space), file.page_offset(page_id)))
    }

    pub(crate) fn load(&self, page_id: PageId) -> Result<Page> {
        let Some(pool) = &self.pool else {
            return self.file.lock().read_page(page_id);
        };

        let handle = FrameHandle::fetch(pool, self.position(page_id)?)?;
        let page = Page::from_bytes(&handle.read())?;
        page.verify_checksum()?;

        if page.self_id() != page_id {
            return Err(StorageError::Corrupted {
                page_id,
                reason: format!("slot holds page {}", page.self_id()),
            });
        }
        Ok(page)
    }

    /// Refreshes the page checksum and writes it out.
    pub(crate) fn store(&self, page: &mut Page) -> Result<()> {
        page.update_checksum();

        let Some(pool) = &self.pool else {
            return self.file.lock().write_page(page);
        };

        let handle = FrameHandle::fetch(pool, self.position(page.self_id())?)?;
        handle.write().copy_from_slice(page.as_bytes());
        // Release then only unpins.
        pool.flush_page(handle.position())?;
        Ok(())
    }

    /// Writes back cached pages and the header; `sync` also fsyncs the file.
    pub(crate) fn flush(&self, sync: bool) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.flush_all_pages()?;
        }

        let mut file = self.file.lock();
        file.write_header()?;
        if sync {
            file.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::LruBufferPool;
    use crate::file::space::FileSpaceManager;
    use crate::page::{PageType, RecordValue};
    use crate::BytewiseComparator;
    use tempfile::tempdir;

    #[test]
    fn test_buffered_store_writes_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.idx");
        let file = IndexFile::create_new(&path, 1024).unwrap();
        let pool: Arc<dyn BufferPool> =
            Arc::new(LruBufferPool::new(4, 1024, Arc::new(FileSpaceManager::new())));
        let store = PageStore::buffered(file, Arc::clone(&pool)).unwrap();

        let page_id = store.allocate();
        let mut page = Page::new(page_id, PageType::Leaf, 1024);
        page.insert(b"k", RecordValue::Leaf(b"v"), &BytewiseComparator).unwrap();
        store.store(&mut page).unwrap();

        let position = store.position(page_id).unwrap();
        let frame = pool.fetch_page(&position).unwrap();
        assert!(!frame.is_dirty());
        pool.unpin_page(&position);

        // The file already holds the page without a pool flush.
        let on_disk = store.file.lock().read_page(page_id).unwrap();
        assert_eq!(on_disk.as_bytes(), page.as_bytes());
    }
}
