//! Disk-resident B+Tree over slotted pages.
//!
//! Leaves hold the key/value records and are chained through `prev`/`next`
//! in key order. Internal pages hold separators: the record for key `k`
//! points at the child whose keys are all `<= k`, and the `max` sentinel
//! points at the rightmost child. Every level keeps its own sibling chain.
//!
//! Pages are loaded as owned copies, modified, and stored back; the tree
//! never holds a page across a call into storage.

mod store;

use crate::buffer::{BufferPool, LruBufferPool};
use crate::codec::encode_u64;
use crate::compare::KeyComparator;
use crate::config::IndexConfig;
use crate::file::space::FileSpaceManager;
use crate::file::IndexFile;
use crate::page::record::RECORD_META_SIZE;
use crate::page::{max_record_size, Page, PageType, RecordValue, MAX_RECORD_ADDR};
use crate::{PageId, Result, StorageError, NIL_PAGE};
use bytes::Bytes;
use log::{debug, error, trace};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use store::PageStore;

pub use crate::file::IndexMeta;

/// Deepest descent accepted before the tree is reported as corrupted.
const MAX_DEPTH: usize = 64;

/// Snapshot of one page, as reported by [`BPlusTreeIndex::bfs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSummary {
    pub page_id: PageId,
    pub page_type: PageType,
    pub parent: PageId,
    pub prev: PageId,
    pub next: PageId,
    pub node_size: u16,
    pub free_size: u32,
    pub keys: Vec<Bytes>,
    /// Children in key order; empty for leaves.
    pub children: Vec<PageId>,
}

impl PageSummary {
    fn of(page: &Page) -> Result<Self> {
        let children = match page.page_type() {
            PageType::Internal => page.children()?,
            _ => Vec::new(),
        };

        Ok(Self {
            page_id: page.self_id(),
            page_type: page.page_type(),
            parent: page.parent(),
            prev: page.prev(),
            next: page.next(),
            node_size: page.node_size(),
            free_size: page.free_size(),
            keys: page.iter().map(|r| Bytes::copy_from_slice(r.key)).collect(),
            children,
        })
    }
}

/// An ordered byte-string index stored in a single file.
///
/// Mutations take `&mut self`: the tree does no latching of its own.
pub struct BPlusTreeIndex {
    store: PageStore,
    comparator: Arc<dyn KeyComparator>,
    config: IndexConfig,
    closed: bool,
}

impl BPlusTreeIndex {
    /// Opens the index at `path`, creating it when missing. Page I/O goes
    /// through a private buffer pool when `config.pool` is set.
    pub fn open(
        path: impl AsRef<Path>,
        comparator: impl KeyComparator + 'static,
        config: IndexConfig,
    ) -> Result<Self> {
        config.validate()?;
        let file = IndexFile::open_or_create(path.as_ref(), config.page_size)?;

        let store = match &config.pool {
            Some(pool_config) => {
                let pool = LruBufferPool::from_config(
                    pool_config,
                    file.page_size(),
                    Arc::new(FileSpaceManager::new()),
                );
                PageStore::buffered(file, Arc::new(pool))?
            }
            None => PageStore::direct(file),
        };

        Ok(Self::with_store(store, Arc::new(comparator), config))
    }

    /// Opens the index at `path` on top of a caller-owned buffer pool.
    ///
    /// Pool frames are addressed by the index file's path as space name and
    /// the page's byte offset inside the file, so the pool's space manager
    /// must resolve that name to the same file (or to a stand-in for it).
    pub fn open_with_pool(
        path: impl AsRef<Path>,
        comparator: impl KeyComparator + 'static,
        config: IndexConfig,
        pool: Arc<dyn BufferPool>,
    ) -> Result<Self> {
        config.validate()?;
        let file = IndexFile::open_or_create(path.as_ref(), config.page_size)?;
        let store = PageStore::buffered(file, pool)?;
        Ok(Self::with_store(store, Arc::new(comparator), config))
    }

    fn with_store(store: PageStore, comparator: Arc<dyn KeyComparator>, config: IndexConfig) -> Self {
        let meta = store.meta();
        debug!(
            "index {} ready: root {}, leaf {}, {} pages, {}",
            store.path().display(),
            meta.root,
            meta.leaf,
            meta.max_page_id,
            if store.is_buffered() { "buffered" } else { "direct" }
        );

        Self {
            store,
            comparator,
            config,
            closed: false,
        }
    }

    pub fn meta(&self) -> IndexMeta {
        self.store.meta()
    }

    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StorageError::Fail("index is closed".into()));
        }
        Ok(())
    }

    fn corrupted(page_id: PageId, reason: impl Into<String>) -> StorageError {
        StorageError::Corrupted {
            page_id,
            reason: reason.into(),
        }
    }

    pub fn search(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let Some(leaf) = self.locate_leaf(key)? else {
            return Ok(None);
        };
        Ok(leaf
            .search(key, self.comparator.as_ref())?
            .map(Bytes::copy_from_slice))
    }

    /// Descends from the root to the leaf whose range covers `key`.
    fn locate_leaf(&self, key: &[u8]) -> Result<Option<Page>> {
        let root = self.store.meta().root;
        if root == NIL_PAGE {
            return Ok(None);
        }

        let cmp = self.comparator.as_ref();
        let mut page = self.store.load(root)?;
        for _ in 0..MAX_DEPTH {
            match page.page_type() {
                PageType::Leaf => return Ok(Some(page)),
                PageType::Internal => {
                    let addr = page.lower_bound(key, cmp)?;
                    let child = page.child_of(addr)?;
                    trace!("page {} -> child {}", page.self_id(), child);
                    page = self.store.load(child)?;
                }
                PageType::Free => {
                    return Err(Self::corrupted(page.self_id(), "free page reachable from the root"));
                }
            }
        }
        Err(Self::corrupted(root, format!("deeper than {} levels", MAX_DEPTH)))
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;

        // Separators carry an 8-byte child instead of the value, so the
        // key must also fit an internal page.
        let size = RECORD_META_SIZE + key.len() + value.len().max(8);
        let limit = max_record_size(self.store.page_size());
        if size > limit {
            return Err(StorageError::RecordTooLarge { size, limit });
        }

        let leaf = match self.locate_leaf(key)? {
            Some(leaf) => leaf,
            None => {
                let root = self.store.allocate();
                self.store.update_meta(|meta| {
                    meta.root = root;
                    meta.leaf = root;
                });
                debug!("created root leaf {}", root);
                Page::new(root, PageType::Leaf, self.store.page_size())
            }
        };

        self.insert_into(leaf, key, RecordValue::Leaf(value))
    }

    /// Inserts into `page`, splitting it (and its ancestors) when full.
    fn insert_into(&self, mut page: Page, key: &[u8], value: RecordValue<'_>) -> Result<()> {
        let cmp = self.comparator.as_ref();

        match page.insert(key, value, cmp) {
            Ok(()) => {
                self.store.store(&mut page)?;
                if let RecordValue::Separator { right, .. } = value {
                    self.set_parent(right, page.self_id())?;
                }
                Ok(())
            }
            Err(StorageError::PageFull(_)) => {
                let (separator, sibling) = self.split_page(&mut page)?;
                let target = if cmp.less(&separator, key) {
                    sibling
                } else {
                    page.self_id()
                };
                let target = self.store.load(target)?;
                self.insert_into(target, key, value)
            }
            Err(e) => Err(e),
        }
    }

    /// Splits `page`, links the new sibling on its level and posts the
    /// separator to the parent, growing a new root when there is none.
    /// Returns the separator and the sibling id.
    fn split_page(&self, page: &mut Page) -> Result<(Vec<u8>, PageId)> {
        let sibling_id = self.store.allocate();
        let (separator, mut sibling) = match page.split(sibling_id) {
            Ok(split) => split,
            Err(StorageError::ConstraintNotMatched(reason)) => {
                return Err(Self::corrupted(page.self_id(), reason));
            }
            Err(e) => return Err(e),
        };

        sibling.set_prev(page.self_id());
        sibling.set_next(page.next());
        if page.next() != NIL_PAGE {
            let mut next = self.store.load(page.next())?;
            next.set_prev(sibling_id);
            self.store.store(&mut next)?;
        }
        page.set_next(sibling_id);

        let parent = if page.parent() == NIL_PAGE {
            let root_id = self.store.allocate();
            page.set_parent(root_id);
            sibling.set_parent(root_id);
            self.store.update_meta(|meta| meta.root = root_id);
            debug!(
                "new root {} over pages {} and {}",
                root_id,
                page.self_id(),
                sibling_id
            );
            Page::new(root_id, PageType::Internal, self.store.page_size())
        } else {
            self.store.load(page.parent())?
        };

        self.store.store(page)?;
        self.store.store(&mut sibling)?;
        if !sibling.is_leaf() {
            self.adopt_children(&sibling)?;
        }

        self.insert_into(
            parent,
            &separator,
            RecordValue::Separator {
                left: page.self_id(),
                right: sibling_id,
            },
        )?;
        Ok((separator, sibling_id))
    }

    fn set_parent(&self, page_id: PageId, parent: PageId) -> Result<()> {
        let mut page = self.store.load(page_id)?;
        if page.parent() != parent {
            page.set_parent(parent);
            self.store.store(&mut page)?;
        }
        Ok(())
    }

    /// Points every child of the internal page `page` back at it.
    fn adopt_children(&self, page: &Page) -> Result<()> {
        for child in page.children()? {
            self.set_parent(child, page.self_id())?;
        }
        Ok(())
    }

    pub fn erase(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let Some(mut leaf) = self.locate_leaf(key)? else {
            return Err(StorageError::KeyNotFound);
        };

        leaf.erase(key, self.comparator.as_ref())?;
        self.store.store(&mut leaf)?;
        self.rebalance(leaf)
    }

    /// Collapses an empty internal root, or merges an underfull page into a
    /// sibling and continues with the parent.
    fn rebalance(&self, page: Page) -> Result<()> {
        if page.parent() == NIL_PAGE {
            if page.page_type() == PageType::Internal && page.node_size() == 0 {
                let mut child = self.store.load(page.max_child()?)?;
                child.set_parent(NIL_PAGE);
                self.store.store(&mut child)?;
                self.store.update_meta(|meta| meta.root = child.self_id());
                self.free_page(page.self_id())?;
                debug!("root {} collapsed into {}", page.self_id(), child.self_id());
                return self.rebalance(child);
            }
            return Ok(());
        }

        if page.free_ratio() <= self.config.merge_threshold {
            return Ok(());
        }

        if page.next() != NIL_PAGE {
            if let Some(parent) = self.try_merge(page.self_id(), page.next())? {
                return self.rebalance(parent);
            }
        }
        if page.prev() != NIL_PAGE {
            if let Some(parent) = self.try_merge(page.prev(), page.self_id())? {
                return self.rebalance(parent);
            }
        }

        debug!(
            "page {} is {:.0}% free but no sibling can take it",
            page.self_id(),
            page.free_ratio() * 100.0
        );
        Ok(())
    }

    /// Moves every record of `right_id` onto the end of `left_id`, then drops
    /// the right page from its parent and frees it. Returns the updated
    /// parent, or `None` when the pages cannot be merged.
    fn try_merge(&self, left_id: PageId, right_id: PageId) -> Result<Option<Page>> {
        let cmp = self.comparator.as_ref();
        let left = self.store.load(left_id)?;
        let right = self.store.load(right_id)?;
        if left.parent() != right.parent() || left.parent() == NIL_PAGE {
            return Ok(None);
        }

        let mut parent = self.store.load(left.parent())?;
        let Some(sep_addr) = parent.find_child(left_id)? else {
            return Err(Self::corrupted(
                parent.self_id(),
                format!("child {} not referenced", left_id),
            ));
        };
        if sep_addr == MAX_RECORD_ADDR {
            return Ok(None);
        }
        let separator = parent.record(sep_addr)?.key.to_vec();

        let mut merged = match self.merged(&left, &right, &separator) {
            Ok(merged) => merged,
            Err(StorageError::SpaceNotEnough { needed, available }) => {
                trace!(
                    "pages {} and {} do not fit together ({} needed, {} free)",
                    left_id,
                    right_id,
                    needed,
                    available
                );
                return Ok(None);
            }
            Err(StorageError::ConstraintNotMatched(reason)) => {
                trace!("pages {} and {} not mergeable: {}", left_id, right_id, reason);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        merged.set_next(right.next());
        if right.next() != NIL_PAGE {
            let mut next = self.store.load(right.next())?;
            next.set_prev(left_id);
            self.store.store(&mut next)?;
        }

        parent.erase(&separator, cmp)?;
        if !parent.replace_child(right_id, left_id)? {
            return Err(Self::corrupted(
                parent.self_id(),
                format!("child {} not referenced", right_id),
            ));
        }

        self.store.store(&mut merged)?;
        self.store.store(&mut parent)?;
        if !merged.is_leaf() {
            self.adopt_children(&merged)?;
        }
        self.free_page(right_id)?;

        debug!(
            "merged page {} into {} ({} records)",
            right_id,
            left_id,
            merged.node_size()
        );
        Ok(Some(parent))
    }

    /// `left` with the records of `right` appended. Internal pages first
    /// take the separator down, carrying `left`'s rightmost child.
    fn merged(&self, left: &Page, right: &Page, separator: &[u8]) -> Result<Page> {
        let cmp = self.comparator.as_ref();
        let mut merged = left.clone();

        if !left.is_leaf() {
            merged.append(separator, &encode_u64(left.max_child()? as u64), cmp)?;
            merged.append_page(right, cmp)?;
            merged.set_max_child(right.max_child()?)?;
        } else {
            merged.append_page(right, cmp)?;
        }
        Ok(merged)
    }

    /// Pushes `page_id` onto the free list.
    fn free_page(&self, page_id: PageId) -> Result<()> {
        let mut page = Page::new(page_id, PageType::Free, self.store.page_size());
        page.set_next(self.store.meta().free);
        self.store.store(&mut page)?;
        self.store.update_meta(|meta| meta.free = page_id);
        debug!("page {} freed", page_id);
        Ok(())
    }

    /// Every record in key order, read along the leaf chain.
    pub fn scan(&self) -> Result<Vec<(Bytes, Bytes)>> {
        self.ensure_open()?;
        let mut records = Vec::new();
        self.for_each_leaf(|leaf| {
            records.extend(
                leaf.iter()
                    .map(|r| (Bytes::copy_from_slice(r.key), Bytes::copy_from_slice(r.value))),
            );
        })?;
        Ok(records)
    }

    /// Number of records in the tree.
    pub fn len(&self) -> Result<usize> {
        self.ensure_open()?;
        let mut len = 0;
        self.for_each_leaf(|leaf| len += leaf.node_size() as usize)?;
        Ok(len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn for_each_leaf(&self, mut f: impl FnMut(&Page)) -> Result<()> {
        let meta = self.store.meta();
        let mut page_id = meta.leaf;

        // A chain longer than the file has pages must loop.
        for _ in 0..=meta.max_page_id {
            if page_id == NIL_PAGE {
                return Ok(());
            }
            let leaf = self.store.load(page_id)?;
            if !leaf.is_leaf() {
                return Err(Self::corrupted(page_id, "non-leaf page on the leaf chain"));
            }
            f(&leaf);
            page_id = leaf.next();
        }
        Err(Self::corrupted(meta.leaf, "leaf chain does not terminate"))
    }

    /// Pages level by level, root first.
    pub fn bfs(&self) -> Result<Vec<Vec<PageSummary>>> {
        self.ensure_open()?;
        Ok(self
            .levels()?
            .iter()
            .map(|level| level.iter().map(PageSummary::of).collect::<Result<Vec<_>>>())
            .collect::<Result<Vec<_>>>()?)
    }

    fn levels(&self) -> Result<Vec<Vec<Page>>> {
        let root = self.store.meta().root;
        if root == NIL_PAGE {
            return Ok(Vec::new());
        }

        let mut levels = Vec::new();
        let mut queue = VecDeque::from([root]);
        while !queue.is_empty() {
            if levels.len() == MAX_DEPTH {
                return Err(Self::corrupted(root, format!("deeper than {} levels", MAX_DEPTH)));
            }

            let mut level = Vec::with_capacity(queue.len());
            for page_id in queue.drain(..) {
                level.push(self.store.load(page_id)?);
            }
            for page in &level {
                if page.page_type() == PageType::Internal {
                    queue.extend(page.children()?);
                }
            }
            levels.push(level);
        }
        Ok(levels)
    }

    /// Checks every page and the links between them: page integrity,
    /// parent pointers, sibling chains per level, separator ranges, equal
    /// leaf depth and the leaf chain head.
    pub fn verify(&self) -> Result<()> {
        self.ensure_open()?;
        let cmp = self.comparator.as_ref();
        let levels = self.levels()?;
        let meta = self.store.meta();

        // Key bounds (exclusive low, inclusive high) per page id.
        type Bounds = (Option<Vec<u8>>, Option<Vec<u8>>);
        let mut bounds: Vec<(PageId, PageId, Bounds)> = vec![(meta.root, NIL_PAGE, (None, None))];

        for (depth, level) in levels.iter().enumerate() {
            let leaves = level.iter().filter(|p| p.is_leaf()).count();
            if leaves != 0 && leaves != level.len() {
                return Err(Self::corrupted(
                    level[0].self_id(),
                    format!("level {} mixes leaves and internal pages", depth),
                ));
            }

            let mut next_bounds = Vec::new();
            for (i, page) in level.iter().enumerate() {
                let page_id = page.self_id();
                page.check_integrity(cmp)?;

                let (expected_id, expected_parent, (low, high)) = &bounds[i];
                if page_id != *expected_id || page.parent() != *expected_parent {
                    return Err(Self::corrupted(
                        page_id,
                        format!("parent is {}, expected {}", page.parent(), expected_parent),
                    ));
                }

                let prev = if i == 0 { NIL_PAGE } else { level[i - 1].self_id() };
                let next = level.get(i + 1).map_or(NIL_PAGE, Page::self_id);
                if page.prev() != prev || page.next() != next {
                    return Err(Self::corrupted(
                        page_id,
                        format!(
                            "siblings {}/{}, expected {}/{}",
                            page.prev(),
                            page.next(),
                            prev,
                            next
                        ),
                    ));
                }

                let mut lower = low.clone();
                for record in page.iter() {
                    let above_low = lower.as_deref().map_or(true, |low| cmp.less(low, record.key));
                    let within_high = high.as_deref().map_or(true, |high| !cmp.less(high, record.key));
                    if !above_low || !within_high {
                        return Err(Self::corrupted(page_id, "key outside the parent's range"));
                    }

                    if page.page_type() == PageType::Internal {
                        next_bounds.push((
                            page.child_of(record.address)?,
                            page_id,
                            (lower.clone(), Some(record.key.to_vec())),
                        ));
                    }
                    lower = Some(record.key.to_vec());
                }
                if page.page_type() == PageType::Internal {
                    next_bounds.push((page.max_child()?, page_id, (lower, high.clone())));
                }
            }
            bounds = next_bounds;
        }

        if let Some(leaves) = levels.last() {
            if leaves[0].self_id() != meta.leaf {
                return Err(Self::corrupted(
                    meta.leaf,
                    format!("leaf chain starts at {}, leftmost leaf is {}", meta.leaf, leaves[0].self_id()),
                ));
            }
        }
        Ok(())
    }

    /// Writes back cached pages and the file header.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.store.flush(false)
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.store.flush(self.config.sync_on_close)?;
        self.closed = true;
        debug!("index {} closed", self.store.path().display());
        Ok(())
    }
}

impl Drop for BPlusTreeIndex {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("failed to close index {}: {}", self.store.path().display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::BytewiseComparator;
    use crate::config::PoolConfig;
    use tempfile::{tempdir, TempDir};

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn open_small(dir: &TempDir, config: IndexConfig) -> BPlusTreeIndex {
        init_logging();
        BPlusTreeIndex::open(
            dir.path().join("test.idx"),
            BytewiseComparator,
            config.with_page_size(256),
        )
        .unwrap()
    }

    fn open_sized(dir: &TempDir, name: &str, page_size: usize, config: IndexConfig) -> BPlusTreeIndex {
        init_logging();
        BPlusTreeIndex::open(
            dir.path().join(name),
            BytewiseComparator,
            config.with_page_size(page_size),
        )
        .unwrap()
    }

    fn key(i: usize) -> Vec<u8> {
        format!("key{:04}", i).into_bytes()
    }

    #[test]
    fn test_empty_tree() {
        let dir = tempdir().unwrap();
        let tree = open_small(&dir, IndexConfig::default().without_pool());

        assert_eq!(tree.search(b"missing").unwrap(), None);
        assert_eq!(tree.meta().root, NIL_PAGE);
        assert!(tree.is_empty().unwrap());
        assert!(tree.bfs().unwrap().is_empty());
        tree.verify().unwrap();
    }

    #[test]
    fn test_single_leaf() {
        let dir = tempdir().unwrap();
        let mut tree = open_small(&dir, IndexConfig::default().without_pool());

        tree.insert(b"b", b"2").unwrap();
        tree.insert(b"a", b"1").unwrap();
        assert!(matches!(tree.insert(b"a", b"x"), Err(StorageError::KeyExists)));

        assert_eq!(tree.search(b"a").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(tree.len().unwrap(), 2);

        let meta = tree.meta();
        assert_eq!(meta.root, meta.leaf);
        assert_eq!(tree.bfs().unwrap().len(), 1);
    }

    #[test]
    fn test_split_grows_root() {
        let dir = tempdir().unwrap();
        let mut tree = open_small(&dir, IndexConfig::default().without_pool());

        for i in 0..40 {
            tree.insert(&key(i), b"value").unwrap();
        }
        tree.verify().unwrap();

        let levels = tree.bfs().unwrap();
        assert!(levels.len() >= 2);
        assert_eq!(levels[0].len(), 1);
        assert_eq!(levels[0][0].page_type, PageType::Internal);
        assert!(levels[0][0].children.len() >= 2);

        for i in 0..40 {
            assert_eq!(tree.search(&key(i)).unwrap().as_deref(), Some(&b"value"[..]));
        }
        assert_eq!(tree.len().unwrap(), 40);
    }

    #[test]
    fn test_descending_inserts() {
        let dir = tempdir().unwrap();
        let mut tree = open_small(&dir, IndexConfig::default().without_pool());

        for i in (0..60).rev() {
            tree.insert(&key(i), &key(i)).unwrap();
        }
        tree.verify().unwrap();

        let keys: Vec<_> = tree.scan().unwrap().into_iter().map(|(k, _)| k).collect();
        let expected: Vec<_> = (0..60).map(|i| Bytes::from(key(i))).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_erase_merges_back_to_one_leaf() {
        let dir = tempdir().unwrap();
        let mut tree = open_sized(&dir, "merge.idx", 1024, IndexConfig::default().without_pool());

        for i in 0..200 {
            tree.insert(&key(i), b"v").unwrap();
        }
        assert_eq!(tree.bfs().unwrap().len(), 2);

        for i in 0..200 {
            tree.erase(&key(i)).unwrap();
            tree.verify().unwrap();
        }

        let levels = tree.bfs().unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0][0].page_type, PageType::Leaf);
        assert_eq!(levels[0][0].node_size, 0);
        assert_ne!(tree.meta().free, NIL_PAGE);
    }

    #[test]
    fn test_erase_missing() {
        let dir = tempdir().unwrap();
        let mut tree = open_small(&dir, IndexConfig::default().without_pool());

        assert!(matches!(tree.erase(b"nothing"), Err(StorageError::KeyNotFound)));
        tree.insert(b"a", b"1").unwrap();
        assert!(matches!(tree.erase(b"b"), Err(StorageError::KeyNotFound)));
    }

    #[test]
    fn test_record_too_large() {
        let dir = tempdir().unwrap();
        let mut tree = open_small(&dir, IndexConfig::default().without_pool());

        let value = vec![0u8; 256];
        assert!(matches!(
            tree.insert(b"k", &value),
            Err(StorageError::RecordTooLarge { .. })
        ));
        assert_eq!(tree.meta().root, NIL_PAGE);
    }

    #[test]
    fn test_buffered_matches_direct() {
        let dir = tempdir().unwrap();
        let config = IndexConfig::default().with_merge_threshold(0.5);
        let mut direct = open_sized(&dir, "direct.idx", 256, config.clone().without_pool());
        let mut buffered = open_sized(
            &dir,
            "buffered.idx",
            256,
            config.with_pool(PoolConfig {
                capacity: 4,
                ..PoolConfig::default()
            }),
        );

        for i in (0..80).map(|i| (i * 37) % 80) {
            direct.insert(&key(i), &key(i)).unwrap();
            buffered.insert(&key(i), &key(i)).unwrap();
        }
        for i in (0..80).step_by(3) {
            direct.erase(&key(i)).unwrap();
            buffered.erase(&key(i)).unwrap();
        }

        direct.verify().unwrap();
        buffered.verify().unwrap();
        assert_eq!(direct.scan().unwrap(), buffered.scan().unwrap());
        assert_eq!(buffered.len().unwrap(), 80 - 27);
    }

    #[test]
    fn test_closed_index_rejects_operations() {
        let dir = tempdir().unwrap();
        let mut tree = open_small(&dir, IndexConfig::default().without_pool());
        tree.insert(b"a", b"1").unwrap();

        tree.close().unwrap();
        tree.close().unwrap();
        assert!(matches!(tree.search(b"a"), Err(StorageError::Fail(_))));
        assert!(matches!(tree.insert(b"b", b"2"), Err(StorageError::Fail(_))));
    }

    #[test]
    fn test_invalid_config() {
        let dir = tempdir().unwrap();
        let result = BPlusTreeIndex::open(
            dir.path().join("bad.idx"),
            BytewiseComparator,
            IndexConfig::default().with_merge_threshold(1.5),
        );
        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));
    }
}
