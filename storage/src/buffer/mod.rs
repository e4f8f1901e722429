//! Buffer pool.
//!
//! A fixed set of frames caches pages of one or more spaces. Frames are
//! pinned while in use; unpinned frames are handed to a [`Replacer`] and
//! may be reused for another page, after writing their bytes back if they
//! were modified.

pub mod replacer;

use crate::config::{PoolConfig, ReplacerKind};
use crate::file::space::SpaceManager;
use crate::{Result, StorageError};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use replacer::{ClockReplacer, LruReplacer, Replacer};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Index of a frame inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// Where a page lives: a space name and a byte address inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PagePosition {
    pub space: Arc<str>,
    pub address: u64,
}

impl PagePosition {
    pub fn new(space: impl Into<Arc<str>>, address: u64) -> Self {
        Self {
            space: space.into(),
            address,
        }
    }
}

impl fmt::Display for PagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.space, self.address)
    }
}

/// One page-sized buffer of the pool.
pub struct Frame {
    id: FrameId,
    data: RwLock<Box<[u8]>>,
    position: Mutex<Option<PagePosition>>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    fn new(id: FrameId, page_size: usize) -> Self {
        Self {
            id,
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            position: Mutex::new(None),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Page currently held, if any.
    pub fn position(&self) -> Option<PagePosition> {
        self.position.lock().clone()
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.is_dirty.store(true, Ordering::Release);
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Write access to the page bytes; marks the frame dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.mark_dirty();
        self.data.write()
    }

    /// Returns the pin count before this call.
    fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns the new pin count, or `None` if the frame was not pinned.
    fn unpin(&self) -> Option<u32> {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    fn assign(&self, position: Option<PagePosition>, pin_count: u32) {
        *self.position.lock() = position;
        self.pin_count.store(pin_count, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("position", &self.position())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .finish()
    }
}

pub trait BufferPool: Send + Sync {
    /// Returns the frame holding `position`, loading it if needed. The
    /// frame comes back pinned; every fetch must be paired with an
    /// [`BufferPool::unpin_page`].
    fn fetch_page(&self, position: &PagePosition) -> Result<Arc<Frame>>;

    /// Drops one pin. Returns `false` if the page is not resident or was
    /// not pinned.
    fn unpin_page(&self, position: &PagePosition) -> bool;

    /// Writes the page back if it is dirty. Returns `false` if the page is
    /// not resident.
    fn flush_page(&self, position: &PagePosition) -> Result<bool>;

    /// Writes back every dirty resident page.
    fn flush_all_pages(&self) -> Result<()>;

    fn page_size(&self) -> usize;

    fn capacity(&self) -> usize;
}

struct PoolState {
    page_table: HashMap<PagePosition, FrameId>,
    free_list: VecDeque<FrameId>,
}

/// Buffer pool over a [`SpaceManager`], with least-recently-unpinned
/// replacement unless another [`Replacer`] is supplied.
pub struct LruBufferPool {
    page_size: usize,
    frames: Vec<Arc<Frame>>,
    state: Mutex<PoolState>,
    replacer: Box<dyn Replacer>,
    spaces: Arc<dyn SpaceManager>,
}

impl LruBufferPool {
    pub fn new(capacity: usize, page_size: usize, spaces: Arc<dyn SpaceManager>) -> Self {
        Self::with_replacer(capacity, page_size, spaces, Box::new(LruReplacer::new(capacity)))
    }

    pub fn with_replacer(
        capacity: usize,
        page_size: usize,
        spaces: Arc<dyn SpaceManager>,
        replacer: Box<dyn Replacer>,
    ) -> Self {
        let frames = (0..capacity)
            .map(|i| Arc::new(Frame::new(FrameId(i as u32), page_size)))
            .collect();
        let free_list = (0..capacity).map(|i| FrameId(i as u32)).collect();

        Self {
            page_size,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(capacity),
                free_list,
            }),
            replacer,
            spaces,
        }
    }

    pub fn from_config(config: &PoolConfig, page_size: usize, spaces: Arc<dyn SpaceManager>) -> Self {
        let replacer: Box<dyn Replacer> = match config.replacer {
            ReplacerKind::Lru => Box::new(LruReplacer::new(config.capacity)),
            ReplacerKind::Clock => Box::new(ClockReplacer::new(config.capacity)),
        };
        Self::with_replacer(config.capacity, page_size, spaces, replacer)
    }

    pub fn is_resident(&self, position: &PagePosition) -> bool {
        self.state.lock().page_table.contains_key(position)
    }

    /// Pin count of a resident page.
    pub fn pin_count(&self, position: &PagePosition) -> Option<u32> {
        let state = self.state.lock();
        state
            .page_table
            .get(position)
            .map(|frame_id| self.frames[frame_id.0 as usize].pin_count())
    }

    pub fn free_frames(&self) -> usize {
        self.state.lock().free_list.len()
    }

    fn write_back(&self, frame: &Frame, position: &PagePosition) -> Result<()> {
        let data = frame.read();
        self.spaces.write(&position.space, position.address, &data)?;
        frame.is_dirty.store(false, Ordering::Release);
        log::trace!("wrote back {} from {}", position, frame.id);
        Ok(())
    }
}

impl BufferPool for LruBufferPool {
    fn fetch_page(&self, position: &PagePosition) -> Result<Arc<Frame>> {
        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(position) {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.pin() == 0 {
                self.replacer.pin(frame_id);
            }
            return Ok(Arc::clone(frame));
        }

        let frame_id = match state.free_list.pop_front() {
            Some(frame_id) => frame_id,
            None => self
                .replacer
                .victim()
                .ok_or(StorageError::PoolExhausted(self.frames.len()))?,
        };
        let frame = Arc::clone(&self.frames[frame_id.0 as usize]);

        if let Some(old) = frame.position() {
            if frame.is_dirty() {
                if let Err(e) = self.write_back(&frame, &old) {
                    self.replacer.unpin(frame_id);
                    return Err(e);
                }
            }
            state.page_table.remove(&old);
            log::debug!("evicted {} from {}", old, frame_id);
        }

        let loaded = {
            let mut data = frame.data.write();
            self.spaces.read(&position.space, position.address, &mut data[..])
        };
        if let Err(e) = loaded {
            frame.assign(None, 0);
            state.free_list.push_back(frame_id);
            return Err(e);
        }

        frame.assign(Some(position.clone()), 1);
        state.page_table.insert(position.clone(), frame_id);
        log::trace!("loaded {} into {}", position, frame_id);
        Ok(frame)
    }

    fn unpin_page(&self, position: &PagePosition) -> bool {
        let state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(position) else {
            return false;
        };

        match self.frames[frame_id.0 as usize].unpin() {
            Some(0) => {
                self.replacer.unpin(frame_id);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    fn flush_page(&self, position: &PagePosition) -> Result<bool> {
        let state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(position) else {
            return Ok(false);
        };

        let frame = &self.frames[frame_id.0 as usize];
        if frame.is_dirty() {
            self.write_back(frame, position)?;
        }
        Ok(true)
    }

    fn flush_all_pages(&self) -> Result<()> {
        let state = self.state.lock();
        let mut touched: HashSet<Arc<str>> = HashSet::new();

        for (position, frame_id) in &state.page_table {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                self.write_back(frame, position)?;
                touched.insert(Arc::clone(&position.space));
            }
        }

        for space in touched {
            self.spaces.sync(&space)?;
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn capacity(&self) -> usize {
        self.frames.len()
    }
}

impl Drop for LruBufferPool {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all_pages() {
            log::error!("failed to flush buffer pool on drop: {}", e);
        }
    }
}

/// A pinned page. Clones share the pin; when the last clone is dropped the
/// page is flushed if dirty and then unpinned.
#[derive(Clone)]
pub struct FrameHandle {
    inner: Arc<PinnedFrame>,
}

struct PinnedFrame {
    pool: Arc<dyn BufferPool>,
    position: PagePosition,
    frame: Arc<Frame>,
}

impl FrameHandle {
    pub fn fetch(pool: &Arc<dyn BufferPool>, position: PagePosition) -> Result<Self> {
        let frame = pool.fetch_page(&position)?;
        Ok(Self {
            inner: Arc::new(PinnedFrame {
                pool: Arc::clone(pool),
                position,
                frame,
            }),
        })
    }

    pub fn position(&self) -> &PagePosition {
        &self.inner.position
    }

    pub fn frame(&self) -> &Frame {
        &self.inner.frame
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.inner.frame.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.inner.frame.write()
    }
}

impl Drop for PinnedFrame {
    fn drop(&mut self) {
        if self.frame.is_dirty() {
            if let Err(e) = self.pool.flush_page(&self.position) {
                log::error!("failed to flush {} on release: {}", self.position, e);
            }
        }
        if !self.pool.unpin_page(&self.position) {
            log::warn!("released {} but it was not pinned", self.position);
        }
    }
}
