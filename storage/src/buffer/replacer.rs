//! Page replacement policies for the buffer pool.

use super::FrameId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Chooses which unpinned frame the pool reuses next.
///
/// Only frames that are resident and have no pins are tracked; the pool
/// calls `unpin` when a frame's pin count drops to zero and `pin` when it
/// is picked up again.
pub trait Replacer: Send + Sync {
    /// Removes and returns the frame to evict, if any is evictable.
    fn victim(&self) -> Option<FrameId>;

    /// Stops tracking `frame_id`; it is in use.
    fn pin(&self, frame_id: FrameId);

    /// Makes `frame_id` an eviction candidate.
    fn unpin(&self, frame_id: FrameId);

    /// Number of evictable frames.
    fn size(&self) -> usize;
}

#[derive(Debug, Clone, Copy, Default)]
struct LruNode {
    prev: Option<FrameId>,
    next: Option<FrameId>,
}

/// Doubly linked list threaded through a map of nodes. The head is the
/// most recently unpinned frame, the tail the least recent.
#[derive(Debug, Default)]
struct LruList {
    nodes: HashMap<FrameId, LruNode>,
    head: Option<FrameId>,
    tail: Option<FrameId>,
}

impl LruList {
    fn push_front(&mut self, frame_id: FrameId) {
        let node = LruNode {
            prev: None,
            next: self.head,
        };

        match self.head {
            Some(head) => {
                if let Some(head_node) = self.nodes.get_mut(&head) {
                    head_node.prev = Some(frame_id);
                }
            }
            None => self.tail = Some(frame_id),
        }

        self.head = Some(frame_id);
        self.nodes.insert(frame_id, node);
    }

    fn detach(&mut self, frame_id: FrameId) -> bool {
        let Some(node) = self.nodes.remove(&frame_id) else {
            return false;
        };

        match node.prev {
            Some(prev) => {
                if let Some(prev_node) = self.nodes.get_mut(&prev) {
                    prev_node.next = node.next;
                }
            }
            None => self.head = node.next,
        }

        match node.next {
            Some(next) => {
                if let Some(next_node) = self.nodes.get_mut(&next) {
                    next_node.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }

        true
    }

    fn pop_back(&mut self) -> Option<FrameId> {
        let tail = self.tail?;
        self.detach(tail);
        Some(tail)
    }
}

/// Least-recently-unpinned replacement.
pub struct LruReplacer {
    capacity: usize,
    inner: Mutex<LruList>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LruList {
                nodes: HashMap::with_capacity(capacity),
                ..LruList::default()
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Replacer for LruReplacer {
    fn victim(&self) -> Option<FrameId> {
        self.inner.lock().pop_back()
    }

    fn pin(&self, frame_id: FrameId) {
        self.inner.lock().detach(frame_id);
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        inner.detach(frame_id);
        inner.push_front(frame_id);
    }

    fn size(&self) -> usize {
        self.inner.lock().nodes.len()
    }
}

/// Clock (second chance) replacement.
///
/// Frames sit on a circular buffer with a reference bit. The hand sweeps
/// it: an evictable frame with its bit set gets the bit cleared and is
/// skipped once, one with the bit clear is the victim.
pub struct ClockReplacer {
    inner: Mutex<ClockInner>,
}

struct ClockInner {
    num_frames: usize,
    reference_bits: Vec<bool>,
    evictable: HashSet<FrameId>,
    hand: usize,
}

impl ClockReplacer {
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(ClockInner {
                num_frames,
                reference_bits: vec![false; num_frames],
                evictable: HashSet::with_capacity(num_frames),
                hand: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().num_frames
    }
}

impl Replacer for ClockReplacer {
    fn victim(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        if inner.evictable.is_empty() {
            return None;
        }

        // Two sweeps clear every reference bit at most once.
        for _ in 0..(2 * inner.num_frames) {
            let hand = inner.hand;
            let frame_id = FrameId(hand as u32);
            inner.hand = (hand + 1) % inner.num_frames;

            if inner.evictable.contains(&frame_id) {
                if inner.reference_bits[hand] {
                    inner.reference_bits[hand] = false;
                } else {
                    inner.evictable.remove(&frame_id);
                    return Some(frame_id);
                }
            }
        }
        None
    }

    fn pin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        inner.evictable.remove(&frame_id);
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let index = frame_id.0 as usize;
        if index >= inner.num_frames {
            return;
        }
        inner.reference_bits[index] = true;
        inner.evictable.insert(frame_id);
    }

    fn size(&self) -> usize {
        self.inner.lock().evictable.len()
    }
}
