//! Bump allocation out of a single contiguous region.

use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of arena generations. Zero is never handed out.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Identifies a slice handed out by an [Arena].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Slot {
    pub arena: u64,
    pub index: u64,
}

/// A region of zeroed memory handed out front to back.
///
/// Slices share the region's allocation, so a retired arena stays alive until
/// its last slice is dropped. Only the most recent slice can give space back.
pub(crate) struct Arena {
    generation: u64,
    free: BytesMut,
    next: u64,
    last: Option<u64>,
}

impl Arena {
    pub fn new(size: usize) -> Self {
        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            free: BytesMut::zeroed(size),
            next: 0,
            last: None,
        }
    }

    /// Bytes left at the end of the region.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Carve `size` bytes off the front of the free region.
    pub fn allocate(&mut self, size: usize) -> Option<(BytesMut, Slot)> {
        if size > self.free.len() {
            return None;
        }
        let chunk = self.free.split_to(size);
        let slot = Slot {
            arena: self.generation,
            index: self.next,
        };
        self.next += 1;
        self.last = Some(slot.index);
        Some((chunk, slot))
    }

    /// Returns whether `slot` is the most recent live slice of this arena.
    pub fn is_last(&self, slot: Slot) -> bool {
        slot.arena == self.generation && self.last == Some(slot.index)
    }

    /// Extend the most recent slice by `extra` bytes.
    ///
    /// The caller must have checked [Arena::is_last] for `chunk`.
    pub fn grow(&mut self, chunk: &mut BytesMut, extra: usize) -> bool {
        if extra > self.free.len() {
            return false;
        }
        chunk.unsplit(self.free.split_to(extra));
        true
    }

    /// Give back the tail of the most recent slice. The slice stays live.
    ///
    /// The caller must have checked [Arena::is_last] for the slice `tail` was
    /// split from.
    pub fn reclaim_tail(&mut self, mut tail: BytesMut) {
        tail.unsplit(std::mem::take(&mut self.free));
        self.free = tail;
    }

    /// Give back the most recent slice in full.
    pub fn reclaim(&mut self, chunk: BytesMut) {
        self.reclaim_tail(chunk);
        self.last = None;
    }
}
