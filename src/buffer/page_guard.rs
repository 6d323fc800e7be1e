use std::ops::Deref;
use std::sync::Arc;

use crate::common::{PageId, PAGE_SIZE};

use super::buffer_pool_manager::BufferPoolInner;
use super::{FrameHeader, PageReadLatch, PageWriteLatch};

/// Pin held by a guard: page, frame and the pool to give it back to
struct PinnedPage {
    page_id: PageId,
    frame: Arc<FrameHeader>,
    pool: Arc<BufferPoolInner>,
    is_dirty: bool,
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.pool.unpin(self.page_id, &self.frame, self.is_dirty);
    }
}

/// RAII guard for read-only access to a page.
///
/// Holds the page's read latch and one pin; dropping it releases the latch
/// first and then the pin.
pub struct ReadPageGuard {
    // Declared first so the latch is released before the pin
    latch: PageReadLatch,
    pinned: PinnedPage,
}

impl ReadPageGuard {
    pub(crate) fn new(page_id: PageId, frame: Arc<FrameHeader>, pool: Arc<BufferPoolInner>) -> Self {
        let latch = frame.latch_read();
        Self {
            latch,
            pinned: PinnedPage {
                page_id,
                frame,
                pool,
                is_dirty: false,
            },
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.pinned.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.latch
    }

    /// Drops this guard, releasing the page.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data()[..]
    }
}

/// RAII guard for read-write access to a page.
///
/// Holds the page's write latch and one pin. Modifications must be reported
/// with `mark_dirty` (implied by `data_mut`) before the guard is dropped.
pub struct WritePageGuard {
    // Declared first so the latch is released before the pin
    latch: PageWriteLatch,
    pinned: PinnedPage,
}

impl WritePageGuard {
    pub(crate) fn new(page_id: PageId, frame: Arc<FrameHeader>, pool: Arc<BufferPoolInner>) -> Self {
        let latch = frame.latch_write();
        Self {
            latch,
            pinned: PinnedPage {
                page_id,
                frame,
                pool,
                is_dirty: false,
            },
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.pinned.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.latch
    }

    /// Returns the page data for writing and marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.pinned.is_dirty = true;
        &mut self.latch
    }

    /// Records that the page must be written back before eviction.
    pub fn mark_dirty(&mut self) {
        self.pinned.is_dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.pinned.is_dirty
    }

    /// Drops this guard, releasing the page.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data()[..]
    }
}
