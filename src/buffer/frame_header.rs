use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{
    ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};

use crate::common::{FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};

pub type PageData = Box<[u8; PAGE_SIZE]>;

/// Owned read latch on a frame's page data
pub type PageReadLatch = ArcRwLockReadGuard<RawRwLock, PageData>;

/// Owned write latch on a frame's page data
pub type PageWriteLatch = ArcRwLockWriteGuard<RawRwLock, PageData>;

/// FrameHeader manages a single buffer frame in the buffer pool.
///
/// The page-id, pin count and dirty flag are only changed by the buffer pool
/// under its latch. The data lock doubles as the page latch used by guards.
pub struct FrameHeader {
    frame_id: FrameId,
    /// The page ID stored in this frame (INVALID_PAGE_ID if empty)
    page_id: RwLock<PageId>,
    pin_count: AtomicU32,
    /// Whether the page has been modified since being read from disk
    is_dirty: AtomicBool,
    data: Arc<RwLock<PageData>>,
}

impl FrameHeader {
    /// Creates a new FrameHeader for the given frame ID.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: RwLock::new(INVALID_PAGE_ID),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))),
        }
    }

    /// Returns the frame ID.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page ID stored in this frame.
    pub fn page_id(&self) -> PageId {
        *self.page_id.read()
    }

    pub(crate) fn set_page_id(&self, page_id: PageId) {
        *self.page_id.write() = page_id;
    }

    /// Returns the current pin count.
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the new value.
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count and returns the new value.
    /// Returns None if the pin count was already 0.
    pub(crate) fn unpin(&self) -> Option<u32> {
        loop {
            let current = self.pin_count.load(Ordering::Acquire);
            if current == 0 {
                return None;
            }
            if self
                .pin_count
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(current - 1);
            }
        }
    }

    /// Returns whether the page is dirty.
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Borrows the page data for reading.
    pub fn read_data(&self) -> RwLockReadGuard<'_, PageData> {
        self.data.read()
    }

    /// Borrows the page data for writing. Callers report the change through
    /// `unpin_page(.., true)`.
    pub fn write_data(&self) -> RwLockWriteGuard<'_, PageData> {
        self.data.write()
    }

    pub(crate) fn latch_read(&self) -> PageReadLatch {
        self.data.read_arc()
    }

    pub(crate) fn latch_write(&self) -> PageWriteLatch {
        self.data.write_arc()
    }

    /// Copies data from the given page into the frame.
    pub(crate) fn copy_from(&self, data: &[u8; PAGE_SIZE]) {
        self.data.write().copy_from_slice(data);
    }

    /// Copies the frame contents out.
    pub(crate) fn copy_to(&self, data: &mut [u8; PAGE_SIZE]) {
        data.copy_from_slice(&self.data.read()[..]);
    }

    /// Resets the frame to its initial state.
    pub(crate) fn reset(&self) {
        *self.page_id.write() = INVALID_PAGE_ID;
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.data.write().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_pin_unpin() {
        let frame = FrameHeader::new(FrameId::new(0));

        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.pin(), 2);
        assert_eq!(frame.pin_count(), 2);

        assert_eq!(frame.unpin(), Some(1));
        assert_eq!(frame.unpin(), Some(0));
        assert_eq!(frame.unpin(), None);
    }

    #[test]
    fn test_frame_header_reset() {
        let frame = FrameHeader::new(FrameId::new(0));

        frame.set_page_id(PageId::new(5));
        frame.pin();
        frame.set_dirty(true);
        frame.copy_from(&[1u8; PAGE_SIZE]);

        frame.reset();

        assert_eq!(frame.page_id(), INVALID_PAGE_ID);
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());

        let mut data = [9u8; PAGE_SIZE];
        frame.copy_to(&mut data);
        assert_eq!(data[0], 0);
    }

    #[test]
    fn test_owned_latches_are_exclusive() {
        let frame = FrameHeader::new(FrameId::new(0));

        let r1 = frame.latch_read();
        let r2 = frame.latch_read();
        assert!(frame.data.try_write().is_none());
        drop(r1);
        drop(r2);

        let mut w = frame.latch_write();
        w[0] = 3;
        assert!(frame.data.try_read().is_none());
        drop(w);
        assert_eq!(frame.read_data()[0], 3);
    }
}
