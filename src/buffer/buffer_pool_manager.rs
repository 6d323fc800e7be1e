use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{FrameId, PageId, Result, StrataError, DEFAULT_BUCKET_SIZE, PAGE_SIZE};
use crate::container::hash::ExtendibleHashTable;
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::{FrameHeader, LruKReplacer, ReadPageGuard, WritePageGuard};

/// State shared between the pool handle and every outstanding page guard
pub(crate) struct BufferPoolInner {
    frames: Vec<Arc<FrameHeader>>,
    /// Page table: maps resident page IDs to frame IDs
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// Free frames. Holding this latch serializes every change to the
    /// page table, the frame metadata and the free list.
    latch: Mutex<VecDeque<FrameId>>,
    replacer: LruKReplacer,
    disk_scheduler: DiskScheduler,
}

impl BufferPoolInner {
    /// Takes a frame from the free list, or evicts one. Must be called with
    /// the pool latch held; the returned frame is reset and unmapped.
    fn acquire_frame(&self, free_list: &mut VecDeque<FrameId>) -> Result<FrameId> {
        if let Some(frame_id) = free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.evict().ok_or(StrataError::BufferPoolFull)?;
        let frame = &self.frames[frame_id.as_usize()];
        let old_page_id = frame.page_id();

        if frame.is_dirty() {
            let mut data = [0u8; PAGE_SIZE];
            frame.copy_to(&mut data);
            if let Err(e) = self.disk_scheduler.schedule_write_sync(old_page_id, &data) {
                // Put the victim back so it can be retried later
                self.replacer.record_access(frame_id)?;
                self.replacer.set_evictable(frame_id, true);
                return Err(e);
            }
        }
        debug!(%frame_id, page_id = %old_page_id, dirty = frame.is_dirty(), "evicted page");

        self.page_table.remove(&old_page_id);
        frame.reset();
        Ok(frame_id)
    }

    /// Registers an access and pins the frame against eviction.
    fn pin_frame(&self, frame: &FrameHeader) -> Result<()> {
        frame.pin();
        self.replacer.record_access(frame.frame_id())?;
        self.replacer.set_evictable(frame.frame_id(), false);
        Ok(())
    }

    fn new_page(&self) -> Result<(PageId, Arc<FrameHeader>)> {
        let mut free_list = self.latch.lock();
        let frame_id = self.acquire_frame(&mut free_list)?;

        let page_id = match self.disk_scheduler.disk_manager().allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                free_list.push_back(frame_id);
                return Err(e);
            }
        };

        let frame = Arc::clone(&self.frames[frame_id.as_usize()]);
        frame.set_page_id(page_id);
        self.pin_frame(&frame)?;
        self.page_table.insert(page_id, frame_id);

        trace!(%page_id, %frame_id, "allocated new page");
        Ok((page_id, frame))
    }

    fn fetch_page(&self, page_id: PageId) -> Result<Arc<FrameHeader>> {
        if !page_id.is_valid() {
            return Err(StrataError::InvalidPageId(page_id));
        }

        let mut free_list = self.latch.lock();
        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = Arc::clone(&self.frames[frame_id.as_usize()]);
            self.pin_frame(&frame)?;
            return Ok(frame);
        }

        let frame_id = self.acquire_frame(&mut free_list)?;
        let frame = Arc::clone(&self.frames[frame_id.as_usize()]);

        let mut data = [0u8; PAGE_SIZE];
        if let Err(e) = self.disk_scheduler.schedule_read_sync(page_id, &mut data) {
            free_list.push_back(frame_id);
            return Err(e);
        }

        frame.copy_from(&data);
        frame.set_page_id(page_id);
        self.pin_frame(&frame)?;
        self.page_table.insert(page_id, frame_id);
        Ok(frame)
    }

    /// Drops one pin, ORing in the dirty flag. Returns false if the frame no
    /// longer holds `page_id` or was not pinned.
    fn unpin_locked(&self, page_id: PageId, frame: &FrameHeader, is_dirty: bool) -> bool {
        if frame.page_id() != page_id {
            return false;
        }
        match frame.unpin() {
            None => false,
            Some(remaining) => {
                if is_dirty {
                    frame.set_dirty(true);
                }
                if remaining == 0 {
                    self.replacer.set_evictable(frame.frame_id(), true);
                }
                true
            }
        }
    }

    pub(crate) fn unpin(&self, page_id: PageId, frame: &FrameHeader, is_dirty: bool) -> bool {
        let _latch = self.latch.lock();
        self.unpin_locked(page_id, frame, is_dirty)
    }
}

/// BufferPoolManager is responsible for fetching database pages from disk
/// and storing them in memory. It manages a fixed number of frames and uses
/// the LRU-K replacement policy to decide which pages to evict.
///
/// Pages can be used through the raw pin API (`new_page`, `fetch_page`,
/// `unpin_page`) or through guards (`new_page_guarded`, `fetch_page_read`,
/// `fetch_page_write`) that hold the page latch and unpin on drop.
pub struct BufferPoolManager {
    pool_size: usize,
    inner: Arc<BufferPoolInner>,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with the given pool size, k value for LRU-K,
    /// and disk manager.
    pub fn new(pool_size: usize, k: usize, disk_manager: Arc<DiskManager>) -> Self {
        Self::with_bucket_size(pool_size, k, DEFAULT_BUCKET_SIZE, disk_manager)
    }

    /// Like [`BufferPoolManager::new`], with an explicit page-table bucket capacity.
    pub fn with_bucket_size(
        pool_size: usize,
        k: usize,
        bucket_size: usize,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let inner = Arc::new(BufferPoolInner {
            frames,
            page_table: ExtendibleHashTable::new(bucket_size),
            latch: Mutex::new(free_list),
            replacer: LruKReplacer::new(k, pool_size),
            disk_scheduler: DiskScheduler::new(disk_manager),
        });

        Self { pool_size, inner }
    }

    /// Allocates a fresh zeroed page and pins it once.
    ///
    /// The caller owns that pin and must release it with `unpin_page`.
    /// Fails with `BufferPoolFull` when every frame is pinned.
    pub fn new_page(&self) -> Result<PageId> {
        self.inner.new_page().map(|(page_id, _)| page_id)
    }

    /// Pins a page, reading it from disk if it is not resident.
    ///
    /// The caller owns the pin and must release it with `unpin_page`.
    pub fn fetch_page(&self, page_id: PageId) -> Result<Arc<FrameHeader>> {
        self.inner.fetch_page(page_id)
    }

    /// Releases one pin on a resident page. The dirty flag is ORed in, never
    /// cleared. Returns false if the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _latch = self.inner.latch.lock();
        match self.inner.page_table.find(&page_id) {
            Some(frame_id) => {
                let frame = &self.inner.frames[frame_id.as_usize()];
                self.inner.unpin_locked(page_id, frame, is_dirty)
            }
            None => false,
        }
    }

    /// Allocates a fresh page and returns it write-latched.
    pub fn new_page_guarded(&self) -> Result<WritePageGuard> {
        let (page_id, frame) = self.inner.new_page()?;
        Ok(WritePageGuard::new(page_id, frame, Arc::clone(&self.inner)))
    }

    /// Pins a page and takes its read latch.
    ///
    /// The pool latch is released before the page latch is requested, so a
    /// caller blocked on a busy page does not stall the rest of the pool.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        let frame = self.inner.fetch_page(page_id)?;
        Ok(ReadPageGuard::new(page_id, frame, Arc::clone(&self.inner)))
    }

    /// Pins a page and takes its write latch.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        let frame = self.inner.fetch_page(page_id)?;
        Ok(WritePageGuard::new(page_id, frame, Arc::clone(&self.inner)))
    }

    /// Writes a resident page to disk whether or not it is dirty.
    /// Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if !page_id.is_valid() {
            return Err(StrataError::InvalidPageId(page_id));
        }

        // Pin instead of holding the pool latch across the page latch
        let frame = {
            let _latch = self.inner.latch.lock();
            match self.inner.page_table.find(&page_id) {
                Some(frame_id) => {
                    let frame = Arc::clone(&self.inner.frames[frame_id.as_usize()]);
                    self.inner.pin_frame(&frame)?;
                    frame
                }
                None => return Ok(false),
            }
        };

        frame.set_dirty(false);
        let mut data = [0u8; PAGE_SIZE];
        frame.copy_to(&mut data);
        let result = self.inner.disk_scheduler.schedule_write_sync(page_id, &data);
        if result.is_err() {
            frame.set_dirty(true);
        }

        self.inner.unpin(page_id, &frame, false);
        result.map(|_| true)
    }

    /// Flushes every resident page to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let resident: Vec<PageId> = {
            let _latch = self.inner.latch.lock();
            self.inner
                .frames
                .iter()
                .map(|f| f.page_id())
                .filter(|p| p.is_valid())
                .collect()
        };

        for page_id in resident {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Deletes a page from the pool and hands its id back to the disk manager.
    ///
    /// Returns true if the page is gone (including when it was never
    /// resident) and false if it is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut free_list = self.inner.latch.lock();

        let Some(frame_id) = self.inner.page_table.find(&page_id) else {
            return Ok(true);
        };
        let frame = &self.inner.frames[frame_id.as_usize()];
        if frame.pin_count() > 0 {
            return Ok(false);
        }

        self.inner.replacer.remove(frame_id)?;
        self.inner.page_table.remove(&page_id);
        frame.reset();
        free_list.push_back(frame_id);
        self.inner
            .disk_scheduler
            .disk_manager()
            .deallocate_page(page_id);

        debug!(%page_id, %frame_id, "deleted page");
        Ok(true)
    }

    /// Returns the pin count of a resident page.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let _latch = self.inner.latch.lock();
        self.inner
            .page_table
            .find(&page_id)
            .map(|frame_id| self.inner.frames[frame_id.as_usize()].pin_count())
    }

    /// Returns the pool size.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_frame_count(&self) -> usize {
        self.inner.latch.lock().len()
    }

    /// Number of frames with a non-zero pin count.
    pub fn pinned_frame_count(&self) -> usize {
        let _latch = self.inner.latch.lock();
        self.inner
            .frames
            .iter()
            .filter(|f| f.pin_count() > 0)
            .count()
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.inner.disk_scheduler.disk_manager()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = BufferPoolManager::new(pool_size, 2, dm);
        (bpm, temp_file)
    }

    #[test]
    fn test_new_page_is_pinned() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap();
        // Page 0 is the header page
        assert_eq!(page_id, PageId::new(1));
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
        assert_eq!(bpm.free_frame_count(), 9);

        assert!(bpm.unpin_page(page_id, false));
        assert!(!bpm.unpin_page(page_id, false));
        assert!(!bpm.unpin_page(PageId::new(42), false));
    }

    #[test]
    fn test_unpin_never_clears_dirty() {
        let (bpm, _temp) = create_bpm(4);

        let page_id = bpm.new_page().unwrap();
        let frame = bpm.fetch_page(page_id).unwrap();
        bpm.unpin_page(page_id, true);
        bpm.unpin_page(page_id, false);
        assert!(frame.is_dirty());

        bpm.flush_page(page_id).unwrap();
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_guard_releases_pin_on_drop() {
        let (bpm, _temp) = create_bpm(4);

        let page_id = {
            let mut guard = bpm.new_page_guarded().unwrap();
            guard.data_mut()[0] = 9;
            guard.page_id()
        };
        assert_eq!(bpm.get_pin_count(page_id), Some(0));
        assert_eq!(bpm.pinned_frame_count(), 0);

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 9);
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
    }

    #[test]
    fn test_delete_page_rules() {
        let (bpm, _temp) = create_bpm(4);

        let page_id = bpm.new_page().unwrap();
        assert!(!bpm.delete_page(page_id).unwrap());

        bpm.unpin_page(page_id, false);
        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.get_pin_count(page_id), None);
        assert_eq!(bpm.free_frame_count(), 4);

        // Not resident
        assert!(bpm.delete_page(PageId::new(77)).unwrap());

        // The freed id is handed out again
        assert_eq!(bpm.new_page().unwrap(), page_id);
    }
}
