use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{PageId, Result, StrataError, HEADER_PAGE_ID, PAGE_SIZE};

/// DiskManager is responsible for reading and writing pages to/from disk.
///
/// It manages a single database file. Page 0 is reserved for the header page
/// when the file is created, so data pages are handed out from 1. Deallocated
/// page ids go onto a free list and are reused before the file grows.
///
/// The free list lives in memory only. Ids still on it when the manager is
/// dropped stay allocated in the file and are not handed out after reopening.
pub struct DiskManager {
    db_file: Mutex<File>,
    db_path: String,
    /// Number of pages in the file, including the header page
    num_pages: AtomicU32,
    /// Page ids released by `deallocate_page`, reused LIFO
    free_pages: Mutex<Vec<PageId>>,
    num_reads: AtomicU32,
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Opens (or creates) the database file at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path_str = db_path.as_ref().to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&db_path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        let dm = Self {
            db_file: Mutex::new(file),
            db_path: path_str,
            num_pages: AtomicU32::new(num_pages),
            free_pages: Mutex::new(Vec::new()),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        };

        if num_pages == 0 {
            // An all-zero header page is an empty index directory
            dm.write_page(HEADER_PAGE_ID, &[0u8; PAGE_SIZE])?;
            dm.num_pages.store(1, Ordering::SeqCst);
            debug!(path = %dm.db_path, "created database file");
        }

        Ok(dm)
    }

    /// Reads a page from disk. Bytes past the end of the file read as zero.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8; PAGE_SIZE]) -> Result<()> {
        if !page_id.is_valid() {
            return Err(StrataError::InvalidPageId(page_id));
        }
        let offset = (page_id.as_u32() as u64) * (PAGE_SIZE as u64);

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < PAGE_SIZE {
            match file.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        data[filled..].fill(0);

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a full page to disk.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        if !page_id.is_valid() {
            return Err(StrataError::InvalidPageId(page_id));
        }
        let offset = (page_id.as_u32() as u64) * (PAGE_SIZE as u64);

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Allocates a zero-initialized page, reusing a freed id when one exists.
    pub fn allocate_page(&self) -> Result<PageId> {
        let reused = self.free_pages.lock().pop();
        let page_id = match reused {
            Some(page_id) => {
                trace!(%page_id, "reusing freed page");
                page_id
            }
            None => PageId::new(self.num_pages.fetch_add(1, Ordering::SeqCst)),
        };

        self.write_page(page_id, &[0u8; PAGE_SIZE])?;
        Ok(page_id)
    }

    /// Marks a page id as reusable. The header page is never released.
    pub fn deallocate_page(&self, page_id: PageId) {
        if page_id == HEADER_PAGE_ID || !page_id.is_valid() {
            return;
        }
        let mut free = self.free_pages.lock();
        if !free.contains(&page_id) {
            free.push(page_id);
        }
    }

    /// Returns the number of pages in the file.
    pub fn get_num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::Relaxed)
    }

    /// Returns the number of page ids waiting to be reused.
    pub fn get_num_free_pages(&self) -> usize {
        self.free_pages.lock().len()
    }

    /// Returns the number of disk reads performed.
    pub fn get_num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of disk writes performed.
    pub fn get_num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    pub fn get_db_path(&self) -> &str {
        &self.db_path
    }

    /// Flushes any buffered writes to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.db_file.lock();
        file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let file = self.db_file.get_mut();
        let _ = file.sync_all();
    }
}
