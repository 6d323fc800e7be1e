use bytes::{Buf, BufMut};

use crate::common::{PageId, Result, StrataError, PAGE_SIZE};

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;

/// Index names are stored zero-padded to this many bytes
pub const MAX_INDEX_NAME_LEN: usize = 32;
const RECORD_SIZE: usize = MAX_INDEX_NAME_LEN + 4; // name (32) + root_id (4)
pub const MAX_HEADER_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

fn encode_name(name: &str) -> Result<[u8; MAX_INDEX_NAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.len() > MAX_INDEX_NAME_LEN {
        return Err(StrataError::IndexNameTooLong(name.to_string()));
    }
    let mut buf = [0u8; MAX_INDEX_NAME_LEN];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

fn record_offset(index: usize) -> usize {
    RECORDS_OFFSET + index * RECORD_SIZE
}

fn read_count(data: &[u8; PAGE_SIZE]) -> usize {
    (&data[RECORD_COUNT_OFFSET..]).get_u32_le() as usize
}

fn find_record(data: &[u8; PAGE_SIZE], name: &[u8; MAX_INDEX_NAME_LEN]) -> Option<usize> {
    (0..read_count(data)).find(|&i| {
        let offset = record_offset(i);
        &data[offset..offset + MAX_INDEX_NAME_LEN] == name
    })
}

fn read_root(data: &[u8; PAGE_SIZE], index: usize) -> PageId {
    let offset = record_offset(index) + MAX_INDEX_NAME_LEN;
    PageId::new((&data[offset..]).get_u32_le())
}

/// Mutable view over page 0: the directory of index name -> root page id.
///
/// An all-zero page is a valid, empty directory.
pub struct HeaderPage<'a> {
    data: &'a mut [u8; PAGE_SIZE],
}

impl<'a> HeaderPage<'a> {
    pub fn new(data: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn init(&mut self) {
        self.data.fill(0);
    }

    pub fn record_count(&self) -> usize {
        read_count(&*self.data)
    }

    fn set_record_count(&mut self, count: usize) {
        (&mut self.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]).put_u32_le(count as u32);
    }

    fn set_root(&mut self, index: usize, root_id: PageId) {
        let offset = record_offset(index) + MAX_INDEX_NAME_LEN;
        (&mut self.data[offset..offset + 4]).put_u32_le(root_id.as_u32());
    }

    /// Adds a record. Returns false if `name` is already present.
    pub fn insert_record(&mut self, name: &str, root_id: PageId) -> Result<bool> {
        let key = encode_name(name)?;
        if find_record(&*self.data, &key).is_some() {
            return Ok(false);
        }

        let count = self.record_count();
        if count >= MAX_HEADER_RECORDS {
            return Err(StrataError::HeaderPageFull);
        }

        let offset = record_offset(count);
        self.data[offset..offset + MAX_INDEX_NAME_LEN].copy_from_slice(&key);
        self.set_root(count, root_id);
        self.set_record_count(count + 1);
        Ok(true)
    }

    /// Rewrites the root of an existing record. Returns false if absent.
    pub fn update_record(&mut self, name: &str, root_id: PageId) -> Result<bool> {
        let key = encode_name(name)?;
        match find_record(&*self.data, &key) {
            Some(index) => {
                self.set_root(index, root_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes a record, moving the last record into its slot.
    pub fn delete_record(&mut self, name: &str) -> Result<bool> {
        let key = encode_name(name)?;
        let Some(index) = find_record(&*self.data, &key) else {
            return Ok(false);
        };

        let last = self.record_count() - 1;
        if index != last {
            let src = record_offset(last);
            let dst = record_offset(index);
            self.data.copy_within(src..src + RECORD_SIZE, dst);
        }
        let tail = record_offset(last);
        self.data[tail..tail + RECORD_SIZE].fill(0);
        self.set_record_count(last);
        Ok(true)
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        let key = encode_name(name).ok()?;
        find_record(&*self.data, &key).map(|i| read_root(&*self.data, i))
    }
}

/// Read-only view over the header page
pub struct HeaderPageRef<'a> {
    data: &'a [u8; PAGE_SIZE],
}

impl<'a> HeaderPageRef<'a> {
    pub fn new(data: &'a [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn record_count(&self) -> usize {
        read_count(self.data)
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        let key = encode_name(name).ok()?;
        find_record(self.data, &key).map(|i| read_root(self.data, i))
    }
}
