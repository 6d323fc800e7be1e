//! Common header shared by B+ tree leaf and internal pages.
//!
//! ```text
//! | page_type (1) | pad (3) | size (4) | max_size (4) | page_id (4) | ...
//! ```
//!
//! Leaf pages follow this with a 4-byte next-leaf page id. The entry array
//! starts right after the header; every entry is a key followed by a value.

use bytes::{Buf, BufMut};

use crate::common::{PageId, Result, StrataError, PAGE_SIZE};

pub(crate) const PAGE_TYPE_OFFSET: usize = 0;
pub(crate) const SIZE_OFFSET: usize = 4;
pub(crate) const MAX_SIZE_OFFSET: usize = 8;
pub(crate) const PAGE_ID_OFFSET: usize = 12;
pub(crate) const COMMON_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndexPageType {
    Invalid = 0,
    Leaf = 1,
    Internal = 2,
}

impl From<u8> for IndexPageType {
    fn from(value: u8) -> Self {
        match value {
            1 => IndexPageType::Leaf,
            2 => IndexPageType::Internal,
            _ => IndexPageType::Invalid,
        }
    }
}

pub(crate) fn read_u32(data: &[u8; PAGE_SIZE], offset: usize) -> u32 {
    (&data[offset..]).get_u32_le()
}

pub(crate) fn write_u32(data: &mut [u8; PAGE_SIZE], offset: usize, value: u32) {
    (&mut data[offset..offset + 4]).put_u32_le(value);
}

/// Read-only access to the fields every tree page carries.
#[derive(Clone, Copy)]
pub struct BPlusTreePage<'a> {
    data: &'a [u8; PAGE_SIZE],
}

impl<'a> BPlusTreePage<'a> {
    pub fn new(data: &'a [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn page_type(&self) -> IndexPageType {
        IndexPageType::from(self.data[PAGE_TYPE_OFFSET])
    }

    pub fn is_leaf(&self) -> bool {
        self.page_type() == IndexPageType::Leaf
    }

    pub fn size(&self) -> usize {
        read_u32(self.data, SIZE_OFFSET) as usize
    }

    pub fn max_size(&self) -> usize {
        read_u32(self.data, MAX_SIZE_OFFSET) as usize
    }

    /// Leaves hold at least `ceil((max-1)/2)` entries, internals `ceil(max/2)` children
    pub fn min_size(&self) -> usize {
        if self.is_leaf() {
            self.max_size() / 2
        } else {
            (self.max_size() + 1) / 2
        }
    }

    pub fn page_id(&self) -> PageId {
        PageId::new(read_u32(self.data, PAGE_ID_OFFSET))
    }

    /// Fails unless the page carries a leaf or internal header.
    pub fn validate(&self) -> Result<IndexPageType> {
        match self.page_type() {
            IndexPageType::Invalid => Err(StrataError::IndexCorrupted(format!(
                "page {} is not a B+ tree page",
                self.page_id()
            ))),
            page_type => Ok(page_type),
        }
    }

    /// Fails unless `size <= max_size <= capacity`, so entry offsets stay
    /// inside the page.
    pub fn check_bounds(&self, capacity: usize) -> Result<()> {
        let (size, max_size) = (self.size(), self.max_size());
        if size > max_size || max_size > capacity {
            return Err(StrataError::IndexCorrupted(format!(
                "page {} has size {} and max size {} with room for {}",
                self.page_id(),
                size,
                max_size,
                capacity
            )));
        }
        Ok(())
    }
}

/// Fixed-width entry array that follows a page header.
pub(crate) struct EntryLayout {
    pub header_size: usize,
    pub entry_size: usize,
}

impl EntryLayout {
    pub fn offset(&self, index: usize) -> usize {
        self.header_size + index * self.entry_size
    }

    /// Number of entries that fit in one page
    pub fn capacity(&self) -> usize {
        (PAGE_SIZE - self.header_size) / self.entry_size
    }

    /// Opens a gap at `index` by shifting `[index, size)` one slot right.
    pub fn shift_right(&self, data: &mut [u8; PAGE_SIZE], index: usize, size: usize) {
        if index < size {
            let start = self.offset(index);
            let end = self.offset(size);
            data.copy_within(start..end, start + self.entry_size);
        }
    }

    /// Closes the gap at `index` by shifting `(index, size)` one slot left.
    pub fn shift_left(&self, data: &mut [u8; PAGE_SIZE], index: usize, size: usize) {
        if index + 1 < size {
            let start = self.offset(index + 1);
            let end = self.offset(size);
            data.copy_within(start..end, self.offset(index));
        }
    }
}
