use std::cmp::Ordering;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use crate::common::{PageId, Result, StrataError, PAGE_SIZE};
use crate::index::{IndexKey, KeyComparator};

use super::b_plus_tree_page::{
    read_u32, write_u32, BPlusTreePage, EntryLayout, IndexPageType, COMMON_HEADER_SIZE,
    MAX_SIZE_OFFSET, PAGE_ID_OFFSET, PAGE_TYPE_OFFSET, SIZE_OFFSET,
};

pub const INTERNAL_HEADER_SIZE: usize = COMMON_HEADER_SIZE;
const CHILD_SIZE: usize = 4;

/// View of a B+ tree internal node: `size` children and `size - 1`
/// separator keys. Slot 0's key is unused; key `i` is the smallest key
/// reachable through child `i`.
pub struct InternalPage<D, K> {
    data: D,
    _key: PhantomData<K>,
}

impl<D, K> InternalPage<D, K>
where
    D: Deref<Target = [u8; PAGE_SIZE]>,
    K: IndexKey,
{
    const LAYOUT: EntryLayout = EntryLayout {
        header_size: INTERNAL_HEADER_SIZE,
        entry_size: K::ENCODED_LEN + CHILD_SIZE,
    };

    /// Wraps a page that must already hold an internal node whose sizes fit
    /// the page.
    pub fn open(data: D) -> Result<Self> {
        let header = BPlusTreePage::new(&data);
        if header.validate()? != IndexPageType::Internal {
            return Err(StrataError::IndexCorrupted(format!(
                "page {} is not an internal node",
                header.page_id()
            )));
        }
        header.check_bounds(Self::capacity())?;
        Ok(Self {
            data,
            _key: PhantomData,
        })
    }

    pub fn capacity() -> usize {
        Self::LAYOUT.capacity()
    }

    fn header(&self) -> BPlusTreePage<'_> {
        BPlusTreePage::new(&self.data)
    }

    pub fn size(&self) -> usize {
        self.header().size()
    }

    pub fn max_size(&self) -> usize {
        self.header().max_size()
    }

    pub fn min_size(&self) -> usize {
        self.header().min_size()
    }

    pub fn page_id(&self) -> PageId {
        self.header().page_id()
    }

    pub fn key_at(&self, index: usize) -> K {
        let offset = Self::LAYOUT.offset(index);
        K::decode(&self.data[offset..offset + K::ENCODED_LEN])
    }

    pub fn value_at(&self, index: usize) -> PageId {
        let offset = Self::LAYOUT.offset(index) + K::ENCODED_LEN;
        PageId::new(read_u32(&self.data, offset))
    }

    /// Slot holding `child`, if any.
    pub fn value_index(&self, child: PageId) -> Option<usize> {
        (0..self.size()).find(|&i| self.value_at(i) == child)
    }

    /// Child whose subtree covers `key`: the largest `i` with
    /// `key_at(i) <= key`, or 0 when `key` sorts before `key_at(1)`.
    pub fn lookup<C: KeyComparator<K>>(&self, key: &K, cmp: &C) -> PageId {
        let (mut lo, mut hi) = (1, self.size());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.compare(&self.key_at(mid), key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        self.value_at(lo - 1)
    }

    pub fn entries(&self) -> Vec<(K, PageId)> {
        (0..self.size())
            .map(|i| (self.key_at(i), self.value_at(i)))
            .collect()
    }
}

impl<D, K> InternalPage<D, K>
where
    D: DerefMut<Target = [u8; PAGE_SIZE]>,
    K: IndexKey,
{
    /// Formats `data` as an empty internal node.
    pub fn init(mut data: D, page_id: PageId, max_size: usize) -> Self {
        data.fill(0);
        data[PAGE_TYPE_OFFSET] = IndexPageType::Internal as u8;
        write_u32(&mut data, MAX_SIZE_OFFSET, max_size as u32);
        write_u32(&mut data, PAGE_ID_OFFSET, page_id.as_u32());
        Self {
            data,
            _key: PhantomData,
        }
    }

    fn set_size(&mut self, size: usize) {
        write_u32(&mut self.data, SIZE_OFFSET, size as u32);
    }

    pub fn set_key_at(&mut self, index: usize, key: &K) {
        let offset = Self::LAYOUT.offset(index);
        key.encode(&mut self.data[offset..offset + K::ENCODED_LEN]);
    }

    pub fn set_value_at(&mut self, index: usize, child: PageId) {
        let offset = Self::LAYOUT.offset(index) + K::ENCODED_LEN;
        write_u32(&mut self.data, offset, child.as_u32());
    }

    /// Turns an empty page into a root with two children.
    pub fn populate_new_root(&mut self, left: PageId, key: &K, right: PageId) {
        self.set_value_at(0, left);
        self.set_key_at(1, key);
        self.set_value_at(1, right);
        self.set_size(2);
    }

    pub fn insert_at(&mut self, index: usize, key: &K, child: PageId) {
        let size = self.size();
        Self::LAYOUT.shift_right(&mut self.data, index, size);
        self.set_key_at(index, key);
        self.set_value_at(index, child);
        self.set_size(size + 1);
    }

    /// Inserts `(key, new_child)` right after `old_child`. Returns false if
    /// `old_child` is not in this node.
    pub fn insert_after(&mut self, old_child: PageId, key: &K, new_child: PageId) -> bool {
        match self.value_index(old_child) {
            Some(index) => {
                self.insert_at(index + 1, key, new_child);
                true
            }
            None => false,
        }
    }

    pub fn remove_at(&mut self, index: usize) {
        let size = self.size();
        Self::LAYOUT.shift_left(&mut self.data, index, size);
        self.set_size(size - 1);
    }

    /// Replaces the whole entry array. `entries[0].0` lands in the unused slot.
    pub fn set_entries(&mut self, entries: &[(K, PageId)]) {
        for (i, (key, child)) in entries.iter().enumerate() {
            self.set_key_at(i, key);
            self.set_value_at(i, *child);
        }
        self.set_size(entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::OrdComparator;

    fn p(n: u32) -> PageId {
        PageId::new(n)
    }

    #[test]
    fn test_internal_lookup_routes_by_separator() {
        let mut data = [0u8; PAGE_SIZE];
        let mut node = InternalPage::<_, i64>::init(&mut data, p(1), 4);
        node.populate_new_root(p(10), &20, p(11));
        assert!(node.insert_after(p(11), &40, p(12)));
        assert!(!node.insert_after(p(99), &50, p(13)));

        assert_eq!(node.size(), 3);
        assert_eq!(node.lookup(&5, &OrdComparator), p(10));
        assert_eq!(node.lookup(&20, &OrdComparator), p(11));
        assert_eq!(node.lookup(&39, &OrdComparator), p(11));
        assert_eq!(node.lookup(&40, &OrdComparator), p(12));
        assert_eq!(node.lookup(&1000, &OrdComparator), p(12));
        assert_eq!(node.value_index(p(12)), Some(2));
    }

    #[test]
    fn test_internal_remove_and_reset() {
        let mut data = [0u8; PAGE_SIZE];
        let mut node = InternalPage::<_, i64>::init(&mut data, p(1), 4);
        node.set_entries(&[(0, p(10)), (20, p(11)), (40, p(12))]);

        node.remove_at(1);
        assert_eq!(node.size(), 2);
        assert_eq!(node.key_at(1), 40);
        assert_eq!(node.value_at(1), p(12));
        assert_eq!(node.min_size(), 2);
    }

    #[test]
    fn test_internal_open_rejects_size_past_max() {
        let mut data = [0u8; PAGE_SIZE];
        InternalPage::<_, i64>::init(&mut data, p(1), 4).set_entries(&[(0, p(10)), (20, p(11))]);
        assert!(InternalPage::<_, i64>::open(&data).is_ok());

        write_u32(&mut data, SIZE_OFFSET, 7);
        assert!(matches!(
            InternalPage::<_, i64>::open(&data),
            Err(StrataError::IndexCorrupted(_))
        ));
    }
}
