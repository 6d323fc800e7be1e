use std::cmp::Ordering;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use bytes::{Buf, BufMut};

use crate::common::{PageId, RecordId, Result, SlotId, StrataError, INVALID_PAGE_ID, PAGE_SIZE};
use crate::index::{IndexKey, KeyComparator};

use super::b_plus_tree_page::{
    read_u32, write_u32, BPlusTreePage, EntryLayout, IndexPageType, COMMON_HEADER_SIZE,
    MAX_SIZE_OFFSET, PAGE_ID_OFFSET, PAGE_TYPE_OFFSET, SIZE_OFFSET,
};

const NEXT_PAGE_ID_OFFSET: usize = COMMON_HEADER_SIZE;
pub const LEAF_HEADER_SIZE: usize = COMMON_HEADER_SIZE + 4;

/// RecordId on disk: page id (4) + slot id (2)
pub const RID_SIZE: usize = 6;

fn encode_rid(rid: RecordId, mut buf: &mut [u8]) {
    buf.put_u32_le(rid.page_id.as_u32());
    buf.put_u16_le(rid.slot_id.as_u16());
}

fn decode_rid(mut buf: &[u8]) -> RecordId {
    let page_id = PageId::new(buf.get_u32_le());
    let slot_id = SlotId::new(buf.get_u16_le());
    RecordId::new(page_id, slot_id)
}

/// View of a B+ tree leaf: sorted `(key, RecordId)` pairs plus a link to
/// the next leaf.
///
/// `D` is the page buffer: `&[u8; PAGE_SIZE]` for reading, `&mut` for writing.
pub struct LeafPage<D, K> {
    data: D,
    _key: PhantomData<K>,
}

impl<D, K> LeafPage<D, K>
where
    D: Deref<Target = [u8; PAGE_SIZE]>,
    K: IndexKey,
{
    const LAYOUT: EntryLayout = EntryLayout {
        header_size: LEAF_HEADER_SIZE,
        entry_size: K::ENCODED_LEN + RID_SIZE,
    };

    /// Wraps a page that must already hold a leaf whose sizes fit the page.
    pub fn open(data: D) -> Result<Self> {
        let header = BPlusTreePage::new(&data);
        if header.validate()? != IndexPageType::Leaf {
            return Err(StrataError::IndexCorrupted(format!(
                "page {} is not a leaf",
                header.page_id()
            )));
        }
        header.check_bounds(Self::capacity())?;
        Ok(Self {
            data,
            _key: PhantomData,
        })
    }

    /// Maximum number of entries a page can physically hold
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

    pub fn next_page_id(&self) -> PageId {
        PageId::new(read_u32(&self.data, NEXT_PAGE_ID_OFFSET))
    }

    pub fn key_at(&self, index: usize) -> K {
        let offset = Self::LAYOUT.offset(index);
        K::decode(&self.data[offset..offset + K::ENCODED_LEN])
    }

    pub fn value_at(&self, index: usize) -> RecordId {
        let offset = Self::LAYOUT.offset(index) + K::ENCODED_LEN;
        decode_rid(&self.data[offset..offset + RID_SIZE])
    }

    pub fn entries(&self) -> Vec<(K, RecordId)> {
        (0..self.size())
            .map(|i| (self.key_at(i), self.value_at(i)))
            .collect()
    }

    /// First index whose key is not less than `key`.
    pub fn lower_bound<C: KeyComparator<K>>(&self, key: &K, cmp: &C) -> usize {
        let (mut lo, mut hi) = (0, self.size());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.compare(&self.key_at(mid), key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Index of the entry equal to `key`.
    pub fn find<C: KeyComparator<K>>(&self, key: &K, cmp: &C) -> Option<usize> {
        let index = self.lower_bound(key, cmp);
        (index < self.size() && cmp.compare(&self.key_at(index), key) == Ordering::Equal)
            .then_some(index)
    }

    /// All values stored under `key`.
    pub fn lookup<C: KeyComparator<K>>(&self, key: &K, cmp: &C) -> Vec<RecordId> {
        (self.lower_bound(key, cmp)..self.size())
            .take_while(|&i| cmp.compare(&self.key_at(i), key) == Ordering::Equal)
            .map(|i| self.value_at(i))
            .collect()
    }
}

impl<D, K> LeafPage<D, K>
where
    D: DerefMut<Target = [u8; PAGE_SIZE]>,
    K: IndexKey,
{
    /// Formats `data` as an empty leaf.
    pub fn init(mut data: D, page_id: PageId, max_size: usize) -> Self {
        data.fill(0);
        data[PAGE_TYPE_OFFSET] = IndexPageType::Leaf as u8;
        write_u32(&mut data, MAX_SIZE_OFFSET, max_size as u32);
        write_u32(&mut data, PAGE_ID_OFFSET, page_id.as_u32());
        write_u32(&mut data, NEXT_PAGE_ID_OFFSET, INVALID_PAGE_ID.as_u32());
        Self {
            data,
            _key: PhantomData,
        }
    }

    fn set_size(&mut self, size: usize) {
        write_u32(&mut self.data, SIZE_OFFSET, size as u32);
    }

    pub fn set_next_page_id(&mut self, page_id: PageId) {
        write_u32(&mut self.data, NEXT_PAGE_ID_OFFSET, page_id.as_u32());
    }

    fn write_entry(&mut self, index: usize, key: &K, value: RecordId) {
        let offset = Self::LAYOUT.offset(index);
        key.encode(&mut self.data[offset..offset + K::ENCODED_LEN]);
        let offset = offset + K::ENCODED_LEN;
        encode_rid(value, &mut self.data[offset..offset + RID_SIZE]);
    }

    pub fn insert_at(&mut self, index: usize, key: &K, value: RecordId) {
        let size = self.size();
        Self::LAYOUT.shift_right(&mut self.data, index, size);
        self.write_entry(index, key, value);
        self.set_size(size + 1);
    }

    pub fn remove_at(&mut self, index: usize) {
        let size = self.size();
        Self::LAYOUT.shift_left(&mut self.data, index, size);
        self.set_size(size - 1);
    }

    /// Inserts in key order. Returns false, leaving the page untouched, if
    /// the key is already present.
    pub fn insert<C: KeyComparator<K>>(&mut self, key: &K, value: RecordId, cmp: &C) -> bool {
        let index = self.lower_bound(key, cmp);
        if index < self.size() && cmp.compare(&self.key_at(index), key) == Ordering::Equal {
            return false;
        }
        self.insert_at(index, key, value);
        true
    }

    /// Removes the entry for `key`. Returns false if absent.
    pub fn remove<C: KeyComparator<K>>(&mut self, key: &K, cmp: &C) -> bool {
        match self.find(key, cmp) {
            Some(index) => {
                self.remove_at(index);
                true
            }
            None => false,
        }
    }

    /// Replaces the whole entry array.
    pub fn set_entries(&mut self, entries: &[(K, RecordId)]) {
        for (i, (key, value)) in entries.iter().enumerate() {
            self.write_entry(i, key, *value);
        }
        self.set_size(entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::OrdComparator;

    fn rid(n: u32) -> RecordId {
        RecordId::new(PageId::new(n), SlotId::new(n as u16))
    }

    #[test]
    fn test_leaf_insert_keeps_order() {
        let mut data = [0u8; PAGE_SIZE];
        let mut leaf = LeafPage::<_, i64>::init(&mut data, PageId::new(4), 8);

        for k in [5i64, 1, 3, 4, 2] {
            assert!(leaf.insert(&k, rid(k as u32), &OrdComparator));
        }
        assert!(!leaf.insert(&3, rid(99), &OrdComparator));

        let keys: Vec<i64> = leaf.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
        assert_eq!(leaf.lookup(&3, &OrdComparator), vec![rid(3)]);
        assert!(leaf.lookup(&9, &OrdComparator).is_empty());
        assert_eq!(leaf.next_page_id(), INVALID_PAGE_ID);

        assert!(leaf.remove(&1, &OrdComparator));
        assert!(!leaf.remove(&1, &OrdComparator));
        assert_eq!(leaf.key_at(0), 2);
        assert_eq!(leaf.size(), 4);
    }

    #[test]
    fn test_leaf_open_rejects_internal_page() {
        let mut data = [0u8; PAGE_SIZE];
        data[PAGE_TYPE_OFFSET] = IndexPageType::Internal as u8;
        assert!(LeafPage::<_, i64>::open(&data).is_err());

        let mut data = [0u8; PAGE_SIZE];
        LeafPage::<_, i64>::init(&mut data, PageId::new(2), 4);
        let leaf = LeafPage::<_, i64>::open(&data).unwrap();
        assert_eq!(leaf.max_size(), 4);
        assert_eq!(leaf.min_size(), 2);
        assert_eq!(leaf.page_id(), PageId::new(2));
    }

    #[test]
    fn test_leaf_open_rejects_corrupt_sizes() {
        let mut data = [0u8; PAGE_SIZE];
        LeafPage::<_, i64>::init(&mut data, PageId::new(3), 4);
        write_u32(&mut data, SIZE_OFFSET, 5000);
        assert!(matches!(
            LeafPage::<_, i64>::open(&data),
            Err(StrataError::IndexCorrupted(_))
        ));

        let capacity = LeafPage::<&[u8; PAGE_SIZE], i64>::capacity();
        write_u32(&mut data, SIZE_OFFSET, 0);
        write_u32(&mut data, MAX_SIZE_OFFSET, capacity as u32 + 1);
        assert!(matches!(
            LeafPage::<_, i64>::open(&data),
            Err(StrataError::IndexCorrupted(_))
        ));
    }
}
