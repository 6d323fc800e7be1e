use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{PageId, RecordId, Result};
use crate::storage::page::LeafPage;

use super::key_comparator::IndexKey;

/// Forward iterator over the leaf level.
///
/// Holds a read latch and a pin on the current leaf only. Moving past the
/// last entry releases that leaf before the next one is fetched. Do not
/// modify the tree from a thread that still holds an iterator.
pub struct BPlusTreeIterator<K> {
    bpm: Arc<BufferPoolManager>,
    guard: Option<ReadPageGuard>,
    index: usize,
    _key: PhantomData<K>,
}

impl<K: IndexKey> BPlusTreeIterator<K> {
    /// Positions at `index` in `leaf`, skipping forward if that slot is past
    /// the end of the leaf.
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        leaf: Option<ReadPageGuard>,
        index: usize,
    ) -> Result<Self> {
        let mut iter = Self {
            bpm,
            guard: leaf,
            index,
            _key: PhantomData,
        };
        iter.settle()?;
        Ok(iter)
    }

    pub(crate) fn end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            guard: None,
            index: 0,
            _key: PhantomData,
        }
    }

    pub fn is_end(&self) -> bool {
        self.guard.is_none()
    }

    /// Leaf the iterator currently points into.
    pub fn page_id(&self) -> Option<PageId> {
        self.guard.as_ref().map(|g| g.page_id())
    }

    /// Advances through leaves until `index` names a live entry or the
    /// chain runs out.
    fn settle(&mut self) -> Result<()> {
        while let Some(guard) = &self.guard {
            let leaf = LeafPage::<_, K>::open(guard.data())?;
            if self.index < leaf.size() {
                return Ok(());
            }
            let next = leaf.next_page_id();
            self.guard = None;
            self.index = 0;
            if next.is_valid() {
                self.guard = Some(self.bpm.fetch_page_read(next)?);
            }
        }
        Ok(())
    }
}

impl<K: IndexKey> Iterator for BPlusTreeIterator<K> {
    type Item = Result<(K, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        let guard = self.guard.as_ref()?;
        let entry = LeafPage::<_, K>::open(guard.data())
            .map(|leaf| (leaf.key_at(self.index), leaf.value_at(self.index)));
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                self.guard = None;
                return Some(Err(e));
            }
        };
        self.index += 1;
        if let Err(e) = self.settle() {
            self.guard = None;
            return Some(Err(e));
        }
        Some(Ok(entry))
    }
}

impl<K> PartialEq for BPlusTreeIterator<K> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.guard, &other.guard) {
            (None, None) => true,
            (Some(a), Some(b)) => a.page_id() == b.page_id() && self.index == other.index,
            _ => false,
        }
    }
}

impl<K> std::fmt::Debug for BPlusTreeIterator<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTreeIterator")
            .field("page_id", &self.guard.as_ref().map(|g| g.page_id()))
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::common::{PageId, RecordId, SlotId};
    use crate::index::{BPlusTree, OrdComparator};
    use crate::storage::disk::DiskManager;
    use crate::buffer::BufferPoolManager;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_iterator_crosses_leaves_and_releases_pins() {
        let dir = tempdir().unwrap();
        let dm = Arc::new(DiskManager::new(dir.path().join("iter.db")).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(8, 2, dm));
        let tree = BPlusTree::<i64>::new("iter", Arc::clone(&bpm), OrdComparator, 3, 3).unwrap();

        assert!(tree.begin().unwrap().is_end());
        assert_eq!(tree.begin().unwrap(), tree.end());

        for k in (0..20).rev() {
            let rid = RecordId::new(PageId::new(k as u32), SlotId::new(0));
            tree.insert(&(k * 10), rid).unwrap();
        }

        let keys: Vec<i64> = tree.begin().unwrap().map(|e| e.unwrap().0).collect();
        assert_eq!(keys, (0..20).map(|k| k * 10).collect::<Vec<_>>());

        // Starting between keys lands on the next larger one
        let mut iter = tree.begin_at(&45).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().0, 50);
        drop(iter);

        assert!(tree.begin_at(&1000).unwrap().is_end());
        assert_eq!(bpm.pinned_frame_count(), 0);
    }
}
