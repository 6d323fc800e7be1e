//! Concurrent B+ tree over buffer pool pages.
//!
//! Keys are unique and map to a single [`RecordId`]. Every node lives in one
//! page; the root page id is kept behind its own latch and mirrored into the
//! header page under the index name so the tree can be reopened.
//!
//! Readers crab down with read latches. Writers first try an optimistic
//! descent that only write-latches the leaf, and fall back to a pessimistic
//! descent holding write latches on every unsafe ancestor (see
//! [`crabbing`](super::crabbing)).

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use crate::buffer::{BufferPoolManager, ReadPageGuard, WritePageGuard};
use crate::common::{
    PageId, RecordId, Result, SlotId, StrataError, HEADER_PAGE_ID, INVALID_PAGE_ID, PAGE_SIZE,
};
use crate::storage::page::{
    HeaderPage, HeaderPageRef, InternalPage, LeafPage, MAX_INDEX_NAME_LEN,
};

use super::b_plus_tree_iterator::BPlusTreeIterator;
use super::crabbing::{CrabStack, Descent, NodeShape, Operation};
use super::key_comparator::{IndexKey, KeyComparator, OrdComparator};

type RootLatch<'a> = RwLockWriteGuard<'a, PageId>;
type WriteStack<'a> = CrabStack<RootLatch<'a>, WritePageGuard>;

/// Accumulated state of an integrity walk
struct IntegrityWalk<K> {
    leaf_depth: Option<usize>,
    prev_key: Option<K>,
    leaves: Vec<PageId>,
}

pub struct BPlusTree<K, C = OrdComparator> {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    comparator: C,
    leaf_max_size: usize,
    internal_max_size: usize,
    root_page_id: RwLock<PageId>,
    _key: PhantomData<fn() -> K>,
}

impl<K, C> BPlusTree<K, C>
where
    K: IndexKey,
    C: KeyComparator<K>,
{
    /// Creates an empty tree. The header record is written on the first
    /// insert.
    pub fn new(
        index_name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let index_name = index_name.into();
        Self::validate(&index_name, leaf_max_size, internal_max_size)?;
        Ok(Self {
            index_name,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
            root_page_id: RwLock::new(INVALID_PAGE_ID),
            _key: PhantomData,
        })
    }

    /// Attaches to a tree previously registered in the header page. A name
    /// with no record opens as an empty tree.
    pub fn open(
        index_name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let index_name = index_name.into();
        Self::validate(&index_name, leaf_max_size, internal_max_size)?;
        let root_page_id = {
            let guard = bpm.fetch_page_read(HEADER_PAGE_ID)?;
            HeaderPageRef::new(guard.data())
                .get_root_id(&index_name)
                .unwrap_or(INVALID_PAGE_ID)
        };
        debug!(index = %index_name, root = %root_page_id, "opened index");
        Ok(Self {
            index_name,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
            root_page_id: RwLock::new(root_page_id),
            _key: PhantomData,
        })
    }

    fn validate(index_name: &str, leaf_max_size: usize, internal_max_size: usize) -> Result<()> {
        if index_name.len() > MAX_INDEX_NAME_LEN {
            return Err(StrataError::IndexNameTooLong(index_name.to_string()));
        }
        let leaf_capacity = LeafPage::<&[u8; PAGE_SIZE], K>::capacity();
        if !(2..=leaf_capacity).contains(&leaf_max_size) {
            return Err(StrataError::InvalidConfig(format!(
                "leaf_max_size must be in 2..={}, got {}",
                leaf_capacity, leaf_max_size
            )));
        }
        let internal_capacity = InternalPage::<&[u8; PAGE_SIZE], K>::capacity();
        if !(3..=internal_capacity).contains(&internal_max_size) {
            return Err(StrataError::InvalidConfig(format!(
                "internal_max_size must be in 3..={}, got {}",
                internal_capacity, internal_max_size
            )));
        }
        Ok(())
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id.read().is_valid()
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    fn corrupt(&self, what: impl std::fmt::Display) -> StrataError {
        StrataError::IndexCorrupted(format!("{}: {}", self.index_name, what))
    }

    fn persist_root(&self, root_page_id: PageId) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(HEADER_PAGE_ID)?;
        let mut header = HeaderPage::new(guard.data_mut());
        if !header.update_record(&self.index_name, root_page_id)? {
            header.insert_record(&self.index_name, root_page_id)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Search
    // ---------------------------------------------------------------------

    /// Read-crabs to the leaf covering `key`, or the leftmost leaf when `key`
    /// is `None`. Returns `None` for an empty tree.
    fn find_leaf_read(&self, key: Option<&K>) -> Result<Option<ReadPageGuard>> {
        let root_latch = self.root_page_id.read();
        if !root_latch.is_valid() {
            return Ok(None);
        }
        let mut guard = self.bpm.fetch_page_read(*root_latch)?;
        drop(root_latch);

        loop {
            if NodeShape::of(guard.data())?.is_leaf {
                return Ok(Some(guard));
            }
            let node = InternalPage::<_, K>::open(guard.data())?;
            let child = match key {
                Some(key) => node.lookup(key, &self.comparator),
                None => node.value_at(0),
            };
            guard = self.bpm.fetch_page_read(child)?;
        }
    }

    /// Values stored under `key`: empty or a single record id.
    pub fn get_value(&self, key: &K) -> Result<Vec<RecordId>> {
        match self.find_leaf_read(Some(key))? {
            Some(guard) => Ok(LeafPage::<_, K>::open(guard.data())?.lookup(key, &self.comparator)),
            None => Ok(Vec::new()),
        }
    }

    // ---------------------------------------------------------------------
    // Iteration
    // ---------------------------------------------------------------------

    /// Iterator positioned at the smallest key.
    pub fn begin(&self) -> Result<BPlusTreeIterator<K>> {
        let leaf = self.find_leaf_read(None)?;
        BPlusTreeIterator::new(Arc::clone(&self.bpm), leaf, 0)
    }

    /// Iterator positioned at the first key not less than `key`.
    pub fn begin_at(&self, key: &K) -> Result<BPlusTreeIterator<K>> {
        match self.find_leaf_read(Some(key))? {
            Some(guard) => {
                let index = LeafPage::<_, K>::open(guard.data())?.lower_bound(key, &self.comparator);
                BPlusTreeIterator::new(Arc::clone(&self.bpm), Some(guard), index)
            }
            None => Ok(self.end()),
        }
    }

    pub fn end(&self) -> BPlusTreeIterator<K> {
        BPlusTreeIterator::end(Arc::clone(&self.bpm))
    }

    // ---------------------------------------------------------------------
    // Shared descent helpers
    // ---------------------------------------------------------------------

    /// Optimistic descent: read latches down to the leaf's parent, then a
    /// write latch on the leaf. Returns the leaf and whether it is the root.
    fn latch_leaf_optimistic(&self, key: &K) -> Result<Option<(WritePageGuard, bool)>> {
        let root_latch = self.root_page_id.read();
        if !root_latch.is_valid() {
            return Ok(None);
        }
        let root_id = *root_latch;
        let root = self.bpm.fetch_page_read(root_id)?;
        if NodeShape::of(root.data())?.is_leaf {
            // The root-id latch pins the tree shape while the read latch is
            // swapped for a write latch.
            drop(root);
            let leaf = self.bpm.fetch_page_write(root_id)?;
            drop(root_latch);
            return Ok(Some((leaf, true)));
        }
        drop(root_latch);

        let mut parent = root;
        loop {
            let child_id = InternalPage::<_, K>::open(parent.data())?.lookup(key, &self.comparator);
            let child = self.bpm.fetch_page_read(child_id)?;
            if NodeShape::of(child.data())?.is_leaf {
                drop(child);
                let leaf = self.bpm.fetch_page_write(child_id)?;
                return Ok(Some((leaf, false)));
            }
            parent = child;
        }
    }

    /// Pessimistic descent: write latches from the root, releasing every
    /// ancestor of a node that is safe for `op`. The leaf is returned; its
    /// unsafe ancestors stay in `ctx`.
    fn descend_write(
        &self,
        ctx: &mut WriteStack<'_>,
        root_id: PageId,
        key: &K,
        op: Operation,
    ) -> Result<WritePageGuard> {
        let mut guard = self.bpm.fetch_page_write(root_id)?;
        loop {
            let shape = NodeShape::of(guard.data())?;
            let safe = shape.is_safe(op, guard.page_id() == root_id);
            if shape.is_leaf {
                if safe {
                    ctx.release_ancestors();
                }
                return Ok(guard);
            }
            let child = InternalPage::<_, K>::open(guard.data())?.lookup(key, &self.comparator);
            ctx.push(guard, safe);
            guard = self.bpm.fetch_page_write(child)?;
        }
    }

    // ---------------------------------------------------------------------
    // Insert
    // ---------------------------------------------------------------------

    /// Inserts `key -> rid`. Returns false, leaving the tree unchanged, when
    /// the key already exists.
    pub fn insert(&self, key: &K, rid: RecordId) -> Result<bool> {
        if let Descent::Done(inserted) = self.insert_optimistic(key, rid)? {
            return Ok(inserted);
        }
        trace!(index = %self.index_name, ?key, "insert restarting pessimistically");
        self.insert_pessimistic(key, rid)
    }

    fn insert_optimistic(&self, key: &K, rid: RecordId) -> Result<Descent<bool>> {
        let Some((mut guard, is_root)) = self.latch_leaf_optimistic(key)? else {
            return Ok(Descent::Restart);
        };
        if LeafPage::<_, K>::open(guard.data())?
            .find(key, &self.comparator)
            .is_some()
        {
            return Ok(Descent::Done(false));
        }
        if !NodeShape::of(guard.data())?.is_safe(Operation::Insert, is_root) {
            return Ok(Descent::Restart);
        }
        LeafPage::<_, K>::open(guard.data_mut())?.insert(key, rid, &self.comparator);
        Ok(Descent::Done(true))
    }

    fn insert_pessimistic(&self, key: &K, rid: RecordId) -> Result<bool> {
        let mut root_latch = self.root_page_id.write();
        if !root_latch.is_valid() {
            self.start_new_tree(&mut root_latch, key, rid)?;
            return Ok(true);
        }
        let root_id = *root_latch;
        let mut ctx = CrabStack::new(root_latch);
        let mut leaf_guard = self.descend_write(&mut ctx, root_id, key, Operation::Insert)?;

        let leaf = LeafPage::<_, K>::open(leaf_guard.data())?;
        if leaf.find(key, &self.comparator).is_some() {
            return Ok(false);
        }
        if leaf.size() + 1 < leaf.max_size() {
            LeafPage::<_, K>::open(leaf_guard.data_mut())?.insert(key, rid, &self.comparator);
            return Ok(true);
        }

        // Take the sibling frame before touching the leaf so a full pool
        // leaves the tree as it was.
        let mut right_guard = self.bpm.new_page_guarded()?;
        LeafPage::<_, K>::open(leaf_guard.data_mut())?.insert(key, rid, &self.comparator);
        let separator = self.split_leaf(&mut leaf_guard, &mut right_guard)?;
        let (left_id, right_id) = (leaf_guard.page_id(), right_guard.page_id());
        drop(right_guard);
        drop(leaf_guard);

        self.insert_into_parent(&mut ctx, left_id, separator, right_id)?;
        Ok(true)
    }

    fn start_new_tree(&self, root_latch: &mut RootLatch<'_>, key: &K, rid: RecordId) -> Result<()> {
        let mut guard = self.bpm.new_page_guarded()?;
        let page_id = guard.page_id();
        LeafPage::<_, K>::init(guard.data_mut(), page_id, self.leaf_max_size)
            .insert(key, rid, &self.comparator);
        drop(guard);

        **root_latch = page_id;
        self.persist_root(page_id)?;
        debug!(index = %self.index_name, root = %page_id, "started new tree");
        Ok(())
    }

    /// Moves the upper half of a full leaf into `right` and links it in.
    /// Returns the separator to push up.
    fn split_leaf(&self, left: &mut WritePageGuard, right: &mut WritePageGuard) -> Result<K> {
        let right_id = right.page_id();
        let mut leaf = LeafPage::<_, K>::open(left.data_mut())?;
        let entries = leaf.entries();
        let keep = entries.len() / 2;

        let mut sibling = LeafPage::<_, K>::init(right.data_mut(), right_id, leaf.max_size());
        sibling.set_entries(&entries[keep..]);
        sibling.set_next_page_id(leaf.next_page_id());
        leaf.set_entries(&entries[..keep]);
        leaf.set_next_page_id(right_id);
        Ok(entries[keep].0)
    }

    /// Registers `right` (split off `left`) with the parent, splitting
    /// ancestors and growing a new root as needed.
    fn insert_into_parent(
        &self,
        ctx: &mut WriteStack<'_>,
        mut left: PageId,
        mut key: K,
        mut right: PageId,
    ) -> Result<()> {
        loop {
            let Some(mut parent) = ctx.pop() else {
                let root_latch = ctx
                    .root_latch_mut()
                    .ok_or_else(|| self.corrupt(format!("split of {} reached a released root", left)))?;
                let mut guard = self.bpm.new_page_guarded()?;
                let root_id = guard.page_id();
                InternalPage::<_, K>::init(guard.data_mut(), root_id, self.internal_max_size)
                    .populate_new_root(left, &key, right);
                drop(guard);

                **root_latch = root_id;
                self.persist_root(root_id)?;
                debug!(index = %self.index_name, root = %root_id, "tree grew a level");
                return Ok(());
            };

            let parent_id = parent.page_id();
            let node = InternalPage::<_, K>::open(parent.data())?;
            let max_size = node.max_size();
            if node.size() < max_size {
                if !InternalPage::<_, K>::open(parent.data_mut())?.insert_after(left, &key, right) {
                    return Err(self.corrupt(format!("{} is not a child of {}", left, parent_id)));
                }
                return Ok(());
            }

            let mut sibling = self.bpm.new_page_guarded()?;
            let sibling_id = sibling.page_id();
            let mut node = InternalPage::<_, K>::open(parent.data_mut())?;
            let position = node
                .value_index(left)
                .ok_or_else(|| self.corrupt(format!("{} is not a child of {}", left, parent_id)))?;
            let mut entries = node.entries();
            entries.insert(position + 1, (key, right));

            let keep = max_size / 2 + 1;
            node.set_entries(&entries[..keep]);
            InternalPage::<_, K>::init(sibling.data_mut(), sibling_id, max_size)
                .set_entries(&entries[keep..]);
            trace!(index = %self.index_name, page = %parent_id, sibling = %sibling_id, "split internal node");

            key = entries[keep].0;
            left = parent_id;
            right = sibling_id;
        }
    }

    // ---------------------------------------------------------------------
    // Remove
    // ---------------------------------------------------------------------

    /// Removes `key` if present.
    pub fn remove(&self, key: &K) -> Result<()> {
        if let Descent::Done(()) = self.remove_optimistic(key)? {
            return Ok(());
        }
        trace!(index = %self.index_name, ?key, "remove restarting pessimistically");
        self.remove_pessimistic(key)
    }

    fn remove_optimistic(&self, key: &K) -> Result<Descent<()>> {
        let Some((mut guard, is_root)) = self.latch_leaf_optimistic(key)? else {
            return Ok(Descent::Done(()));
        };
        if LeafPage::<_, K>::open(guard.data())?
            .find(key, &self.comparator)
            .is_none()
        {
            return Ok(Descent::Done(()));
        }
        if !NodeShape::of(guard.data())?.is_safe(Operation::Remove, is_root) {
            return Ok(Descent::Restart);
        }
        LeafPage::<_, K>::open(guard.data_mut())?.remove(key, &self.comparator);
        Ok(Descent::Done(()))
    }

    fn remove_pessimistic(&self, key: &K) -> Result<()> {
        let root_latch = self.root_page_id.write();
        if !root_latch.is_valid() {
            return Ok(());
        }
        let root_id = *root_latch;
        let mut ctx = CrabStack::new(root_latch);
        let mut leaf_guard = self.descend_write(&mut ctx, root_id, key, Operation::Remove)?;

        if LeafPage::<_, K>::open(leaf_guard.data())?
            .find(key, &self.comparator)
            .is_none()
        {
            return Ok(());
        }
        LeafPage::<_, K>::open(leaf_guard.data_mut())?.remove(key, &self.comparator);

        let mut garbage = Vec::new();
        self.rebalance(&mut ctx, leaf_guard, root_id, &mut garbage)?;
        drop(ctx);
        self.discard_pages(garbage);
        Ok(())
    }

    /// Restores the minimum occupancy of `node` and its ancestors by
    /// merging with or borrowing from a sibling.
    fn rebalance(
        &self,
        ctx: &mut WriteStack<'_>,
        mut node: WritePageGuard,
        root_id: PageId,
        garbage: &mut Vec<PageId>,
    ) -> Result<()> {
        loop {
            let shape = NodeShape::of(node.data())?;
            let node_id = node.page_id();
            if node_id == root_id {
                return self.adjust_root(ctx, &node, shape, garbage);
            }
            if shape.size >= shape.min_size {
                return Ok(());
            }

            let mut parent = ctx
                .pop()
                .ok_or_else(|| self.corrupt(format!("underfull {} has no latched parent", node_id)))?;
            let (node_index, sibling_id) = {
                let parent_node = InternalPage::<_, K>::open(parent.data())?;
                let index = parent_node
                    .value_index(node_id)
                    .ok_or_else(|| self.corrupt(format!("{} missing from its parent", node_id)))?;
                let sibling_index = if index > 0 { index - 1 } else { index + 1 };
                if sibling_index >= parent_node.size() {
                    return Err(self.corrupt(format!("{} has no sibling", node_id)));
                }
                (index, parent_node.value_at(sibling_index))
            };

            let sibling = self.bpm.fetch_page_write(sibling_id)?;
            let sibling_is_left = node_index > 0;
            let (mut left, mut right, right_index) = if sibling_is_left {
                (sibling, node, node_index)
            } else {
                (node, sibling, node_index + 1)
            };

            let combined = NodeShape::of(left.data())?.size + NodeShape::of(right.data())?.size;
            let fits = if shape.is_leaf {
                combined < shape.max_size
            } else {
                combined <= shape.max_size
            };
            if !fits {
                self.redistribute(&mut parent, &mut left, &mut right, right_index, shape.is_leaf, sibling_is_left)?;
                return Ok(());
            }

            self.merge(&mut parent, &mut left, &right, right_index, shape.is_leaf)?;
            trace!(index = %self.index_name, into = %left.page_id(), from = %right.page_id(), "merged nodes");
            garbage.push(right.page_id());
            drop(right);
            drop(left);
            node = parent;
        }
    }

    /// Collapses an empty root leaf or a root with a single child.
    fn adjust_root(
        &self,
        ctx: &mut WriteStack<'_>,
        root: &WritePageGuard,
        shape: NodeShape,
        garbage: &mut Vec<PageId>,
    ) -> Result<()> {
        let new_root = if shape.is_leaf && shape.size == 0 {
            INVALID_PAGE_ID
        } else if !shape.is_leaf && shape.size == 1 {
            InternalPage::<_, K>::open(root.data())?.value_at(0)
        } else {
            return Ok(());
        };

        let root_latch = ctx
            .root_latch_mut()
            .ok_or_else(|| self.corrupt("root collapse without the root latch"))?;
        **root_latch = new_root;
        garbage.push(root.page_id());
        self.persist_root(new_root)?;
        debug!(index = %self.index_name, root = %new_root, "tree shrank a level");
        Ok(())
    }

    /// Appends `right` to `left` and drops `right` from the parent.
    fn merge(
        &self,
        parent: &mut WritePageGuard,
        left: &mut WritePageGuard,
        right: &WritePageGuard,
        right_index: usize,
        is_leaf: bool,
    ) -> Result<()> {
        if is_leaf {
            let from = LeafPage::<_, K>::open(right.data())?;
            let mut into = LeafPage::<_, K>::open(left.data_mut())?;
            let mut entries = into.entries();
            entries.extend(from.entries());
            into.set_entries(&entries);
            into.set_next_page_id(from.next_page_id());
        } else {
            // The separator comes down as the key of right's first child.
            let separator = InternalPage::<_, K>::open(parent.data())?.key_at(right_index);
            let mut moved = InternalPage::<_, K>::open(right.data())?.entries();
            if let Some(first) = moved.first_mut() {
                first.0 = separator;
            }
            let mut into = InternalPage::<_, K>::open(left.data_mut())?;
            let mut entries = into.entries();
            entries.extend(moved);
            into.set_entries(&entries);
        }
        InternalPage::<_, K>::open(parent.data_mut())?.remove_at(right_index);
        Ok(())
    }

    /// Moves one entry across the `left`/`right` boundary toward the
    /// underfull side and rewrites their separator in the parent.
    fn redistribute(
        &self,
        parent: &mut WritePageGuard,
        left: &mut WritePageGuard,
        right: &mut WritePageGuard,
        right_index: usize,
        is_leaf: bool,
        from_left: bool,
    ) -> Result<()> {
        let separator = if is_leaf {
            let mut l = LeafPage::<_, K>::open(left.data_mut())?;
            let mut r = LeafPage::<_, K>::open(right.data_mut())?;
            if from_left {
                let last = l.size() - 1;
                let (key, value) = (l.key_at(last), l.value_at(last));
                l.remove_at(last);
                r.insert_at(0, &key, value);
                key
            } else {
                let (key, value) = (r.key_at(0), r.value_at(0));
                r.remove_at(0);
                let end = l.size();
                l.insert_at(end, &key, value);
                r.key_at(0)
            }
        } else {
            let old = InternalPage::<_, K>::open(parent.data())?.key_at(right_index);
            let mut l = InternalPage::<_, K>::open(left.data_mut())?;
            let mut r = InternalPage::<_, K>::open(right.data_mut())?;
            if from_left {
                let last = l.size() - 1;
                let (key, child) = (l.key_at(last), l.value_at(last));
                l.remove_at(last);
                r.insert_at(0, &key, child);
                r.set_key_at(1, &old);
                key
            } else {
                let (key, child) = (r.key_at(1), r.value_at(0));
                r.remove_at(0);
                let end = l.size();
                l.insert_at(end, &old, child);
                key
            }
        };
        InternalPage::<_, K>::open(parent.data_mut())?.set_key_at(right_index, &separator);
        Ok(())
    }

    fn discard_pages(&self, pages: Vec<PageId>) {
        for page_id in pages {
            match self.bpm.delete_page(page_id) {
                Ok(true) => {}
                Ok(false) => warn!(index = %self.index_name, page = %page_id, "freed node still pinned"),
                Err(e) => warn!(index = %self.index_name, page = %page_id, error = %e, "failed to free node"),
            }
        }
    }

    // ---------------------------------------------------------------------
    // Diagnostics
    // ---------------------------------------------------------------------

    /// Number of levels, 0 for an empty tree.
    pub fn height(&self) -> Result<usize> {
        let root_latch = self.root_page_id.read();
        if !root_latch.is_valid() {
            return Ok(0);
        }
        let mut guard = self.bpm.fetch_page_read(*root_latch)?;
        drop(root_latch);

        let mut height = 1;
        while !NodeShape::of(guard.data())?.is_leaf {
            let child = InternalPage::<_, K>::open(guard.data())?.value_at(0);
            guard = self.bpm.fetch_page_read(child)?;
            height += 1;
        }
        Ok(height)
    }

    /// Checks ordering, occupancy and balance of the whole tree, and that the
    /// leaf chain visits leaves in key order. Expects no concurrent writers.
    pub fn check_integrity(&self) -> Result<()> {
        let root_latch = self.root_page_id.read();
        if !root_latch.is_valid() {
            return Ok(());
        }
        let mut walk = IntegrityWalk {
            leaf_depth: None,
            prev_key: None,
            leaves: Vec::new(),
        };
        self.check_node(*root_latch, 0, None, None, true, &mut walk)?;

        let mut chained = Vec::with_capacity(walk.leaves.len());
        let mut next = walk.leaves.first().copied().unwrap_or(INVALID_PAGE_ID);
        while next.is_valid() && chained.len() <= walk.leaves.len() {
            chained.push(next);
            let guard = self.bpm.fetch_page_read(next)?;
            next = LeafPage::<_, K>::open(guard.data())?.next_page_id();
        }
        if chained != walk.leaves {
            return Err(self.corrupt(format!(
                "leaf chain {:?} differs from tree order {:?}",
                chained, walk.leaves
            )));
        }
        Ok(())
    }

    fn check_node(
        &self,
        page_id: PageId,
        depth: usize,
        lower: Option<K>,
        upper: Option<K>,
        is_root: bool,
        walk: &mut IntegrityWalk<K>,
    ) -> Result<()> {
        use std::cmp::Ordering;

        let cmp = &self.comparator;
        let in_bounds = |key: &K| {
            lower.map_or(true, |lo| cmp.compare(key, &lo) != Ordering::Less)
                && upper.map_or(true, |hi| cmp.compare(key, &hi) == Ordering::Less)
        };

        let guard = self.bpm.fetch_page_read(page_id)?;
        let shape = NodeShape::of(guard.data())?;
        let min_size = match (is_root, shape.is_leaf) {
            (true, true) => 1,
            (true, false) => 2,
            (false, _) => shape.min_size,
        };
        let max_size = if shape.is_leaf { shape.max_size - 1 } else { shape.max_size };
        if shape.size < min_size || shape.size > max_size {
            return Err(self.corrupt(format!(
                "{} holds {} entries, expected {}..={}",
                page_id, shape.size, min_size, max_size
            )));
        }

        if shape.is_leaf {
            let expected = *walk.leaf_depth.get_or_insert(depth);
            if expected != depth {
                return Err(self.corrupt(format!(
                    "leaf {} at depth {}, others at {}",
                    page_id, depth, expected
                )));
            }
            for (key, _) in LeafPage::<_, K>::open(guard.data())?.entries() {
                let ascending = walk
                    .prev_key
                    .map_or(true, |prev| cmp.compare(&prev, &key) == Ordering::Less);
                if !ascending || !in_bounds(&key) {
                    return Err(self.corrupt(format!("key {:?} out of order in {}", key, page_id)));
                }
                walk.prev_key = Some(key);
            }
            walk.leaves.push(page_id);
            return Ok(());
        }

        let entries = InternalPage::<_, K>::open(guard.data())?.entries();
        drop(guard);
        for (i, (child, separator)) in entries.iter().map(|(k, c)| (*c, *k)).enumerate() {
            let child_lower = if i == 0 { lower } else { Some(separator) };
            if i > 0 && !in_bounds(&separator) {
                return Err(self.corrupt(format!("separator {:?} out of range in {}", separator, page_id)));
            }
            let child_upper = entries.get(i + 1).map(|(k, _)| *k).or(upper);
            self.check_node(child, depth + 1, child_lower, child_upper, false, walk)?;
        }
        Ok(())
    }

    /// One line per level, nodes as `(page: keys)`.
    pub fn to_pretty_string(&self) -> Result<String> {
        let root_latch = self.root_page_id.read();
        if !root_latch.is_valid() {
            return Ok("(empty)".to_string());
        }
        let mut out = String::new();
        let mut level = vec![*root_latch];
        while !level.is_empty() {
            let mut next_level = Vec::new();
            let mut nodes = Vec::with_capacity(level.len());
            for page_id in level {
                let guard = self.bpm.fetch_page_read(page_id)?;
                let keys: Vec<String> = if NodeShape::of(guard.data())?.is_leaf {
                    LeafPage::<_, K>::open(guard.data())?
                        .entries()
                        .iter()
                        .map(|(k, _)| format!("{:?}", k))
                        .collect()
                } else {
                    let entries = InternalPage::<_, K>::open(guard.data())?.entries();
                    next_level.extend(entries.iter().map(|(_, c)| *c));
                    entries.iter().skip(1).map(|(k, _)| format!("{:?}", k)).collect()
                };
                nodes.push(format!("({}: {})", page_id, keys.join(",")));
            }
            out.push_str(&nodes.join(" "));
            out.push('\n');
            level = next_level;
        }
        Ok(out)
    }

    /// Graphviz description of the tree. Each node is a table; internal
    /// slots are ports pointing at their children and leaves link to their
    /// right sibling.
    pub fn to_graph(&self) -> Result<String> {
        let root_latch = self.root_page_id.read();
        let mut out = String::from("digraph G {\n");
        let mut queue = VecDeque::new();
        if root_latch.is_valid() {
            queue.push_back((*root_latch, None));
        }
        while let Some((page_id, parent)) = queue.pop_front() {
            let guard = self.bpm.fetch_page_read(page_id)?;
            let shape = NodeShape::of(guard.data())?;
            let id = page_id.as_u32();
            let name = if shape.is_leaf {
                format!("LEAF_{}", id)
            } else {
                format!("INT_{}", id)
            };

            let cells: Vec<String> = if shape.is_leaf {
                let leaf = LeafPage::<_, K>::open(guard.data())?;
                let next = leaf.next_page_id();
                if next.is_valid() {
                    out.push_str(&format!(
                        "{} -> LEAF_{};\n{{rank=same {} LEAF_{}}};\n",
                        name,
                        next.as_u32(),
                        name,
                        next.as_u32()
                    ));
                }
                leaf.entries()
                    .iter()
                    .map(|(k, _)| format!("<TD>{:?}</TD>", k))
                    .collect()
            } else {
                let entries = InternalPage::<_, K>::open(guard.data())?.entries();
                queue.extend(entries.iter().map(|(_, child)| (*child, Some(id))));
                entries
                    .iter()
                    .enumerate()
                    .map(|(i, (k, child))| {
                        let label = if i == 0 { String::new() } else { format!("{:?}", k) };
                        format!("<TD PORT=\"p{}\">{}</TD>", child.as_u32(), label)
                    })
                    .collect()
            };

            let span = shape.size.max(1);
            out.push_str(&format!(
                "{}[shape=plain color={} label=<<TABLE BORDER=\"0\" CELLBORDER=\"1\" CELLSPACING=\"0\" CELLPADDING=\"4\">\n\
                 <TR><TD COLSPAN=\"{}\">P={}</TD></TR>\n\
                 <TR><TD COLSPAN=\"{}\">max_size={},min_size={},size={}</TD></TR>\n\
                 <TR>{}</TR></TABLE>>];\n",
                name,
                if shape.is_leaf { "green" } else { "pink" },
                span,
                id,
                span,
                shape.max_size,
                shape.min_size,
                shape.size,
                cells.join("")
            ));
            if let Some(parent) = parent {
                out.push_str(&format!("INT_{}:p{} -> {};\n", parent, id, name));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }

    /// Writes [`to_graph`](Self::to_graph) to `path`. An empty tree writes
    /// nothing.
    pub fn draw(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.is_empty() {
            warn!(index = %self.index_name, "not drawing an empty tree");
            return Ok(());
        }
        fs::write(path, self.to_graph()?)?;
        Ok(())
    }

    /// Inserts every whitespace-separated integer in `path` as a key. The
    /// record id takes its page from the high 32 bits of the key and its
    /// slot from the low 16. Returns how many keys were new.
    pub fn insert_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let mut inserted = 0;
        for n in read_integers(path.as_ref())? {
            let rid = RecordId::new(PageId::new((n >> 32) as u32), SlotId::new(n as u16));
            if self.insert(&K::from_integer(n), rid)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Removes every whitespace-separated integer key in `path`. Returns how
    /// many keys were read.
    pub fn remove_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let keys = read_integers(path.as_ref())?;
        for &n in &keys {
            self.remove(&K::from_integer(n))?;
        }
        Ok(keys.len())
    }
}

fn read_integers(path: &Path) -> Result<Vec<i64>> {
    fs::read_to_string(path)?
        .split_whitespace()
        .map(|token| {
            token.parse::<i64>().map_err(|e| {
                StrataError::from(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad key {:?}: {}", token, e),
                ))
            })
        })
        .collect()
}
