//! Latch-crabbing protocol used by the B+ tree.
//!
//! A structural change (split or merge) can only travel upward through
//! nodes that are *unsafe* for the operation. Writers therefore run in two
//! passes:
//!
//! 1. Optimistic: read latches top-down, releasing each parent once the
//!    child is latched, and a write latch on the leaf only. If the leaf turns
//!    out to be unsafe the pass gives up with [`Descent::Restart`].
//! 2. Pessimistic: the root-id latch plus write latches top-down, kept in a
//!    [`CrabStack`]. Latching a safe node releases everything above it.
//!
//! The stack is generic over its latch types so the protocol can be driven
//! without a buffer pool.

use crate::common::{Result, PAGE_SIZE};
use crate::storage::page::BPlusTreePage;

/// Tree operation a descent is performed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Search,
    Insert,
    Remove,
}

/// Outcome of an optimistic pass
#[derive(Debug, PartialEq, Eq)]
pub enum Descent<T> {
    Done(T),
    Restart,
}

/// The parts of a node the protocol looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeShape {
    pub is_leaf: bool,
    pub size: usize,
    pub max_size: usize,
    pub min_size: usize,
}

impl NodeShape {
    pub fn of(data: &[u8; PAGE_SIZE]) -> Result<Self> {
        let page = BPlusTreePage::new(data);
        page.validate()?;
        Ok(Self {
            is_leaf: page.is_leaf(),
            size: page.size(),
            max_size: page.max_size(),
            min_size: page.min_size(),
        })
    }

    /// Whether `op` applied somewhere below this node can never change
    /// the node's parent.
    ///
    /// Leaves split once they reach `max_size`; internal nodes split when a
    /// child is added to a full node. A root leaf may shrink to one entry and
    /// a root internal node to two children.
    pub fn is_safe(&self, op: Operation, is_root: bool) -> bool {
        match op {
            Operation::Search => true,
            Operation::Insert if self.is_leaf => self.size + 1 < self.max_size,
            Operation::Insert => self.size < self.max_size,
            Operation::Remove if is_root && self.is_leaf => self.size > 1,
            Operation::Remove if is_root => self.size > 2,
            Operation::Remove => self.size > self.min_size,
        }
    }
}

/// Latches held by a pessimistic descent: the root-id latch `R` and the page
/// latches `G` from the topmost unsafe ancestor down to the current node.
pub struct CrabStack<R, G> {
    root_latch: Option<R>,
    held: Vec<G>,
}

impl<R, G> CrabStack<R, G> {
    pub fn new(root_latch: R) -> Self {
        Self {
            root_latch: Some(root_latch),
            held: Vec::new(),
        }
    }

    /// Adds a freshly latched node. A safe node releases the root-id latch
    /// and every ancestor, top-down.
    pub fn push(&mut self, latch: G, safe: bool) {
        if safe {
            self.release_ancestors();
        }
        self.held.push(latch);
    }

    pub fn release_ancestors(&mut self) {
        self.root_latch = None;
        self.held.clear();
    }

    /// Takes the deepest held node.
    pub fn pop(&mut self) -> Option<G> {
        self.held.pop()
    }

    pub fn last(&self) -> Option<&G> {
        self.held.last()
    }

    pub fn root_latch_mut(&mut self) -> Option<&mut R> {
        self.root_latch.as_mut()
    }

    pub fn holds_root_latch(&self) -> bool {
        self.root_latch.is_some()
    }

    pub fn depth(&self) -> usize {
        self.held.len()
    }
}
