pub mod b_plus_tree;
pub mod b_plus_tree_iterator;
pub mod crabbing;
pub mod key_comparator;

pub use b_plus_tree::BPlusTree;
pub use b_plus_tree_iterator::BPlusTreeIterator;
pub use crabbing::{CrabStack, Descent, NodeShape, Operation};
pub use key_comparator::{GenericKey, IndexKey, KeyComparator, OrdComparator};
