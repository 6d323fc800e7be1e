mod b_plus_tree_internal_page;
mod b_plus_tree_leaf_page;
mod b_plus_tree_page;
mod header_page;

pub use b_plus_tree_internal_page::*;
pub use b_plus_tree_leaf_page::*;
pub use b_plus_tree_page::{BPlusTreePage, IndexPageType};
pub use header_page::*;
