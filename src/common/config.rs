use std::time::Duration;

use super::types::PageId;

/// Size of a page in bytes (4 KB)
pub const PAGE_SIZE: usize = 4096;

/// Invalid page ID constant
pub const INVALID_PAGE_ID: PageId = PageId(u32::MAX);

/// Page 0 holds the index-name -> root-page directory
pub const HEADER_PAGE_ID: PageId = PageId(0);

/// Default K value for LRU-K replacement policy
pub const DEFAULT_LRUK_K: usize = 2;

/// Default buffer pool size (number of frames)
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 10;

/// Default capacity of a single bucket in the page table
pub const DEFAULT_BUCKET_SIZE: usize = 8;

/// Default B+ tree leaf fan-out
pub const DEFAULT_LEAF_MAX_SIZE: usize = 128;

/// Default B+ tree internal fan-out
pub const DEFAULT_INTERNAL_MAX_SIZE: usize = 128;

/// How often the deadlock detector wakes up
pub const DEFAULT_CYCLE_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

/// Runtime knobs for a [`crate::engine::StorageEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of frames in the buffer pool
    pub pool_size: usize,
    /// K of the LRU-K replacer
    pub replacer_k: usize,
    /// Bucket capacity of the buffer pool's page table
    pub bucket_size: usize,
    /// Spawn the background deadlock detector
    pub enable_deadlock_detection: bool,
    pub cycle_detection_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_BUFFER_POOL_SIZE,
            replacer_k: DEFAULT_LRUK_K,
            bucket_size: DEFAULT_BUCKET_SIZE,
            enable_deadlock_detection: true,
            cycle_detection_interval: DEFAULT_CYCLE_DETECTION_INTERVAL,
        }
    }
}
