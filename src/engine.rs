use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::BufferPoolManager;
use crate::common::{EngineConfig, Result, StrataError};
use crate::concurrency::{
    DeadlockDetector, IsolationLevel, LockManager, Transaction, TransactionManager,
};
use crate::index::{BPlusTree, IndexKey, KeyComparator};
use crate::storage::disk::DiskManager;

/// Owns one database file and everything built on it: the buffer pool,
/// the lock manager, the transaction manager and the deadlock detector.
///
/// Dropping the engine stops the detector and flushes every dirty page.
pub struct StorageEngine {
    config: EngineConfig,
    disk_manager: Arc<DiskManager>,
    bpm: Arc<BufferPoolManager>,
    lock_manager: Arc<LockManager>,
    txn_manager: TransactionManager,
    detector: Option<DeadlockDetector>,
}

impl StorageEngine {
    pub fn open<P: AsRef<Path>>(db_path: P, config: EngineConfig) -> Result<Self> {
        if config.pool_size == 0 || config.replacer_k == 0 || config.bucket_size == 0 {
            return Err(StrataError::InvalidConfig(format!(
                "pool_size, replacer_k and bucket_size must be positive: {:?}",
                config
            )));
        }

        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        let bpm = Arc::new(BufferPoolManager::with_bucket_size(
            config.pool_size,
            config.replacer_k,
            config.bucket_size,
            Arc::clone(&disk_manager),
        ));
        let lock_manager = Arc::new(LockManager::new());
        let txn_manager = TransactionManager::new(Arc::clone(&lock_manager));
        let detector = if config.enable_deadlock_detection {
            Some(lock_manager.start_deadlock_detection(config.cycle_detection_interval)?)
        } else {
            None
        };

        debug!(path = %disk_manager.get_db_path(), pool_size = config.pool_size, "storage engine opened");
        Ok(Self {
            config,
            disk_manager,
            bpm,
            lock_manager,
            txn_manager,
            detector,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPoolManager> {
        &self.bpm
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.txn_manager
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        self.txn_manager.begin(isolation_level)
    }

    /// Opens the index called `name`, creating it empty if the header page
    /// has no record for it.
    pub fn open_index<K, C>(
        &self,
        name: &str,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<BPlusTree<K, C>>
    where
        K: IndexKey,
        C: KeyComparator<K>,
    {
        BPlusTree::open(
            name,
            Arc::clone(&self.bpm),
            comparator,
            leaf_max_size,
            internal_max_size,
        )
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.detector.take();
        if let Err(e) = self.bpm.flush_all_pages() {
            warn!(error = %e, "failed to flush buffer pool on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{PageId, RecordId, SlotId};
    use crate::index::OrdComparator;
    use tempfile::tempdir;

    #[test]
    fn test_index_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.db");
        let config = EngineConfig {
            enable_deadlock_detection: false,
            ..EngineConfig::default()
        };

        {
            let engine = StorageEngine::open(&path, config.clone()).unwrap();
            let index = engine.open_index::<i64, _>("orders_pk", OrdComparator, 4, 4).unwrap();
            for k in 0..50 {
                index.insert(&k, RecordId::new(PageId::new(k as u32), SlotId::new(0))).unwrap();
            }
        }

        let engine = StorageEngine::open(&path, config).unwrap();
        let index = engine.open_index::<i64, _>("orders_pk", OrdComparator, 4, 4).unwrap();
        assert!(!index.is_empty());
        assert_eq!(
            index.get_value(&42).unwrap(),
            vec![RecordId::new(PageId::new(42), SlotId::new(0))]
        );
        assert_eq!(index.begin().unwrap().count(), 50);

        let other = engine.open_index::<i64, _>("missing", OrdComparator, 4, 4).unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_rejects_empty_pool() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            pool_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            StorageEngine::open(dir.path().join("bad.db"), config),
            Err(StrataError::InvalidConfig(_))
        ));
    }
}
