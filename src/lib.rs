//! Strata - the storage core of a disk-oriented relational database
//!
//! Fixed-size pages live in a single database file and are cached in a
//! buffer pool. Indexes and lock management are built on top of it.
//!
//! # Architecture
//!
//! - **Storage Layer** (`storage`): disk I/O and on-page formats
//!   - `DiskManager`: reads, writes, allocates and frees pages in the file
//!   - `DiskScheduler`: background I/O worker used by the buffer pool
//!   - `HeaderPage`: page 0, mapping index names to root pages
//!   - `LeafPage` / `InternalPage`: B+ tree node layouts
//!
//! - **Buffer Pool** (`buffer`): page cache
//!   - `BufferPoolManager`: pins pages in frames, writing back dirty victims
//!   - `LruKReplacer`: LRU-K eviction policy
//!   - `ReadPageGuard`/`WritePageGuard`: RAII latch + pin on a page
//!
//! - **Containers** (`container`): `ExtendibleHashTable`, also used as the
//!   buffer pool's page table
//!
//! - **Index** (`index`): concurrent B+ tree with latch crabbing and a
//!   forward iterator
//!
//! - **Concurrency** (`concurrency`): two-phase table/row locking with
//!   isolation levels and wait-for-graph deadlock detection
//!
//! - **Engine** (`engine`): `StorageEngine` ties one file to all of the above
//!
//! # Example
//!
//! ```rust,no_run
//! use strata::common::{
//!     EngineConfig, PageId, RecordId, SlotId, DEFAULT_INTERNAL_MAX_SIZE, DEFAULT_LEAF_MAX_SIZE,
//! };
//! use strata::concurrency::{IsolationLevel, LockMode};
//! use strata::engine::StorageEngine;
//! use strata::index::OrdComparator;
//!
//! let engine = StorageEngine::open("test.db", EngineConfig::default()).unwrap();
//! let index = engine
//!     .open_index::<i64, _>("users_pk", OrdComparator, DEFAULT_LEAF_MAX_SIZE, DEFAULT_INTERNAL_MAX_SIZE)
//!     .unwrap();
//!
//! let txn = engine.begin(IsolationLevel::RepeatableRead);
//! engine.lock_manager().lock_table(&txn, LockMode::IntentionExclusive, 1).unwrap();
//!
//! let rid = RecordId::new(PageId::new(7), SlotId::new(0));
//! engine.lock_manager().lock_row(&txn, LockMode::Exclusive, 1, rid).unwrap();
//! index.insert(&42, rid).unwrap();
//! engine.transaction_manager().commit(&txn);
//!
//! assert_eq!(index.get_value(&42).unwrap(), vec![rid]);
//! ```

pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod container;
pub mod engine;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{PageId, RecordId, Result, SlotId, StrataError, TxnId};
pub use engine::StorageEngine;
