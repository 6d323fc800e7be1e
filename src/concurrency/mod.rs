mod lock_manager;
mod transaction;
mod transaction_manager;
mod wait_for_graph;

pub use lock_manager::{DeadlockDetector, LockManager, LockMode};
pub use transaction::{IsolationLevel, Transaction, TransactionState};
pub use transaction_manager::TransactionManager;
pub use wait_for_graph::WaitForGraph;
