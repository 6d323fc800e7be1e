use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::Mutex;

use crate::common::{RecordId, TableOid, TxnId};

use super::lock_manager::LockMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking state. `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Growing => "GROWING",
            TransactionState::Shrinking => "SHRINKING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Locks currently granted to a transaction, at most one mode per resource.
#[derive(Debug, Default)]
struct LockSet {
    tables: HashMap<TableOid, LockMode>,
    rows: HashMap<TableOid, HashMap<RecordId, LockMode>>,
}

/// A transaction as seen by the lock manager: identity, isolation level,
/// 2PL state and the locks it holds.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    locks: Mutex<LockSet>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            locks: Mutex::new(LockSet::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// Moves a growing transaction to shrinking. Returns false in any other state.
    pub(crate) fn begin_shrinking(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TransactionState::Growing {
            *state = TransactionState::Shrinking;
            true
        } else {
            false
        }
    }

    pub fn table_lock_mode(&self, oid: TableOid) -> Option<LockMode> {
        self.locks.lock().tables.get(&oid).copied()
    }

    pub fn row_lock_mode(&self, oid: TableOid, rid: RecordId) -> Option<LockMode> {
        self.locks
            .lock()
            .rows
            .get(&oid)
            .and_then(|rows| rows.get(&rid))
            .copied()
    }

    /// Tables this transaction holds in exactly `mode`.
    pub fn table_lock_set(&self, mode: LockMode) -> HashSet<TableOid> {
        self.locks
            .lock()
            .tables
            .iter()
            .filter(|(_, held)| **held == mode)
            .map(|(oid, _)| *oid)
            .collect()
    }

    /// Rows of `oid` this transaction holds in exactly `mode`.
    pub fn row_lock_set(&self, oid: TableOid, mode: LockMode) -> HashSet<RecordId> {
        self.locks
            .lock()
            .rows
            .get(&oid)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, held)| **held == mode)
                    .map(|(rid, _)| *rid)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn row_lock_count(&self, oid: TableOid) -> usize {
        self.locks.lock().rows.get(&oid).map_or(0, HashMap::len)
    }

    pub(crate) fn held_table_locks(&self) -> Vec<(TableOid, LockMode)> {
        self.locks
            .lock()
            .tables
            .iter()
            .map(|(oid, mode)| (*oid, *mode))
            .collect()
    }

    pub(crate) fn held_row_locks(&self) -> Vec<(TableOid, RecordId)> {
        self.locks
            .lock()
            .rows
            .iter()
            .flat_map(|(oid, rows)| rows.keys().map(move |rid| (*oid, *rid)))
            .collect()
    }

    pub(crate) fn set_table_lock(&self, oid: TableOid, mode: Option<LockMode>) {
        let mut locks = self.locks.lock();
        match mode {
            Some(mode) => {
                locks.tables.insert(oid, mode);
            }
            None => {
                locks.tables.remove(&oid);
            }
        }
    }

    pub(crate) fn set_row_lock(&self, oid: TableOid, rid: RecordId, mode: Option<LockMode>) {
        let mut locks = self.locks.lock();
        match mode {
            Some(mode) => {
                locks.rows.entry(oid).or_default().insert(rid, mode);
            }
            None => {
                if let Some(rows) = locks.rows.get_mut(&oid) {
                    rows.remove(&rid);
                    if rows.is_empty() {
                        locks.rows.remove(&oid);
                    }
                }
            }
        }
    }
}
