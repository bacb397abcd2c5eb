use std::collections::HashSet;
use std::time::Instant;

use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::index::RowId;
use crate::mvcc::{TxnId, BULK_LOAD_TXN};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum IsolationLevel {
    /// Snapshot taken once at begin (the default).
    Snapshot,
    /// Snapshot refreshed at every statement.
    ReadCommitted,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::Snapshot
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    Aborted,
}

/// The snapshot a transaction reads through: its id (used as the logical
/// start timestamp) and the set of transactions that were active, hence
/// invisible, when it began.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionState {
    pub id: TxnId,
    pub read_only: bool,
    pub isolation: IsolationLevel,
    /// Ids at or above this began after the snapshot and are invisible.
    /// Equal to `id` for a begin-time snapshot; a ReadCommitted statement
    /// refreshes it to the current id high-water mark.
    pub high_water: TxnId,
    /// Concurrent active (uncommitted) transactions as of the snapshot.
    /// Their writes are invisible even though their ids are lower.
    pub active: HashSet<TxnId>,
}

impl TransactionState {
    /// Whether this snapshot sees the effects of transaction `txn`.
    pub fn sees(&self, txn: TxnId) -> bool {
        txn == BULK_LOAD_TXN
            || txn == self.id
            || (txn < self.high_water && !self.active.contains(&txn))
    }
}

/// One record in a transaction's write set, used for rollback and for the
/// first-committer-wins re-check at commit.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteRecord {
    pub table: String,
    pub row_id: RowId,
}

/// An entry in the transaction table.
pub struct Transaction {
    pub st: TransactionState,
    pub status: TxnStatus,
    pub write_set: Vec<WriteRecord>,
    /// Last statement time, for idle-timeout aborts.
    pub last_active: Instant,
}

impl Transaction {
    pub fn new(st: TransactionState) -> Self {
        Self { st, status: TxnStatus::Active, write_set: Vec::new(), last_active: Instant::now() }
    }

    pub fn record_write(&mut self, table: &str, row_id: RowId) {
        // One record per row identity is enough for the commit check.
        if !self.write_set.iter().any(|w| w.row_id == row_id && w.table == table) {
            self.write_set.push(WriteRecord { table: table.to_string(), row_id });
        }
        self.last_active = Instant::now();
    }
}
