//! This mod implements MVCC (Multi-Version Concurrency Control) over whole
//! SQL rows: ACID transactions with snapshot isolation on top of per-row
//! version chains.
//!
//! VERSIONS
//! ========
//! Every logical row has a stable identity and a chain of versions, newest
//! first. Each version records the transaction that created it and, once
//! superseded or deleted, the transaction that deleted it. A delete is just a
//! deletion mark; an update marks the old version deleted and pushes a new
//! one in the same chain.
//!
//! For example, a row updated at t1, t4 and deleted at t6 has the chain:
//!
//!   [created_by=4 deleted_by=6] -> [created_by=1 deleted_by=4]
//!
//! A transaction that began at t2 still sees the t1 version; one that began
//! at t5 sees the t4 version; one that begins at t7 sees nothing.
//!
//! Transaction ids are logical timestamps handed out by the transaction
//! table. Rows installed by the bulk-load fast path carry the reserved
//! creator id 0 and are visible to every snapshot; the first real write to
//! such a row moves it into normal versioning.
//!
//! ISOLATION
//! =========
//! A transaction takes a snapshot at begin: its own id plus the set of
//! transactions active at that moment. A version is visible iff its creator
//! is the transaction itself, or committed with an id at or below the
//! snapshot and not in the active set; and its deletion mark (if any) is NOT
//! visible by the same rule.
//!
//! Conflicts are resolved first-committer-wins. A statement that would
//! overwrite another active transaction's uncommitted write fails
//! immediately (the transaction stays usable); at commit, the write set is
//! re-checked against everything committed since the snapshot, and a loser
//! aborts wholesale. Two transactions committing at the same instant are
//! ordered by who acquires the transaction-table lock first.
//!
//! Writers don't block readers. Readers don't block writers.

pub mod engine;
pub mod transaction;

/// A transaction id doubles as a logical timestamp.
pub type TxnId = u64;

/// Creator id of rows installed by the bulk-load fast path at startup.
/// Visible to every snapshot.
pub const BULK_LOAD_TXN: TxnId = 0;
