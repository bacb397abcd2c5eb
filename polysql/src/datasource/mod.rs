//! The pluggable datasource layer. The MVCC engine implements the contract
//! directly for in-memory tables; file-backed adapters wrap it, adding
//! durability (WAL + checkpointed table files) underneath the same API.
//!
//! Capabilities beyond the base contract are probed rather than downcast:
//! an adapter that persists index metadata answers [`Datasource::as_index_persister`]
//! with itself.

pub mod flusher;
pub mod json;
pub mod memory;
pub mod xml;

use crate::cancel::CancelToken;
use crate::error::CResult;
use crate::index::IndexMeta;
use crate::mvcc::transaction::IsolationLevel;
use crate::mvcc::TxnId;
use crate::sql::plan::{Filter, QueryOptions, ResultSet, UpdateSet};
use crate::sql::schema::Table;
use crate::sql::Row;

/// The contract between the executor and any table store.
pub trait Datasource: Send + Sync {
    /// Engine tag, e.g. "memory", "xml", "json".
    fn name(&self) -> &str;

    fn connect(&self) -> CResult<()>;
    fn close(&self) -> CResult<()>;
    fn is_connected(&self) -> bool;
    fn is_writable(&self) -> bool;

    fn get_tables(&self) -> CResult<Vec<String>>;
    fn get_table_info(&self, table: &str) -> CResult<Table>;

    fn query(
        &self,
        table: &str,
        options: &QueryOptions,
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<ResultSet>;
    fn insert(&self, table: &str, rows: Vec<Row>, txn: Option<TxnId>) -> CResult<usize>;
    fn update(
        &self,
        table: &str,
        filters: &[Filter],
        updates: &UpdateSet,
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<usize>;
    fn delete(
        &self,
        table: &str,
        filters: &[Filter],
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<usize>;

    fn create_table(&self, schema: Table) -> CResult<()>;
    fn drop_table(&self, table: &str) -> CResult<()>;
    fn truncate_table(&self, table: &str, txn: Option<TxnId>) -> CResult<usize>;
    fn create_index(&self, meta: IndexMeta) -> CResult<()>;
    fn drop_index(&self, table: &str, name: &str) -> CResult<()>;

    fn begin(&self, read_only: bool, isolation: IsolationLevel) -> CResult<TxnId>;
    fn commit(&self, txn: TxnId) -> CResult<()>;
    fn rollback(&self, txn: TxnId) -> CResult<()>;

    /// Flushes dirty state to durable storage. A no-op for purely in-memory
    /// sources.
    fn flush(&self) -> CResult<()> {
        Ok(())
    }

    /// Capability probe: adapters that store index metadata on disk return
    /// themselves here.
    fn as_index_persister(&self) -> Option<&dyn IndexPersister> {
        None
    }
}

/// Capability of persisting index metadata to a sidecar file.
pub trait IndexPersister {
    fn persist_index_meta(&self, table: &str, metas: &[IndexMeta]) -> CResult<()>;
}
