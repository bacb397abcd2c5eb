use std::sync::atomic::{AtomicBool, Ordering};

use crate::cancel::CancelToken;
use crate::datasource::Datasource;
use crate::error::CResult;
use crate::index::IndexMeta;
use crate::mvcc::engine::MvccEngine;
use crate::mvcc::transaction::IsolationLevel;
use crate::mvcc::TxnId;
use crate::sql::plan::{Filter, QueryOptions, ResultSet, UpdateSet};
use crate::sql::schema::Table;
use crate::sql::Row;

/// The in-memory datasource: a thin connected/writable shell over the MVCC
/// engine. Session temp tables and `engine=memory` tables live here.
pub struct MemoryDatasource {
    engine: MvccEngine,
    connected: AtomicBool,
}

impl MemoryDatasource {
    pub fn new() -> Self {
        Self { engine: MvccEngine::new("memory"), connected: AtomicBool::new(false) }
    }

    pub fn with_engine(engine: MvccEngine) -> Self {
        Self { engine, connected: AtomicBool::new(false) }
    }

    pub fn engine(&self) -> &MvccEngine {
        &self.engine
    }
}

impl Default for MemoryDatasource {
    fn default() -> Self {
        Self::new()
    }
}

impl Datasource for MemoryDatasource {
    fn name(&self) -> &str {
        "memory"
    }

    fn connect(&self) -> CResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> CResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn get_tables(&self) -> CResult<Vec<String>> {
        Ok(self.engine.get_tables())
    }

    fn get_table_info(&self, table: &str) -> CResult<Table> {
        self.engine.get_table_info(table)
    }

    fn query(
        &self,
        table: &str,
        options: &QueryOptions,
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<ResultSet> {
        self.engine.query(table, options, txn, cancel)
    }

    fn insert(&self, table: &str, rows: Vec<Row>, txn: Option<TxnId>) -> CResult<usize> {
        self.engine.insert(table, rows, txn)
    }

    fn update(
        &self,
        table: &str,
        filters: &[Filter],
        updates: &UpdateSet,
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<usize> {
        self.engine.update(table, filters, updates, txn, cancel)
    }

    fn delete(
        &self,
        table: &str,
        filters: &[Filter],
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<usize> {
        self.engine.delete(table, filters, txn, cancel)
    }

    fn create_table(&self, schema: Table) -> CResult<()> {
        self.engine.create_table(schema)
    }

    fn drop_table(&self, table: &str) -> CResult<()> {
        self.engine.drop_table(table)
    }

    fn truncate_table(&self, table: &str, txn: Option<TxnId>) -> CResult<usize> {
        self.engine.truncate(table, txn)
    }

    fn create_index(&self, meta: IndexMeta) -> CResult<()> {
        self.engine.create_index(meta)
    }

    fn drop_index(&self, table: &str, name: &str) -> CResult<()> {
        self.engine.drop_index(table, name)
    }

    fn begin(&self, read_only: bool, isolation: IsolationLevel) -> CResult<TxnId> {
        self.engine.begin(read_only, isolation)
    }

    fn commit(&self, txn: TxnId) -> CResult<()> {
        self.engine.commit(txn)
    }

    fn rollback(&self, txn: TxnId) -> CResult<()> {
        self.engine.rollback(txn)
    }
}
