use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::{CResult, Error};
use crate::expr::generated::GeneratedColumns;
use crate::expr::{NoFns, ScalarFns};
use crate::index::constraint::{check_constraints, foreign_keys, unique_key_applies};
use crate::index::{Index, IndexMeta, IndexSet, IndexType, RowId};
use crate::mvcc::transaction::{
    IsolationLevel, Transaction, TransactionState, TxnStatus,
};
use crate::mvcc::{TxnId, BULK_LOAD_TXN};
use crate::sql::plan::{matches_all, Filter, QueryOptions, ResultSet, UpdateSet};
use crate::sql::schema::{OnDelete, Table};
use crate::sql::value::Value;
use crate::sql::{Row, ROW_ATTS};
use crate::storage::page::Page;

/// How many rows a scan processes between cancellation checks.
const CANCEL_CHECK_EVERY: usize = 256;

/// One version of a logical row. Chains are ordered newest first.
#[derive(Clone, Debug, PartialEq)]
pub struct RowVersion {
    pub row: Row,
    pub created_by: TxnId,
    pub deleted_by: Option<TxnId>,
}

/// The versioned row set of one table.
pub(crate) struct TableData {
    pub schema: Table,
    pub generated: GeneratedColumns,
    /// Version chains by stable row identity, newest version first.
    pub rows: BTreeMap<RowId, Vec<RowVersion>>,
    pub next_row_id: RowId,
    pub next_auto: i64,
    pub indexes: IndexSet,
    /// Set when the table was populated through the bulk-load fast path.
    pub bulk_loaded: bool,
}

struct TxnTable {
    next_id: TxnId,
    active: HashMap<TxnId, Transaction>,
}

struct EngineState {
    tables: HashMap<String, TableData>,
    txns: TxnTable,
}

/// Engine status, for observability and tests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub tables: u64,
    pub active_txns: u64,
    pub total_versions: u64,
}

/// The MVCC storage engine: versioned tables, a transaction table and
/// snapshot-isolated reads and writes.
///
/// All state sits behind one engine mutex; operations take it once and run
/// to completion, which keeps the critical sections short relative to any
/// I/O (the engine itself never touches disk; persistence adapters wrap it).
pub struct MvccEngine {
    name: String,
    state: Arc<Mutex<EngineState>>,
    fns: Arc<dyn ScalarFns>,
}

impl MvccEngine {
    pub fn new(name: &str) -> Self {
        Self::with_functions(name, Arc::new(NoFns))
    }

    pub fn with_functions(name: &str, fns: Arc<dyn ScalarFns>) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(EngineState {
                tables: HashMap::new(),
                txns: TxnTable { next_id: 1, active: HashMap::new() },
            })),
            fns,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state poisoned")
    }

    // --- transactions ---

    pub fn begin(&self, read_only: bool, isolation: IsolationLevel) -> CResult<TxnId> {
        Ok(begin_internal(&mut self.lock(), read_only, isolation))
    }

    /// Publishes the write set atomically, first-committer-wins. A conflict
    /// aborts the transaction and surfaces as [`Error::WriteConflict`].
    pub fn commit(&self, txn: TxnId) -> CResult<()> {
        let mut state = self.lock();
        commit_internal(&mut state, txn)
    }

    pub fn rollback(&self, txn: TxnId) -> CResult<()> {
        let mut state = self.lock();
        rollback_internal(&mut state, txn)?;
        prune_versions(&mut state);
        Ok(())
    }

    /// Aborts transactions that have been idle longer than `max_idle`.
    /// Returns the aborted transaction ids.
    pub fn abort_idle(&self, max_idle: Duration) -> Vec<TxnId> {
        let mut state = self.lock();
        let stale: Vec<TxnId> = state
            .txns
            .active
            .iter()
            .filter(|(_, t)| t.last_active.elapsed() > max_idle)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Err(err) = rollback_internal(&mut state, *id) {
                log::error!("failed to abort idle transaction {}: {}", id, err);
            } else {
                log::info!("aborted idle transaction {}", id);
            }
        }
        if !stale.is_empty() {
            prune_versions(&mut state);
        }
        stale
    }

    // --- DDL ---

    pub fn create_table(&self, schema: Table) -> CResult<()> {
        let mut state = self.lock();
        create_table_internal(&mut state, schema)
    }

    pub fn drop_table(&self, table: &str) -> CResult<()> {
        let mut state = self.lock();
        if state.tables.remove(table).is_none() {
            return Err(Error::TableNotFound(table.to_string()));
        }
        Ok(())
    }

    pub fn get_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_table_info(&self, table: &str) -> CResult<Table> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.schema.clone())
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    pub fn create_index(&self, meta: IndexMeta) -> CResult<()> {
        let mut state = self.lock();
        create_index_internal(&mut state, meta)
    }

    pub fn drop_index(&self, table: &str, name: &str) -> CResult<()> {
        let mut state = self.lock();
        let data = get_table_mut(&mut state, table)?;
        data.indexes.remove(name)?;
        Ok(())
    }

    pub fn index_metas(&self, table: &str) -> CResult<Vec<IndexMeta>> {
        let state = self.lock();
        let data =
            state.tables.get(table).ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        Ok(data.indexes.metas())
    }

    // --- bulk load ---

    /// Installs pages of trusted rows without per-row versioning, for the
    /// startup load path. Valid only while the table is empty and no
    /// transaction is active.
    pub fn bulk_load(
        &self,
        table: &str,
        producer: &mut dyn FnMut() -> CResult<Option<Page>>,
    ) -> CResult<usize> {
        let mut state = self.lock();
        if !state.txns.active.is_empty() {
            return Err(Error::ReadOnly(
                "bulk load is only valid during the read-only load phase".to_string(),
            ));
        }
        {
            let data = get_table(&state, table)?;
            if !data.rows.is_empty() {
                return Err(Error::ReadOnly(format!(
                    "bulk load into non-empty table {}",
                    table
                )));
            }
        }
        let mut loaded = 0;
        while let Some(page) = producer()? {
            let data = get_table_mut(&mut state, table)?;
            for row in page.rows {
                let row = data.schema.normalize_row(&row)?;
                bump_auto_increment(data, &row);
                let id = data.next_row_id;
                data.next_row_id += 1;
                data.indexes.maintain(id, None, Some(&row));
                data.rows.insert(
                    id,
                    vec![RowVersion { row, created_by: BULK_LOAD_TXN, deleted_by: None }],
                );
                loaded += 1;
            }
        }
        let data = get_table_mut(&mut state, table)?;
        data.bulk_loaded = true;
        log::info!("bulk-loaded {} rows into {}", loaded, table);
        Ok(loaded)
    }

    // --- DML ---

    pub fn query(
        &self,
        table: &str,
        options: &QueryOptions,
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<ResultSet> {
        let mut state = self.lock();
        let st = snapshot_for(&mut state, txn)?;
        query_internal(&state, table, options, &st, cancel, self.fns.as_ref())
    }

    pub fn insert(&self, table: &str, rows: Vec<Row>, txn: Option<TxnId>) -> CResult<usize> {
        self.write_op(txn, |state, st| {
            let mut inserted = 0;
            for row in rows {
                insert_row(state, table, row, st, self.fns.as_ref())?;
                inserted += 1;
            }
            Ok(inserted)
        })
    }

    pub fn update(
        &self,
        table: &str,
        filters: &[Filter],
        updates: &UpdateSet,
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<usize> {
        self.write_op(txn, |state, st| {
            update_where(state, table, filters, updates, st, cancel, self.fns.as_ref())
        })
    }

    pub fn delete(
        &self,
        table: &str,
        filters: &[Filter],
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<usize> {
        self.write_op(txn, |state, st| {
            delete_where(state, table, filters, st, cancel, self.fns.as_ref())
        })
    }

    /// Deletes every visible row. Inside a transaction the emptied table is
    /// visible only to the writer until commit.
    pub fn truncate(&self, table: &str, txn: Option<TxnId>) -> CResult<usize> {
        self.write_op(txn, |state, st| truncate_internal(state, table, st))
    }

    pub fn status(&self) -> Status {
        let state = self.lock();
        Status {
            name: self.name.clone(),
            tables: state.tables.len() as u64,
            active_txns: state.txns.active.len() as u64,
            total_versions: state
                .tables
                .values()
                .map(|t| t.rows.values().map(|c| c.len() as u64).sum::<u64>())
                .sum(),
        }
    }

    /// Runs a mutation under either the caller's transaction or an implicit
    /// autocommit transaction. Statement-level errors leave an explicit
    /// transaction usable; cancellation and storage errors abort it.
    fn write_op<F>(&self, txn: Option<TxnId>, op: F) -> CResult<usize>
    where
        F: FnOnce(&mut EngineState, &TransactionState) -> CResult<usize>,
    {
        let mut state = self.lock();
        let (txn_id, implicit) = match txn {
            Some(id) => (id, false),
            None => (begin_internal(&mut state, false, IsolationLevel::default()), true),
        };
        let st = match snapshot_for(&mut state, Some(txn_id)) {
            Ok(st) => st,
            Err(err) => {
                if implicit {
                    let _ = rollback_internal(&mut state, txn_id);
                }
                return Err(err);
            }
        };
        if st.read_only {
            if implicit {
                let _ = rollback_internal(&mut state, txn_id);
            }
            return Err(Error::ReadOnly("transaction is read-only".to_string()));
        }

        match op(&mut state, &st) {
            Ok(affected) => {
                touch(&mut state, txn_id);
                if implicit {
                    commit_internal(&mut state, txn_id)?;
                }
                Ok(affected)
            }
            Err(err) => {
                if implicit || !err.is_statement_level() {
                    // A cancelled or failed writer aborts its transaction;
                    // statement-level errors keep an explicit one open.
                    let _ = rollback_internal(&mut state, txn_id);
                    prune_versions(&mut state);
                }
                Err(err)
            }
        }
    }
}

// --- internal: transactions ---

fn begin_internal(state: &mut EngineState, read_only: bool, isolation: IsolationLevel) -> TxnId {
    let id = state.txns.next_id;
    state.txns.next_id += 1;
    let active: HashSet<TxnId> = state.txns.active.keys().copied().collect();
    let st = TransactionState { id, read_only, isolation, high_water: id, active };
    state.txns.active.insert(id, Transaction::new(st));
    id
}

fn snapshot_for(state: &mut EngineState, txn: Option<TxnId>) -> CResult<TransactionState> {
    match txn {
        Some(id) => {
            let txn = state
                .txns
                .active
                .get(&id)
                .ok_or_else(|| Error::Internal(format!("transaction {} is not active", id)))?;
            let mut st = txn.st.clone();
            if st.isolation == IsolationLevel::ReadCommitted {
                // Refresh per statement: see everything committed so far.
                st.high_water = state.txns.next_id;
                st.active = state.txns.active.keys().copied().filter(|t| *t != id).collect();
            }
            Ok(st)
        }
        None => Ok(TransactionState {
            id: BULK_LOAD_TXN,
            read_only: true,
            isolation: IsolationLevel::Snapshot,
            high_water: state.txns.next_id,
            active: state.txns.active.keys().copied().collect(),
        }),
    }
}

fn touch(state: &mut EngineState, txn: TxnId) {
    if let Some(t) = state.txns.active.get_mut(&txn) {
        t.last_active = std::time::Instant::now();
    }
}

fn commit_internal(state: &mut EngineState, txn_id: TxnId) -> CResult<()> {
    let txn = state
        .txns
        .active
        .get(&txn_id)
        .ok_or_else(|| Error::Internal(format!("transaction {} is not active", txn_id)))?;

    // First-committer-wins: every row in the write set must be untouched by
    // transactions that committed after our snapshot. Versions from aborted
    // transactions were removed at rollback, so any non-active stranger in a
    // chain has committed.
    let mut conflict = false;
    'check: for w in &txn.write_set {
        let Some(data) = state.tables.get(&w.table) else { continue };
        let Some(chain) = data.rows.get(&w.row_id) else { continue };
        for version in chain {
            for toucher in
                std::iter::once(version.created_by).chain(version.deleted_by.into_iter())
            {
                if toucher != txn_id
                    && toucher != BULK_LOAD_TXN
                    && !state.txns.active.contains_key(&toucher)
                    && !txn.st.sees(toucher)
                {
                    conflict = true;
                    break 'check;
                }
            }
        }
    }

    if conflict {
        rollback_internal(state, txn_id)?;
        prune_versions(state);
        return Err(Error::WriteConflict);
    }

    // Removing the entry from the active table atomically publishes every
    // write to transactions that begin from here on.
    let mut txn = state.txns.active.remove(&txn_id).expect("checked above");
    txn.status = TxnStatus::Committed;
    prune_versions(state);
    Ok(())
}

fn rollback_internal(state: &mut EngineState, txn_id: TxnId) -> CResult<()> {
    let mut txn = state
        .txns
        .active
        .remove(&txn_id)
        .ok_or_else(|| Error::Internal(format!("transaction {} is not active", txn_id)))?;
    txn.status = TxnStatus::Aborted;

    for w in txn.write_set.iter().rev() {
        let Some(data) = state.tables.get_mut(&w.table) else { continue };
        let Some(chain) = data.rows.get_mut(&w.row_id) else { continue };

        let mut removed: Vec<RowVersion> = Vec::new();
        chain.retain(|v| {
            if v.created_by == txn_id {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });
        for version in chain.iter_mut() {
            if version.deleted_by == Some(txn_id) {
                version.deleted_by = None;
            }
        }
        let emptied = chain.is_empty();
        if emptied {
            data.rows.remove(&w.row_id);
        }
        cleanup_index_entries(data, w.row_id, removed);
    }
    Ok(())
}

/// Removes index entries for rolled-back or pruned versions whose keys no
/// longer appear in any surviving version of the row.
fn cleanup_index_entries(data: &mut TableData, row_id: RowId, removed: Vec<RowVersion>) {
    if removed.is_empty() || data.indexes.is_empty() {
        return;
    }
    let survivors = data.rows.get(&row_id).cloned().unwrap_or_default();
    for version in removed {
        data.indexes.maintain(row_id, Some(&version.row), None);
        for survivor in &survivors {
            data.indexes.maintain(row_id, None, Some(&survivor.row));
        }
    }
}

/// Opportunistic version-chain pruning: once the oldest live snapshot has
/// advanced past a deletion mark, the dead version can never be seen again
/// and is released.
fn prune_versions(state: &mut EngineState) {
    let oldest = state.txns.active.keys().copied().min().unwrap_or(state.txns.next_id);
    let active_ids: HashSet<TxnId> = state.txns.active.keys().copied().collect();
    let pinned: HashSet<TxnId> =
        state.txns.active.values().flat_map(|t| t.st.active.iter().copied()).collect();

    for data in state.tables.values_mut() {
        let mut emptied: Vec<RowId> = Vec::new();
        let mut removed_per_row: Vec<(RowId, Vec<RowVersion>)> = Vec::new();
        for (row_id, chain) in data.rows.iter_mut() {
            let mut removed = Vec::new();
            chain.retain(|v| {
                let dead = match v.deleted_by {
                    Some(d) => !active_ids.contains(&d) && d < oldest && !pinned.contains(&d),
                    None => false,
                };
                if dead {
                    removed.push(v.clone());
                }
                !dead
            });
            if chain.is_empty() {
                emptied.push(*row_id);
            }
            if !removed.is_empty() {
                removed_per_row.push((*row_id, removed));
            }
        }
        for row_id in emptied {
            data.rows.remove(&row_id);
        }
        for (row_id, removed) in removed_per_row {
            cleanup_index_entries(data, row_id, removed);
        }
    }
}

// --- internal: helpers ---

fn get_table<'a>(state: &'a EngineState, table: &str) -> CResult<&'a TableData> {
    state.tables.get(table).ok_or_else(|| Error::TableNotFound(table.to_string()))
}

fn get_table_mut<'a>(state: &'a mut EngineState, table: &str) -> CResult<&'a mut TableData> {
    state.tables.get_mut(table).ok_or_else(|| Error::TableNotFound(table.to_string()))
}

/// The version of a chain this snapshot reads, if any.
pub(crate) fn visible_version<'a>(
    chain: &'a [RowVersion],
    st: &TransactionState,
) -> Option<&'a RowVersion> {
    for version in chain {
        if !st.sees(version.created_by) {
            continue;
        }
        return match version.deleted_by {
            Some(d) if st.sees(d) => None,
            _ => Some(version),
        };
    }
    None
}

/// A statement may not touch a row another active transaction has
/// uncommitted changes on (no dirty writes). Statement-level error.
fn statement_conflict_check(
    chain: &[RowVersion],
    st: &TransactionState,
    active: &HashMap<TxnId, Transaction>,
) -> CResult<()> {
    for version in chain {
        for toucher in std::iter::once(version.created_by).chain(version.deleted_by.into_iter()) {
            if toucher != st.id && active.contains_key(&toucher) {
                return Err(Error::WriteConflict);
            }
        }
    }
    Ok(())
}

fn bump_auto_increment(data: &mut TableData, row: &Row) {
    for column in &data.schema.columns {
        if column.auto_increment {
            if let Some(Value::Integer(v)) = row.get(&column.name) {
                if *v >= data.next_auto {
                    data.next_auto = v + 1;
                }
            }
        }
    }
}

fn check_cancel(cancel: Option<&CancelToken>, counter: &mut usize) -> CResult<()> {
    *counter += 1;
    if *counter % CANCEL_CHECK_EVERY == 0 {
        if let Some(token) = cancel {
            token.check()?;
        }
    }
    Ok(())
}

// --- internal: DDL ---

fn create_table_internal(state: &mut EngineState, schema: Table) -> CResult<()> {
    if state.tables.contains_key(&schema.name) {
        return Err(Error::Value(format!("table {} already exists", schema.name)));
    }
    if schema.columns.is_empty() {
        return Err(Error::Value(format!("table {} has no columns", schema.name)));
    }
    let mut seen = HashSet::new();
    for column in &schema.columns {
        if !seen.insert(&column.name) {
            return Err(Error::Value(format!(
                "duplicate column {} in table {}",
                column.name, schema.name
            )));
        }
        if column.primary_key && column.nullable {
            return Err(Error::Value(format!(
                "primary key column {}.{} cannot be nullable",
                schema.name, column.name
            )));
        }
        if column.generated.is_some() && column.auto_increment {
            return Err(Error::Value(format!(
                "column {}.{} cannot be both generated and auto-increment",
                schema.name, column.name
            )));
        }
    }
    for constraint in &schema.constraints {
        if let crate::sql::schema::Constraint::ForeignKey { columns, ref_columns, .. } = constraint
        {
            if columns.len() != ref_columns.len() {
                return Err(Error::Value(format!(
                    "foreign key {} column count mismatch",
                    constraint.name()
                )));
            }
        }
    }

    // Dependency analysis doubles as expression validation; a cycle or an
    // unresolved reference rejects the schema here.
    let generated = GeneratedColumns::analyze(&schema)?;

    let mut indexes = IndexSet::default();
    let pk: Vec<String> = schema.primary_key().iter().map(|c| c.name.clone()).collect();
    if !pk.is_empty() {
        indexes.add(Index::new(IndexMeta {
            name: "PRIMARY".to_string(),
            table: schema.name.clone(),
            index_type: IndexType::Ordered,
            unique: true,
            columns: pk,
        }))?;
    }
    for column in &schema.columns {
        if column.unique && !column.primary_key {
            indexes.add(Index::new(IndexMeta {
                name: format!("uniq_{}", column.name),
                table: schema.name.clone(),
                index_type: IndexType::Ordered,
                unique: true,
                columns: vec![column.name.clone()],
            }))?;
        }
    }
    // Table-level (composite) unique constraints enforce through a unique
    // index of the same name.
    for constraint in &schema.constraints {
        if let crate::sql::schema::Constraint::Unique { name, columns } = constraint {
            indexes.add(Index::new(IndexMeta {
                name: name.clone(),
                table: schema.name.clone(),
                index_type: IndexType::Ordered,
                unique: true,
                columns: columns.clone(),
            }))?;
        }
    }

    let name = schema.name.clone();
    state.tables.insert(
        name,
        TableData {
            schema,
            generated,
            rows: BTreeMap::new(),
            next_row_id: 1,
            next_auto: 1,
            indexes,
            bulk_loaded: false,
        },
    );
    Ok(())
}

fn create_index_internal(state: &mut EngineState, meta: IndexMeta) -> CResult<()> {
    let st = snapshot_for(state, None)?;
    let data = get_table(state, &meta.table)?;
    for column in &meta.columns {
        data.schema.get_column(column)?;
        // VIRTUAL generated columns must classify as indexable.
        data.generated.check_indexable(column)?;
    }

    let mut index = Index::new(meta.clone());
    // Backfill from every version so uncommitted writers keep their own
    // entries; readers re-verify visibility anyway.
    for (row_id, chain) in &data.rows {
        for version in chain {
            let key = index.key_of(&version.row);
            index.insert_entry(key, *row_id);
        }
    }

    if meta.unique {
        // No two currently visible rows may share a key.
        let mut seen: HashSet<Vec<Value>> = HashSet::new();
        for chain in data.rows.values() {
            if let Some(version) = visible_version(chain, &st) {
                let key = index.key_of(&version.row);
                if unique_key_applies(&key) && !seen.insert(key) {
                    return Err(Error::Constraint(format!(
                        "duplicate key prevents unique index {} on {}",
                        meta.name, meta.table
                    )));
                }
            }
        }
    }

    get_table_mut(state, &meta.table)?.indexes.add(index)
}

// --- internal: queries ---

fn query_internal(
    state: &EngineState,
    table: &str,
    options: &QueryOptions,
    st: &TransactionState,
    cancel: Option<&CancelToken>,
    fns: &dyn ScalarFns,
) -> CResult<ResultSet> {
    let data = get_table(state, table)?;

    // Push the leading filter down to an index scan when one matches.
    let pushdown = options
        .filters
        .iter()
        .find_map(|f| data.indexes.pick_for(&f.column, f.op).map(|i| (i, f)));
    let candidates: Vec<RowId> = match pushdown {
        Some((index, filter)) => index.scan_leading(filter.op, &filter.value),
        None => data.rows.keys().copied().collect(),
    };

    let mut counter = 0;
    let mut matched: Vec<(RowId, Row)> = Vec::new();
    for id in candidates {
        check_cancel(cancel, &mut counter)?;
        let Some(chain) = data.rows.get(&id) else { continue };
        let Some(version) = visible_version(chain, st) else { continue };
        let mut row = version.row.clone();
        data.generated.materialize_virtual(&mut row, fns);
        if !matches_all(&options.filters, &row) {
            continue;
        }
        matched.push((id, row));
    }

    // Index scans come back in key order; full scans in insertion order.
    // Explicit ordering re-sorts with the primary key (or insertion order)
    // as the stable tie-break.
    if !options.order.is_empty() {
        matched.sort_by(|(a_id, a), (b_id, b)| {
            match data.schema.primary_key_of(a).zip(data.schema.primary_key_of(b)) {
                Some((ka, kb)) => ka.cmp(&kb),
                None => a_id.cmp(b_id),
            }
        });
        for spec in options.order.iter().rev() {
            matched.sort_by(|(_, a), (_, b)| {
                let av = a.get(&spec.column).unwrap_or(&Value::Null);
                let bv = b.get(&spec.column).unwrap_or(&Value::Null);
                let ord = av.cmp(bv);
                if spec.desc {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
    } else if pushdown.is_none() {
        matched.sort_by_key(|(id, _)| *id);
    }

    let total = matched.len();
    let offset = options.offset.unwrap_or(0);
    let limit = options.limit.unwrap_or(usize::MAX);
    let window = matched.into_iter().skip(offset).take(limit);

    let columns: Vec<String> = if options.projection.is_empty() {
        data.schema.columns.iter().map(|c| c.name.clone()).collect()
    } else {
        for p in &options.projection {
            data.schema.get_column(p)?;
        }
        options.projection.clone()
    };

    let rows: Vec<Row> = window
        .map(|(_, row)| {
            columns
                .iter()
                .filter(|c| c.as_str() != ROW_ATTS)
                .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                .collect()
        })
        .collect();

    Ok(ResultSet { columns, rows, total })
}

/// Visible rows matching a filter list, as (id, row) clones. Filters run
/// over a copy with VIRTUAL columns materialized; the returned rows are the
/// stored representation.
fn collect_matching(
    state: &EngineState,
    table: &str,
    filters: &[Filter],
    st: &TransactionState,
    cancel: Option<&CancelToken>,
    fns: &dyn ScalarFns,
) -> CResult<Vec<(RowId, Row)>> {
    let data = get_table(state, table)?;
    let pushdown =
        filters.iter().find_map(|f| data.indexes.pick_for(&f.column, f.op).map(|i| (i, f)));
    let candidates: Vec<RowId> = match pushdown {
        Some((index, filter)) => index.scan_leading(filter.op, &filter.value),
        None => data.rows.keys().copied().collect(),
    };

    let mut counter = 0;
    let mut matched = Vec::new();
    for id in candidates {
        check_cancel(cancel, &mut counter)?;
        let Some(chain) = data.rows.get(&id) else { continue };
        let Some(version) = visible_version(chain, st) else { continue };
        let hit = if data.generated.is_empty() {
            matches_all(filters, &version.row)
        } else {
            let mut readable = version.row.clone();
            data.generated.materialize_virtual(&mut readable, fns);
            matches_all(filters, &readable)
        };
        if hit {
            matched.push((id, version.row.clone()));
        }
    }
    Ok(matched)
}

// --- internal: constraint checks (read phase) ---

fn unique_check(
    data: &TableData,
    st: &TransactionState,
    row: &Row,
    exclude: Option<RowId>,
) -> CResult<()> {
    for index in data.indexes.iter().filter(|i| i.meta.unique) {
        let key = index.key_of(row);
        if !unique_key_applies(&key) {
            continue;
        }
        for id in index.lookup(&key) {
            if Some(id) == exclude {
                continue;
            }
            let Some(chain) = data.rows.get(&id) else { continue };
            if let Some(version) = visible_version(chain, st) {
                if index.key_of(&version.row) == key {
                    return Err(Error::Constraint(format!(
                        "duplicate key {:?} for index {} on table {}",
                        key, index.meta.name, index.meta.table
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Child-side foreign key check: every referenced parent row must be visible
/// under the writer's snapshot.
fn foreign_key_check(
    state: &EngineState,
    schema: &Table,
    st: &TransactionState,
    row: &Row,
) -> CResult<()> {
    for (name, columns, ref_table, ref_columns, _) in foreign_keys(schema) {
        let key: Vec<Value> =
            columns.iter().map(|c| row.get(c).cloned().unwrap_or(Value::Null)).collect();
        if key.iter().any(Value::is_null) {
            continue;
        }
        let parent = state
            .tables
            .get(ref_table)
            .ok_or_else(|| Error::TableNotFound(ref_table.to_string()))?;
        let exists = parent.rows.values().any(|chain| {
            visible_version(chain, st).map_or(false, |v| {
                ref_columns
                    .iter()
                    .zip(&key)
                    .all(|(c, k)| v.row.get(c).map_or(false, |val| val == k))
            })
        });
        if !exists {
            return Err(Error::Constraint(format!(
                "foreign key {} violated: no parent row in {}",
                name, ref_table
            )));
        }
    }
    Ok(())
}

/// What to do to dependents of a parent row being deleted.
enum FkAction {
    Cascade(String, RowId),
    SetNull(String, RowId, Vec<String>),
}

/// Finds dependents of a parent row under every referencing table's FK
/// clauses, and fails on NO ACTION dependents.
fn plan_fk_actions(
    state: &EngineState,
    parent_table: &str,
    parent_row: &Row,
    st: &TransactionState,
) -> CResult<Vec<FkAction>> {
    let mut actions = Vec::new();
    for (child_name, child) in &state.tables {
        for (name, columns, ref_table, ref_columns, on_delete) in foreign_keys(&child.schema) {
            if ref_table != parent_table {
                continue;
            }
            let parent_key: Vec<Value> = ref_columns
                .iter()
                .map(|c| parent_row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            for (row_id, chain) in &child.rows {
                let Some(version) = visible_version(chain, st) else { continue };
                let child_key: Vec<Value> = columns
                    .iter()
                    .map(|c| version.row.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                if child_key.iter().any(Value::is_null) || child_key != parent_key {
                    continue;
                }
                match on_delete {
                    OnDelete::NoAction => {
                        return Err(Error::Constraint(format!(
                            "cannot delete from {}: row is referenced by {} via foreign key {}",
                            parent_table, child_name, name
                        )));
                    }
                    OnDelete::Cascade => actions.push(FkAction::Cascade(child_name.clone(), *row_id)),
                    OnDelete::SetNull => {
                        actions.push(FkAction::SetNull(child_name.clone(), *row_id, columns.to_vec()))
                    }
                }
            }
        }
    }
    Ok(actions)
}

// --- internal: DML ---

fn insert_row(
    state: &mut EngineState,
    table: &str,
    row: Row,
    st: &TransactionState,
    fns: &dyn ScalarFns,
) -> CResult<()> {
    // Read phase: prepare and validate the candidate row.
    let prepared = {
        let data = get_table(state, table)?;
        let mut row = row;
        for column in &data.schema.columns {
            if column.generated.is_some() {
                if row.get(&column.name).map_or(false, |v| !v.is_null()) {
                    return Err(Error::Value(format!(
                        "cannot insert into generated column {}.{}",
                        table, column.name
                    )));
                }
                row.remove(&column.name);
            }
            if column.auto_increment && row.get(&column.name).map_or(true, Value::is_null) {
                row.insert(column.name.clone(), Value::Integer(data.next_auto));
            }
        }
        data.schema.validate_row(&row)?;
        let mut row = data.schema.normalize_row(&row)?;
        data.generated.materialize_stored(&mut row, fns);
        check_constraints(&data.schema, &row, fns)?;
        unique_check(data, st, &row, None)?;
        foreign_key_check(state, &data.schema, st, &row)?;
        row
    };

    // Write phase: install the version and maintain indexes.
    let data = get_table_mut(state, table)?;
    bump_auto_increment(data, &prepared);
    let row_id = data.next_row_id;
    data.next_row_id += 1;
    data.indexes.maintain(row_id, None, Some(&prepared));
    data.rows
        .insert(row_id, vec![RowVersion { row: prepared, created_by: st.id, deleted_by: None }]);
    if let Some(txn) = state.txns.active.get_mut(&st.id) {
        txn.record_write(table, row_id);
    }
    Ok(())
}

fn update_where(
    state: &mut EngineState,
    table: &str,
    filters: &[Filter],
    updates: &UpdateSet,
    st: &TransactionState,
    cancel: Option<&CancelToken>,
    fns: &dyn ScalarFns,
) -> CResult<usize> {
    {
        let data = get_table(state, table)?;
        for column in updates.keys() {
            let descriptor = data.schema.get_column(column)?;
            if descriptor.generated.is_some() {
                return Err(Error::Value(format!(
                    "cannot update generated column {}.{}",
                    table, column
                )));
            }
        }
    }

    let targets = collect_matching(state, table, filters, st, cancel, fns)?;
    let changed: Vec<String> = updates.keys().cloned().collect();
    let mut affected = 0;

    for (row_id, old_row) in targets {
        // Read phase: build and validate the replacement row.
        let new_row = {
            let data = get_table(state, table)?;
            let mut row = old_row.clone();
            for (column, value) in updates {
                let descriptor = data.schema.get_column(column)?;
                let value =
                    if value.is_null() { Value::Null } else { value.cast(descriptor.datatype)? };
                row.insert(column.clone(), value);
            }
            data.generated.cascade_stored(&mut row, &changed, fns);
            data.schema.validate_row(&row)?;
            check_constraints(&data.schema, &row, fns)?;
            unique_check(data, st, &row, Some(row_id))?;
            foreign_key_check(state, &data.schema, st, &row)?;
            row
        };

        if new_row == old_row {
            affected += 1;
            continue;
        }

        apply_update(state, table, row_id, new_row, st)?;
        affected += 1;
    }
    Ok(affected)
}

/// Installs a new version of a row (or rewrites the writer's own
/// uncommitted head version in place).
fn apply_update(
    state: &mut EngineState,
    table: &str,
    row_id: RowId,
    new_row: Row,
    st: &TransactionState,
) -> CResult<()> {
    // The split borrow: conflict check needs the txn table and the chain.
    {
        let data = get_table(state, table)?;
        let chain = data
            .rows
            .get(&row_id)
            .ok_or_else(|| Error::Internal(format!("row {} vanished mid-update", row_id)))?;
        statement_conflict_check(chain, st, &state.txns.active)?;
    }

    let data = get_table_mut(state, table)?;
    let chain = data.rows.get_mut(&row_id).expect("checked above");

    let rewrite_own =
        chain.first().map_or(false, |h| h.created_by == st.id && h.deleted_by.is_none());
    if rewrite_own {
        // Rewriting our own uncommitted write: swap content in place and
        // retire the superseded version's index keys.
        let head = chain.first_mut().expect("head exists");
        let old_row = std::mem::replace(&mut head.row, new_row);
        let replaced = RowVersion { row: old_row, created_by: st.id, deleted_by: None };
        cleanup_index_entries(data, row_id, vec![replaced]);
    } else {
        // Mark the currently visible version deleted and push the new one.
        for version in chain.iter_mut() {
            if st.sees(version.created_by) && version.deleted_by.is_none() {
                version.deleted_by = Some(st.id);
                break;
            }
        }
        chain.insert(0, RowVersion { row: new_row.clone(), created_by: st.id, deleted_by: None });
        data.indexes.maintain(row_id, None, Some(&new_row));
    }
    if let Some(txn) = state.txns.active.get_mut(&st.id) {
        txn.record_write(table, row_id);
    }
    Ok(())
}

fn delete_where(
    state: &mut EngineState,
    table: &str,
    filters: &[Filter],
    st: &TransactionState,
    cancel: Option<&CancelToken>,
    fns: &dyn ScalarFns,
) -> CResult<usize> {
    let targets = collect_matching(state, table, filters, st, cancel, fns)?;
    let mut affected = 0;
    let mut worklist: Vec<(String, RowId)> =
        targets.iter().map(|(id, _)| (table.to_string(), *id)).collect();
    let mut counter = 0;

    while let Some((victim_table, row_id)) = worklist.pop() {
        check_cancel(cancel, &mut counter)?;

        // Read phase: the row may already be deleted by an earlier cascade
        // step in this same statement.
        let Some(parent_row) = ({
            let data = get_table(state, &victim_table)?;
            data.rows.get(&row_id).and_then(|chain| visible_version(chain, st)).map(|v| v.row.clone())
        }) else {
            continue;
        };

        let actions = plan_fk_actions(state, &victim_table, &parent_row, st)?;

        apply_delete_mark(state, &victim_table, row_id, st)?;
        if victim_table == table {
            affected += 1;
        }

        for action in actions {
            match action {
                FkAction::Cascade(child_table, child_id) => worklist.push((child_table, child_id)),
                FkAction::SetNull(child_table, child_id, columns) => {
                    let nulls: UpdateSet =
                        columns.into_iter().map(|c| (c, Value::Null)).collect();
                    set_null_dependent(state, &child_table, child_id, &nulls, st, fns)?;
                }
            }
        }
    }
    Ok(affected)
}

fn apply_delete_mark(
    state: &mut EngineState,
    table: &str,
    row_id: RowId,
    st: &TransactionState,
) -> CResult<()> {
    {
        let data = get_table(state, table)?;
        if let Some(chain) = data.rows.get(&row_id) {
            statement_conflict_check(chain, st, &state.txns.active)?;
        }
    }
    let data = get_table_mut(state, table)?;
    let Some(chain) = data.rows.get_mut(&row_id) else { return Ok(()) };

    // Deleting our own uncommitted insert removes the version outright.
    let own_only = chain.len() == 1
        && chain[0].created_by == st.id
        && chain[0].deleted_by.is_none();
    if own_only {
        let removed = chain.remove(0);
        data.rows.remove(&row_id);
        cleanup_index_entries(data, row_id, vec![removed]);
        if let Some(txn) = state.txns.active.get_mut(&st.id) {
            txn.record_write(table, row_id);
        }
        return Ok(());
    }

    for version in chain.iter_mut() {
        if st.sees(version.created_by) && version.deleted_by.is_none() {
            version.deleted_by = Some(st.id);
            break;
        }
    }
    if let Some(txn) = state.txns.active.get_mut(&st.id) {
        txn.record_write(table, row_id);
    }
    Ok(())
}

/// ON DELETE SET NULL path: a targeted single-row update that bypasses the
/// filter machinery but keeps generated-column cascade and validation.
fn set_null_dependent(
    state: &mut EngineState,
    table: &str,
    row_id: RowId,
    nulls: &UpdateSet,
    st: &TransactionState,
    fns: &dyn ScalarFns,
) -> CResult<()> {
    let new_row = {
        let data = get_table(state, table)?;
        let Some(version) = data.rows.get(&row_id).and_then(|c| visible_version(c, st)) else {
            return Ok(());
        };
        let mut row = version.row.clone();
        for (column, _) in nulls {
            row.insert(column.clone(), Value::Null);
        }
        let changed: Vec<String> = nulls.keys().cloned().collect();
        data.generated.cascade_stored(&mut row, &changed, fns);
        data.schema.validate_row(&row)?;
        row
    };
    apply_update(state, table, row_id, new_row, st)
}

fn truncate_internal(
    state: &mut EngineState,
    table: &str,
    st: &TransactionState,
) -> CResult<usize> {
    let victims: Vec<RowId> = {
        let data = get_table(state, table)?;
        data.rows
            .iter()
            .filter(|(_, chain)| visible_version(chain, st).is_some())
            .map(|(id, _)| *id)
            .collect()
    };
    let count = victims.len();
    for row_id in victims {
        apply_delete_mark(state, table, row_id, st)?;
    }
    Ok(count)
}
