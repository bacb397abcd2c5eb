use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde_derive::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::datasource::Datasource;
use crate::error::{CResult, Error};
use crate::index::IndexMeta;
use crate::mvcc::engine::MvccEngine;
use crate::mvcc::transaction::IsolationLevel;
use crate::mvcc::TxnId;
use crate::sql::plan::{Filter, QueryOptions, ResultSet, UpdateSet};
use crate::sql::schema::Table;
use crate::sql::Row;
use crate::storage::page::paginate;

/// On-disk shape of one table file.
#[derive(Serialize, Deserialize)]
struct TableFile {
    schema: Table,
    rows: Vec<Row>,
}

/// A single-file-per-table JSON datasource: `<dir>/<table>.json` holding the
/// schema and the row set. Load on connect, rewrite dirty tables on flush.
/// It shares the XML adapter's contract but not its WAL; durability is
/// flush-grained.
pub struct JsonDatasource {
    dir: PathBuf,
    engine: MvccEngine,
    dirty: Mutex<HashSet<String>>,
    connected: AtomicBool,
}

impl JsonDatasource {
    pub fn open(dir: PathBuf) -> Self {
        Self {
            dir,
            engine: MvccEngine::new("json"),
            dirty: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &MvccEngine {
        &self.engine
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.json", table))
    }

    fn mark_dirty(&self, table: &str) {
        self.dirty.lock().expect("dirty set poisoned").insert(table.to_string());
    }

    fn load_all(&self) -> CResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |e| e == "json"))
            .collect();
        paths.sort();
        for path in paths {
            let file: TableFile = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
            let table = file.schema.name.clone();
            self.engine.create_table(file.schema)?;
            let pages = paginate(&table, file.rows);
            let mut iter = pages.into_iter();
            self.engine.bulk_load(&table, &mut || Ok(iter.next()))?;
        }
        Ok(())
    }

    fn write_table(&self, table: &str) -> CResult<()> {
        let schema = self.engine.get_table_info(table)?;
        let rows = self.engine.query(table, &QueryOptions::default(), None, None)?.rows;
        let file = TableFile { schema, rows };
        let path = self.table_path(table);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        std::fs::rename(&tmp, &path)
            .map_err(|err| Error::Storage(format!("rename {} failed: {}", tmp.display(), err)))?;
        Ok(())
    }
}

impl Datasource for JsonDatasource {
    fn name(&self) -> &str {
        "json"
    }

    fn connect(&self) -> CResult<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.load_all().map_err(|err| {
            self.connected.store(false, Ordering::SeqCst);
            err
        })
    }

    fn close(&self) -> CResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.flush()
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
        let affected = self.engine.insert(table, rows, txn)?;
        self.mark_dirty(table);
        Ok(affected)
    }

    fn update(
        &self,
        table: &str,
        filters: &[Filter],
        updates: &UpdateSet,
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<usize> {
        let affected = self.engine.update(table, filters, updates, txn, cancel)?;
        self.mark_dirty(table);
        Ok(affected)
    }

    fn delete(
        &self,
        table: &str,
        filters: &[Filter],
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<usize> {
        let affected = self.engine.delete(table, filters, txn, cancel)?;
        self.mark_dirty(table);
        Ok(affected)
    }

    fn create_table(&self, schema: Table) -> CResult<()> {
        let table = schema.name.clone();
        self.engine.create_table(schema)?;
        self.mark_dirty(&table);
        Ok(())
    }

    fn drop_table(&self, table: &str) -> CResult<()> {
        self.engine.drop_table(table)?;
        let path = self.table_path(table);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        self.dirty.lock().expect("dirty set poisoned").remove(table);
        Ok(())
    }

    fn truncate_table(&self, table: &str, txn: Option<TxnId>) -> CResult<usize> {
        let affected = self.engine.truncate(table, txn)?;
        self.mark_dirty(table);
        Ok(affected)
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

    fn flush(&self) -> CResult<()> {
        let dirty: Vec<String> = {
            let dirty = self.dirty.lock().expect("dirty set poisoned");
            dirty.iter().cloned().collect()
        };
        for table in &dirty {
            if self.engine.get_table_info(table).is_ok() {
                self.write_table(table)?;
            }
        }
        let mut set = self.dirty.lock().expect("dirty set poisoned");
        for table in dirty {
            set.remove(&table);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sql::row_from;
    use crate::sql::schema::Column;
    use crate::sql::value::{DataType, Value};

    fn schema() -> Table {
        Table::new(
            "notes",
            "json",
            vec![
                Column::new("id", DataType::Integer).primary(),
                Column::new("body", DataType::String),
            ],
        )
    }

    #[test]
    fn flush_reopen_round_trip() -> CResult<()> {
        let dir = tempdir::TempDir::new("jsondb")?;
        let path = dir.path().join("db");
        {
            let source = JsonDatasource::open(path.clone());
            source.connect()?;
            source.create_table(schema())?;
            source
                .insert(
                    "notes",
                    vec![row_from(vec![("id", Value::Integer(1)), ("body", Value::from("hi"))])],
                    None,
                )?;
            source.close()?;
        }
        let source = JsonDatasource::open(path);
        source.connect()?;
        let rs = source.query("notes", &QueryOptions::default(), None, None)?;
        assert_eq!(rs.total, 1);
        assert_eq!(rs.rows[0].get("body"), Some(&Value::from("hi")));
        Ok(())
    }

    #[test]
    fn drop_table_removes_the_file() -> CResult<()> {
        let dir = tempdir::TempDir::new("jsondb")?;
        let path = dir.path().join("db");
        let source = JsonDatasource::open(path.clone());
        source.connect()?;
        source.create_table(schema())?;
        source.flush()?;
        assert!(path.join("notes.json").exists());
        source.drop_table("notes")?;
        assert!(!path.join("notes.json").exists());
        Ok(())
    }
}
