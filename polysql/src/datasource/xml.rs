use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use crate::cancel::CancelToken;
use crate::datasource::{Datasource, IndexPersister};
use crate::error::{CResult, Error};
use crate::index::{IndexMeta, IndexType};
use crate::mvcc::engine::MvccEngine;
use crate::mvcc::transaction::IsolationLevel;
use crate::mvcc::TxnId;
use crate::sql::plan::{Filter, QueryOptions, ResultSet, UpdateSet};
use crate::sql::schema::{
    Column, Constraint, GeneratedKind, GeneratedSpec, OnDelete, StorageMode, Table,
};
use crate::sql::value::{DataType, Value};
use crate::sql::Row;
use crate::storage::buffer::BufferPool;
use crate::storage::page::paginate;
use crate::storage::wal::{Wal, WalEntry};

const SCHEMA_FILE: &str = "__schema__.xml";
const META_FILE: &str = "__meta__.xml";
const DATA_FILE: &str = "data.xml";
const WAL_FILE: &str = "wal.log";

/// Buffer-pool frames per adapter.
const POOL_CAPACITY: usize = 64;

/// Adapter options. `encoding` overrides BOM sniffing ("utf-8", "utf-16le",
/// "utf-16be").
#[derive(Clone, Debug, Default)]
pub struct XmlOptions {
    pub encoding: Option<String>,
}

/// The XML-directory datasource.
///
/// One directory per database, one subdirectory per table:
///
/// - `__schema__.xml` — column definitions and storage mode.
/// - `__meta__.xml` — index definitions.
/// - `data.xml` (single-file mode) or `<pk>.xml` per row (file-per-row,
///   the default, selected via `COMMENT 'xml_mode=...'`).
///
/// Durability: every autocommit mutation appends to the WAL (fsync'd)
/// before touching memory; transactional statements are staged and appended
/// when the engine accepts the commit. A checkpoint rewrites dirty table
/// files atomically, then truncates the log.
pub struct XmlDatasource {
    dir: PathBuf,
    engine: MvccEngine,
    wal: Mutex<Wal>,
    dirty: Mutex<HashSet<String>>,
    staged: Mutex<HashMap<TxnId, Vec<WalEntry>>>,
    /// Encoding each table's data files were read with; writes re-encode to
    /// match.
    encodings: Mutex<HashMap<String, &'static Encoding>>,
    encoding_override: Option<&'static Encoding>,
    pool: BufferPool,
    connected: AtomicBool,
    read_only: AtomicBool,
}

impl XmlDatasource {
    pub fn open(dir: PathBuf) -> CResult<Self> {
        Self::open_with_options(dir, XmlOptions::default())
    }

    pub fn open_with_options(dir: PathBuf, options: XmlOptions) -> CResult<Self> {
        let encoding_override = match &options.encoding {
            Some(label) => Some(
                Encoding::for_label(label.as_bytes())
                    .ok_or_else(|| Error::Value(format!("unknown encoding: {}", label)))?,
            ),
            None => None,
        };
        let wal = Wal::open(dir.join(WAL_FILE))?;
        Ok(Self {
            dir,
            engine: MvccEngine::new("xml"),
            wal: Mutex::new(wal),
            dirty: Mutex::new(HashSet::new()),
            staged: Mutex::new(HashMap::new()),
            encodings: Mutex::new(HashMap::new()),
            encoding_override,
            pool: BufferPool::new(POOL_CAPACITY),
            connected: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
        })
    }

    pub fn engine(&self) -> &MvccEngine {
        &self.engine
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.dir.join(table)
    }

    fn ensure_writable(&self) -> CResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly(format!(
                "datasource {} is read-only after a storage failure",
                self.dir.display()
            )));
        }
        Ok(())
    }

    fn mark_dirty(&self, table: &str) {
        self.dirty.lock().expect("dirty set poisoned").insert(table.to_string());
    }

    /// Appends to the WAL, flipping the adapter read-only on failure.
    fn append_wal(&self, entry: &WalEntry) -> CResult<()> {
        let mut wal = self.wal.lock().expect("wal poisoned");
        match wal.append(entry) {
            Ok(_) => Ok(()),
            Err(err) => {
                log::error!("WAL append failed, marking {} read-only: {}", self.dir.display(), err);
                self.read_only.store(true, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn stage(&self, txn: TxnId, entry: WalEntry) {
        self.staged.lock().expect("staged poisoned").entry(txn).or_default().push(entry);
    }

    fn encoding_for(&self, table: &str) -> &'static Encoding {
        if let Some(enc) = self.encoding_override {
            return enc;
        }
        *self.encodings.lock().expect("encodings poisoned").get(table).unwrap_or(&UTF_8)
    }

    fn read_text(&self, table: &str, path: &Path) -> CResult<String> {
        let bytes = std::fs::read(path)?;
        let encoding = self.encoding_override.unwrap_or_else(|| sniff_encoding(&bytes));
        self.encodings.lock().expect("encodings poisoned").insert(table.to_string(), encoding);
        decode_text(encoding, &bytes)
    }

    /// Loads every table directory, replays the WAL, and rebuilds indexes
    /// from the sidecar metadata.
    fn load_all(&self) -> CResult<()> {
        std::fs::create_dir_all(&self.dir)?;

        let mut table_dirs: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                table_dirs.push(entry.path());
            }
        }
        table_dirs.sort();

        for table_dir in table_dirs {
            self.load_table(&table_dir)?;
        }

        // Re-apply post-checkpoint mutations. Statement-level failures are
        // deterministic repeats of failures the log captured; skip them.
        let pending = self.wal.lock().expect("wal poisoned").replay()?;
        for entry in pending {
            let table = wal_entry_table(&entry);
            if let Err(err) = self.apply_replayed(entry) {
                if err.is_statement_level() {
                    log::warn!("skipping WAL entry during replay: {}", err);
                } else {
                    return Err(err);
                }
            } else if let Some(table) = table {
                self.mark_dirty(&table);
            }
        }
        Ok(())
    }

    fn load_table(&self, table_dir: &Path) -> CResult<()> {
        let schema_path = table_dir.join(SCHEMA_FILE);
        if !schema_path.exists() {
            log::warn!("ignoring {} without {}", table_dir.display(), SCHEMA_FILE);
            return Ok(());
        }
        let dir_name = table_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Storage(format!("bad table directory {}", table_dir.display())))?
            .to_string();

        // Leftover temp files from an interrupted checkpoint.
        for entry in std::fs::read_dir(table_dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "tmp") {
                log::warn!("removing stale temp file {}", path.display());
                let _ = std::fs::remove_file(&path);
            }
        }

        let schema = decode_schema(&self.read_text(&dir_name, &schema_path)?)?;
        let table = schema.name.clone();
        self.engine.create_table(schema.clone())?;

        let rows = match schema.storage_mode {
            StorageMode::SingleFile => {
                let data_path = table_dir.join(DATA_FILE);
                if data_path.exists() {
                    decode_rows(&schema, &self.read_text(&table, &data_path)?)?
                } else {
                    Vec::new()
                }
            }
            StorageMode::FilePerRow => {
                let mut files: Vec<PathBuf> = std::fs::read_dir(table_dir)?
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| {
                        p.extension().map_or(false, |e| e == "xml")
                            && p.file_name().map_or(false, |n| {
                                n != SCHEMA_FILE && n != META_FILE && n != DATA_FILE
                            })
                    })
                    .collect();
                files.sort();
                let mut rows = Vec::new();
                for file in files {
                    rows.extend(decode_rows(&schema, &self.read_text(&table, &file)?)?);
                }
                rows
            }
        };

        // Stream page-sized batches through the buffer pool so peak memory
        // stays bounded on the load path.
        let pages = paginate(&table, rows);
        let mut iter = pages.into_iter();
        self.engine.bulk_load(&table, &mut || match iter.next() {
            Some(page) => {
                let installed = self.pool.install(page)?;
                Ok(Some((*installed).clone()))
            }
            None => Ok(None),
        })?;

        let meta_path = table_dir.join(META_FILE);
        if meta_path.exists() {
            // Indexes implied by the schema (primary key, unique columns and
            // constraints) were already rebuilt by create_table.
            let implicit: Vec<String> =
                self.engine.index_metas(&table)?.into_iter().map(|m| m.name).collect();
            for meta in decode_meta(&self.read_text(&table, &meta_path)?)? {
                if implicit.contains(&meta.name) {
                    continue;
                }
                self.engine.create_index(meta)?;
            }
        }
        Ok(())
    }

    fn apply_replayed(&self, entry: WalEntry) -> CResult<()> {
        match entry {
            WalEntry::Insert { table, rows } => self.engine.insert(&table, rows, None).map(|_| ()),
            WalEntry::Update { table, filters, updates } => {
                self.engine.update(&table, &filters, &updates, None, None).map(|_| ())
            }
            WalEntry::Delete { table, filters } => {
                self.engine.delete(&table, &filters, None, None).map(|_| ())
            }
            WalEntry::CreateTable { schema } => self.engine.create_table(schema),
            WalEntry::DropTable { table } => self.engine.drop_table(&table),
            WalEntry::Truncate { table } => self.engine.truncate(&table, None).map(|_| ()),
            WalEntry::Checkpoint => Ok(()),
        }
    }

    /// Writes one table's durable files according to its storage mode.
    fn write_table_files(&self, table: &str) -> CResult<()> {
        let schema = self.engine.get_table_info(table)?;
        let rows = self.engine.query(table, &QueryOptions::default(), None, None)?.rows;
        let table_dir = self.table_dir(table);
        std::fs::create_dir_all(&table_dir)?;
        let encoding = self.encoding_for(table);

        self.write_sidecars(&schema)?;

        match schema.storage_mode {
            StorageMode::SingleFile => {
                let text = encode_rows(&schema, &rows)?;
                write_atomic(&table_dir.join(DATA_FILE), &encode_text(encoding, &text))?;
            }
            StorageMode::FilePerRow => {
                let mut files: Vec<(String, Vec<u8>)> = Vec::with_capacity(rows.len());
                for row in &rows {
                    let name = row_file_name(&schema, row)?;
                    let text = encode_rows(&schema, std::slice::from_ref(row))?;
                    files.push((name, encode_text(encoding, &text)));
                }
                let written: HashSet<String> = files.iter().map(|(n, _)| n.clone()).collect();
                write_files_parallel(&table_dir, files)?;

                // Remove stray data files from deleted or renamed rows.
                for entry in std::fs::read_dir(&table_dir)? {
                    let path = entry?.path();
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
                    if name == SCHEMA_FILE || name == META_FILE {
                        continue;
                    }
                    if path.extension().map_or(false, |e| e == "xml") && !written.contains(name) {
                        log::debug!("removing orphan data file {}", path.display());
                        std::fs::remove_file(&path)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn write_sidecars(&self, schema: &Table) -> CResult<()> {
        let table_dir = self.table_dir(&schema.name);
        std::fs::create_dir_all(&table_dir)?;
        write_atomic(
            &table_dir.join(SCHEMA_FILE),
            encode_schema(schema)?.as_bytes(),
        )?;
        let metas = self.engine.index_metas(&schema.name)?;
        write_atomic(&table_dir.join(META_FILE), encode_meta(&metas)?.as_bytes())?;
        Ok(())
    }

    /// The checkpoint: write every dirty table's files, append a checkpoint
    /// record, truncate the log.
    fn checkpoint(&self) -> CResult<()> {
        let dirty: Vec<String> = {
            let dirty = self.dirty.lock().expect("dirty set poisoned");
            dirty.iter().cloned().collect()
        };
        if dirty.is_empty() {
            return Ok(());
        }
        for table in &dirty {
            if self.engine.get_table_info(table).is_ok() {
                self.write_table_files(table).map_err(|err| {
                    log::error!("checkpoint failed for {}: {}", table, err);
                    self.read_only.store(true, Ordering::SeqCst);
                    err
                })?;
            }
        }
        {
            let mut wal = self.wal.lock().expect("wal poisoned");
            wal.append(&WalEntry::Checkpoint)?;
            wal.reset()?;
        }
        let mut set = self.dirty.lock().expect("dirty set poisoned");
        for table in dirty {
            set.remove(&table);
        }
        Ok(())
    }
}

impl Datasource for XmlDatasource {
    fn name(&self) -> &str {
        "xml"
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
        if !self.read_only.load(Ordering::SeqCst) {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_writable(&self) -> bool {
        !self.read_only.load(Ordering::SeqCst)
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
        self.ensure_writable()?;
        let entry = WalEntry::Insert { table: table.to_string(), rows: rows.clone() };
        match txn {
            None => {
                self.append_wal(&entry)?;
                let affected = self.engine.insert(table, rows, None)?;
                self.mark_dirty(table);
                Ok(affected)
            }
            Some(id) => {
                let affected = self.engine.insert(table, rows, Some(id))?;
                self.stage(id, entry);
                Ok(affected)
            }
        }
    }

    fn update(
        &self,
        table: &str,
        filters: &[Filter],
        updates: &UpdateSet,
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<usize> {
        self.ensure_writable()?;
        let entry = WalEntry::Update {
            table: table.to_string(),
            filters: filters.to_vec(),
            updates: updates.clone(),
        };
        match txn {
            None => {
                self.append_wal(&entry)?;
                let affected = self.engine.update(table, filters, updates, None, cancel)?;
                self.mark_dirty(table);
                Ok(affected)
            }
            Some(id) => {
                let affected = self.engine.update(table, filters, updates, Some(id), cancel)?;
                self.stage(id, entry);
                Ok(affected)
            }
        }
    }

    fn delete(
        &self,
        table: &str,
        filters: &[Filter],
        txn: Option<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> CResult<usize> {
        self.ensure_writable()?;
        let entry = WalEntry::Delete { table: table.to_string(), filters: filters.to_vec() };
        match txn {
            None => {
                self.append_wal(&entry)?;
                let affected = self.engine.delete(table, filters, None, cancel)?;
                self.mark_dirty(table);
                Ok(affected)
            }
            Some(id) => {
                let affected = self.engine.delete(table, filters, Some(id), cancel)?;
                self.stage(id, entry);
                Ok(affected)
            }
        }
    }

    fn create_table(&self, schema: Table) -> CResult<()> {
        self.ensure_writable()?;
        self.append_wal(&WalEntry::CreateTable { schema: schema.clone() })?;
        self.engine.create_table(schema.clone())?;
        self.write_sidecars(&schema)?;
        self.mark_dirty(&schema.name);
        Ok(())
    }

    fn drop_table(&self, table: &str) -> CResult<()> {
        self.ensure_writable()?;
        self.append_wal(&WalEntry::DropTable { table: table.to_string() })?;
        self.engine.drop_table(table)?;
        self.pool.remove_table(table);
        let table_dir = self.table_dir(table);
        if table_dir.exists() {
            std::fs::remove_dir_all(&table_dir)?;
        }
        self.dirty.lock().expect("dirty set poisoned").remove(table);
        Ok(())
    }

    fn truncate_table(&self, table: &str, txn: Option<TxnId>) -> CResult<usize> {
        self.ensure_writable()?;
        let entry = WalEntry::Truncate { table: table.to_string() };
        match txn {
            None => {
                self.append_wal(&entry)?;
                let affected = self.engine.truncate(table, None)?;
                self.mark_dirty(table);
                Ok(affected)
            }
            Some(id) => {
                let affected = self.engine.truncate(table, Some(id))?;
                self.stage(id, entry);
                Ok(affected)
            }
        }
    }

    fn create_index(&self, meta: IndexMeta) -> CResult<()> {
        self.ensure_writable()?;
        let table = meta.table.clone();
        self.engine.create_index(meta)?;
        let metas = self.engine.index_metas(&table)?;
        self.persist_index_meta(&table, &metas)
    }

    fn drop_index(&self, table: &str, name: &str) -> CResult<()> {
        self.ensure_writable()?;
        self.engine.drop_index(table, name)?;
        let metas = self.engine.index_metas(table)?;
        self.persist_index_meta(table, &metas)
    }

    fn begin(&self, read_only: bool, isolation: IsolationLevel) -> CResult<TxnId> {
        self.engine.begin(read_only, isolation)
    }

    /// The engine decides the winner first; the accepted write set is then
    /// made durable. A WAL failure here flips the adapter read-only with the
    /// memory state intact.
    fn commit(&self, txn: TxnId) -> CResult<()> {
        let staged = self.staged.lock().expect("staged poisoned").remove(&txn).unwrap_or_default();
        match self.engine.commit(txn) {
            Ok(()) => {
                for entry in &staged {
                    self.append_wal(entry)?;
                    if let Some(table) = wal_entry_table(entry) {
                        self.mark_dirty(&table);
                    }
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn rollback(&self, txn: TxnId) -> CResult<()> {
        self.staged.lock().expect("staged poisoned").remove(&txn);
        self.engine.rollback(txn)
    }

    fn flush(&self) -> CResult<()> {
        self.ensure_writable()?;
        self.checkpoint()
    }

    fn as_index_persister(&self) -> Option<&dyn IndexPersister> {
        Some(self)
    }
}

impl IndexPersister for XmlDatasource {
    fn persist_index_meta(&self, table: &str, metas: &[IndexMeta]) -> CResult<()> {
        let table_dir = self.table_dir(table);
        std::fs::create_dir_all(&table_dir)?;
        write_atomic(&table_dir.join(META_FILE), encode_meta(metas)?.as_bytes())
    }
}

fn wal_entry_table(entry: &WalEntry) -> Option<String> {
    match entry {
        WalEntry::Insert { table, .. }
        | WalEntry::Update { table, .. }
        | WalEntry::Delete { table, .. }
        | WalEntry::DropTable { table }
        | WalEntry::Truncate { table } => Some(table.clone()),
        WalEntry::CreateTable { schema } => Some(schema.name.clone()),
        WalEntry::Checkpoint => None,
    }
}

// --- file naming and atomic writes ---

/// Row-per-file data files are named after the primary-key value.
fn row_file_name(schema: &Table, row: &Row) -> CResult<String> {
    let key = schema.primary_key_of(row).ok_or_else(|| {
        Error::Value(format!("table {} needs a primary key for file-per-row storage", schema.name))
    })?;
    let joined = key.iter().map(Value::to_string).collect::<Vec<_>>().join("_");
    let safe: String = joined
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' || c == '_' { c } else { '_' })
        .collect();
    Ok(format!("{}.xml", safe))
}

/// Writes through a temp file in the same directory and renames over the
/// target, so readers only ever see complete files.
fn write_atomic(path: &Path, bytes: &[u8]) -> CResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
        .map_err(|err| Error::Storage(format!("rename {} failed: {}", tmp.display(), err)))?;
    Ok(())
}

/// Row-per-file write-out, parallelized across a worker pool bounded by the
/// CPU count.
fn write_files_parallel(dir: &Path, files: Vec<(String, Vec<u8>)>) -> CResult<()> {
    if files.is_empty() {
        return Ok(());
    }
    let workers = num_cpus::get().clamp(1, files.len());
    let chunk_size = files.len().div_ceil(workers);

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for chunk in files.chunks(chunk_size) {
            handles.push(scope.spawn(move || -> CResult<()> {
                for (name, bytes) in chunk {
                    std::fs::write(dir.join(name), bytes)?;
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| Error::Internal("row writer thread panicked".to_string()))??;
        }
        Ok(())
    })
}

// --- character encoding ---

/// BOM sniffing with the every-other-byte-zero fallback for BOM-less
/// UTF-16. An explicit adapter encoding option overrides this entirely.
fn sniff_encoding(bytes: &[u8]) -> &'static Encoding {
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return UTF_16LE;
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return UTF_16BE;
    }
    if bytes.len() >= 4 && bytes.len() % 2 == 0 {
        let odd_zeros = bytes.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
        let even_zeros = bytes.iter().step_by(2).filter(|b| **b == 0).count();
        let half = bytes.len() / 2;
        if odd_zeros == half {
            return UTF_16LE;
        }
        if even_zeros == half {
            return UTF_16BE;
        }
    }
    UTF_8
}

fn decode_text(encoding: &'static Encoding, bytes: &[u8]) -> CResult<String> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(Error::Storage(format!("malformed {} text", encoding.name())));
    }
    Ok(text.into_owned())
}

fn encode_text(encoding: &'static Encoding, text: &str) -> Vec<u8> {
    if encoding == UTF_16LE {
        let mut out = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    } else if encoding == UTF_16BE {
        let mut out = vec![0xFE, 0xFF];
        for unit in text.encode_utf16() {
            out.extend_from_slice(&unit.to_be_bytes());
        }
        out
    } else {
        text.as_bytes().to_vec()
    }
}

// --- XML codecs ---

fn attr_map(e: &BytesStart) -> CResult<HashMap<String, String>> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::Storage(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value =
            attr.unescape_value().map_err(|err| Error::Storage(err.to_string()))?.to_string();
        map.insert(key, value);
    }
    Ok(map)
}

fn comma_list(text: &str) -> Vec<String> {
    text.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
}

pub fn encode_schema(table: &Table) -> CResult<String> {
    let mut writer = quick_xml::Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("Schema");
    root.push_attribute(("name", table.name.as_str()));
    root.push_attribute(("engine", table.engine.as_str()));
    root.push_attribute(("rootTag", "Row"));
    root.push_attribute(("storageMode", table.storage_mode.to_string().as_str()));
    if let Some(comment) = &table.comment {
        root.push_attribute(("comment", comment.as_str()));
    }
    writer.write_event(Event::Start(root))?;

    for column in &table.columns {
        let mut e = BytesStart::new("Column");
        e.push_attribute(("name", column.name.as_str()));
        e.push_attribute(("type", column.datatype.to_string().as_str()));
        e.push_attribute(("nullable", if column.nullable { "true" } else { "false" }));
        if column.primary_key {
            e.push_attribute(("primaryKey", "true"));
        }
        if column.unique {
            e.push_attribute(("unique", "true"));
        }
        if column.auto_increment {
            e.push_attribute(("autoIncrement", "true"));
        }
        if let Some(default) = &column.default {
            e.push_attribute(("default", default.to_string().as_str()));
        }
        if let Some(generated) = &column.generated {
            e.push_attribute(("generated", generated.kind.to_string().as_str()));
            e.push_attribute(("expression", generated.expression.as_str()));
            e.push_attribute(("dependsOn", generated.depends_on.join(",").as_str()));
        }
        writer.write_event(Event::Empty(e))?;
    }

    for constraint in &table.constraints {
        match constraint {
            Constraint::Unique { name, columns } => {
                let mut e = BytesStart::new("Unique");
                e.push_attribute(("name", name.as_str()));
                e.push_attribute(("columns", columns.join(",").as_str()));
                writer.write_event(Event::Empty(e))?;
            }
            Constraint::ForeignKey { name, columns, ref_table, ref_columns, on_delete } => {
                let mut e = BytesStart::new("ForeignKey");
                e.push_attribute(("name", name.as_str()));
                e.push_attribute(("columns", columns.join(",").as_str()));
                e.push_attribute(("refTable", ref_table.as_str()));
                e.push_attribute(("refColumns", ref_columns.join(",").as_str()));
                e.push_attribute(("onDelete", on_delete.to_string().as_str()));
                writer.write_event(Event::Empty(e))?;
            }
            Constraint::Check { name, expression } => {
                let mut e = BytesStart::new("Check");
                e.push_attribute(("name", name.as_str()));
                e.push_attribute(("expression", expression.as_str()));
                writer.write_event(Event::Empty(e))?;
            }
        }
    }

    writer.write_event(Event::End(BytesEnd::new("Schema")))?;
    Ok(String::from_utf8(writer.into_inner())?)
}

pub fn decode_schema(text: &str) -> CResult<Table> {
    let mut reader = quick_xml::Reader::from_str(text);
    reader.trim_text(true);

    let mut table: Option<Table> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let attrs = attr_map(&e)?;
                match e.name().as_ref() {
                    b"Schema" => {
                        let name = attrs
                            .get("name")
                            .ok_or_else(|| Error::Storage("schema without name".to_string()))?;
                        let engine = attrs.get("engine").cloned().unwrap_or_else(|| "xml".to_string());
                        let mut t = Table::new(name, &engine, Vec::new());
                        if let Some(mode) = attrs.get("storageMode") {
                            t.storage_mode = mode
                                .parse()
                                .map_err(|_| Error::Storage(format!("bad storageMode {}", mode)))?;
                        }
                        t.comment = attrs.get("comment").cloned();
                        table = Some(t);
                    }
                    b"Column" => {
                        let table = table
                            .as_mut()
                            .ok_or_else(|| Error::Storage("Column outside Schema".to_string()))?;
                        let name = attrs
                            .get("name")
                            .ok_or_else(|| Error::Storage("column without name".to_string()))?;
                        let datatype: DataType = attrs
                            .get("type")
                            .ok_or_else(|| Error::Storage("column without type".to_string()))?
                            .parse()
                            .map_err(|_| Error::Storage("bad column type".to_string()))?;
                        let mut column = Column::new(name, datatype);
                        column.nullable = attrs.get("nullable").map_or(true, |v| v == "true");
                        column.primary_key = attrs.get("primaryKey").map_or(false, |v| v == "true");
                        column.unique = attrs.get("unique").map_or(false, |v| v == "true");
                        column.auto_increment =
                            attrs.get("autoIncrement").map_or(false, |v| v == "true");
                        if let Some(default) = attrs.get("default") {
                            column.default =
                                Some(Value::String(default.clone()).cast(datatype)?);
                        }
                        if let Some(kind) = attrs.get("generated") {
                            let kind: GeneratedKind = kind
                                .parse()
                                .map_err(|_| Error::Storage("bad generated kind".to_string()))?;
                            column.generated = Some(GeneratedSpec {
                                kind,
                                expression: attrs.get("expression").cloned().unwrap_or_default(),
                                depends_on: comma_list(
                                    attrs.get("dependsOn").map(String::as_str).unwrap_or(""),
                                ),
                            });
                        }
                        table.columns.push(column);
                    }
                    b"Unique" => {
                        let table = table
                            .as_mut()
                            .ok_or_else(|| Error::Storage("Unique outside Schema".to_string()))?;
                        table.constraints.push(Constraint::Unique {
                            name: attrs.get("name").cloned().unwrap_or_default(),
                            columns: comma_list(
                                attrs.get("columns").map(String::as_str).unwrap_or(""),
                            ),
                        });
                    }
                    b"ForeignKey" => {
                        let table = table
                            .as_mut()
                            .ok_or_else(|| Error::Storage("ForeignKey outside Schema".to_string()))?;
                        let on_delete: OnDelete = attrs
                            .get("onDelete")
                            .map(|v| {
                                v.parse().map_err(|_| {
                                    Error::Storage(format!("bad onDelete {}", v))
                                })
                            })
                            .transpose()?
                            .unwrap_or_default();
                        table.constraints.push(Constraint::ForeignKey {
                            name: attrs.get("name").cloned().unwrap_or_default(),
                            columns: comma_list(
                                attrs.get("columns").map(String::as_str).unwrap_or(""),
                            ),
                            ref_table: attrs.get("refTable").cloned().unwrap_or_default(),
                            ref_columns: comma_list(
                                attrs.get("refColumns").map(String::as_str).unwrap_or(""),
                            ),
                            on_delete,
                        });
                    }
                    b"Check" => {
                        let table = table
                            .as_mut()
                            .ok_or_else(|| Error::Storage("Check outside Schema".to_string()))?;
                        table.constraints.push(Constraint::Check {
                            name: attrs.get("name").cloned().unwrap_or_default(),
                            expression: attrs.get("expression").cloned().unwrap_or_default(),
                        });
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(err.into()),
        }
    }
    table.ok_or_else(|| Error::Storage("no Schema element found".to_string()))
}

pub fn encode_meta(metas: &[IndexMeta]) -> CResult<String> {
    let mut writer = quick_xml::Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("Meta")))?;
    for meta in metas {
        let mut e = BytesStart::new("Index");
        e.push_attribute(("name", meta.name.as_str()));
        e.push_attribute(("table", meta.table.as_str()));
        e.push_attribute(("type", meta.index_type.to_string().as_str()));
        e.push_attribute(("unique", if meta.unique { "true" } else { "false" }));
        e.push_attribute(("columns", meta.columns.join(",").as_str()));
        writer.write_event(Event::Empty(e))?;
    }
    writer.write_event(Event::End(BytesEnd::new("Meta")))?;
    Ok(String::from_utf8(writer.into_inner())?)
}

pub fn decode_meta(text: &str) -> CResult<Vec<IndexMeta>> {
    let mut reader = quick_xml::Reader::from_str(text);
    reader.trim_text(true);
    let mut metas = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) if e.name().as_ref() == b"Index" => {
                let attrs = attr_map(&e)?;
                let index_type: IndexType = attrs
                    .get("type")
                    .map(String::as_str)
                    .unwrap_or("ordered")
                    .parse()
                    .map_err(|_| Error::Storage("bad index type".to_string()))?;
                metas.push(IndexMeta {
                    name: attrs.get("name").cloned().unwrap_or_default(),
                    table: attrs.get("table").cloned().unwrap_or_default(),
                    index_type,
                    unique: attrs.get("unique").map_or(false, |v| v == "true"),
                    columns: comma_list(attrs.get("columns").map(String::as_str).unwrap_or("")),
                });
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(metas)
}

/// Rows as attribute-only `<Row col="value"/>` elements under a `<Table>`
/// root. NULLs are omitted attributes. Generated VIRTUAL columns are never
/// written.
pub fn encode_rows(schema: &Table, rows: &[Row]) -> CResult<String> {
    let mut writer = quick_xml::Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    let mut root = BytesStart::new("Table");
    root.push_attribute(("name", schema.name.as_str()));
    writer.write_event(Event::Start(root))?;

    for row in rows {
        let mut e = BytesStart::new("Row");
        for column in &schema.columns {
            if column
                .generated
                .as_ref()
                .map_or(false, |g| g.kind == GeneratedKind::Virtual)
            {
                continue;
            }
            let Some(value) = row.get(&column.name) else { continue };
            if value.is_null() {
                continue;
            }
            e.push_attribute((column.name.as_str(), value.to_string().as_str()));
        }
        writer.write_event(Event::Empty(e))?;
    }

    writer.write_event(Event::End(BytesEnd::new("Table")))?;
    Ok(String::from_utf8(writer.into_inner())?)
}

pub fn decode_rows(schema: &Table, text: &str) -> CResult<Vec<Row>> {
    let mut reader = quick_xml::Reader::from_str(text);
    reader.trim_text(true);
    let mut rows = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) if e.name().as_ref() == b"Row" => {
                let attrs = attr_map(&e)?;
                let mut row = Row::new();
                for column in &schema.columns {
                    if let Some(text) = attrs.get(&column.name) {
                        row.insert(
                            column.name.clone(),
                            Value::String(text.clone()).cast(column.datatype)?,
                        );
                    }
                }
                rows.push(row);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sql::plan::FilterOp;
    use crate::sql::row_from;

    fn users_schema(mode: StorageMode) -> Table {
        let mut table = Table::new(
            "users",
            "xml",
            vec![
                Column::new("id", DataType::Integer).primary(),
                Column::new("name", DataType::String).not_null(),
                Column::new("age", DataType::Integer),
            ],
        );
        table.storage_mode = mode;
        table
    }

    fn user(id: i64, name: &str, age: i64) -> Row {
        row_from(vec![
            ("id", Value::Integer(id)),
            ("name", Value::from(name)),
            ("age", Value::Integer(age)),
        ])
    }

    #[test]
    fn schema_round_trip() {
        use pretty_assertions::assert_eq;
        let mut table = users_schema(StorageMode::SingleFile);
        table.columns[2].default = Some(Value::Integer(18));
        table = table.with_constraint(Constraint::Check {
            name: "age_ok".to_string(),
            expression: "age >= 0".to_string(),
        });
        let text = encode_schema(&table).unwrap();
        let decoded = decode_schema(&text).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn meta_round_trip() {
        let metas = vec![IndexMeta {
            name: "age_idx".to_string(),
            table: "users".to_string(),
            index_type: IndexType::Hash,
            unique: false,
            columns: vec!["age".to_string()],
        }];
        let text = encode_meta(&metas).unwrap();
        assert_eq!(decode_meta(&text).unwrap(), metas);
    }

    #[test]
    fn rows_round_trip_with_escaping_and_nulls() {
        let schema = users_schema(StorageMode::SingleFile);
        let rows = vec![
            user(1, "a <quoted> & \"name\"", 30),
            row_from(vec![("id", Value::Integer(2)), ("name", Value::from("b"))]),
        ];
        let text = encode_rows(&schema, &rows).unwrap();
        let decoded = decode_rows(&schema, &text).unwrap();
        assert_eq!(decoded[0].get("name"), rows[0].get("name"));
        // Omitted attribute reads back as absent, normalized to NULL later.
        assert_eq!(decoded[1].get("age"), None);
    }

    #[test]
    fn flush_reopen_round_trip_single_file() -> CResult<()> {
        let dir = tempdir::TempDir::new("xmldb")?;
        let path = dir.path().join("db");
        {
            let source = XmlDatasource::open(path.clone())?;
            source.connect()?;
            source.create_table(users_schema(StorageMode::SingleFile))?;
            source.insert("users", vec![user(1, "ann", 30), user(2, "bob", 40)], None)?;
            source.flush()?;
            source.close()?;
        }
        let source = XmlDatasource::open(path)?;
        source.connect()?;
        let rs = source.query("users", &QueryOptions::default(), None, None)?;
        assert_eq!(rs.total, 2);
        Ok(())
    }

    #[test]
    fn wal_replay_recovers_unflushed_writes() -> CResult<()> {
        let dir = tempdir::TempDir::new("xmldb")?;
        let path = dir.path().join("db");
        {
            let source = XmlDatasource::open(path.clone())?;
            source.connect()?;
            source.create_table(users_schema(StorageMode::SingleFile))?;
            source.insert("users", vec![user(1, "a", 1), user(2, "b", 2)], None)?;
            // Simulated crash: the adapter is dropped without flush/close.
        }
        let source = XmlDatasource::open(path)?;
        source.connect()?;
        let rs = source.query("users", &QueryOptions::default(), None, None)?;
        assert_eq!(rs.total, 2);
        Ok(())
    }

    #[test]
    fn checkpoint_truncates_the_wal() -> CResult<()> {
        let dir = tempdir::TempDir::new("xmldb")?;
        let path = dir.path().join("db");
        let source = XmlDatasource::open(path.clone())?;
        source.connect()?;
        source.create_table(users_schema(StorageMode::SingleFile))?;
        source.insert("users", vec![user(1, "a", 1)], None)?;
        source.flush()?;
        // Checkpoint then empty log; an immediate second flush is a no-op.
        assert_eq!(std::fs::metadata(path.join(WAL_FILE))?.len(), 0);
        source.flush()?;
        assert_eq!(std::fs::metadata(path.join(WAL_FILE))?.len(), 0);
        Ok(())
    }

    #[test]
    fn orphan_row_files_are_removed() -> CResult<()> {
        let dir = tempdir::TempDir::new("xmldb")?;
        let path = dir.path().join("db");
        let source = XmlDatasource::open(path.clone())?;
        source.connect()?;
        source.create_table(users_schema(StorageMode::FilePerRow))?;
        source.insert("users", vec![user(1, "a", 1), user(2, "b", 2), user(3, "c", 3)], None)?;
        source.flush()?;

        let table_dir = path.join("users");
        assert!(table_dir.join("2.xml").exists());

        source.delete("users", &[Filter::new("id", FilterOp::Eq, Value::Integer(2))], None, None)?;
        source.flush()?;

        let mut names: Vec<String> = std::fs::read_dir(&table_dir)?
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["1.xml", "3.xml", META_FILE, SCHEMA_FILE]);
        Ok(())
    }

    #[test]
    fn rolled_back_transaction_never_reaches_the_wal() -> CResult<()> {
        let dir = tempdir::TempDir::new("xmldb")?;
        let path = dir.path().join("db");
        {
            let source = XmlDatasource::open(path.clone())?;
            source.connect()?;
            source.create_table(users_schema(StorageMode::SingleFile))?;
            let txn = source.begin(false, IsolationLevel::Snapshot)?;
            source.insert("users", vec![user(1, "ghost", 1)], Some(txn))?;
            source.rollback(txn)?;
            let txn = source.begin(false, IsolationLevel::Snapshot)?;
            source.insert("users", vec![user(2, "real", 2)], Some(txn))?;
            source.commit(txn)?;
        }
        let source = XmlDatasource::open(path)?;
        source.connect()?;
        let rs = source.query("users", &QueryOptions::default(), None, None)?;
        assert_eq!(rs.total, 1);
        assert_eq!(rs.rows[0].get("name"), Some(&Value::from("real")));
        Ok(())
    }

    #[test]
    fn indexes_rebuild_from_sidecar_meta() -> CResult<()> {
        let dir = tempdir::TempDir::new("xmldb")?;
        let path = dir.path().join("db");
        {
            let source = XmlDatasource::open(path.clone())?;
            source.connect()?;
            source.create_table(users_schema(StorageMode::SingleFile))?;
            source.insert("users", vec![user(1, "a", 10), user(2, "b", 20)], None)?;
            source.create_index(IndexMeta {
                name: "age_idx".to_string(),
                table: "users".to_string(),
                index_type: IndexType::Ordered,
                unique: false,
                columns: vec!["age".to_string()],
            })?;
            source.flush()?;
            source.close()?;
        }
        let source = XmlDatasource::open(path)?;
        source.connect()?;
        let metas = source.engine().index_metas("users")?;
        assert!(metas.iter().any(|m| m.name == "age_idx"));
        Ok(())
    }

    #[test]
    fn utf16_files_are_sniffed_and_round_tripped() -> CResult<()> {
        let dir = tempdir::TempDir::new("xmldb")?;
        let path = dir.path().join("db");
        let schema = users_schema(StorageMode::SingleFile);

        // Seed the directory by hand with UTF-16LE files.
        let table_dir = path.join("users");
        std::fs::create_dir_all(&table_dir)?;
        std::fs::write(
            table_dir.join(SCHEMA_FILE),
            encode_text(UTF_16LE, &encode_schema(&schema)?),
        )?;
        std::fs::write(
            table_dir.join(DATA_FILE),
            encode_text(UTF_16LE, &encode_rows(&schema, &[user(1, "宽字节", 1)])?),
        )?;

        let source = XmlDatasource::open(path.clone())?;
        source.connect()?;
        let rs = source.query("users", &QueryOptions::default(), None, None)?;
        assert_eq!(rs.total, 1);
        assert_eq!(rs.rows[0].get("name"), Some(&Value::from("宽字节")));

        // A write re-encodes to the original encoding.
        source.insert("users", vec![user(2, "b", 2)], None)?;
        source.flush()?;
        let bytes = std::fs::read(table_dir.join(DATA_FILE))?;
        assert!(bytes.starts_with(&[0xFF, 0xFE]));
        Ok(())
    }

    #[test]
    fn sniffer_detects_boms_and_bomless_utf16() {
        assert_eq!(sniff_encoding(&[0xFF, 0xFE, 0x41, 0x00]), UTF_16LE);
        assert_eq!(sniff_encoding(&[0xFE, 0xFF, 0x00, 0x41]), UTF_16BE);
        assert_eq!(sniff_encoding(&[0x41, 0x00, 0x42, 0x00]), UTF_16LE);
        assert_eq!(sniff_encoding(&[0x00, 0x41, 0x00, 0x42]), UTF_16BE);
        assert_eq!(sniff_encoding(b"<Table/>"), UTF_8);
    }

    #[test]
    fn stale_temp_files_are_cleaned_on_load() -> CResult<()> {
        let dir = tempdir::TempDir::new("xmldb")?;
        let path = dir.path().join("db");
        {
            let source = XmlDatasource::open(path.clone())?;
            source.connect()?;
            source.create_table(users_schema(StorageMode::SingleFile))?;
            source.insert("users", vec![user(1, "a", 1)], None)?;
            source.flush()?;
        }
        // An interrupted checkpoint left a temp file behind.
        std::fs::write(path.join("users").join("data.tmp"), b"partial")?;

        let source = XmlDatasource::open(path.clone())?;
        source.connect()?;
        assert!(!path.join("users").join("data.tmp").exists());
        assert_eq!(source.query("users", &QueryOptions::default(), None, None)?.total, 1);
        Ok(())
    }
}
