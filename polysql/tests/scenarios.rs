//! End-to-end scenarios across the session, executor, MVCC and persistence
//! layers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use polysql::config::EngineConfig;
use polysql::datasource::xml::XmlDatasource;
use polysql::datasource::Datasource;
use polysql::error::{CResult, Error};
use polysql::session::Runtime;
use polysql::sql::plan::{Filter, FilterOp, QueryOptions, SqlParser, Statement, UpdateSet};
use polysql::sql::row_from;
use polysql::sql::schema::{Column, GeneratedKind, Table};
use polysql::sql::value::{DataType, Value};
use polysql::sql::Row;

/// Canned-statement parser; the real SQL frontend is outside the core.
struct StubParser {
    map: Mutex<HashMap<String, Statement>>,
}

impl StubParser {
    fn new() -> Arc<Self> {
        Arc::new(Self { map: Mutex::new(HashMap::new()) })
    }

    fn learn(&self, sql: &str, stmt: Statement) {
        self.map.lock().unwrap().insert(sql.to_string(), stmt);
    }
}

impl SqlParser for StubParser {
    fn parse(&self, sql: &str) -> CResult<Statement> {
        self.map
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .ok_or_else(|| Error::Parse(format!("unknown statement: {}", sql)))
    }
}

fn items_schema() -> Table {
    Table::new(
        "items",
        "xml",
        vec![
            Column::new("id", DataType::Integer).primary(),
            Column::new("label", DataType::String),
            Column::new("qty", DataType::Integer),
        ],
    )
}

fn item(id: i64, label: &str, qty: i64) -> Row {
    row_from(vec![
        ("id", Value::Integer(id)),
        ("label", Value::from(label)),
        ("qty", Value::Integer(qty)),
    ])
}

#[test]
fn session_dml_persists_across_crash_and_restart() -> CResult<()> {
    let dir = tempdir::TempDir::new("polysql")?;
    let db_path = dir.path().join("shop");

    let parser = StubParser::new();
    parser.learn("CREATE", Statement::CreateTable { schema: items_schema() });
    parser.learn(
        "INSERT",
        Statement::Insert { table: "items".to_string(), rows: vec![item(1, "a", 1), item(2, "b", 2)] },
    );
    parser.learn(
        "SELECT",
        Statement::Query { table: "items".to_string(), options: QueryOptions::default() },
    );

    {
        let runtime = Runtime::new(EngineConfig::default(), parser.clone());
        runtime.register_database("shop", Arc::new(XmlDatasource::open(db_path.clone())?))?;
        let session = runtime.create_session();
        session.set_current_db("shop")?;
        session.execute_ddl("CREATE")?;
        assert_eq!(session.execute_insert("INSERT", None)?, 2);
        session.close()?;
        // No flush: the runtime is dropped as if the process died. The WAL
        // carries the mutations.
    }

    let runtime = Runtime::new(EngineConfig::default(), parser);
    runtime.register_database("shop", Arc::new(XmlDatasource::open(db_path)?))?;
    let session = runtime.create_session();
    session.set_current_db("shop")?;
    let rs = session.execute_query("SELECT")?;
    assert_eq!(rs.total, 2);
    session.close()?;
    runtime.shutdown()
}

#[test]
fn flush_reopen_equals_pre_flush_query() -> CResult<()> {
    let dir = tempdir::TempDir::new("polysql")?;
    let db_path = dir.path().join("shop");

    let source = XmlDatasource::open(db_path.clone())?;
    source.connect()?;
    source.create_table(items_schema())?;
    source.insert("items", vec![item(1, "a", 10), item(2, "b", 20), item(3, "c", 30)], None)?;
    source.delete("items", &[Filter::new("id", FilterOp::Eq, Value::Integer(2))], None, None)?;

    let before = source.query("items", &QueryOptions::default(), None, None)?;
    source.flush()?;
    source.close()?;
    drop(source);

    let source = XmlDatasource::open(db_path)?;
    source.connect()?;
    let after = source.query("items", &QueryOptions::default(), None, None)?;
    assert_eq!(before.rows, after.rows);
    assert_eq!(before.total, after.total);
    Ok(())
}

#[test]
fn checkpoint_is_idempotent() -> CResult<()> {
    let dir = tempdir::TempDir::new("polysql")?;
    let db_path = dir.path().join("shop");

    let source = XmlDatasource::open(db_path.clone())?;
    source.connect()?;
    source.create_table(items_schema())?;
    source.insert("items", vec![item(1, "a", 1)], None)?;
    source.flush()?;

    let snapshot = |path: &std::path::Path| -> CResult<Vec<(String, u64)>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(path.join("items"))? {
            let entry = entry?;
            files.push((
                entry.file_name().to_string_lossy().to_string(),
                entry.metadata()?.len(),
            ));
        }
        files.sort();
        Ok(files)
    };

    let first = snapshot(&db_path)?;
    source.flush()?; // nothing dirty: no new durable entries
    let second = snapshot(&db_path)?;
    assert_eq!(first, second);
    assert_eq!(std::fs::metadata(db_path.join("wal.log"))?.len(), 0);
    Ok(())
}

#[test]
fn generated_column_cascade_through_a_session() -> CResult<()> {
    let schema = Table::new(
        "calc",
        "xml",
        vec![
            Column::new("a", DataType::Integer).primary(),
            Column::new("b", DataType::Integer).with_generated(GeneratedKind::Stored, "a * 2", vec!["a"]),
            Column::new("c", DataType::Integer).with_generated(GeneratedKind::Stored, "b + 1", vec!["b"]),
        ],
    );

    let dir = tempdir::TempDir::new("polysql")?;
    let parser = StubParser::new();
    parser.learn("CREATE", Statement::CreateTable { schema });
    parser.learn(
        "INSERT",
        Statement::Insert {
            table: "calc".to_string(),
            rows: vec![row_from(vec![("a", Value::Integer(5))])],
        },
    );
    parser.learn(
        "UPDATE",
        Statement::Update {
            table: "calc".to_string(),
            filters: vec![Filter::new("a", FilterOp::Eq, Value::Integer(5))],
            updates: [("a".to_string(), Value::Integer(7))].into_iter().collect::<UpdateSet>(),
        },
    );
    parser.learn(
        "SELECT",
        Statement::Query { table: "calc".to_string(), options: QueryOptions::default() },
    );

    let runtime = Runtime::new(EngineConfig::default(), parser);
    runtime
        .register_database("db", Arc::new(XmlDatasource::open(dir.path().join("db"))?))?;
    let session = runtime.create_session();
    session.set_current_db("db")?;
    session.execute_ddl("CREATE")?;
    session.execute_insert("INSERT", None)?;

    let rs = session.execute_query("SELECT")?;
    assert_eq!(rs.rows[0].get("b"), Some(&Value::Integer(10)));
    assert_eq!(rs.rows[0].get("c"), Some(&Value::Integer(11)));

    session.execute_update("UPDATE", None, None)?;
    let rs = session.execute_query("SELECT")?;
    assert_eq!(rs.rows[0].get("a"), Some(&Value::Integer(7)));
    assert_eq!(rs.rows[0].get("b"), Some(&Value::Integer(14)));
    assert_eq!(rs.rows[0].get("c"), Some(&Value::Integer(15)));
    session.close()?;
    runtime.shutdown()
}

#[test]
fn concurrent_sessions_conflict_on_a_common_row() -> CResult<()> {
    let dir = tempdir::TempDir::new("polysql")?;
    let source = Arc::new(XmlDatasource::open(dir.path().join("db"))?);
    source.connect()?;
    source.create_table(items_schema())?;
    source.insert("items", vec![item(1, "a", 1)], None)?;

    use polysql::mvcc::transaction::IsolationLevel;
    let t1 = source.begin(false, IsolationLevel::Snapshot)?;
    let t2 = source.begin(false, IsolationLevel::Snapshot)?;

    let filters = vec![Filter::new("id", FilterOp::Eq, Value::Integer(1))];
    let set = |v: i64| -> UpdateSet { [("qty".to_string(), Value::Integer(v))].into_iter().collect() };

    source.update("items", &filters, &set(2), Some(t1), None)?;
    source.commit(t1)?;

    source.update("items", &filters, &set(3), Some(t2), None)?;
    assert_eq!(source.commit(t2), Err(Error::WriteConflict));

    let rs = source.query("items", &QueryOptions::default(), None, None)?;
    assert_eq!(rs.rows[0].get("qty"), Some(&Value::Integer(2)));
    Ok(())
}

#[test]
fn wal_survives_a_mid_transaction_crash() -> CResult<()> {
    let dir = tempdir::TempDir::new("polysql")?;
    let db_path = dir.path().join("db");
    {
        let source = XmlDatasource::open(db_path.clone())?;
        source.connect()?;
        source.create_table(items_schema())?;

        use polysql::mvcc::transaction::IsolationLevel;
        // A committed transaction is durable; an open one dies with the
        // process and leaves nothing behind.
        let committed = source.begin(false, IsolationLevel::Snapshot)?;
        source.insert("items", vec![item(1, "kept", 1)], Some(committed))?;
        source.commit(committed)?;

        let open = source.begin(false, IsolationLevel::Snapshot)?;
        source.insert("items", vec![item(2, "lost", 2)], Some(open))?;
        // Crash with the transaction open.
    }

    let source = XmlDatasource::open(db_path)?;
    source.connect()?;
    let rs = source.query("items", &QueryOptions::default(), None, None)?;
    assert_eq!(rs.total, 1);
    assert_eq!(rs.rows[0].get("label"), Some(&Value::from("kept")));
    Ok(())
}
