//! Per-connection sessions and the runtime that owns them.
//!
//! A [`Runtime`] is the dependency-injection handle the design calls for:
//! it carries the config, the registered databases, the external parser and
//! the access-control hook. Sessions are created from it, execute statements
//! one at a time, and coordinate with the global query registry for KILL and
//! timeouts.

pub mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::datasource::memory::MemoryDatasource;
use crate::datasource::Datasource;
use crate::config::EngineConfig;
use crate::error::{CResult, Error};
use crate::exec::{self, AccessControl, AllowAll, ExecResult};
use crate::mvcc::transaction::IsolationLevel;
use crate::mvcc::TxnId;
use crate::session::registry::{arm_timeout, extract_trace_id, QueryContext, QueryRegistry};
use crate::sql::plan::{Filter, ResultSet, SqlParser, Statement, UpdateSet};
use crate::sql::value::Value;
use crate::sql::Row;

/// Session ids are process-global so the default thread id (the truncated
/// session id) stays unique across runtimes; KILL addresses threads
/// globally.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process runtime: configuration, registered databases, parser and ACL.
pub struct Runtime {
    config: EngineConfig,
    parser: Arc<dyn SqlParser>,
    acl: Arc<dyn AccessControl>,
    sources: Mutex<HashMap<String, Arc<dyn Datasource>>>,
    /// Sessions are owned by their connections; the runtime holds weak
    /// references so an abandoned session cannot pin the process.
    sessions: Mutex<HashMap<u64, Weak<Session>>>,
}

impl Runtime {
    pub fn new(config: EngineConfig, parser: Arc<dyn SqlParser>) -> Arc<Self> {
        Self::with_access_control(config, parser, Arc::new(AllowAll))
    }

    pub fn with_access_control(
        config: EngineConfig,
        parser: Arc<dyn SqlParser>,
        acl: Arc<dyn AccessControl>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            parser,
            acl,
            sources: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers a database under a name and connects it.
    pub fn register_database(&self, name: &str, source: Arc<dyn Datasource>) -> CResult<()> {
        source.connect()?;
        self.sources.lock().expect("sources poisoned").insert(name.to_string(), source);
        Ok(())
    }

    pub fn database(&self, name: &str) -> CResult<Arc<dyn Datasource>> {
        self.sources
            .lock()
            .expect("sources poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DatabaseNotFound(name.to_string()))
    }

    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.sources.lock().expect("sources poisoned").keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create_session(self: &Arc<Self>) -> Arc<Session> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(id, self.clone()));
        self.sessions.lock().expect("sessions poisoned").insert(id, Arc::downgrade(&session));
        session
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .expect("sessions poisoned")
            .values()
            .filter(|s| s.upgrade().is_some())
            .count()
    }

    fn remove_session(&self, id: u64) {
        self.sessions.lock().expect("sessions poisoned").remove(&id);
    }

    /// Closes sessions idle longer than `session_max_age` and prunes dead
    /// entries. Returns how many were collected.
    pub fn gc_sessions(&self) -> usize {
        let stale: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().expect("sessions poisoned");
            sessions.retain(|_, s| s.upgrade().is_some());
            sessions
                .values()
                .filter_map(Weak::upgrade)
                .filter(|s| s.idle_for() > self.config.session_max_age())
                .collect()
        };
        for session in &stale {
            log::info!("garbage-collecting idle session {}", session.id());
            if let Err(err) = session.close() {
                log::error!("failed to close idle session {}: {}", session.id(), err);
            }
        }
        stale.len()
    }

    /// Flushes every registered database.
    pub fn flush_all(&self) -> CResult<()> {
        let sources: Vec<Arc<dyn Datasource>> =
            self.sources.lock().expect("sources poisoned").values().cloned().collect();
        for source in sources {
            source.flush()?;
        }
        Ok(())
    }

    /// Closes all sessions and databases.
    pub fn shutdown(&self) -> CResult<()> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .expect("sessions poisoned")
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for session in sessions {
            session.close()?;
        }
        let sources: Vec<Arc<dyn Datasource>> =
            self.sources.lock().expect("sources poisoned").values().cloned().collect();
        for source in sources {
            source.close()?;
        }
        Ok(())
    }
}

struct SessionState {
    thread_id: u32,
    user: Option<String>,
    host: Option<String>,
    current_db: Option<String>,
    autocommit: bool,
    vars: HashMap<String, Value>,
    txn: Option<TxnId>,
    txn_db: Option<String>,
    temp_tables: Vec<String>,
    timeout: Option<Duration>,
    trace_id: Option<String>,
    sequence: u64,
    last_active: Instant,
    closed: bool,
}

/// One connection's state: current database, autocommit, variables, an
/// optional open transaction and session-private temp tables. Statements
/// execute strictly in submission order; each registers with the query
/// registry for the duration of its run.
pub struct Session {
    id: u64,
    runtime: Arc<Runtime>,
    /// Session-private temp tables, dropped wholesale on close.
    temp: MemoryDatasource,
    st: Mutex<SessionState>,
}

impl Session {
    fn new(id: u64, runtime: Arc<Runtime>) -> Self {
        let temp = MemoryDatasource::new();
        let _ = temp.connect();
        Self {
            id,
            runtime,
            temp,
            st: Mutex::new(SessionState {
                thread_id: id as u32,
                user: None,
                host: None,
                current_db: None,
                autocommit: true,
                vars: HashMap::new(),
                txn: None,
                txn_db: None,
                temp_tables: Vec::new(),
                timeout: None,
                trace_id: None,
                sequence: 0,
                last_active: Instant::now(),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.st.lock().expect("session state poisoned")
    }

    pub fn idle_for(&self) -> Duration {
        self.lock().last_active.elapsed()
    }

    // --- knobs ---

    pub fn set_thread_id(&self, thread_id: u32) {
        self.lock().thread_id = thread_id;
    }

    pub fn thread_id(&self) -> u32 {
        self.lock().thread_id
    }

    pub fn set_user(&self, user: &str, host: &str) {
        let mut st = self.lock();
        st.user = Some(user.to_string());
        st.host = Some(host.to_string());
    }

    pub fn set_query_timeout(&self, timeout: Option<Duration>) {
        self.lock().timeout = timeout;
    }

    pub fn set_trace_id(&self, trace_id: &str) {
        self.lock().trace_id = Some(trace_id.to_string());
    }

    pub fn get_current_db(&self) -> Option<String> {
        self.lock().current_db.clone()
    }

    pub fn set_current_db(&self, name: &str) -> CResult<()> {
        self.runtime.database(name)?;
        self.lock().current_db = Some(name.to_string());
        Ok(())
    }

    pub fn set_variable(&self, name: &str, value: Value) {
        self.lock().vars.insert(name.to_string(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.lock().vars.get(name).cloned()
    }

    pub fn autocommit(&self) -> bool {
        self.lock().autocommit
    }

    pub fn set_autocommit(&self, on: bool) {
        self.lock().autocommit = on;
    }

    // --- statement entry points ---

    pub fn execute_query(&self, sql: &str) -> CResult<ResultSet> {
        match self.execute(sql)? {
            ExecResult::Rows(rs) => Ok(rs),
            other => Err(Error::Value(format!("statement did not produce rows: {:?}", other))),
        }
    }

    /// INSERT with optional pre-bound rows replacing the parsed ones (the
    /// wire layer binds bulk payloads without re-encoding them as SQL).
    pub fn execute_insert(&self, sql: &str, rows: Option<Vec<Row>>) -> CResult<usize> {
        let stmt = self.parse(sql)?;
        let stmt = match (stmt, rows) {
            (Statement::Insert { table, .. }, Some(rows)) => Statement::Insert { table, rows },
            (stmt @ Statement::Insert { .. }, None) => stmt,
            _ => return Err(Error::Value("execute_insert requires an INSERT".to_string())),
        };
        Ok(self.run_parsed(sql, stmt)?.affected())
    }

    pub fn execute_update(
        &self,
        sql: &str,
        filters: Option<Vec<Filter>>,
        updates: Option<UpdateSet>,
    ) -> CResult<usize> {
        let stmt = self.parse(sql)?;
        let stmt = match stmt {
            Statement::Update { table, filters: parsed_filters, updates: parsed_updates } => {
                Statement::Update {
                    table,
                    filters: filters.unwrap_or(parsed_filters),
                    updates: updates.unwrap_or(parsed_updates),
                }
            }
            _ => return Err(Error::Value("execute_update requires an UPDATE".to_string())),
        };
        Ok(self.run_parsed(sql, stmt)?.affected())
    }

    pub fn execute_delete(&self, sql: &str, filters: Option<Vec<Filter>>) -> CResult<usize> {
        let stmt = self.parse(sql)?;
        let stmt = match stmt {
            Statement::Delete { table, filters: parsed_filters } => {
                Statement::Delete { table, filters: filters.unwrap_or(parsed_filters) }
            }
            _ => return Err(Error::Value("execute_delete requires a DELETE".to_string())),
        };
        Ok(self.run_parsed(sql, stmt)?.affected())
    }

    pub fn execute_ddl(&self, sql: &str) -> CResult<usize> {
        let stmt = self.parse(sql)?;
        match stmt {
            Statement::CreateTable { .. }
            | Statement::DropTable { .. }
            | Statement::Truncate { .. }
            | Statement::CreateIndex { .. }
            | Statement::DropIndex { .. } => Ok(self.run_parsed(sql, stmt)?.affected()),
            _ => Err(Error::Value("execute_ddl requires a DDL statement".to_string())),
        }
    }

    /// Parses and executes any statement, including transaction control.
    pub fn execute(&self, sql: &str) -> CResult<ExecResult> {
        let stmt = self.parse(sql)?;
        match stmt {
            Statement::Begin { read_only } => {
                self.begin_tx(read_only)?;
                Ok(ExecResult::None)
            }
            Statement::Commit => {
                self.commit_tx()?;
                Ok(ExecResult::None)
            }
            Statement::Rollback => {
                self.rollback_tx()?;
                Ok(ExecResult::None)
            }
            Statement::Kill { thread_id } => {
                QueryRegistry::global().kill(thread_id)?;
                Ok(ExecResult::None)
            }
            stmt => self.run_parsed(sql, stmt),
        }
    }

    // --- transactions ---

    /// Opens a transaction on the current database. An already-open
    /// transaction is committed first, as MySQL does on BEGIN.
    pub fn begin_tx(&self, read_only: bool) -> CResult<TxnId> {
        if self.lock().txn.is_some() {
            self.commit_tx()?;
        }
        let db = self
            .get_current_db()
            .ok_or_else(|| Error::DatabaseNotFound("no database selected".to_string()))?;
        let source = self.runtime.database(&db)?;
        let txn = source.begin(read_only, IsolationLevel::default())?;
        let mut st = self.lock();
        st.txn = Some(txn);
        st.txn_db = Some(db);
        st.last_active = Instant::now();
        Ok(txn)
    }

    pub fn commit_tx(&self) -> CResult<()> {
        let (txn, db) = {
            let mut st = self.lock();
            let txn = st.txn.take().ok_or_else(|| {
                Error::Internal("no transaction is open on this session".to_string())
            })?;
            (txn, st.txn_db.take())
        };
        let db = db.ok_or_else(|| Error::Internal("transaction lost its database".to_string()))?;
        self.runtime.database(&db)?.commit(txn)
    }

    pub fn rollback_tx(&self) -> CResult<()> {
        let (txn, db) = {
            let mut st = self.lock();
            let txn = st.txn.take().ok_or_else(|| {
                Error::Internal("no transaction is open on this session".to_string())
            })?;
            (txn, st.txn_db.take())
        };
        let db = db.ok_or_else(|| Error::Internal("transaction lost its database".to_string()))?;
        self.runtime.database(&db)?.rollback(txn)
    }

    /// Closes the session: rolls back any open transaction, drops temp
    /// tables, unregisters any in-flight query.
    pub fn close(&self) -> CResult<()> {
        {
            let mut st = self.lock();
            if st.closed {
                return Ok(());
            }
            st.closed = true;
        }
        if self.lock().txn.is_some() {
            if let Err(err) = self.rollback_tx() {
                log::error!("rollback on session {} close failed: {}", self.id, err);
            }
        }
        let temp_tables: Vec<String> = std::mem::take(&mut self.lock().temp_tables);
        for table in temp_tables {
            if let Err(err) = self.temp.drop_table(&table) {
                log::error!("dropping temp table {} failed: {}", table, err);
            }
        }
        let thread_id = self.lock().thread_id;
        if let Some(ctx) = QueryRegistry::global().current(thread_id) {
            ctx.cancel.kill();
            QueryRegistry::global().unregister(&ctx.id);
        }
        self.temp.close()?;
        self.runtime.remove_session(self.id);
        Ok(())
    }

    // --- internals ---

    fn parse(&self, sql: &str) -> CResult<Statement> {
        let (trace_id, stripped) = extract_trace_id(sql);
        if let Some(trace_id) = trace_id {
            self.lock().trace_id = Some(trace_id);
        }
        self.runtime.parser.parse(stripped)
    }

    /// The shared execution path: register with the query registry, arm the
    /// timeout, dispatch, and handle cancellation fallout.
    fn run_parsed(&self, sql: &str, stmt: Statement) -> CResult<ExecResult> {
        let (thread_id, user, host, db, timeout, trace_id) = {
            let mut st = self.lock();
            if st.closed {
                return Err(Error::Internal("session is closed".to_string()));
            }
            st.sequence += 1;
            st.last_active = Instant::now();
            (
                st.thread_id,
                st.user.clone(),
                st.host.clone(),
                st.current_db.clone(),
                st.timeout,
                st.trace_id.clone(),
            )
        };

        let mut ctx = QueryContext::new(thread_id, sql);
        ctx.user = user.clone();
        ctx.host = host;
        ctx.database = db.clone();
        ctx.trace_id = trace_id.clone();
        let ctx = QueryRegistry::global().register(ctx);
        match timeout {
            // A zero timeout is already expired.
            Some(t) if t.is_zero() => ctx.cancel.time_out(),
            Some(t) => arm_timeout(ctx.cancel.clone(), t),
            None => {}
        }
        if let Some(trace_id) = &trace_id {
            log::debug!("[trace_id={}] executing {}", trace_id, ctx.id);
        }

        let result = self.dispatch_stmt(&stmt, &db, user.as_deref(), &ctx.cancel);

        QueryRegistry::global().unregister(&ctx.id);

        if let Err(err) = &result {
            if matches!(err, Error::Timeout | Error::Killed) && self.lock().txn.is_some() {
                // A cancelled writer aborts its transaction.
                if let Err(rollback_err) = self.rollback_tx() {
                    log::error!("rollback after cancellation failed: {}", rollback_err);
                }
            }
        }
        result
    }

    fn dispatch_stmt(
        &self,
        stmt: &Statement,
        db: &Option<String>,
        user: Option<&str>,
        cancel: &crate::cancel::CancelToken,
    ) -> CResult<ExecResult> {
        // Temp tables shadow database tables, and temp DDL stays local.
        if let Statement::CreateTable { schema } = stmt {
            if schema.engine == "temp" {
                let mut schema = schema.clone();
                schema.engine = "memory".to_string();
                let name = schema.name.clone();
                self.temp.create_table(schema)?;
                self.lock().temp_tables.push(name);
                return Ok(ExecResult::Affected(0));
            }
        }
        if let Some(table) = statement_table(stmt) {
            let is_temp = self.lock().temp_tables.contains(&table.to_string());
            if is_temp {
                if let Statement::DropTable { table } = stmt {
                    self.lock().temp_tables.retain(|t| t != table);
                }
                return exec::dispatch(
                    &self.temp,
                    stmt.clone(),
                    None,
                    Some(cancel),
                    user,
                    self.runtime.acl.as_ref(),
                );
            }
        }

        let db = db
            .clone()
            .ok_or_else(|| Error::DatabaseNotFound("no database selected".to_string()))?;
        let source = self.runtime.database(&db)?;

        // With autocommit off, the first statement opens a transaction that
        // stays open until an explicit COMMIT or ROLLBACK.
        let implicit_begin = {
            let st = self.lock();
            !st.autocommit
                && st.txn.is_none()
                && matches!(
                    stmt,
                    Statement::Query { .. }
                        | Statement::Insert { .. }
                        | Statement::Update { .. }
                        | Statement::Delete { .. }
                        | Statement::Truncate { .. }
                )
        };
        if implicit_begin {
            self.begin_tx(false)?;
        }

        let txn = {
            let st = self.lock();
            if st.txn_db.as_deref() == Some(db.as_str()) {
                st.txn
            } else {
                None
            }
        };
        exec::dispatch(
            source.as_ref(),
            stmt.clone(),
            txn,
            Some(cancel),
            user,
            self.runtime.acl.as_ref(),
        )
    }
}

fn statement_table(stmt: &Statement) -> Option<&str> {
    match stmt {
        Statement::Query { table, .. }
        | Statement::Insert { table, .. }
        | Statement::Update { table, .. }
        | Statement::Delete { table, .. }
        | Statement::DropTable { table }
        | Statement::Truncate { table }
        | Statement::CreateIndex { table, .. }
        | Statement::DropIndex { table, .. } => Some(table),
        Statement::CreateTable { schema } => Some(&schema.name),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use serial_test::serial;

    use super::*;
    use crate::sql::plan::{FilterOp, QueryOptions};
    use crate::sql::row_from;
    use crate::sql::schema::{Column, Table};
    use crate::sql::value::DataType;

    /// A canned-statement parser: maps exact SQL strings to statements.
    /// The real parser is an external collaborator.
    struct StubParser {
        map: Mutex<HashMap<String, Statement>>,
    }

    impl StubParser {
        fn new() -> Self {
            Self { map: Mutex::new(HashMap::new()) }
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

    fn runtime_with_db() -> (Arc<Runtime>, Arc<StubParser>) {
        let parser = Arc::new(StubParser::new());
        let runtime = Runtime::new(EngineConfig::default(), parser.clone());
        let source = Arc::new(MemoryDatasource::new());
        runtime.register_database("app", source).unwrap();
        let session = runtime.create_session();
        session.set_current_db("app").unwrap();
        session
            .runtime
            .database("app")
            .unwrap()
            .create_table(Table::new(
                "users",
                "memory",
                vec![
                    Column::new("id", DataType::Integer).primary(),
                    Column::new("name", DataType::String),
                ],
            ))
            .unwrap();
        session.close().unwrap();
        (runtime, parser)
    }

    fn insert_stmt(id: i64, name: &str) -> Statement {
        Statement::Insert {
            table: "users".to_string(),
            rows: vec![row_from(vec![("id", Value::Integer(id)), ("name", Value::from(name))])],
        }
    }

    fn select_all() -> Statement {
        Statement::Query { table: "users".to_string(), options: QueryOptions::default() }
    }

    #[test]
    fn execute_round_trip() {
        let (runtime, parser) = runtime_with_db();
        parser.learn("INSERT", insert_stmt(1, "ann"));
        parser.learn("SELECT", select_all());

        let session = runtime.create_session();
        session.set_current_db("app").unwrap();
        assert_eq!(session.execute_insert("INSERT", None).unwrap(), 1);
        let rs = session.execute_query("SELECT").unwrap();
        assert_eq!(rs.total, 1);
        session.close().unwrap();
    }

    #[test]
    fn transaction_rollback_through_session() {
        let (runtime, parser) = runtime_with_db();
        parser.learn("INSERT", insert_stmt(1, "ann"));
        parser.learn("SELECT", select_all());

        let session = runtime.create_session();
        session.set_current_db("app").unwrap();
        session.begin_tx(false).unwrap();
        session.execute_insert("INSERT", None).unwrap();
        session.rollback_tx().unwrap();
        assert_eq!(session.execute_query("SELECT").unwrap().total, 0);
        session.close().unwrap();
    }

    #[test]
    fn close_rolls_back_open_transaction() {
        let (runtime, parser) = runtime_with_db();
        parser.learn("INSERT", insert_stmt(1, "ann"));
        parser.learn("SELECT", select_all());

        let session = runtime.create_session();
        session.set_current_db("app").unwrap();
        session.begin_tx(false).unwrap();
        session.execute_insert("INSERT", None).unwrap();
        session.close().unwrap();

        let session = runtime.create_session();
        session.set_current_db("app").unwrap();
        assert_eq!(session.execute_query("SELECT").unwrap().total, 0);
        session.close().unwrap();
    }

    #[test]
    #[serial]
    fn zero_timeout_expires_the_query_and_rolls_back() {
        let (runtime, parser) = runtime_with_db();
        parser.learn("SELECT", select_all());
        let rows: Vec<Row> = (0..600)
            .map(|i| row_from(vec![("id", Value::Integer(i)), ("name", Value::from("u"))]))
            .collect();
        parser.learn("INSERT MANY", Statement::Insert { table: "users".to_string(), rows });

        let session = runtime.create_session();
        session.set_current_db("app").unwrap();
        session.execute_insert("INSERT MANY", None).unwrap();

        session.begin_tx(false).unwrap();
        session.set_query_timeout(Some(Duration::ZERO));
        assert_eq!(session.execute_query("SELECT"), Err(Error::Timeout));

        // The transaction was rolled back; the session remains usable.
        session.set_query_timeout(None);
        assert_eq!(session.execute_query("SELECT").unwrap().total, 600);
        session.close().unwrap();
    }

    #[test]
    #[serial]
    fn kill_unknown_thread_reports_query_not_found() {
        let (runtime, parser) = runtime_with_db();
        parser.learn("KILL 9999", Statement::Kill { thread_id: 9999 });
        let session = runtime.create_session();
        session.set_current_db("app").unwrap();
        assert_eq!(session.execute("KILL 9999"), Err(Error::QueryNotFound(9999)));
        session.close().unwrap();
    }

    #[test]
    fn trace_id_is_extracted_and_stored() {
        let (runtime, parser) = runtime_with_db();
        parser.learn("SELECT", select_all());
        let session = runtime.create_session();
        session.set_current_db("app").unwrap();
        session.execute_query("/* trace_id=deadbeef */ SELECT").unwrap();
        assert_eq!(session.lock().trace_id, Some("deadbeef".to_string()));
        session.close().unwrap();
    }

    #[test]
    fn temp_tables_are_session_private_and_dropped_on_close() {
        let (runtime, parser) = runtime_with_db();
        let temp_schema = Table::new(
            "scratch",
            "temp",
            vec![Column::new("v", DataType::Integer).primary()],
        );
        parser.learn("CREATE TEMP", Statement::CreateTable { schema: temp_schema });
        parser.learn(
            "INSERT TEMP",
            Statement::Insert {
                table: "scratch".to_string(),
                rows: vec![row_from(vec![("v", Value::Integer(1))])],
            },
        );
        parser.learn(
            "SELECT TEMP",
            Statement::Query { table: "scratch".to_string(), options: QueryOptions::default() },
        );

        let session = runtime.create_session();
        session.set_current_db("app").unwrap();
        session.execute("CREATE TEMP").unwrap();
        session.execute("INSERT TEMP").unwrap();
        assert_eq!(session.execute_query("SELECT TEMP").unwrap().total, 1);

        // Invisible to a second session.
        let other = runtime.create_session();
        other.set_current_db("app").unwrap();
        assert!(other.execute_query("SELECT TEMP").is_err());

        session.close().unwrap();
        other.close().unwrap();
    }

    #[test]
    fn autocommit_off_keeps_an_implicit_transaction_open() {
        let (runtime, parser) = runtime_with_db();
        parser.learn("INSERT", insert_stmt(1, "ann"));
        parser.learn("SELECT", select_all());

        let session = runtime.create_session();
        session.set_current_db("app").unwrap();
        session.set_autocommit(false);
        session.execute_insert("INSERT", None).unwrap();

        // Uncommitted: invisible to another session.
        let other = runtime.create_session();
        other.set_current_db("app").unwrap();
        assert_eq!(other.execute_query("SELECT").unwrap().total, 0);

        session.commit_tx().unwrap();
        assert_eq!(other.execute_query("SELECT").unwrap().total, 1);
        session.close().unwrap();
        other.close().unwrap();
    }

    #[test]
    fn sessions_gc_when_idle() {
        let parser = Arc::new(StubParser::new());
        let mut config = EngineConfig::default();
        config.session_max_age_secs = 0;
        let runtime = Runtime::new(config, parser);
        runtime.register_database("app", Arc::new(MemoryDatasource::new())).unwrap();
        let _session = runtime.create_session();
        assert_eq!(runtime.session_count(), 1);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(runtime.gc_sessions(), 1);
        assert_eq!(runtime.session_count(), 0);
    }

    #[test]
    fn update_with_bound_filters() {
        let (runtime, parser) = runtime_with_db();
        parser.learn("INSERT", insert_stmt(1, "ann"));
        parser.learn(
            "UPDATE",
            Statement::Update {
                table: "users".to_string(),
                filters: Vec::new(),
                updates: UpdateSet::new(),
            },
        );
        parser.learn("SELECT", select_all());

        let session = runtime.create_session();
        session.set_current_db("app").unwrap();
        session.execute_insert("INSERT", None).unwrap();
        let filters = vec![Filter::new("id", FilterOp::Eq, Value::Integer(1))];
        let updates: UpdateSet = [("name".to_string(), Value::from("bob"))].into_iter().collect();
        assert_eq!(session.execute_update("UPDATE", Some(filters), Some(updates)).unwrap(), 1);
        let rs = session.execute_query("SELECT").unwrap();
        assert_eq!(rs.rows[0].get("name"), Some(&Value::from("bob")));
        session.close().unwrap();
    }
}
