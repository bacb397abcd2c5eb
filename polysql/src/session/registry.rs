use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use crate::cancel::CancelToken;
use crate::error::{CResult, Error};

/// Process-wide monotonic sequence, the third component of a query id.
static QUERY_SEQUENCE: AtomicU64 = AtomicU64::new(0);

static GLOBAL: Lazy<QueryRegistry> = Lazy::new(QueryRegistry::new);

/// Globally-unique query identity: thread id, start nanos, sequence.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryId {
    pub thread_id: u32,
    pub start_nanos: u128,
    pub sequence: u64,
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.thread_id, self.start_nanos, self.sequence)
    }
}

/// Everything the registry knows about an in-flight query.
pub struct QueryContext {
    pub id: QueryId,
    pub sql: String,
    pub started_at: Instant,
    pub cancel: CancelToken,
    pub user: Option<String>,
    pub host: Option<String>,
    pub database: Option<String>,
    pub trace_id: Option<String>,
}

impl QueryContext {
    pub fn new(thread_id: u32, sql: &str) -> Self {
        let start_nanos =
            SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
        Self {
            id: QueryId {
                thread_id,
                start_nanos,
                sequence: QUERY_SEQUENCE.fetch_add(1, Ordering::SeqCst),
            },
            sql: sql.to_string(),
            started_at: Instant::now(),
            cancel: CancelToken::new(),
            user: None,
            host: None,
            database: None,
            trace_id: None,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    by_thread: HashMap<u32, Arc<QueryContext>>,
    by_id: HashMap<QueryId, Arc<QueryContext>>,
}

/// The global registry of running queries, indexed by thread id for KILL.
/// Two small maps behind one lock; every operation is O(1).
pub struct QueryRegistry {
    inner: Mutex<RegistryInner>,
}

impl QueryRegistry {
    fn new() -> Self {
        Self { inner: Mutex::new(RegistryInner::default()) }
    }

    /// The process-wide registry, lazily initialized on first use.
    pub fn global() -> &'static QueryRegistry {
        &GLOBAL
    }

    /// Registers a query. A query still registered for the same thread is
    /// cancelled and replaced; a session runs one statement at a time.
    pub fn register(&self, ctx: QueryContext) -> Arc<QueryContext> {
        let ctx = Arc::new(ctx);
        let mut inner = self.inner.lock().expect("query registry poisoned");
        if let Some(prior) = inner.by_thread.insert(ctx.id.thread_id, ctx.clone()) {
            log::warn!("cancelling still-registered query {} for thread {}", prior.id, prior.id.thread_id);
            prior.cancel.kill();
            inner.by_id.remove(&prior.id);
        }
        inner.by_id.insert(ctx.id.clone(), ctx.clone());
        ctx
    }

    pub fn unregister(&self, id: &QueryId) {
        let mut inner = self.inner.lock().expect("query registry poisoned");
        inner.by_id.remove(id);
        if inner.by_thread.get(&id.thread_id).map_or(false, |ctx| ctx.id == *id) {
            inner.by_thread.remove(&id.thread_id);
        }
    }

    /// KILL: trips the cancel handle of the thread's current query.
    pub fn kill(&self, thread_id: u32) -> CResult<()> {
        let inner = self.inner.lock().expect("query registry poisoned");
        match inner.by_thread.get(&thread_id) {
            Some(ctx) => {
                log::info!("killing query {} ({})", ctx.id, ctx.sql);
                ctx.cancel.kill();
                Ok(())
            }
            None => Err(Error::QueryNotFound(thread_id)),
        }
    }

    pub fn current(&self, thread_id: u32) -> Option<Arc<QueryContext>> {
        self.inner.lock().expect("query registry poisoned").by_thread.get(&thread_id).cloned()
    }

    pub fn running(&self) -> usize {
        self.inner.lock().expect("query registry poisoned").by_id.len()
    }
}

/// Arms a timer that trips the query's timeout flag after `timeout`. Firing
/// after the query finished is harmless; the token is per query.
pub fn arm_timeout(token: CancelToken, timeout: Duration) {
    std::thread::Builder::new()
        .name("polysql-query-timeout".to_string())
        .spawn(move || {
            std::thread::sleep(timeout);
            token.time_out();
        })
        .expect("failed to spawn timeout timer");
}

/// Extracts a leading `/* trace_id=... */` comment, returning the trace id
/// and the SQL with the comment stripped.
pub fn extract_trace_id(sql: &str) -> (Option<String>, &str) {
    let trimmed = sql.trim_start();
    let Some(rest) = trimmed.strip_prefix("/*") else { return (None, sql) };
    let Some(end) = rest.find("*/") else { return (None, sql) };
    let comment = rest[..end].trim();
    let Some(id) = comment.strip_prefix("trace_id=") else { return (None, sql) };
    (Some(id.trim().to_string()), rest[end + 2..].trim_start())
}
