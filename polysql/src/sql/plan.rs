use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::sql::schema::Table;
use crate::sql::value::Value;
use crate::sql::Row;

/// Comparison operator in a pushed-down filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum FilterOp {
    #[strum(serialize = "=")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
}

/// A single conjunct of a WHERE clause, already reduced by the optimizer to
/// column-op-constant form. A row matches a filter list when every filter
/// matches; a NULL comparison never matches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(column: &str, op: FilterOp, value: Value) -> Self {
        Self { column: column.to_string(), op, value }
    }

    pub fn matches(&self, row: &Row) -> bool {
        let lhs = row.get(&self.column).unwrap_or(&Value::Null);
        match lhs.sql_cmp(&self.value) {
            None => false,
            Some(ord) => match self.op {
                FilterOp::Eq => ord == std::cmp::Ordering::Equal,
                FilterOp::Ne => ord != std::cmp::Ordering::Equal,
                FilterOp::Lt => ord == std::cmp::Ordering::Less,
                FilterOp::Le => ord != std::cmp::Ordering::Greater,
                FilterOp::Gt => ord == std::cmp::Ordering::Greater,
                FilterOp::Ge => ord != std::cmp::Ordering::Less,
            },
        }
    }
}

pub fn matches_all(filters: &[Filter], row: &Row) -> bool {
    filters.iter().all(|f| f.matches(row))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub desc: bool,
}

/// Everything a query execution needs beyond the table name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub filters: Vec<Filter>,
    pub order: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Column projection; empty means all user-visible columns.
    pub projection: Vec<String>,
    /// Requesting user, consulted by the access-control hook.
    pub user: Option<String>,
}

/// Column updates of an UPDATE statement.
pub type UpdateSet = BTreeMap<String, Value>;

/// A query result: the projected column names, the row batch, and the total
/// match count before offset/limit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub total: usize,
}

/// An executable statement, as produced by the external parser/optimizer.
/// The executor dispatches these; the core never sees raw SQL other than for
/// query registration and trace-id extraction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Query {
        table: String,
        options: QueryOptions,
    },
    Insert {
        table: String,
        rows: Vec<Row>,
    },
    Update {
        table: String,
        filters: Vec<Filter>,
        updates: UpdateSet,
    },
    Delete {
        table: String,
        filters: Vec<Filter>,
    },
    CreateTable {
        schema: Table,
    },
    DropTable {
        table: String,
    },
    Truncate {
        table: String,
    },
    CreateIndex {
        table: String,
        name: String,
        columns: Vec<String>,
        unique: bool,
        hash: bool,
    },
    DropIndex {
        table: String,
        name: String,
    },
    Begin {
        read_only: bool,
    },
    Commit,
    Rollback,
    Kill {
        thread_id: u32,
    },
}

/// The external SQL parser/optimizer. The core registers raw SQL for
/// cancellation and tracing, but consumes only the parsed [`Statement`].
pub trait SqlParser: Send + Sync {
    fn parse(&self, sql: &str) -> crate::error::CResult<Statement>;
}
