//! Executor glue: takes a parsed [`Statement`], enforces access control,
//! and routes it to the datasource. Generated-column materialization and
//! constraint checks live inside the MVCC engine; the executor's job is
//! dispatch and the permission boundary.

use crate::cancel::CancelToken;
use crate::datasource::Datasource;
use crate::error::{CResult, Error};
use crate::index::{IndexMeta, IndexType};
use crate::mvcc::TxnId;
use crate::sql::plan::{ResultSet, Statement};

/// What a statement did.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecResult {
    Rows(ResultSet),
    Affected(usize),
    None,
}

impl ExecResult {
    pub fn affected(&self) -> usize {
        match self {
            ExecResult::Affected(n) => *n,
            _ => 0,
        }
    }
}

/// Statement categories for the permission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
}

/// The authentication/ACL capability. Supplied by the embedder; the core
/// only enforces the answer.
pub trait AccessControl: Send + Sync {
    fn check(&self, user: Option<&str>, table: &str, action: Action) -> CResult<()>;
}

/// Default policy: everything is allowed.
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check(&self, _user: Option<&str>, _table: &str, _action: Action) -> CResult<()> {
        Ok(())
    }
}

/// Dispatches one statement against one datasource. Transaction control and
/// KILL are session concerns and are rejected here.
pub fn dispatch(
    source: &dyn Datasource,
    stmt: Statement,
    txn: Option<TxnId>,
    cancel: Option<&CancelToken>,
    user: Option<&str>,
    acl: &dyn AccessControl,
) -> CResult<ExecResult> {
    match stmt {
        Statement::Query { table, options } => {
            acl.check(user, &table, Action::Select)?;
            let rs = source.query(&table, &options, txn, cancel)?;
            Ok(ExecResult::Rows(rs))
        }
        Statement::Insert { table, rows } => {
            acl.check(user, &table, Action::Insert)?;
            Ok(ExecResult::Affected(source.insert(&table, rows, txn)?))
        }
        Statement::Update { table, filters, updates } => {
            acl.check(user, &table, Action::Update)?;
            Ok(ExecResult::Affected(source.update(&table, &filters, &updates, txn, cancel)?))
        }
        Statement::Delete { table, filters } => {
            acl.check(user, &table, Action::Delete)?;
            Ok(ExecResult::Affected(source.delete(&table, &filters, txn, cancel)?))
        }
        Statement::CreateTable { schema } => {
            acl.check(user, &schema.name, Action::Ddl)?;
            source.create_table(schema)?;
            Ok(ExecResult::Affected(0))
        }
        Statement::DropTable { table } => {
            acl.check(user, &table, Action::Ddl)?;
            source.drop_table(&table)?;
            Ok(ExecResult::Affected(0))
        }
        Statement::Truncate { table } => {
            acl.check(user, &table, Action::Ddl)?;
            Ok(ExecResult::Affected(source.truncate_table(&table, txn)?))
        }
        Statement::CreateIndex { table, name, columns, unique, hash } => {
            acl.check(user, &table, Action::Ddl)?;
            source.create_index(IndexMeta {
                name,
                table,
                index_type: if hash { IndexType::Hash } else { IndexType::Ordered },
                unique,
                columns,
            })?;
            Ok(ExecResult::Affected(0))
        }
        Statement::DropIndex { table, name } => {
            acl.check(user, &table, Action::Ddl)?;
            source.drop_index(&table, &name)?;
            Ok(ExecResult::Affected(0))
        }
        Statement::Begin { .. } | Statement::Commit | Statement::Rollback => Err(Error::Internal(
            "transaction control must go through the session".to_string(),
        )),
        Statement::Kill { .. } => {
            Err(Error::Internal("KILL must go through the session".to_string()))
        }
    }
}
