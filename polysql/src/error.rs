use thiserror::Error;

/// Crate-wide result type.
pub type CResult<T> = std::result::Result<T, Error>;

/// All errors surfaced by the engine. The session returns these to the caller
/// verbatim; nothing is downgraded to a log line except the two cases the
/// storage layer recovers silently (STORED generated-column evaluation and a
/// partial trailing WAL record).
#[derive(Error, Clone, Debug, PartialEq)]
pub enum Error {
    /// SQL that the (external) parser rejected.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    /// Type mismatch or an invalid value for the target column.
    #[error("invalid value: {0}")]
    Value(String),

    /// Unique, primary-key, foreign-key or check constraint violation.
    /// Aborts the statement, the transaction stays open.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// First-committer-wins serialization failure. The transaction is
    /// aborted and the caller may retry it from the top.
    #[error("write-write conflict, transaction must retry")]
    WriteConflict,

    #[error("query timed out")]
    Timeout,

    #[error("query killed")]
    Killed,

    /// KILL addressed a thread with no registered query.
    #[error("query not found for thread {0}")]
    QueryNotFound(u32),

    /// The datasource refused a mutation (load phase, or it was marked
    /// read-only after a storage failure).
    #[error("read only: {0}")]
    ReadOnly(String),

    /// Disk-level failure. Aborts the transaction; the adapter may flip
    /// itself read-only until restart.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the error kinds that abort only the current statement,
    /// leaving the transaction usable.
    pub fn is_statement_level(&self) -> bool {
        matches!(
            self,
            Error::Constraint(_)
                | Error::Value(_)
                | Error::ColumnNotFound(_)
                | Error::TableNotFound(_)
                | Error::PermissionDenied(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Value(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::Value(err.to_string())
    }
}

impl From<std::num::ParseFloatError> for Error {
    fn from(err: std::num::ParseFloatError) -> Self {
        Error::Value(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statement_level_kinds() {
        assert!(Error::Constraint("dup".into()).is_statement_level());
        assert!(!Error::WriteConflict.is_statement_level());
        assert!(!Error::Storage("disk full".into()).is_statement_level());
    }

    #[test]
    fn io_error_maps_to_storage() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err, Error::Storage("boom".to_string()));
    }
}
