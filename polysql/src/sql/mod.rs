//! SQL-facing data model: polymorphic values, table schemas and the
//! pre-parsed plan inputs the executor consumes. The SQL parser itself is an
//! external collaborator; everything in here starts where the AST ends.

pub mod plan;
pub mod schema;
pub mod value;

use std::collections::BTreeMap;

use crate::sql::value::Value;

/// A row is a mapping of column name to value. The `__atts__` slot is
/// reserved for internal per-row metadata and never reaches a result set.
pub type Row = BTreeMap<String, Value>;

/// Reserved internal row slot.
pub const ROW_ATTS: &str = "__atts__";

/// Builds a row from (name, value) pairs. Test and adapter helper.
pub fn row_from(pairs: Vec<(&str, Value)>) -> Row {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
