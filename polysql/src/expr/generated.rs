use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{CResult, Error};
use crate::expr::eval::evaluate;
use crate::expr::parser::parse;
use crate::expr::{Expr, ScalarFns};
use crate::sql::schema::{GeneratedKind, Table};
use crate::sql::value::{DataType, Value};
use crate::sql::Row;

/// Functions whose result depends on something other than the row, and which
/// therefore disqualify a VIRTUAL column from being indexed.
pub const NON_DETERMINISTIC_FNS: &[&str] = &[
    "now",
    "curdate",
    "curtime",
    "current_date",
    "current_time",
    "current_timestamp",
    "localtime",
    "localtimestamp",
    "sysdate",
    "unix_timestamp",
    "utc_date",
    "utc_time",
    "utc_timestamp",
    "rand",
    "random",
    "uuid",
    "uuid_short",
    "user",
    "current_user",
    "session_user",
    "system_user",
    "database",
    "schema",
    "connection_id",
    "last_insert_id",
    "found_rows",
    "row_count",
    "version",
    "sleep",
];

/// Expressions longer than this are considered too complex to index.
pub const INDEXABLE_MAX_LEN: usize = 1000;

/// A single analyzed generated column.
#[derive(Debug)]
struct GeneratedColumn {
    kind: GeneratedKind,
    expr: Expr,
    text: String,
    datatype: DataType,
    depends_on: Vec<String>,
}

/// The per-table generated-column engine: dependency validation, topological
/// evaluation order, cascade analysis and indexability classification.
#[derive(Debug)]
pub struct GeneratedColumns {
    table: String,
    columns: HashMap<String, GeneratedColumn>,
    /// Generated column names in dependency (topological) order.
    order: Vec<String>,
    /// Reverse dependency edges: column name -> generated columns that
    /// directly depend on it.
    dependents: HashMap<String, Vec<String>>,
}

impl GeneratedColumns {
    /// Analyzes a table schema. Rejects unresolved dependencies, direct
    /// self-references, references to AUTO_INCREMENT columns, and cycles.
    pub fn analyze(table: &Table) -> CResult<Self> {
        let mut columns = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for column in &table.columns {
            let Some(spec) = &column.generated else { continue };
            let expr = parse(&spec.expression)?;

            // The declared dependency list and the parsed references must
            // both resolve against the schema.
            let mut depends_on = spec.depends_on.clone();
            for referenced in expr.column_refs() {
                if !depends_on.contains(&referenced) {
                    depends_on.push(referenced);
                }
            }
            for dep in &depends_on {
                let dep_column = table.get_column(dep)?;
                if dep == &column.name {
                    return Err(Error::Value(format!(
                        "generated column {}.{} references itself",
                        table.name, column.name
                    )));
                }
                if dep_column.auto_increment {
                    return Err(Error::Value(format!(
                        "generated column {}.{} cannot reference auto-increment column {}",
                        table.name, column.name, dep
                    )));
                }
            }

            for dep in &depends_on {
                dependents.entry(dep.clone()).or_default().push(column.name.clone());
            }
            columns.insert(
                column.name.clone(),
                GeneratedColumn {
                    kind: spec.kind,
                    expr,
                    text: spec.expression.clone(),
                    datatype: column.datatype,
                    depends_on,
                },
            );
        }

        let order = topo_sort(&table.name, &columns)?;
        Ok(Self { table: table.name.clone(), columns, order, dependents })
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn kind_of(&self, column: &str) -> Option<GeneratedKind> {
        self.columns.get(column).map(|c| c.kind)
    }

    /// Evaluates every STORED column into the row, in topological order, so a
    /// later generated column sees the values of earlier ones. Evaluation
    /// failure (division by zero, cast failure, unknown function) stores NULL
    /// and continues; the caller is never faulted.
    pub fn materialize_stored(&self, row: &mut Row, fns: &dyn ScalarFns) {
        for name in &self.order {
            let column = &self.columns[name];
            if column.kind != GeneratedKind::Stored {
                continue;
            }
            let value = self.evaluate_column(column, row, fns);
            row.insert(name.clone(), value);
        }
    }

    /// Re-evaluates the STORED columns affected by a change to `changed` base
    /// columns: BFS over the reverse-dependency graph, then evaluation in
    /// topological order.
    pub fn cascade_stored(&self, row: &mut Row, changed: &[String], fns: &dyn ScalarFns) {
        let affected = self.affected_by(changed);
        for name in &self.order {
            if !affected.contains(name) {
                continue;
            }
            let column = &self.columns[name];
            if column.kind != GeneratedKind::Stored {
                continue;
            }
            let value = self.evaluate_column(column, row, fns);
            row.insert(name.clone(), value);
        }
    }

    /// Computes VIRTUAL columns into a read-side copy of the row.
    pub fn materialize_virtual(&self, row: &mut Row, fns: &dyn ScalarFns) {
        for name in &self.order {
            let column = &self.columns[name];
            if column.kind != GeneratedKind::Virtual {
                continue;
            }
            let value = self.evaluate_column(column, row, fns);
            row.insert(name.clone(), value);
        }
    }

    /// The set of generated columns transitively affected by a change to the
    /// given columns.
    pub fn affected_by(&self, changed: &[String]) -> HashSet<String> {
        let mut affected = HashSet::new();
        let mut queue: VecDeque<&str> = changed.iter().map(String::as_str).collect();
        while let Some(name) = queue.pop_front() {
            if let Some(children) = self.dependents.get(name) {
                for child in children {
                    if affected.insert(child.clone()) {
                        queue.push_back(child);
                    }
                }
            }
        }
        affected
    }

    /// Whether an index over this generated column is allowed. VIRTUAL
    /// indexes require the expression to be deterministic, sub-query free
    /// and within the complexity threshold; STORED indexes always qualify.
    pub fn check_indexable(&self, column: &str) -> CResult<()> {
        let Some(generated) = self.columns.get(column) else {
            return Ok(()); // plain column, nothing to classify
        };
        if generated.kind == GeneratedKind::Stored {
            return Ok(());
        }
        let spec_text = &generated.text;
        if spec_text.len() > INDEXABLE_MAX_LEN {
            return Err(Error::Value(format!(
                "expression of {}.{} is too complex to index",
                self.table, column
            )));
        }
        if contains_select(spec_text) {
            return Err(Error::Value(format!(
                "expression of {}.{} contains a sub-query and cannot be indexed",
                self.table, column
            )));
        }
        for called in generated.expr.function_refs() {
            if NON_DETERMINISTIC_FNS.contains(&called.as_str()) {
                return Err(Error::Value(format!(
                    "expression of {}.{} calls non-deterministic function {}() and cannot be indexed",
                    self.table, column, called
                )));
            }
        }
        Ok(())
    }

    fn evaluate_column(&self, column: &GeneratedColumn, row: &Row, fns: &dyn ScalarFns) -> Value {
        match evaluate(&column.expr, row, fns).and_then(|v| v.cast(column.datatype)) {
            Ok(value) => value,
            Err(err) => {
                log::debug!("generated column evaluation in {} degraded to NULL: {}", self.table, err);
                Value::Null
            }
        }
    }
}

/// Kahn's algorithm over the generated-column subgraph. Edges run from a
/// generated dependency to its dependents; base columns have no node.
fn topo_sort(table: &str, columns: &HashMap<String, GeneratedColumn>) -> CResult<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = columns
        .iter()
        .map(|(name, column)| {
            let degree = column.depends_on.iter().filter(|d| columns.contains_key(*d)).count();
            (name.as_str(), degree)
        })
        .collect();

    let mut ready: Vec<&str> =
        in_degree.iter().filter(|(_, d)| **d == 0).map(|(name, _)| *name).collect();
    ready.sort(); // deterministic order among independent columns
    let mut queue: VecDeque<&str> = ready.into();

    let mut order = Vec::with_capacity(columns.len());
    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        let mut unblocked = Vec::new();
        for (other, column) in columns {
            if column.depends_on.iter().any(|d| d == name) {
                let degree = in_degree.get_mut(other.as_str()).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    unblocked.push(other.as_str());
                }
            }
        }
        unblocked.sort();
        queue.extend(unblocked);
    }

    if order.len() != columns.len() {
        return Err(Error::Value(format!(
            "cyclic dependency between generated columns of table {}",
            table
        )));
    }
    Ok(order)
}

/// Word-boundary-checked scan for an embedded SELECT.
pub fn contains_select(text: &str) -> bool {
    let lower = text.to_lowercase();
    let bytes = lower.as_bytes();
    let mut start = 0;
    while let Some(pos) = lower[start..].find("select") {
        let at = start + pos;
        let before_ok = at == 0 || !bytes[at - 1].is_ascii_alphanumeric() && bytes[at - 1] != b'_';
        let after = at + "select".len();
        let after_ok =
            after >= bytes.len() || !bytes[after].is_ascii_alphanumeric() && bytes[after] != b'_';
        if before_ok && after_ok {
            return true;
        }
        start = at + 1;
    }
    false
}
