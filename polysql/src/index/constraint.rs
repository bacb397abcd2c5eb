use crate::error::{CResult, Error};
use crate::expr::eval::evaluate;
use crate::expr::parser::parse;
use crate::expr::ScalarFns;
use crate::sql::schema::{Constraint, Table};
use crate::sql::value::Value;
use crate::sql::Row;

/// Evaluates the table's CHECK constraints against a row. A CHECK passes
/// when its expression is true or NULL (unknown), per SQL semantics.
pub fn check_constraints(table: &Table, row: &Row, fns: &dyn ScalarFns) -> CResult<()> {
    for constraint in &table.constraints {
        let Constraint::Check { name, expression } = constraint else { continue };
        let expr = parse(expression)?;
        match evaluate(&expr, row, fns)? {
            Value::Boolean(false) => {
                return Err(Error::Constraint(format!(
                    "check constraint {} violated on table {}",
                    name, table.name
                )));
            }
            Value::Null | Value::Boolean(true) => {}
            other => {
                if other.to_numeric() == Some(0.0) {
                    return Err(Error::Constraint(format!(
                        "check constraint {} violated on table {}",
                        name, table.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// A unique key participates in uniqueness checks only when none of its
/// parts is NULL; SQL treats NULLs as distinct.
pub fn unique_key_applies(key: &[Value]) -> bool {
    !key.iter().any(Value::is_null)
}

/// The foreign-key clauses of a table, with their resolved column lists.
pub fn foreign_keys(table: &Table) -> Vec<(&str, &[String], &str, &[String], crate::sql::schema::OnDelete)> {
    table
        .constraints
        .iter()
        .filter_map(|c| match c {
            Constraint::ForeignKey { name, columns, ref_table, ref_columns, on_delete } => {
                Some((name.as_str(), columns.as_slice(), ref_table.as_str(), ref_columns.as_slice(), *on_delete))
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expr::NoFns;
    use crate::sql::row_from;
    use crate::sql::schema::Column;
    use crate::sql::value::DataType;

    fn table_with_check() -> Table {
        Table::new(
            "accounts",
            "memory",
            vec![Column::new("balance", DataType::Integer)],
        )
        .with_constraint(Constraint::Check {
            name: "positive_balance".to_string(),
            expression: "balance >= 0".to_string(),
        })
    }

    #[test]
    fn check_passes_and_fails() {
        let table = table_with_check();
        let ok = row_from(vec![("balance", Value::Integer(10))]);
        assert!(check_constraints(&table, &ok, &NoFns).is_ok());
        let bad = row_from(vec![("balance", Value::Integer(-1))]);
        assert!(matches!(check_constraints(&table, &bad, &NoFns), Err(Error::Constraint(_))));
    }

    #[test]
    fn check_with_null_passes() {
        let table = table_with_check();
        let row = row_from(vec![("balance", Value::Null)]);
        assert!(check_constraints(&table, &row, &NoFns).is_ok());
    }

    #[test]
    fn null_parts_exempt_from_uniqueness() {
        assert!(unique_key_applies(&[Value::Integer(1), Value::from("a")]));
        assert!(!unique_key_applies(&[Value::Integer(1), Value::Null]));
    }
}
