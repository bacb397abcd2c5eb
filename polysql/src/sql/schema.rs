use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{CResult, Error};
use crate::sql::value::{DataType, Value};
use crate::sql::{Row, ROW_ATTS};

/// Whether a generated column is materialized on write or computed on read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum GeneratedKind {
    Stored,
    Virtual,
}

/// The generated-column clause of a column definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSpec {
    pub kind: GeneratedKind,
    /// Expression text, parsed lazily by the evaluator.
    pub expression: String,
    /// Declared dependency list; validated against the table's columns.
    pub depends_on: Vec<String>,
}

/// A column descriptor. Created with the table, immutable except via ALTER.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub datatype: DataType,
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub generated: Option<GeneratedSpec>,
}

impl Column {
    pub fn new(name: &str, datatype: DataType) -> Self {
        Self {
            name: name.to_string(),
            datatype,
            nullable: true,
            default: None,
            primary_key: false,
            unique: false,
            auto_increment: false,
            generated: None,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_generated(mut self, kind: GeneratedKind, expression: &str, depends_on: Vec<&str>) -> Self {
        self.generated = Some(GeneratedSpec {
            kind,
            expression: expression.to_string(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
        });
        self
    }
}

/// What happens to child rows when a referenced parent row is deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum OnDelete {
    Cascade,
    SetNull,
    NoAction,
}

impl Default for OnDelete {
    fn default() -> Self {
        OnDelete::NoAction
    }
}

/// A table-level constraint. Uniqueness and primary keys are usually
/// declared on the column; the table-level form covers composites, foreign
/// keys and CHECK expressions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    Unique {
        name: String,
        columns: Vec<String>,
    },
    ForeignKey {
        name: String,
        columns: Vec<String>,
        ref_table: String,
        ref_columns: Vec<String>,
        #[serde(default)]
        on_delete: OnDelete,
    },
    Check {
        name: String,
        expression: String,
    },
}

impl Constraint {
    pub fn name(&self) -> &str {
        match self {
            Constraint::Unique { name, .. }
            | Constraint::ForeignKey { name, .. }
            | Constraint::Check { name, .. } => name,
        }
    }
}

/// On-disk layout for file-backed tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum StorageMode {
    SingleFile,
    FilePerRow,
}

impl Default for StorageMode {
    fn default() -> Self {
        StorageMode::FilePerRow
    }
}

/// A table descriptor: ordered columns, engine tag and storage attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    /// Engine tag, e.g. "memory" or "xml".
    pub engine: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub storage_mode: StorageMode,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Table {
    pub fn new(name: &str, engine: &str, columns: Vec<Column>) -> Self {
        Self {
            name: name.to_string(),
            engine: engine.to_string(),
            columns,
            storage_mode: StorageMode::default(),
            comment: None,
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Attaches a CREATE TABLE comment, picking up an `xml_mode=` option if
    /// one is present.
    pub fn with_comment(mut self, comment: &str) -> Self {
        if let Some(mode) = parse_xml_mode(comment) {
            self.storage_mode = mode;
        }
        self.comment = Some(comment.to_string());
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn get_column(&self, name: &str) -> CResult<&Column> {
        self.column(name).ok_or_else(|| Error::ColumnNotFound(format!("{}.{}", self.name, name)))
    }

    /// The primary-key columns, in declaration order.
    pub fn primary_key(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    /// Projects the primary-key tuple out of a row, or None if the table has
    /// no primary key.
    pub fn primary_key_of(&self, row: &Row) -> Option<Vec<Value>> {
        let pk = self.primary_key();
        if pk.is_empty() {
            return None;
        }
        Some(pk.iter().map(|c| row.get(&c.name).cloned().unwrap_or(Value::Null)).collect())
    }

    /// Validates a row against the schema: unknown columns, nullability and
    /// type agreement (with coercion for numeric kinds). Generated columns
    /// are exempt from the nullability check since evaluation may produce
    /// NULL on purpose.
    pub fn validate_row(&self, row: &Row) -> CResult<()> {
        for name in row.keys() {
            if name == ROW_ATTS {
                continue;
            }
            if self.column(name).is_none() {
                return Err(Error::ColumnNotFound(format!("{}.{}", self.name, name)));
            }
        }
        for column in &self.columns {
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            if value.is_null() {
                if !column.nullable && column.generated.is_none() && !column.auto_increment {
                    return Err(Error::Value(format!(
                        "NULL value in non-nullable column {}.{}",
                        self.name, column.name
                    )));
                }
                continue;
            }
            match (value.datatype(), column.datatype) {
                (Some(have), want) if have == want => {}
                // Integer literals are acceptable for float columns and
                // vice versa; the engine casts on store.
                (Some(DataType::Integer), DataType::Float) | (Some(DataType::Float), DataType::Integer) => {}
                (Some(DataType::Boolean), DataType::Integer) => {}
                (Some(have), want) => {
                    return Err(Error::Value(format!(
                        "column {}.{} expects {}, got {}",
                        self.name, column.name, want, have
                    )));
                }
                (None, _) => {}
            }
        }
        Ok(())
    }

    /// Fills in defaults and casts values to the declared column types.
    /// Generated columns are left alone here; the evaluator owns them.
    pub fn normalize_row(&self, row: &Row) -> CResult<Row> {
        let mut out = Row::new();
        for column in &self.columns {
            let value = match row.get(&column.name) {
                Some(v) if !v.is_null() => v.cast(column.datatype)?,
                _ => match &column.default {
                    Some(d) if column.generated.is_none() => d.cast(column.datatype)?,
                    _ => Value::Null,
                },
            };
            out.insert(column.name.clone(), value);
        }
        if let Some(atts) = row.get(ROW_ATTS) {
            out.insert(ROW_ATTS.to_string(), atts.clone());
        }
        Ok(out)
    }
}

/// Parses an `xml_mode=single_file|file_per_row` option out of a CREATE TABLE
/// comment string.
pub fn parse_xml_mode(comment: &str) -> Option<StorageMode> {
    comment.split(',').map(str::trim).find_map(|part| {
        let rest = part.strip_prefix("xml_mode=")?;
        rest.parse::<StorageMode>().ok()
    })
}
