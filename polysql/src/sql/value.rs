use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use chrono::NaiveDateTime;
use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{CResult, Error};

/// A dynamically typed SQL value.
///
/// Values cross every boundary in the engine (rows, WAL payloads, index keys,
/// expression evaluation), so the coercion rules live here, in one place:
/// both the filter engine and the generated-column evaluator route numeric
/// work through [`Value::to_numeric`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    Timestamp(NaiveDateTime),
}

/// The declared type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DataType {
    Boolean,
    Integer,
    Float,
    String,
    Bytes,
    Timestamp,
}

impl Value {
    pub fn datatype(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Integer(_) => Some(DataType::Integer),
            Value::Float(_) => Some(DataType::Float),
            Value::String(_) => Some(DataType::String),
            Value::Bytes(_) => Some(DataType::Bytes),
            Value::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric coercion to a double. NULL (and anything that does not coerce)
    /// is None, which propagates as NULL through arithmetic and comparison.
    pub fn to_numeric(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            Value::Bytes(_) => None,
            Value::Timestamp(ts) => Some(ts.and_utc().timestamp_micros() as f64),
        }
    }

    /// SQL three-valued comparison: any NULL operand yields None ("NULL"),
    /// which WHERE treats as false. Strings, bytes and timestamps compare
    /// within their own kind; everything else goes through numeric coercion.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (a, b) => {
                let (a, b) = (a.to_numeric()?, b.to_numeric()?);
                a.partial_cmp(&b)
            }
        }
    }

    /// Casts the value to a declared column type. Integers are clipped,
    /// strings formatted. A cast that cannot succeed is an error; the
    /// generated-column path converts that error into NULL.
    pub fn cast(&self, to: DataType) -> CResult<Value> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        match (self, to) {
            (Value::Boolean(_), DataType::Boolean)
            | (Value::Integer(_), DataType::Integer)
            | (Value::Float(_), DataType::Float)
            | (Value::String(_), DataType::String)
            | (Value::Bytes(_), DataType::Bytes)
            | (Value::Timestamp(_), DataType::Timestamp) => Ok(self.clone()),

            (Value::String(s), DataType::Boolean) => match s.trim().to_lowercase().as_str() {
                "true" => Ok(Value::Boolean(true)),
                "false" => Ok(Value::Boolean(false)),
                other => match other.parse::<f64>() {
                    Ok(n) => Ok(Value::Boolean(n != 0.0)),
                    Err(_) => Err(Error::Value(format!("cannot cast '{}' to boolean", s))),
                },
            },
            (v, DataType::Boolean) => match v.to_numeric() {
                Some(n) => Ok(Value::Boolean(n != 0.0)),
                None => Err(Error::Value(format!("cannot cast {} to boolean", v))),
            },
            (v, DataType::Integer) => match v.to_numeric() {
                // Clip to the integer range rather than wrapping.
                Some(n) => Ok(Value::Integer(n.round().clamp(i64::MIN as f64, i64::MAX as f64) as i64)),
                None => Err(Error::Value(format!("cannot cast {} to integer", v))),
            },
            (v, DataType::Float) => match v.to_numeric() {
                Some(n) => Ok(Value::Float(n)),
                None => Err(Error::Value(format!("cannot cast {} to float", v))),
            },
            (v, DataType::String) => Ok(Value::String(v.to_string())),
            (Value::String(s), DataType::Bytes) => {
                let hex = s.strip_prefix("0x").unwrap_or(s);
                if hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(Error::Value(format!("cannot cast '{}' to bytes", s)));
                }
                let bytes = (0..hex.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("checked hex"))
                    .collect();
                Ok(Value::Bytes(bytes))
            }
            (Value::String(s), DataType::Timestamp) => {
                let ts = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                    .map_err(|err| Error::Value(format!("cannot cast '{}' to timestamp: {}", s, err)))?;
                Ok(Value::Timestamp(ts))
            }
            (v, to) => Err(Error::Value(format!("cannot cast {} to {}", v, to))),
        }
    }

    /// Rank used by the total order, so that a mixed-type index key still has
    /// a stable, deterministic ordering.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) => 2,
            Value::Float(_) => 3,
            Value::String(_) => 4,
            Value::Bytes(_) => 5,
            Value::Timestamp(_) => 6,
        }
    }
}

/// Total order for index keys and stable sorts. This is NOT the SQL
/// comparison (see [`Value::sql_cmp`]); it exists so values can live in
/// ordered maps. NULL sorts first, floats use IEEE total ordering.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Timestamp(ts) => ts.hash(state),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "0x{}", b.iter().map(|b| format!("{:02x}", b)).collect::<String>()),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn null_propagates_through_comparison() {
        assert_eq!(Value::Null.sql_cmp(&Value::Integer(1)), None);
        assert_eq!(Value::Integer(1).sql_cmp(&Value::Null), None);
        assert_eq!(Value::Null.sql_cmp(&Value::Null), None);
    }

    #[test]
    fn numeric_coercion_crosses_kinds() {
        assert_eq!(Value::Integer(2).sql_cmp(&Value::Float(2.0)), Some(Ordering::Equal));
        assert_eq!(Value::Boolean(true).sql_cmp(&Value::Integer(1)), Some(Ordering::Equal));
        assert_eq!(Value::String("10".into()).sql_cmp(&Value::Integer(9)), Some(Ordering::Greater));
    }

    #[test]
    fn cast_clips_integers() {
        assert_eq!(Value::Float(3.7).cast(DataType::Integer).unwrap(), Value::Integer(4));
        assert_eq!(Value::Float(1e300).cast(DataType::Integer).unwrap(), Value::Integer(i64::MAX));
        assert!(Value::String("abc".into()).cast(DataType::Integer).is_err());
    }

    #[test]
    fn total_order_is_stable_across_types() {
        let mut values = vec![
            Value::String("a".into()),
            Value::Integer(1),
            Value::Null,
            Value::Boolean(false),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![Value::Null, Value::Boolean(false), Value::Integer(1), Value::String("a".into())]
        );
    }

    #[test]
    fn bytes_display_as_hex() {
        let value = Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(value.to_string(), format!("0x{}", hex::encode([0xde, 0xad, 0xbe, 0xef])));
    }

    #[test]
    fn display_round_trips_through_string_casts() {
        let cases = vec![
            (Value::Boolean(true), DataType::Boolean),
            (Value::Integer(-42), DataType::Integer),
            (Value::Float(2.5), DataType::Float),
            (Value::Bytes(vec![0xde, 0xad]), DataType::Bytes),
        ];
        for (value, datatype) in cases {
            let text = Value::String(value.to_string());
            assert_eq!(text.cast(datatype).unwrap(), value, "via {}", datatype);
        }
    }

    #[test]
    fn datatype_round_trips_through_strum() {
        use std::str::FromStr;
        assert_eq!(DataType::from_str("integer").unwrap(), DataType::Integer);
        assert_eq!(DataType::Timestamp.to_string(), "timestamp");
    }
}
