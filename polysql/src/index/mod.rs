//! Secondary indexes: ordered (equality + range) and hash (equality only),
//! single- or multi-column. The index layer is oblivious to versioning; its
//! payload is a stable row identity, and readers re-check visibility against
//! their snapshot before trusting an entry.

pub mod constraint;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{CResult, Error};
use crate::sql::plan::FilterOp;
use crate::sql::value::Value;
use crate::sql::Row;

/// Stable identity of a logical row, the payload of every index entry.
pub type RowId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum IndexType {
    Ordered,
    Hash,
}

/// Index metadata as persisted to the sidecar file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub name: String,
    pub table: String,
    pub index_type: IndexType,
    pub unique: bool,
    pub columns: Vec<String>,
}

/// One secondary index. Ordered indexes keep keys in a BTreeMap for range
/// scans; hash indexes only answer equality.
pub struct Index {
    pub meta: IndexMeta,
    ordered: BTreeMap<Vec<Value>, BTreeSet<RowId>>,
    hashed: HashMap<Vec<Value>, BTreeSet<RowId>>,
}

impl Index {
    pub fn new(meta: IndexMeta) -> Self {
        Self { meta, ordered: BTreeMap::new(), hashed: HashMap::new() }
    }

    /// Projects the index key tuple out of a row.
    pub fn key_of(&self, row: &Row) -> Vec<Value> {
        self.meta.columns.iter().map(|c| row.get(c).cloned().unwrap_or(Value::Null)).collect()
    }

    pub fn insert_entry(&mut self, key: Vec<Value>, id: RowId) {
        match self.meta.index_type {
            IndexType::Ordered => self.ordered.entry(key).or_default().insert(id),
            IndexType::Hash => self.hashed.entry(key).or_default().insert(id),
        };
    }

    pub fn remove_entry(&mut self, key: &Vec<Value>, id: RowId) {
        match self.meta.index_type {
            IndexType::Ordered => {
                if let Some(ids) = self.ordered.get_mut(key) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.ordered.remove(key);
                    }
                }
            }
            IndexType::Hash => {
                if let Some(ids) = self.hashed.get_mut(key) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.hashed.remove(key);
                    }
                }
            }
        }
    }

    /// Equality lookup on the full key tuple.
    pub fn lookup(&self, key: &Vec<Value>) -> Vec<RowId> {
        let ids = match self.meta.index_type {
            IndexType::Ordered => self.ordered.get(key),
            IndexType::Hash => self.hashed.get(key),
        };
        ids.map(|ids| ids.iter().copied().collect()).unwrap_or_default()
    }

    /// Whether a filter on this index's leading column can be pushed down.
    pub fn supports(&self, column: &str, op: FilterOp) -> bool {
        match self.meta.index_type {
            IndexType::Ordered => self.meta.columns.first().map(String::as_str) == Some(column),
            // Hash only answers whole-key equality; restrict pushdown to
            // single-column hash indexes.
            IndexType::Hash => {
                self.meta.columns.len() == 1
                    && self.meta.columns[0] == column
                    && op == FilterOp::Eq
            }
        }
    }

    /// Range scan on the leading key column, in key order. Only meaningful
    /// for ordered indexes (hash falls back to equality).
    pub fn scan_leading(&self, op: FilterOp, value: &Value) -> Vec<RowId> {
        use std::ops::Bound;
        if self.meta.index_type == IndexType::Hash {
            if self.meta.columns.len() == 1 && op == FilterOp::Eq {
                return self.lookup(&vec![value.clone()]);
            }
            return Vec::new();
        }

        fn leading(key: &[Value]) -> Value {
            key.first().cloned().unwrap_or(Value::Null)
        }
        fn flatten<'a, I>(iter: I) -> Vec<RowId>
        where
            I: Iterator<Item = (&'a Vec<Value>, &'a BTreeSet<RowId>)>,
        {
            iter.flat_map(|(_, ids)| ids.iter().copied()).collect()
        }

        match op {
            // Composite keys sharing the leading value sort directly after
            // the one-element prefix.
            FilterOp::Eq => flatten(
                self.ordered
                    .range((Bound::Included(vec![value.clone()]), Bound::Unbounded))
                    .take_while(|(k, _)| leading(k) == *value),
            ),
            FilterOp::Ge => flatten(
                self.ordered.range((Bound::Included(vec![value.clone()]), Bound::Unbounded)),
            ),
            FilterOp::Gt => flatten(
                self.ordered
                    .range((Bound::Included(vec![value.clone()]), Bound::Unbounded))
                    .skip_while(|(k, _)| leading(k) == *value),
            ),
            FilterOp::Lt => {
                flatten(self.ordered.iter().take_while(|(k, _)| leading(k) < *value))
            }
            FilterOp::Le => {
                flatten(self.ordered.iter().take_while(|(k, _)| leading(k) <= *value))
            }
            FilterOp::Ne => flatten(self.ordered.iter().filter(|(k, _)| leading(k) != *value)),
        }
    }

    /// All row ids in key order (ordered) or arbitrary order (hash).
    pub fn scan_all(&self) -> Vec<RowId> {
        match self.meta.index_type {
            IndexType::Ordered => self.ordered.values().flat_map(|ids| ids.iter().copied()).collect(),
            IndexType::Hash => self.hashed.values().flat_map(|ids| ids.iter().copied()).collect(),
        }
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.hashed.clear();
    }
}

/// The per-table index set, with the single maintenance hook every DML path
/// goes through.
#[derive(Default)]
pub struct IndexSet {
    indexes: Vec<Index>,
}

impl IndexSet {
    pub fn add(&mut self, index: Index) -> CResult<()> {
        if self.indexes.iter().any(|i| i.meta.name == index.meta.name) {
            return Err(Error::Constraint(format!("index {} already exists", index.meta.name)));
        }
        self.indexes.push(index);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> CResult<IndexMeta> {
        let pos = self
            .indexes
            .iter()
            .position(|i| i.meta.name == name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        Ok(self.indexes.remove(pos).meta)
    }

    pub fn get(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.meta.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Index> {
        self.indexes.iter()
    }

    pub fn metas(&self) -> Vec<IndexMeta> {
        self.indexes.iter().map(|i| i.meta.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Applies a row mutation to every index: `old` entries are removed,
    /// `new` entries inserted. Insert passes (None, Some), delete
    /// (Some, None), update (Some, Some).
    pub fn maintain(&mut self, id: RowId, old: Option<&Row>, new: Option<&Row>) {
        for index in &mut self.indexes {
            if let Some(old) = old {
                let key = index.key_of(old);
                index.remove_entry(&key, id);
            }
            if let Some(new) = new {
                let key = index.key_of(new);
                index.insert_entry(key, id);
            }
        }
    }

    /// Picks an index able to serve the leading filter, preferring ordered
    /// ones for their range support.
    pub fn pick_for(&self, column: &str, op: FilterOp) -> Option<&Index> {
        self.indexes
            .iter()
            .filter(|i| i.supports(column, op))
            .max_by_key(|i| i.meta.index_type == IndexType::Ordered)
    }

    pub fn clear(&mut self) {
        for index in &mut self.indexes {
            index.clear();
        }
    }
}
