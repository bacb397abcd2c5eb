//! `polysql` is the core query execution and storage engine of a polyglot
//! SQL runtime: a single-process database that executes already-parsed SQL
//! against pluggable datasources with MVCC snapshot isolation, and persists
//! file-backed databases through a write-ahead log with checkpointing.
//! [Author fengyang]
//!
//! The layering, leaves first:
//!
//! - [`storage`] — append-only WAL with typed entries and checkpoint
//!   barriers, plus a clock-evicting buffer pool of row pages.
//! - [`mvcc`] — version chains per row, a transaction table, snapshot
//!   isolation, first-committer-wins conflicts, bulk-load fast path.
//! - [`index`] — ordered and hash secondary indexes, uniqueness and
//!   foreign-key enforcement.
//! - [`expr`] — the generated-column evaluator: Pratt parsing, topological
//!   evaluation, NULL-propagating arithmetic, indexability classification.
//! - [`datasource`] — capability traits plus the memory, XML and JSON
//!   adapters.
//! - [`session`] — per-connection state, the global query registry
//!   (KILL / timeouts), and the runtime handle wiring it all together.
//!
//! ## Getting started
//!
//! ```rust
//! use polysql::datasource::memory::MemoryDatasource;
//! use polysql::datasource::Datasource;
//! use polysql::error::CResult;
//! use polysql::sql::plan::QueryOptions;
//! use polysql::sql::row_from;
//! use polysql::sql::schema::{Column, Table};
//! use polysql::sql::value::{DataType, Value};
//!
//! fn main() -> CResult<()> {
//!     let source = MemoryDatasource::new();
//!     source.connect()?;
//!
//!     source.create_table(Table::new(
//!         "users",
//!         "memory",
//!         vec![
//!             Column::new("id", DataType::Integer).primary(),
//!             Column::new("name", DataType::String),
//!         ],
//!     ))?;
//!
//!     source.insert(
//!         "users",
//!         vec![row_from(vec![("id", Value::Integer(1)), ("name", Value::from("ann"))])],
//!         None,
//!     )?;
//!
//!     let rs = source.query("users", &QueryOptions::default(), None, None)?;
//!     assert_eq!(rs.total, 1);
//!
//!     source.close()?;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod datasource;
pub mod error;
pub mod exec;
pub mod expr;
pub mod index;
pub mod mvcc;
pub mod session;
pub mod sql;
pub mod storage;
