//! Durable storage primitives: the page abstraction, the buffer pool and the
//! write-ahead log. The MVCC engine sits on top of these; the persistence
//! adapters drive them from below (bulk load on connect, flush on dirty).

pub mod buffer;
pub mod page;
pub mod wal;

use serde_derive::{Deserialize, Serialize};

/// Buffer-pool status, for observability and tests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Number of resident pages.
    pub resident: usize,
    /// Frame capacity of the pool.
    pub capacity: usize,
    /// Number of resident dirty pages.
    pub dirty: usize,
    /// Number of pinned pages.
    pub pinned: usize,
}
