use serde_derive::{Deserialize, Serialize};

use crate::sql::Row;

/// Rows per page. Build-time constant; the eviction policy and page size are
/// deliberately not observable through any public API.
pub const PAGE_SIZE: usize = 1024;

pub type PageId = u64;

/// A fixed-capacity batch of rows with a monotonic id, owned by the buffer
/// pool. Pages are immutable once installed; replacing a page's content means
/// installing a new page under the same key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub table: String,
    pub id: PageId,
    pub rows: Vec<Row>,
}

impl Page {
    pub fn new(table: &str, id: PageId, rows: Vec<Row>) -> Self {
        Self { table: table.to_string(), id, rows }
    }

    pub fn key(&self) -> (String, PageId) {
        (self.table.clone(), self.id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Splits a row set into page-sized batches with monotonically increasing
/// ids, for the bulk-load path.
pub fn paginate(table: &str, rows: Vec<Row>) -> Vec<Page> {
    let mut pages = Vec::new();
    let mut id = 0;
    let mut batch = Vec::with_capacity(PAGE_SIZE.min(rows.len()));
    for row in rows {
        batch.push(row);
        if batch.len() == PAGE_SIZE {
            pages.push(Page::new(table, id, std::mem::take(&mut batch)));
            id += 1;
        }
    }
    if !batch.is_empty() {
        pages.push(Page::new(table, id, batch));
    }
    pages
}
