use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{CResult, Error};
use crate::storage::page::{Page, PageId};
use crate::storage::PoolStatus;

type PageKey = (String, PageId);

/// A fixed-capacity page cache with clock eviction.
///
/// All state sits behind one pool-wide mutex whose critical sections are a
/// map lookup or a clock tick. Page contents are immutable once installed;
/// replacement is an atomic swap of a new `Arc<Page>`. Pinned frames are
/// never evicted, and dirty frames must be flushed through the owning
/// adapter before they are eligible.
pub struct BufferPool {
    capacity: usize,
    inner: Mutex<PoolInner>,
}

struct Frame {
    page: Arc<Page>,
    pins: usize,
    referenced: bool,
    dirty: bool,
}

struct PoolInner {
    frames: HashMap<PageKey, Frame>,
    /// Clock ring of resident keys; `hand` walks it on eviction.
    ring: Vec<PageKey>,
    hand: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer pool needs at least one frame");
        Self {
            capacity,
            inner: Mutex::new(PoolInner { frames: HashMap::new(), ring: Vec::new(), hand: 0 }),
        }
    }

    /// Fetches a page, paging it in through `loader` on a miss. The loader
    /// runs outside the pool lock since it may hit disk.
    pub fn fetch<F>(&self, table: &str, id: PageId, loader: F) -> CResult<Arc<Page>>
    where
        F: FnOnce() -> CResult<Page>,
    {
        let key = (table.to_string(), id);
        {
            let mut inner = self.inner.lock().expect("buffer pool poisoned");
            if let Some(frame) = inner.frames.get_mut(&key) {
                frame.referenced = true;
                return Ok(frame.page.clone());
            }
        }
        let page = loader()?;
        self.install(page)
    }

    /// Installs (or replaces) a page, evicting one cold clean page if the
    /// pool is full. Fails with a backpressure error when every frame is
    /// pinned or dirty; the caller flushes and retries.
    pub fn install(&self, page: Page) -> CResult<Arc<Page>> {
        let key = page.key();
        let page = Arc::new(page);
        let mut inner = self.inner.lock().expect("buffer pool poisoned");

        if let Some(frame) = inner.frames.get_mut(&key) {
            frame.page = page.clone();
            frame.referenced = true;
            return Ok(page);
        }

        if inner.frames.len() >= self.capacity {
            inner.evict_one()?;
        }
        inner.ring.push(key.clone());
        inner
            .frames
            .insert(key, Frame { page: page.clone(), pins: 0, referenced: true, dirty: false });
        Ok(page)
    }

    pub fn pin(&self, table: &str, id: PageId) -> CResult<()> {
        self.with_frame(table, id, |frame| {
            frame.pins += 1;
        })
    }

    pub fn unpin(&self, table: &str, id: PageId) -> CResult<()> {
        self.with_frame(table, id, |frame| {
            frame.pins = frame.pins.saturating_sub(1);
        })
    }

    pub fn mark_dirty(&self, table: &str, id: PageId) -> CResult<()> {
        self.with_frame(table, id, |frame| {
            frame.dirty = true;
        })
    }

    /// Flushes every dirty page through the supplied writer (the owning
    /// adapter's write-table path) and clears the dirty bits. Returns the
    /// number of pages flushed.
    pub fn flush_dirty<F>(&self, mut write: F) -> CResult<usize>
    where
        F: FnMut(&Page) -> CResult<()>,
    {
        // Collect under the lock, write outside it.
        let dirty: Vec<Arc<Page>> = {
            let inner = self.inner.lock().expect("buffer pool poisoned");
            inner.frames.values().filter(|f| f.dirty).map(|f| f.page.clone()).collect()
        };
        for page in &dirty {
            write(page)?;
        }
        let mut inner = self.inner.lock().expect("buffer pool poisoned");
        for page in &dirty {
            if let Some(frame) = inner.frames.get_mut(&page.key()) {
                frame.dirty = false;
            }
        }
        Ok(dirty.len())
    }

    /// Evicts one cold page. Exposed for tests; `install` calls it
    /// internally when the pool is full.
    pub fn evict_one(&self) -> CResult<()> {
        self.inner.lock().expect("buffer pool poisoned").evict_one()
    }

    /// Drops every resident page of a table, e.g. on drop-table.
    pub fn remove_table(&self, table: &str) {
        let mut inner = self.inner.lock().expect("buffer pool poisoned");
        inner.ring.retain(|(t, _)| t != table);
        inner.frames.retain(|(t, _), _| t != table);
        inner.hand = 0;
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock().expect("buffer pool poisoned");
        PoolStatus {
            resident: inner.frames.len(),
            capacity: self.capacity,
            dirty: inner.frames.values().filter(|f| f.dirty).count(),
            pinned: inner.frames.values().filter(|f| f.pins > 0).count(),
        }
    }

    fn with_frame<F>(&self, table: &str, id: PageId, apply: F) -> CResult<()>
    where
        F: FnOnce(&mut Frame),
    {
        let mut inner = self.inner.lock().expect("buffer pool poisoned");
        match inner.frames.get_mut(&(table.to_string(), id)) {
            Some(frame) => {
                apply(frame);
                Ok(())
            }
            None => Err(Error::Internal(format!("page {}/{} is not resident", table, id))),
        }
    }
}

impl PoolInner {
    /// Clock sweep: skip pinned and dirty frames, clear reference bits on
    /// the first pass, evict the first cold frame found. Two full sweeps
    /// without a victim means everything is pinned or dirty.
    fn evict_one(&mut self) -> CResult<()> {
        if self.ring.is_empty() {
            return Err(Error::Internal("buffer pool is empty, nothing to evict".to_string()));
        }
        let mut ticks = 0;
        let max_ticks = self.ring.len() * 2;
        while ticks < max_ticks {
            let pos = self.hand % self.ring.len();
            let key = self.ring[pos].clone();
            let frame = self.frames.get_mut(&key).expect("ring out of sync with frames");
            if frame.pins == 0 && !frame.dirty {
                if frame.referenced {
                    frame.referenced = false;
                } else {
                    self.frames.remove(&key);
                    self.ring.remove(pos);
                    self.hand = pos;
                    return Ok(());
                }
            }
            self.hand = (pos + 1) % self.ring.len();
            ticks += 1;
        }
        Err(Error::Storage("buffer pool exhausted: all frames pinned or dirty".to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sql::row_from;
    use crate::sql::value::Value;

    fn page(table: &str, id: PageId) -> Page {
        Page::new(table, id, vec![row_from(vec![("id", Value::Integer(id as i64))])])
    }

    #[test]
    fn fetch_misses_call_the_loader_once() {
        let pool = BufferPool::new(4);
        let loaded = pool.fetch("t", 1, || Ok(page("t", 1))).unwrap();
        assert_eq!(loaded.id, 1);
        // Hit: loader must not run again.
        let hit = pool.fetch("t", 1, || panic!("loader on a resident page")).unwrap();
        assert_eq!(hit.id, 1);
    }

    #[test]
    fn exactly_full_pool_evicts_one_and_succeeds() {
        let pool = BufferPool::new(2);
        pool.install(page("t", 0)).unwrap();
        pool.install(page("t", 1)).unwrap();
        assert_eq!(pool.status().resident, 2);
        pool.install(page("t", 2)).unwrap();
        let status = pool.status();
        assert_eq!(status.resident, 2);
        assert_eq!(status.capacity, 2);
    }

    #[test]
    fn pinned_pages_never_evict() {
        let pool = BufferPool::new(2);
        pool.install(page("t", 0)).unwrap();
        pool.install(page("t", 1)).unwrap();
        pool.pin("t", 0).unwrap();
        pool.pin("t", 1).unwrap();
        assert!(matches!(pool.install(page("t", 2)), Err(Error::Storage(_))));
        pool.unpin("t", 1).unwrap();
        pool.install(page("t", 2)).unwrap();
        // The pinned page survived.
        pool.fetch("t", 0, || panic!("pinned page was evicted")).unwrap();
    }

    #[test]
    fn dirty_pages_flush_before_eviction() {
        let pool = BufferPool::new(2);
        pool.install(page("t", 0)).unwrap();
        pool.install(page("t", 1)).unwrap();
        pool.mark_dirty("t", 0).unwrap();
        pool.mark_dirty("t", 1).unwrap();
        // Both frames dirty: no victim available.
        assert!(pool.install(page("t", 2)).is_err());
        let flushed = pool.flush_dirty(|_| Ok(())).unwrap();
        assert_eq!(flushed, 2);
        pool.install(page("t", 2)).unwrap();
    }

    #[test]
    fn replacing_a_resident_page_swaps_content() {
        let pool = BufferPool::new(2);
        pool.install(Page::new("t", 0, vec![])).unwrap();
        pool.install(page("t", 0)).unwrap();
        let got = pool.fetch("t", 0, || unreachable!()).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(pool.status().resident, 1);
    }

    #[test]
    fn remove_table_drops_only_that_table() {
        let pool = BufferPool::new(4);
        pool.install(page("a", 0)).unwrap();
        pool.install(page("b", 0)).unwrap();
        pool.remove_table("a");
        assert_eq!(pool.status().resident, 1);
        pool.fetch("b", 0, || panic!("wrong table removed")).unwrap();
    }
}
