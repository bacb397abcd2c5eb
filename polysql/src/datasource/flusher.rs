use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::datasource::Datasource;

/// Background flusher: periodically flushes the registered datasources so a
/// crash loses at most one interval of unflushed (but WAL-covered) work.
///
/// The thread parks on a condvar so `stop` interrupts the wait instead of
/// sleeping out the interval.
pub struct BackgroundFlusher {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundFlusher {
    pub fn start(sources: Vec<Arc<dyn Datasource>>, interval: Duration) -> Self {
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_shutdown = shutdown.clone();

        let handle = std::thread::Builder::new()
            .name("polysql-flusher".to_string())
            .spawn(move || {
                let (lock, cvar) = &*thread_shutdown;
                loop {
                    let stopped = {
                        let guard = lock.lock().expect("flusher shutdown poisoned");
                        let (guard, _) = cvar
                            .wait_timeout_while(guard, interval, |stop| !*stop)
                            .expect("flusher shutdown poisoned");
                        *guard
                    };
                    if stopped {
                        break;
                    }
                    for source in &sources {
                        if !source.is_connected() {
                            continue;
                        }
                        if let Err(err) = source.flush() {
                            log::error!("background flush of {} failed: {}", source.name(), err);
                        }
                    }
                }
            })
            .expect("failed to spawn flusher thread");

        Self { shutdown, handle: Some(handle) }
    }

    /// Stops the flusher and joins the thread.
    pub fn stop(&mut self) {
        let (lock, cvar) = &*self.shutdown;
        *lock.lock().expect("flusher shutdown poisoned") = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundFlusher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datasource::memory::MemoryDatasource;

    #[test]
    fn stop_interrupts_a_long_interval() {
        let source: Arc<dyn Datasource> = Arc::new(MemoryDatasource::new());
        let mut flusher = BackgroundFlusher::start(vec![source], Duration::from_secs(3600));
        let started = std::time::Instant::now();
        flusher.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn flushes_connected_sources() {
        let source = Arc::new(MemoryDatasource::new());
        source.connect().unwrap();
        let mut flusher =
            BackgroundFlusher::start(vec![source.clone() as Arc<dyn Datasource>], Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        flusher.stop();
        // Memory flush is a no-op; the assertion is that nothing wedged.
        assert!(source.is_connected());
    }
}
