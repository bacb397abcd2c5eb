use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{CResult, Error};

/// Cooperative cancellation handle shared between a running query and the
/// query registry. KILL and the timeout timer trip the same flags; callees
/// check at loop boundaries (per page, per row batch) and unwind with the
/// matching error.
#[derive(Clone, Default)]
pub struct CancelToken {
    killed: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn time_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.killed.load(Ordering::SeqCst) || self.timed_out.load(Ordering::SeqCst)
    }

    /// Returns the cancellation error if the token has been tripped.
    pub fn check(&self) -> CResult<()> {
        if self.timed_out.load(Ordering::SeqCst) {
            return Err(Error::Timeout);
        }
        if self.killed.load(Ordering::SeqCst) {
            return Err(Error::Killed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kill_and_timeout_are_distinct() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.kill();
        assert_eq!(token.check(), Err(Error::Killed));

        let token = CancelToken::new();
        token.time_out();
        assert_eq!(token.check(), Err(Error::Timeout));
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        other.kill();
        assert!(token.is_cancelled());
    }
}
