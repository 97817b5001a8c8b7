//! Cooperative cancellation for long scans.
//!
//! Search loops call [`CancellationToken::poll`] once per iteration; the
//! token only inspects its flag and deadline every [`POLL_INTERVAL`] calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, VexError};

/// Number of loop iterations between real cancellation checks.
pub const POLL_INTERVAL: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// A token that is never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that expires after `timeout`. A zero timeout never expires.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: (!timeout.is_zero()).then(|| Instant::now() + timeout),
        }
    }

    /// A token sharing this one's cancel flag that also expires after
    /// `timeout`. The earlier of the two deadlines wins; a zero timeout adds
    /// none.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Fail with [`VexError::Cancelled`] if the token fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(VexError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Iteration-granular check: only every [`POLL_INTERVAL`]th iteration looks at the token.
    #[inline]
    pub fn poll(&self, iteration: usize) -> Result<()> {
        if iteration % POLL_INTERVAL == 0 {
            self.check()
        } else {
            Ok(())
        }
    }
}
