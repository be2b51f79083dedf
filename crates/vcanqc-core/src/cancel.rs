//! # Cancellation
//!
//! A shared flag set by the operator (Ctrl+C in the binary) and polled at
//! every blocking point: serial reads and fixed settle/poll sleeps.

use crate::types::QcError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity of cancellable sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Cloneable cancellation flag. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` once cancellation has been requested.
    pub fn check(&self) -> Result<(), QcError> {
        if self.is_cancelled() {
            Err(QcError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with `Err(Interrupted)` on cancel.
    pub fn sleep(&self, duration: Duration) -> Result<(), QcError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
